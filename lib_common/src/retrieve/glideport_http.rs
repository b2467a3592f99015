//! # glideport.aero Push Client
//!
//! A thin `reqwest` wrapper posting one delivery payload per request to the
//! push endpoint, equivalent to:
//!
//! ```text
//! curl -H "Accept: application/json" -H "Content-Type: application/json" \
//!      -d @payload.json http://glideport.aero/spot/ir_push.php
//! ```
//!
//! The destination has to be registered on the glideport side as
//! `ir_push:<IMEI>` for the fixes to show up.

use std::time::Duration;

use async_trait::async_trait;
use log::info;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};

use crate::delivery::{PushError, PushTarget};
use crate::model::DeliveryPayload;

/// Default push endpoint.
pub const DEFAULT_PUSH_URL: &str = "http://glideport.aero/spot/ir_push.php";

/// HTTP push target.
pub struct GlideportClient {
    inner: Client,
    url: Url,
}

impl GlideportClient {
    /// Creates a client for `url`.
    ///
    /// # Errors
    /// `PushError::Transport` if `url` is not an absolute URL or the HTTP
    /// client cannot be built.
    pub fn new(url: &str) -> Result<Self, PushError> {
        let url = Url::parse(url).map_err(|e| PushError::Transport(format!("invalid push URL {}: {}", url, e)))?;
        let inner = Client::builder()
            .user_agent(concat!("aprs2gpaero/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self { inner, url })
    }

    /// The endpoint payloads are posted to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn classify(error: reqwest::Error, limit: Duration) -> PushError {
    if error.is_timeout() {
        PushError::Timeout(limit)
    } else {
        PushError::Transport(error.to_string())
    }
}

#[async_trait]
impl PushTarget for GlideportClient {
    fn name(&self) -> &str {
        self.url.as_str()
    }

    async fn push(&self, payload: &DeliveryPayload, timeout: Duration) -> Result<(), PushError> {
        let body = serde_json::to_string(payload)?;
        info!("Uploading {}", body);

        let response = self
            .inner
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| classify(e, timeout))?;
        if status.is_success() {
            info!("Received {}", text);
            Ok(())
        } else {
            Err(PushError::Rejected {
                status: status.as_u16(),
                body: text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DestinationId, PositionFix};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn payload() -> DeliveryPayload {
        let fix = PositionFix::new("N0CALL-9", -32.067333, 115.827333, 1554359951.0);
        DeliveryPayload::from_fix(DestinationId::from("VK6FLYR"), &fix, fix.timestamp)
    }

    /// Serves one canned HTTP response and returns the raw request.
    async fn one_shot_server(response: &'static str, delay: Duration) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/spot/ir_push.php", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            tokio::time::sleep(delay).await;
            let _ = socket.write_all(response.as_bytes()).await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn posts_json_and_accepts_2xx() {
        let (url, server) =
            one_shot_server("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok", Duration::ZERO).await;
        let client = GlideportClient::new(&url).unwrap();
        client.push(&payload(), Duration::from_secs(5)).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /spot/ir_push.php"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.contains(r#""imei":"VK6FLYR""#));
        assert!(request.contains(r#""timeStamp":1554359951000"#));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, _server) =
            one_shot_server("HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope", Duration::ZERO)
                .await;
        let client = GlideportClient::new(&url).unwrap();
        match client.push(&payload(), Duration::from_secs(5)).await {
            Err(PushError::Rejected { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "nope");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let (url, _server) = one_shot_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", Duration::from_secs(3)).await;
        let client = GlideportClient::new(&url).unwrap();
        let result = client.push(&payload(), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(PushError::Timeout(_))));
    }

    #[test]
    fn relative_url_is_refused() {
        assert!(matches!(GlideportClient::new("spot/ir_push.php"), Err(PushError::Transport(_))));
    }
}
