//! # Push Interface
//!
//! The uploader talks to the remote tracking service only through
//! `PushTarget`. Timeouts are the one retryable outcome; every other failure
//! is terminal for the payload.

use std::time::Duration;

use async_trait::async_trait;
use log::info;
use thiserror::Error;

use crate::model::DeliveryPayload;

/// Outcome of a failed push.
#[derive(Debug, Error)]
pub enum PushError {
    /// No answer within the push timeout. The payload is retried.
    #[error("Push timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a non-success status.
    #[error("Push rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// Connection or protocol failure other than a timeout.
    #[error("Push transport error: {0}")]
    Transport(String),

    /// The payload could not be serialized.
    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PushError {
    /// True for the outcomes the uploader retries.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PushError::Timeout(_))
    }
}

/// # Push Target
///
/// A remote endpoint accepting one `DeliveryPayload` per call.
#[async_trait]
pub trait PushTarget: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Delivers `payload`, giving up after `timeout`.
    async fn push(&self, payload: &DeliveryPayload, timeout: Duration) -> Result<(), PushError>;
}

/// Logs instead of uploading.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunPushTarget;

#[async_trait]
impl PushTarget for DryRunPushTarget {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn push(&self, payload: &DeliveryPayload, _timeout: Duration) -> Result<(), PushError> {
        info!("would upload, but skipping {}", serde_json::to_string(payload)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DestinationId, PositionFix};

    #[tokio::test]
    async fn dry_run_always_succeeds() {
        let fix = PositionFix::new("N0CALL", 1.0, 2.0, 3.0);
        let payload = DeliveryPayload::from_fix(DestinationId::from("IMEI"), &fix, 3.0);
        assert!(DryRunPushTarget.push(&payload, Duration::from_secs(1)).await.is_ok());
    }

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(PushError::Timeout(Duration::from_secs(5)).is_timeout());
        assert!(!PushError::Rejected { status: 404, body: String::new() }.is_timeout());
        assert!(!PushError::Transport("reset".into()).is_timeout());
    }
}
