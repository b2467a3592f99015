//! # APRS-IS Connection Manager
//!
//! A `PacketSource` is the byte-level transport of the feed. The TCP
//! implementation performs the APRS-IS login handshake:
//!
//! 1. connect to `addr:port` and wait a short settle delay;
//! 2. read the server greeting (`# aprsc ...`);
//! 3. send `user <callsign> pass -1 vers <name> <version>\r\n`;
//! 4. read the login acknowledgement.
//!
//! A read that times out yields an empty chunk instead of an error, so the
//! supervisor's liveness check decides when a quiet feed is really dead. A
//! broken stream is never reused: after an `IngestError` the caller closes the
//! source and connects again.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use super::framing::FrameAssembler;
use crate::configs::ConnectionSettings;

/// Greeting and acknowledgement reads are capped at this many bytes.
const HANDSHAKE_BLOCK_LEN: usize = 10_000;

/// Failures of a packet source. Both are recovered by close + reconnect.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The established stream broke (socket error, remote close).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The stream could not be established or the handshake was not answered.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// # Packet Source
///
/// Byte-level access to a line feed. Implemented over TCP for live
/// operation and over a file for replays and tests.
#[async_trait]
pub trait PacketSource: Send {
    /// Human-readable origin, e.g. `rotate.aprs2.net:10152`.
    fn describe(&self) -> String;

    /// True between a successful `connect` and the next `close`.
    fn is_connected(&self) -> bool;

    /// Establishes the transport, closing any previous one first.
    async fn connect(&mut self) -> Result<(), IngestError>;

    /// Returns up to `max_bytes` new bytes; empty when nothing arrived in time.
    async fn read(&mut self, max_bytes: usize) -> Result<Bytes, IngestError>;

    /// Releases the transport. Calling it on a closed source is a no-op.
    async fn close(&mut self);
}

/// Live APRS-IS feed over TCP.
pub struct TcpPacketSource {
    settings: ConnectionSettings,
    stream: Option<TcpStream>,
}

impl TcpPacketSource {
    /// Creates an unconnected source.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings, stream: None }
    }

    /// The line sent to log in.
    pub fn login_line(&self) -> String {
        format!(
            "user {} pass -1 vers {} {}\r\n",
            self.settings.callsign, self.settings.client_name, self.settings.client_version
        )
    }

    async fn read_handshake(&self, stream: &mut TcpStream, what: &str) -> Result<String, IngestError> {
        let mut buf = vec![0u8; HANDSHAKE_BLOCK_LEN];
        match timeout(self.settings.handshake_timeout, stream.read(&mut buf)).await {
            Err(_) => Err(IngestError::Connection(format!("no {} within {:?}", what, self.settings.handshake_timeout))),
            Ok(Ok(0)) => Err(IngestError::Connection(format!("closed before {}", what))),
            Ok(Ok(n)) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Ok(Err(e)) => Err(IngestError::Connection(format!("reading {}: {}", what, e))),
        }
    }
}

#[async_trait]
impl PacketSource for TcpPacketSource {
    fn describe(&self) -> String {
        format!("{}:{}", self.settings.addr, self.settings.port)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<(), IngestError> {
        self.close().await;
        info!("Connecting to {}", self.describe());

        let target = (self.settings.addr.as_str(), self.settings.port);
        let mut stream = match timeout(self.settings.handshake_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(IngestError::Connection(format!("{}: {}", self.describe(), e))),
            Err(_) => return Err(IngestError::Connection(format!("{}: connect timed out", self.describe()))),
        };
        sleep(self.settings.settle_delay).await;

        let greeting = self.read_handshake(&mut stream, "greeting").await?;
        info!("server greeting : *{}*", greeting.trim_end());

        stream
            .write_all(self.login_line().as_bytes())
            .await
            .map_err(|e| IngestError::Connection(format!("sending login: {}", e)))?;

        let ack = self.read_handshake(&mut stream, "login ack").await?;
        info!("ack : *{}*", ack.split("\r\n").next().unwrap_or_default());

        self.stream = Some(stream);
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> Result<Bytes, IngestError> {
        let read_timeout = self.settings.read_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| IngestError::Transport("not connected".to_string()))?;

        let mut buf = vec![0u8; max_bytes];
        match timeout(read_timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => Err(IngestError::Transport("stream closed by remote host".to_string())),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => Err(IngestError::Transport(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            info!("closing socket");
            if let Err(e) = stream.shutdown().await {
                debug!("socket shutdown: {}", e);
            }
        }
    }
}

/// # Connection State
///
/// Per-connection bookkeeping owned by the supervisor. Reset on every
/// (re)connect so a stale partial line never leaks into a new stream.
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Carries the partial line between reads.
    pub frames: FrameAssembler,
    /// Consecutive reads that produced too few lines.
    pub consecutive_low_reads: u32,
    /// Lines framed since the connection was established.
    pub packets: u64,
    /// When the current connection was established.
    pub connected_at: Option<Instant>,
    /// When the last non-empty read arrived.
    pub last_activity: Option<Instant>,
}

impl ConnectionState {
    /// Starts bookkeeping for a fresh connection.
    pub fn reset(&mut self, now: Instant) {
        *self = Self {
            connected_at: Some(now),
            ..Self::default()
        };
    }

    /// Records the outcome of one read and returns the updated low-read streak.
    pub fn record_read(&mut self, bytes: usize, lines: usize, min_lines: usize, now: Instant) -> u32 {
        if bytes > 0 {
            self.last_activity = Some(now);
        }
        self.packets += lines as u64;
        if lines < min_lines {
            self.consecutive_low_reads += 1;
            warn!("Got no data for last {} cycles", self.consecutive_low_reads);
        } else {
            self.consecutive_low_reads = 0;
        }
        self.consecutive_low_reads
    }
}

/// # Throughput Meter
///
/// Mean packet rate over the whole run and over a sliding window.
#[derive(Debug)]
pub struct ThroughputMeter {
    samples: VecDeque<(usize, Instant)>,
    window: Duration,
    total: u64,
    started: Instant,
}

impl ThroughputMeter {
    /// Upper bound on retained samples, whatever their age.
    pub const MAX_SAMPLES: usize = 1000;

    /// Starts measuring at `started`, averaging over `window`.
    pub fn new(window: Duration, started: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(Self::MAX_SAMPLES),
            window,
            total: 0,
            started,
        }
    }

    /// Adds the packet count of one read.
    pub fn record(&mut self, count: usize, now: Instant) {
        if self.samples.len() == Self::MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((count, now));
        self.total += count as u64;
        while let Some(&(_, at)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        debug!("{} packets in mean rate calculation buffer", self.samples.len());
    }

    /// Packets counted since start.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Mean packets per second since start.
    pub fn overall_rate(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed > 0.0 {
            self.total as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Mean packets per second across the retained samples.
    pub fn window_rate(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(_, first)), Some(&(_, last))) => {
                let span = last.saturating_duration_since(first).as_secs_f64();
                if span > 0.0 {
                    self.samples.iter().map(|(count, _)| *count as f64).sum::<f64>() / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Logs the throughput line.
    pub fn log(&self, last_count: usize, now: Instant) {
        info!(
            "Got {} packets, overall mean rate {:.2} packets / sec over {} sec, over last {:.1} sec mean rate = {:.2} packets / sec",
            last_count,
            self.overall_rate(now),
            now.saturating_duration_since(self.started).as_secs(),
            self.window.as_secs_f64(),
            self.window_rate()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings_for(port: u16) -> ConnectionSettings {
        ConnectionSettings {
            addr: "127.0.0.1".to_string(),
            port,
            callsign: "N0CALL".to_string(),
            settle_delay: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(100),
            ..ConnectionSettings::default()
        }
    }

    #[test]
    fn login_advertises_the_configured_client() {
        let source = TcpPacketSource::new(ConnectionSettings {
            client_name: "ogn-relay".to_string(),
            client_version: "1.2".to_string(),
            ..settings_for(14580)
        });
        assert_eq!(source.login_line(), "user N0CALL pass -1 vers ogn-relay 1.2\r\n");
    }

    #[tokio::test]
    async fn handshake_sends_login_and_reads_feed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"# aprsc 2.1.4\r\n").await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            let login = String::from_utf8(buf[..n].to_vec()).unwrap();
            socket.write_all(b"# logresp N0CALL unverified\r\n").await.unwrap();
            sleep(Duration::from_millis(300)).await;
            socket.write_all(b"N0CALL>APRS:!4903.50N/07201.75W-\r\n").await.unwrap();
            login
        });

        let mut source = TcpPacketSource::new(settings_for(port));
        source.connect().await.unwrap();
        assert!(source.is_connected());

        let mut data = Vec::new();
        while !data.ends_with(b"\r\n") {
            data.extend_from_slice(&source.read(1 << 14).await.unwrap());
        }
        assert_eq!(data, b"N0CALL>APRS:!4903.50N/07201.75W-\r\n");

        let login = server.await.unwrap();
        assert_eq!(login, "user N0CALL pass -1 vers aprs2gpaero 0.2\r\n");

        // Peer is gone: the next read reports a broken transport.
        let mut broken = false;
        for _ in 0..20 {
            match source.read(1024).await {
                Err(IngestError::Transport(_)) => {
                    broken = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("unexpected {}", e),
            }
        }
        assert!(broken);

        source.close().await;
        source.close().await;
        assert!(!source.is_connected());
    }

    #[tokio::test]
    async fn silent_server_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut settings = settings_for(port);
        settings.handshake_timeout = Duration::from_millis(200);
        let mut source = TcpPacketSource::new(settings);
        assert!(matches!(source.connect().await, Err(IngestError::Connection(_))));
        assert!(!source.is_connected());
    }

    #[tokio::test]
    async fn read_without_connection_is_transport_error() {
        let mut source = TcpPacketSource::new(settings_for(1));
        assert!(matches!(source.read(16).await, Err(IngestError::Transport(_))));
    }

    #[test]
    fn low_reads_accumulate_until_a_full_one() {
        let now = Instant::now();
        let mut state = ConnectionState::default();
        state.reset(now);
        assert_eq!(state.record_read(0, 0, 2, now), 1);
        assert_eq!(state.record_read(40, 1, 2, now), 2);
        assert_eq!(state.record_read(400, 5, 2, now), 0);
        assert_eq!(state.packets, 6);
        assert_eq!(state.last_activity, Some(now));
    }

    #[test]
    fn throughput_window_ages_out_samples() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(Duration::from_secs(60), start);
        meter.record(10, start);
        meter.record(10, start + Duration::from_secs(10));
        assert_eq!(meter.window_rate(), 2.0);

        meter.record(30, start + Duration::from_secs(100));
        assert_eq!(meter.sample_count(), 1);
        assert_eq!(meter.total(), 50);
        assert_eq!(meter.overall_rate(start + Duration::from_secs(100)), 0.5);
    }
}
