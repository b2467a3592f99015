//! # Recorded Feed Replay
//!
//! `PacketRecorder` appends every decoded raw line to a CRLF log file and
//! `ReplayPacketSource` plays such a file back through the normal pipeline.
//! At end of file the replay source returns empty reads, so the supervisor's
//! liveness check eventually reconnects, which reopens the file from the top.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::connection::{IngestError, PacketSource};

/// File-backed packet source.
pub struct ReplayPacketSource {
    path: PathBuf,
    file: Option<File>,
}

impl ReplayPacketSource {
    /// Replays `path`; nothing is opened before `connect`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

#[async_trait]
impl PacketSource for ReplayPacketSource {
    fn describe(&self) -> String {
        format!("replay {}", self.path.display())
    }

    fn is_connected(&self) -> bool {
        self.file.is_some()
    }

    async fn connect(&mut self) -> Result<(), IngestError> {
        self.close().await;
        let file = File::open(&self.path)
            .await
            .map_err(|e| IngestError::Connection(format!("{}: {}", self.path.display(), e)))?;
        info!("Replaying packets from {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> Result<Bytes, IngestError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| IngestError::Transport("replay file not open".to_string()))?;
        let mut buf = vec![0u8; max_bytes];
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) {
        if self.file.take().is_some() {
            info!("closing replay file {}", self.path.display());
        }
    }
}

/// Append-only log of raw lines, replayable by `ReplayPacketSource`.
pub struct PacketRecorder {
    path: PathBuf,
    file: File,
}

impl PacketRecorder {
    /// Opens (or creates) `path` for appending.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!("Recording raw packets to {}", path.display());
        Ok(Self { path, file })
    }

    /// Where lines are written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line with its CRLF terminator.
    pub async fn record(&mut self, line: &str) -> std::io::Result<()> {
        let mut framed = Vec::with_capacity(line.len() + 2);
        framed.extend_from_slice(line.as_bytes());
        framed.extend_from_slice(b"\r\n");
        self.file.write_all(&framed).await
    }

    /// Flushes buffered writes.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }
}
