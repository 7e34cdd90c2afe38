//! Unix-datagram telemetry sender
//!
//! Each record goes out as one UTF-8 datagram on a fresh unbound socket,
//! so there is no shared socket state to contend on. Sends are
//! best-effort: a failure is reported to the caller for accounting and
//! never retried, keeping acquisition liveness decoupled from collector
//! availability.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixDatagram;
use tracing::debug;

use crate::error::{AcqSrvError, Result};
use crate::point::Sample;

use super::line_protocol::sample_to_line;
use super::SampleSink;

/// Default collector socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/telegraf.sock";

/// Best-effort line-protocol sender.
#[derive(Debug, Clone)]
pub struct TelegrafSink {
    path: PathBuf,
}

impl TelegrafSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one record; a trailing newline is added when missing.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let socket = UnixDatagram::unbound()
            .map_err(|e| AcqSrvError::sink(format!("socket create failed: {e}")))?;

        let mut datagram = line.as_bytes().to_vec();
        if !datagram.ends_with(b"\n") {
            datagram.push(b'\n');
        }

        socket
            .send_to(&datagram, &self.path)
            .await
            .map_err(|e| {
                AcqSrvError::sink(format!(
                    "send to {} failed: {e}",
                    self.path.display()
                ))
            })?;

        debug!("Sent {} bytes to {}", datagram.len(), self.path.display());
        Ok(())
    }

}

#[async_trait]
impl SampleSink for TelegrafSink {
    /// Format and send a sample as one datagram.
    async fn send_sample(&self, sample: &Sample) -> Result<()> {
        let line = sample_to_line(sample)?;
        self.send_line(&line).await
    }
}

impl Default for TelegrafSink {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Value;
    use std::collections::BTreeMap;

    fn sample() -> Sample {
        Sample {
            point_name: "p1".into(),
            value: Value::U16(7),
            timestamp_ms: 1_700_000_000_000,
            measurement: "m".into(),
            tags: BTreeMap::new(),
            valid: true,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_send_delivers_one_datagram_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegraf.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let sink = TelegrafSink::new(&path);
        sink.send_sample(&sample()).await.unwrap();

        let mut buf = [0u8; 512];
        let n = receiver.recv(&mut buf).await.unwrap();
        let record = std::str::from_utf8(&buf[..n]).unwrap();
        assert_eq!(record, "m value=7i 1700000000000000000\n");
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_not_retried() {
        let sink = TelegrafSink::new("/nonexistent/telegraf.sock");
        let err = sink.send_sample(&sample()).await.unwrap_err();
        assert!(matches!(err, AcqSrvError::SinkError(_)));
    }
}
