//! Telemetry sink: line-protocol formatting and the Unix-datagram sender.

use async_trait::async_trait;

use crate::error::Result;
use crate::point::Sample;

pub mod line_protocol;
pub mod telegraf;

pub use line_protocol::sample_to_line;
pub use telegraf::TelegrafSink;

/// Downstream consumer of decoded samples.
///
/// The acquisition service only depends on this interface; the default
/// implementation is the Unix-datagram line-protocol sender.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Deliver one sample. Best-effort: an error is accounted by the
    /// caller and never retried.
    async fn send_sample(&self, sample: &Sample) -> Result<()>;
}
