//! Acquisition service library
//!
//! A SCADA data-acquisition engine: polls Modbus TCP devices through
//! per-device workers, decodes register data into typed values and
//! streams line-protocol records to a local telemetry collector over a
//! Unix datagram socket.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod point;
pub mod protocols;
pub mod sink;
pub mod utils;

// Re-export commonly used types
pub use acquisition::{AcquisitionService, ServiceEvent, WorkerRegistry};
pub use config::AppConfig;
pub use error::{AcqSrvError, ErrorKind, Result};
pub use point::{DataType, Point, RequestPriority, Sample, Value};

use tracing::error;

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    // If SIGTERM handler failed, wait forever (only Ctrl+C will work)
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
