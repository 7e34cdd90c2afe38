//! Error handling for the acquisition service
//!
//! Provides the service-wide error type, a `Result` alias, and the error
//! classification used by machine consumers of error events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Acquisition service error type
#[derive(Error, Debug, Clone)]
pub enum AcqSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// General protocol errors (malformed frames, id mismatches, truncation)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Not connected error
    #[error("Not connected")]
    NotConnected,

    /// Connection attempt timed out
    #[error("Connect timeout: {0}")]
    ConnectTimeout(String),

    /// Connection refused by the device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// In-flight request timed out
    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    /// Modbus exception response from the device
    #[error("Modbus exception: code {0}")]
    ModbusException(u8),

    /// Request queue is at capacity
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Resource exhausted (queues, permits)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Data conversion and decoding errors
    #[error("Data conversion error: {0}")]
    DataConversionError(String),

    /// Invalid data format or content errors
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid parameter errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Point not found errors
    #[error("Point not found: {0}")]
    PointNotFound(String),

    /// Telemetry sink errors
    #[error("Sink error: {0}")]
    SinkError(String),

    /// Data serialization and deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// State errors (invalid lifecycle transitions)
    #[error("State error: {0}")]
    StateError(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the acquisition service
pub type Result<T> = std::result::Result<T, AcqSrvError>;

/// Machine-readable error classification carried in classified error events.
///
/// The mapping from raw errors follows the dispositions of the worker's
/// error handling: connection-level failures decay health and back off,
/// device exceptions stay request-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectTimeout,
    ConnectionRefused,
    DeviceOverload,
    DeviceBusy,
    Network,
    Protocol,
    Config,
    RequestTimeout,
    ResourceExhaustion,
    Unknown,
}

impl AcqSrvError {
    /// Classify an error for machine consumers.
    ///
    /// Modbus exception codes 5 and 6 mean the device acknowledged but is
    /// busy (retryable); 1, 2 and 3 indicate a request the device will
    /// never accept (configuration problem, no automatic retry).
    pub fn classify(&self) -> ErrorKind {
        match self {
            AcqSrvError::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            AcqSrvError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            AcqSrvError::RequestTimeout(_) => ErrorKind::RequestTimeout,
            AcqSrvError::ConnectionError(_) | AcqSrvError::IoError(_) | AcqSrvError::NotConnected => {
                ErrorKind::Network
            },
            AcqSrvError::ProtocolError(_) => ErrorKind::Protocol,
            AcqSrvError::ModbusException(code) => match code {
                5 | 6 => ErrorKind::DeviceBusy,
                1 | 2 | 3 => ErrorKind::Config,
                _ => ErrorKind::Unknown,
            },
            AcqSrvError::ConfigError(_)
            | AcqSrvError::InvalidParameter(_)
            | AcqSrvError::InvalidData(_) => ErrorKind::Config,
            AcqSrvError::QueueFull(_) | AcqSrvError::ResourceExhausted(_) => {
                ErrorKind::ResourceExhaustion
            },
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether the failure warrants a retry after a short delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classify(),
            ErrorKind::DeviceBusy
                | ErrorKind::DeviceOverload
                | ErrorKind::Network
                | ErrorKind::ConnectTimeout
                | ErrorKind::RequestTimeout
        )
    }
}

// Conversion from std::io::Error, mapped to the connection error classes
// the worker reacts to.
impl From<std::io::Error> for AcqSrvError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                AcqSrvError::ConnectionRefused(err.to_string())
            },
            std::io::ErrorKind::TimedOut => AcqSrvError::RequestTimeout(err.to_string()),
            _ => AcqSrvError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AcqSrvError {
    fn from(err: serde_json::Error) -> Self {
        AcqSrvError::SerializationError(format!("JSON error: {err}"))
    }
}

impl From<serde_yaml::Error> for AcqSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        AcqSrvError::SerializationError(format!("YAML error: {err}"))
    }
}

impl From<figment::Error> for AcqSrvError {
    fn from(err: figment::Error) -> Self {
        AcqSrvError::ConfigError(format!("Configuration error: {err}"))
    }
}

// Helper methods for creating errors
impl AcqSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        AcqSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        AcqSrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        AcqSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        AcqSrvError::ConnectionError(msg.into())
    }

    pub fn data_conversion(msg: impl Into<String>) -> Self {
        AcqSrvError::DataConversionError(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AcqSrvError::InvalidData(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        AcqSrvError::SinkError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AcqSrvError::InternalError(msg.into())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| AcqSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| AcqSrvError::IoError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| AcqSrvError::ProtocolError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| AcqSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| AcqSrvError::InternalError(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection_errors() {
        assert_eq!(
            AcqSrvError::ConnectTimeout("t".into()).classify(),
            ErrorKind::ConnectTimeout
        );
        assert_eq!(
            AcqSrvError::ConnectionRefused("r".into()).classify(),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(AcqSrvError::NotConnected.classify(), ErrorKind::Network);
        assert_eq!(
            AcqSrvError::RequestTimeout("t".into()).classify(),
            ErrorKind::RequestTimeout
        );
    }

    #[test]
    fn test_classify_modbus_exceptions() {
        assert_eq!(AcqSrvError::ModbusException(5).classify(), ErrorKind::DeviceBusy);
        assert_eq!(AcqSrvError::ModbusException(6).classify(), ErrorKind::DeviceBusy);
        assert_eq!(AcqSrvError::ModbusException(1).classify(), ErrorKind::Config);
        assert_eq!(AcqSrvError::ModbusException(2).classify(), ErrorKind::Config);
        assert_eq!(AcqSrvError::ModbusException(3).classify(), ErrorKind::Config);
        assert_eq!(AcqSrvError::ModbusException(4).classify(), ErrorKind::Unknown);
        assert_eq!(AcqSrvError::ModbusException(11).classify(), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_resource_errors() {
        assert_eq!(
            AcqSrvError::QueueFull("1024".into()).classify(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            AcqSrvError::ResourceExhausted("permits".into()).classify(),
            ErrorKind::ResourceExhaustion
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            AcqSrvError::from(refused),
            AcqSrvError::ConnectionRefused(_)
        ));

        let other = std::io::Error::other("boom");
        assert!(matches!(AcqSrvError::from(other), AcqSrvError::IoError(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(AcqSrvError::ModbusException(6).is_retryable());
        assert!(AcqSrvError::ConnectTimeout("t".into()).is_retryable());
        assert!(!AcqSrvError::ModbusException(2).is_retryable());
        assert!(!AcqSrvError::QueueFull("full".into()).is_retryable());
    }
}
