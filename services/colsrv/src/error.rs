//! Error handling for the Collection Service
//!
//! This module provides error type definitions and conversions shared by the
//! whole crate. Variants are deliberately coarse: one variant per failure
//! class, with a human-readable payload.

use thiserror::Error;

/// Collection Service error type
#[derive(Error, Debug, Clone)]
pub enum ColSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Protocol communication errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Data handling errors (parsing, conversion, validation of values)
    #[error("Data error: {0}")]
    DataError(String),

    /// Point errors (unknown point id, point/group mismatch)
    #[error("Point error: {0}")]
    PointError(String),

    /// Managed task errors (registration conflicts, stop timeouts, faults)
    #[error("Task error: {0}")]
    TaskError(String),

    /// State errors (operation invalid in the current worker state)
    #[error("State error: {0}")]
    StateError(String),

    /// Validation errors (invalid parameter, unsupported operation)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the Collection Service
pub type Result<T> = std::result::Result<T, ColSrvError>;

impl ColSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        ColSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ColSrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ColSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ColSrvError::ConnectionError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ColSrvError::TimeoutError(msg.into())
    }

    pub fn point(msg: impl Into<String>) -> Self {
        ColSrvError::PointError(msg.into())
    }

    pub fn task(msg: impl Into<String>) -> Self {
        ColSrvError::TaskError(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        ColSrvError::StateError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ColSrvError::ValidationError(msg.into())
    }

    /// Whether the error class is a transient connection problem that the
    /// reconnection supervisor should absorb rather than surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ColSrvError::ConnectionError(_) | ColSrvError::TimeoutError(_) | ColSrvError::IoError(_)
        )
    }
}

impl From<std::io::Error> for ColSrvError {
    fn from(err: std::io::Error) -> Self {
        ColSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ColSrvError {
    fn from(err: serde_json::Error) -> Self {
        ColSrvError::DataError(format!("JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ColSrvError::connection("refused");
        assert_eq!(err.to_string(), "Connection error: refused");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ColSrvError::timeout("read").is_transient());
        assert!(ColSrvError::connection("reset").is_transient());
        assert!(!ColSrvError::point("unknown id").is_transient());
        assert!(!ColSrvError::ValidationError("bad group".into()).is_transient());
    }
}
