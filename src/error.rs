//! Error types and result aliases for the runscope library.
//!
//! This module defines the core error type [`TraceError`] and the [`Result`] type alias
//! used throughout the library. Producer-facing operations (adding events, entering and
//! exiting contexts) never surface these errors to the host application; they are logged
//! and degraded instead. Collector and query operations return `Result<T>`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Delivery error: {0}")]
    DeliveryError(String),

    #[error("Sink error: {0}")]
    SinkError(String),

    #[error("Event batch cannot be empty")]
    EmptyBatch,

    #[error("Batch of {count} events exceeds the maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TraceError {
    /// HTTP status an ingestion or query layer should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            TraceError::EmptyBatch | TraceError::ConfigError(_) => 400,
            TraceError::SerializationError(_) => 422,
            TraceError::BatchTooLarge { .. } => 413,
            TraceError::RunNotFound(_) | TraceError::EventNotFound(_) => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = TraceError::ConfigError("batch_size must be greater than 0".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: batch_size must be greater than 0");
    }

    #[test]
    fn test_batch_too_large_display() {
        let err = TraceError::BatchTooLarge {
            count: 10_001,
            max: 10_000,
        };
        assert_eq!(err.to_string(), "Batch of 10001 events exceeds the maximum of 10000");
    }

    #[test]
    fn test_run_not_found_display() {
        let err = TraceError::RunNotFound("r1".to_string());
        assert_eq!(err.to_string(), "Run not found: r1");
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: TraceError = json_err.into();

        match err {
            TraceError::SerializationError(_) => {}
            _ => panic!("Expected SerializationError"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "runtime unavailable");
        let err: TraceError = io_err.into();

        match err {
            TraceError::IoError(_) => {}
            _ => panic!("Expected IoError"),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TraceError::EmptyBatch.status_code(), 400);
        assert_eq!(TraceError::BatchTooLarge { count: 2, max: 1 }.status_code(), 413);
        assert_eq!(TraceError::RunNotFound("r".to_string()).status_code(), 404);
        assert_eq!(TraceError::EventNotFound("e".to_string()).status_code(), 404);
        assert_eq!(TraceError::StorageError("down".to_string()).status_code(), 500);
    }

    #[test]
    fn test_result_type() {
        let ok_result: Result<i32> = Ok(42);
        assert!(ok_result.is_ok());

        let err_result: Result<i32> = Err(TraceError::EmptyBatch);
        assert!(err_result.is_err());
    }
}
