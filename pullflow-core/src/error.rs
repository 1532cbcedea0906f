//! Error types for pullflow pipelines

use std::io;
use thiserror::Error;

/// Boxed error produced by user code running inside a stage
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipeline operations
///
/// A failure always belongs to exactly one slot of a sequence. End of
/// sequence is never reported through this type.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Binary (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure raised by user code while producing one element
    #[error("Stage failure: {0}")]
    Stage(#[source] BoxError),

    /// A background worker panicked
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// A worker process exited or closed its output
    #[error("Worker exited: {0}")]
    WorkerExited(String),

    /// A cache entry could not be decoded
    #[error("Cache entry corrupt: {0}")]
    CacheCorrupt(String),

    /// A background producer went away without signalling completion
    #[error("Background producer disconnected")]
    Disconnected,
}

impl Error {
    /// Wrap an arbitrary user error as a stage failure
    pub fn stage<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Stage(err.into())
    }

    /// Build a stage failure from a message
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Stage(message.into().into())
    }

    /// Turn a panic payload into a readable error
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::WorkerPanicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_keeps_source() {
        let err = Error::stage(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, Error::Stage(_)));
        assert_eq!(err.to_string(), "Stage failure: boom");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_panic_payloads() {
        let err = Error::from_panic(&"static message");
        assert_eq!(err.to_string(), "Worker panicked: static message");

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let err = Error::from_panic(owned.as_ref());
        assert_eq!(err.to_string(), "Worker panicked: owned");

        let other: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        let err = Error::from_panic(other.as_ref());
        assert_eq!(err.to_string(), "Worker panicked: unknown panic payload");
    }
}
