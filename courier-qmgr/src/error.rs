//! Typed error handling for the queue manager.
//!
//! Environmental failures (I/O, unreachable delivery agents, log writers) are
//! ordinary errors here, or are absorbed into throttle and defer state by the
//! scheduler. Violated scheduler invariants are panics, not variants.

use std::io;

use courier_spool::SpoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QmgrError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("Recipient log error: {0}")]
    Log(#[from] LogError),

    /// A delivery agent accepted the connection but never answered.
    /// The listener is stuck, so the queue manager cannot make progress.
    #[error("Connection to transport {transport} timed out")]
    ConnectTimeout { transport: String },

    /// The queue-file collaborator could not load or update a message.
    #[error("Message source error: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid concurrency feedback: {0}")]
    Feedback(String),

    #[error("Initial concurrency for {transport} must be at least 1")]
    InitConcurrency { transport: String },

    #[error("Delivery slot discount for {transport} must be at most 100, got {value}")]
    SlotDiscount { transport: String, value: u32 },
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] ron::Error),

    #[error("Malformed log record: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

impl QmgrError {
    /// Whether the service must stop
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. } | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        let err: QmgrError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, QmgrError::Io(_)));
        assert!(!err.is_fatal());

        let err: QmgrError = LogError::from(io::Error::other("disk full")).into();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn connect_timeout_is_fatal() {
        let err = QmgrError::ConnectTimeout {
            transport: "smtp".to_string(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Connection to transport smtp timed out");
    }
}
