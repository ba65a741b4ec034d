//! Error types for the courier-spool crate.

use std::io;

use thiserror::Error;

/// Top-level spool error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (directory listing, rename, timestamp update).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Spool directory validation failed.
    #[error("Spool validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A queue name that is not one of the known queues.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),
}

/// Spool directory validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Spool path contains a `..` component.
    #[error("Spool path cannot contain '..' components: {0}")]
    ParentComponent(String),

    /// Spool path is relative.
    #[error("Spool path must be absolute: {0}")]
    NotAbsolute(String),

    /// Spool path lives under a system directory.
    #[error("Spool path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: &'static str, path: String },

    /// Spool path is not a directory.
    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let spool_err: SpoolError = io_err.into();
        assert!(matches!(spool_err, SpoolError::Io(_)));
        assert!(spool_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_validation_message() {
        let err = SpoolError::from(ValidationError::SystemDirectory {
            prefix: "/etc",
            path: "/etc/spool".to_string(),
        });
        assert!(err.to_string().contains("system directory /etc"));
    }
}
