//! Error types for the load pipeline
//!
//! Separates transient transport failures (retried with backoff) from
//! per-document rejections, reader-side failures, and structural setup
//! errors that abort the whole run.

use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Main error type for the load pipeline
#[derive(Error, Debug)]
pub enum LoadError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store connection error (retryable)
    #[error("Store connection error: {0}")]
    Connection(String),

    /// Request-level store error (retryable)
    #[error("Store request error: {0}")]
    Store(String),

    /// Record source error
    #[error("Source '{name}' error: {message}")]
    Source { name: String, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Retries exhausted for a batch write
    #[error("Retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl LoadError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a request-level store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a source error
    pub fn source(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transient transport-level failures qualify; configuration
    /// errors, reader errors, and exhausted retries never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Store(_) | Self::Io(_))
    }

    /// Check if this is a shutdown error
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Terminal status of one worker or split, reported at close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Finished with every record accounted for
    Completed,
    /// Stopped early (reader error, writer setup failure, or shutdown)
    Failed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LoadError::source("docs", "unreadable entry");
        assert_eq!(err.to_string(), "Source 'docs' error: unreadable entry");
    }

    #[test]
    fn test_retryable_check() {
        assert!(LoadError::connection("timeout").is_retryable());
        assert!(LoadError::store("503 from entry host").is_retryable());
        assert!(!LoadError::config("bad batch size").is_retryable());
        assert!(!LoadError::RetriesExhausted {
            attempts: 4,
            message: "gave up".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_shutdown_check() {
        assert!(LoadError::Shutdown.is_shutdown());
        assert!(!LoadError::connection("reset").is_shutdown());
    }
}
