//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream authority '{0}' is not allowed")]
    UpstreamNotAllowed(String),

    #[error("Zap failed: {0}")]
    Zap(String),

    #[error("Readiness check failed: {0}")]
    Readiness(String),

    #[error("Receiver is tuned to '{actual}', expected '{expected}'")]
    RefMismatch { expected: String, actual: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for error shapes a disconnecting client produces.
    ///
    /// These are expected during normal operation and must never be logged
    /// at error level.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
