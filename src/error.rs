//! Error types for Matview-Store

use thiserror::Error;

/// Result type alias for Matview-Store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Matview-Store
///
/// Errors are cloneable so that a single fatal materializer failure can be
/// handed to every waiter blocked on the same entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The caller's cancellation token fired before the wait was satisfied
    #[error("request canceled")]
    Canceled,

    /// The request-level timeout elapsed before the wait was satisfied
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The materializer has stopped and no longer accepts waiters
    #[error("materializer closed")]
    Closed,

    /// The materializer hit a fatal error; the entry is torn down
    #[error("materializer failed: {0}")]
    MaterializerFailed(String),

    /// The server asked the client to drop its state and resubscribe
    #[error("stream reset requested: {0}")]
    StreamReset(String),

    /// Streaming transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// A view rejected an event
    #[error("View error: {0}")]
    View(String),

    /// Fingerprinting or materializer construction failed
    #[error("Construction error: {0}")]
    Construction(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the materializer may recover from this error by resubscribing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::StreamReset(_))
    }

    /// Whether the error came from the caller ending its own wait.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
