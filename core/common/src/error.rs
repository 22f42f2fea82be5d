//! Common error types for batchline.

use thiserror::Error;

/// Top-level error type for batchline operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transport-level failure talking to the remote store.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote store did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A read request was superseded or aborted before it completed.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// The caller is not authenticated against the remote store.
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// Record or collection not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote store rejected the request for another reason.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The store has been shut down.
    #[error("Closed: {0}")]
    Closed(String),
}

impl Error {
    /// Whether a failed write should consume retry budget and be tried again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Backend(_)
        )
    }

    /// Whether this is the expected "request was superseded" condition.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
