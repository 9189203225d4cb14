//! Error types for the interception pipeline.
//!
//! Only [`TransportError`] ever reaches the caller of a wrapped primitive, and
//! only when the real dispatch fails or the caller aborted. Gateway and
//! consent failures are recovered inside the pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Failure of a network primitive (original or wrapped).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be built (bad URL, bad header, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Failed to reach the upstream server.
    #[error("Failed to reach upstream '{url}': {message}")]
    Upstream {
        /// The URL we tried to reach.
        url: String,
        /// Error message.
        message: String,
    },

    /// Reading a response or request body failed.
    #[error("Body error: {0}")]
    Body(String),

    /// The caller aborted the call before it was dispatched.
    #[error("Request aborted")]
    Aborted,

    /// The call did not complete in time.
    #[error("Request timed out")]
    Timeout,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::Body(err.to_string())
    }
}

/// Failure talking to the local classification/vault service.
///
/// Every variant is recovered locally (fail open).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The service could not be reached.
    #[error("Classification service unavailable: {0}")]
    Unavailable(String),

    /// The service answered with a non-success status.
    #[error("Classification service returned status {0}")]
    Status(u16),

    /// The service answered with a body we could not decode.
    #[error("Malformed classification service response: {0}")]
    Decode(String),

    /// The service did not answer within the configured timeout.
    #[error("Classification service timed out after {0} ms")]
    Timeout(u64),

    /// The text exceeds the scan size cap and was not sent.
    #[error("Text of {len} bytes exceeds the {max} byte scan cap")]
    Oversized {
        /// Length of the rejected text in bytes.
        len: usize,
        /// Configured cap in bytes.
        max: usize,
    },
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => GatewayError::Timeout(0),
            other => GatewayError::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

/// Errors from installing interception into a browsing context.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The context already has hooks installed.
    #[error("Interception already installed in context {0}")]
    AlreadyInstalled(Uuid),
}
