//! Error types for proxy operations.
//!
//! Pipeline failures never show up here: they fail open inside the wrapped
//! primitives. What remains is the proxy's own plumbing:
//! - Server errors (binding, accept)
//! - Request errors (unusable request target)
//! - Tunnel errors (upstream connect, upgrade)

use crate::intercept::InstallError;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Building a response failed.
    #[error("Failed to build response: {0}")]
    Response(#[from] hyper::http::Error),

    /// The client sent a request the proxy cannot forward.
    #[error("Invalid proxy request: {0}")]
    InvalidRequest(String),

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Installing interception for a connection failed.
    #[error("Interception install failed: {0}")]
    Install(#[from] InstallError),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
