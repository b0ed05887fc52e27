//! Transport error taxonomy.

use std::io;
use std::time::Duration;

/// Result alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a request and the wire.
///
/// None of these are retried inside the crate; retry is the caller's call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP connect failed (DNS, refused, unreachable, timed out).
    #[error("TCP dial to {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    /// TLS handshake failed after the TCP leg was up.
    #[error("TLS handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: String, reason: String },

    /// TLS handshake did not finish in time. The socket is already closed.
    #[error("TLS handshake with {addr} timed out after {timeout:?}")]
    HandshakeTimeout { addr: String, timeout: Duration },

    /// The server picked an ALPN protocol we never offered.
    #[error("unsupported protocol negotiated: {0}")]
    UnsupportedProtocol(String),

    /// CONNECT through the upstream proxy did not yield a tunnel.
    #[error("upstream proxy CONNECT failed: {0}")]
    UpstreamConnectFailed(String),

    /// Method, URL, headers or body could not form a request.
    #[error("failed to build request: {0}")]
    RequestBuild(String),

    /// A response body grew past the configured cap.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The caller's deadline expired or the operation was cancelled.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// HTTP/1.1 wire error.
    #[error("HTTP/1.1 error: {0}")]
    Http(#[from] hyper::Error),

    /// HTTP/2 wire error.
    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn dial(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn handshake(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::HandshakeFailed {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn upstream(reason: impl Into<String>) -> Self {
        Self::UpstreamConnectFailed(reason.into())
    }

    pub fn request(reason: impl ToString) -> Self {
        Self::RequestBuild(reason.to_string())
    }

    /// True for failures that happened before any byte reached the origin.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. }
                | Self::HandshakeFailed { .. }
                | Self::HandshakeTimeout { .. }
                | Self::UpstreamConnectFailed(_)
                | Self::UnsupportedProtocol(_)
        )
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Self::RequestBuild(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Cancelled(err.to_string())
    }
}
