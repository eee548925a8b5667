use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Failure of a single proxy attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The backend actively refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Connecting to the backend timed out
    #[error("Connection timed out: {0}")]
    TimedOut(String),

    /// The attempt exceeded the TCP timeout without a response head
    #[error("TCP timeout after {0} seconds")]
    TcpTimeout(u64),

    /// The outgoing request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Any other transport failure (reset, protocol error, DNS ...)
    #[error("Upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Errors that say something about the backend's health.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            UpstreamError::ConnectionRefused(_)
                | UpstreamError::TimedOut(_)
                | UpstreamError::TcpTimeout(_)
        )
    }
}

/// Result type alias for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Where a single attempt is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
}

impl UpstreamTarget {
    /// `scheme://host:port` used as the outgoing URI prefix
    pub fn origin(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        if self.hostname.contains(':') {
            format!("{scheme}://[{}]:{}", self.hostname, self.port)
        } else {
            format!("{scheme}://{}:{}", self.hostname, self.port)
        }
    }
}

/// UpstreamClient is the port for forwarding one request to a backend
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Send `req` to `target` and return once the response head is received.
    /// The body is streamed afterwards. `timeout` bounds connect + response head.
    async fn send(
        &self,
        target: &UpstreamTarget,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> UpstreamResult<Response<AxumBody>>;
}
