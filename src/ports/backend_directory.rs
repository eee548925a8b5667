use async_trait::async_trait;
use hyper::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::backend::{BackendMeta, BackendRecord};

/// Resolution failure reported by the directory. The status code is passed
/// through to the client unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({status})")]
pub struct ResolveError {
    pub status: StatusCode,
    pub message: String,
}

impl ResolveError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The virtual host has no frontend.
    pub fn unknown_host() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Unknown virtual host")
    }

    /// Every backend of the frontend is currently dead.
    pub fn no_backend() -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "Cannot find a valid backend")
    }
}

/// Errors raised by directory operations other than resolution
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DirectoryError {
    #[error("Failed to read certificate material for {domain}: {reason}")]
    CertMaterial { domain: String, reason: String },
}

/// One SNI row: a domain with its PEM encoded certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniRow {
    pub domain: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// BackendDirectory is the port to the store mapping virtual hosts to backends.
///
/// Implementations must be safe to call concurrently from every in-flight request
/// of a worker.
#[async_trait]
pub trait BackendDirectory: Send + Sync + 'static {
    /// Resolve a `Host` header to one backend of its frontend.
    async fn resolve(&self, host_header: &str) -> Result<BackendRecord, ResolveError>;

    /// Mark a backend dead. Idempotent and fire-and-forget: a failure to record the
    /// mark is logged by the implementation, never surfaced to the request.
    async fn mark_dead(&self, meta: &BackendMeta);

    /// One-shot snapshot of every SNI row.
    async fn sni_snapshot(&self) -> Result<Vec<SniRow>, DirectoryError>;

    /// Channel of pushed SNI updates. Every message is the full replacement set.
    /// Can only be taken once.
    fn watch_sni(&self) -> mpsc::Receiver<Vec<SniRow>>;

    /// Whether an active health checker is running against the same backends.
    fn active_health_checks_running(&self) -> bool;
}
