//! Per-request and per-connection state handed to the dispatcher.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{core::backend::BackendMeta, ports::upstream::UpstreamError};

/// Byte counters and liveness of one accepted client connection.
///
/// Written by the connection supervisor, read by the dispatcher when it needs to
/// know whether the client socket is still there and how much was written to it.
/// A TCP timeout that hits while a request is being dispatched is not acted on
/// by the supervisor directly: it fires [`ConnectionStats::tcp_timed_out`] and
/// the dispatcher classifies the running attempt.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    destroyed: AtomicBool,
    in_flight: AtomicUsize,
    tcp_timeout: CancellationToken,
}

/// Marks one request as being dispatched on its connection until dropped.
#[derive(Debug)]
pub struct InFlight {
    stats: Arc<ConnectionStats>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn begin_request(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            stats: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Flag the connection as timed out and destroyed. Returns `false` if it
    /// was already flagged.
    pub fn fire_tcp_timeout(&self) -> bool {
        if self.tcp_timeout.is_cancelled() {
            return false;
        }
        self.mark_destroyed();
        self.tcp_timeout.cancel();
        true
    }

    pub fn is_tcp_timed_out(&self) -> bool {
        self.tcp_timeout.is_cancelled()
    }

    /// Resolves once [`ConnectionStats::fire_tcp_timeout`] was called.
    pub fn tcp_timed_out(&self) -> WaitForCancellationFuture<'_> {
        self.tcp_timeout.cancelled()
    }
}

/// What the dispatcher knows about the client connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub remote_addr: Option<SocketAddr>,
    /// Port of the listener that accepted the connection
    pub local_port: u16,
    /// Whether the connection was TLS terminated
    pub secure: bool,
    pub stats: Arc<ConnectionStats>,
}

impl ClientConnection {
    pub fn new(remote_addr: Option<SocketAddr>, local_port: u16, secure: bool) -> Self {
        Self {
            remote_addr,
            local_port,
            secure,
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }
}

/// Request timings. `start` is taken at arrival; `start_backend` right before the
/// first byte goes to a backend; `end` when the response head is sent and again
/// when the response completes.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    start: Instant,
    started_at: DateTime<Utc>,
    start_backend: Option<Instant>,
    end: Option<Instant>,
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            started_at: Utc::now(),
            start_backend: None,
            end: None,
        }
    }

    /// Wall clock arrival time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn mark_backend_start(&mut self) {
        self.start_backend = Some(Instant::now());
    }

    pub fn mark_end(&mut self) {
        self.end = Some(Instant::now());
    }

    fn end(&self) -> Instant {
        self.end.unwrap_or_else(Instant::now)
    }

    pub fn total(&self) -> Duration {
        self.end().saturating_duration_since(self.start)
    }

    /// Zero when no backend was ever contacted.
    pub fn backend(&self) -> Duration {
        match self.start_backend {
            Some(start_backend) => self.end().saturating_duration_since(start_backend),
            None => Duration::ZERO,
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.total().as_millis() as u64
    }

    pub fn backend_ms(&self) -> u64 {
        self.backend().as_millis() as u64
    }
}

/// State of one inbound request, owned by the task dispatching it.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Set once the directory resolved a backend; replaced on every retry
    pub meta: Option<BackendMeta>,
    pub retry_count: u32,
    pub timer: RequestTimer,
    /// Normalized client address, set once forwarding headers were applied
    pub remote_addr: Option<String>,
    /// Error of the last failed attempt, consumed by the retry decision
    pub pending_error: Option<UpstreamError>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only requests that reached a backend produce an access-log record.
    pub fn is_loggable(&self) -> bool {
        self.meta.is_some() && self.remote_addr.is_some()
    }
}
