//! Per-connection policy for accepted client sockets.
//!
//! Every accepted socket gets TCP keep-alive turned off and is wrapped in a
//! [`SupervisedStream`] that counts bytes and records activity. The connection
//! future then runs under [`ConnectionSupervisor::supervise`], which drops it
//! (closing the socket) once nothing moved for the idle timeout. While a
//! request is being dispatched the timeout is handed to the dispatcher instead,
//! through [`ConnectionStats::fire_tcp_timeout`].
use std::{
    fmt::Display,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use socket2::SockRef;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::core::context::ConnectionStats;

#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Handle on one supervised connection, used for logging and by the dispatcher.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub peer: Option<SocketAddr>,
    pub stats: Arc<ConnectionStats>,
    activity: Arc<Activity>,
}

impl ConnectionHandle {
    pub fn elapsed(&self) -> Duration {
        self.activity.origin.elapsed()
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (addr, port) = match self.peer {
            Some(peer) => (peer.ip().to_string(), peer.port().to_string()),
            None => ("unknown".to_string(), "unknown".to_string()),
        };
        write!(
            f,
            "{{remoteAddress: {addr}, remotePort: {port}, bytesWritten: {}, bytesRead: {}, elapsed: {}}}",
            self.stats.bytes_written(),
            self.stats.bytes_read(),
            self.elapsed().as_secs_f64()
        )
    }
}

/// Byte-counting IO wrapper around an accepted socket.
pub struct SupervisedStream<S> {
    inner: S,
    stats: Arc<ConnectionStats>,
    activity: Arc<Activity>,
}

impl<S> SupervisedStream<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SupervisedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.stats.add_read(n);
                self.activity.touch();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SupervisedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.stats.add_written(n);
                self.activity.touch();
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Idle timeout and socket options applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    idle_timeout: Duration,
}

impl ConnectionSupervisor {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    /// Turn TCP keep-alive off and wrap the socket.
    pub fn accept(
        &self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> (SupervisedStream<TcpStream>, ConnectionHandle) {
        if let Err(e) = SockRef::from(&stream).set_keepalive(false) {
            tracing::debug!(error = %e, "Failed to disable TCP keep-alive");
        }
        self.wrap(stream, peer)
    }

    /// Wrap any stream (used directly by tests on in-memory pipes).
    pub fn wrap<S>(&self, stream: S, peer: Option<SocketAddr>) -> (SupervisedStream<S>, ConnectionHandle) {
        let stats = Arc::new(ConnectionStats::new());
        let activity = Arc::new(Activity::new());
        let handle = ConnectionHandle {
            peer,
            stats: stats.clone(),
            activity: activity.clone(),
        };
        (
            SupervisedStream {
                inner: stream,
                stats,
                activity,
            },
            handle,
        )
    }

    /// Drive `serve` until it completes or the connection idles out. The
    /// connection is flagged destroyed in both cases.
    pub async fn supervise<F, E>(&self, handle: &ConnectionHandle, serve: F)
    where
        F: Future<Output = Result<(), E>>,
        E: Display,
    {
        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    tracing::info!("TCP error from {handle}; Error: {e}");
                }
            }
            _ = self.idle_watchdog(handle) => {
                tracing::info!("TCP timeout from {handle}");
            }
        }
        handle.stats.mark_destroyed();
    }

    async fn idle_watchdog(&self, handle: &ConnectionHandle) {
        loop {
            let idle = handle.activity.idle();
            if idle < self.idle_timeout {
                tokio::time::sleep(self.idle_timeout - idle).await;
                continue;
            }
            if handle.stats.in_flight() == 0 {
                return;
            }
            // The dispatcher owns the running attempt; it answers and the
            // connection idles out on a later pass.
            if handle.stats.fire_tcp_timeout() {
                tracing::info!("TCP timeout from {handle} while dispatching");
            }
            handle.activity.touch();
        }
    }
}
