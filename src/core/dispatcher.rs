//! Request dispatcher: resolve, redirect or proxy, classify failures, retry.
//!
//! Each inbound request runs one bounded loop:
//!
//! 1. resolve the `Host` header against the [`BackendDirectory`];
//! 2. answer redirect backends with a 301;
//! 3. forward the buffered request to the resolved backend;
//! 4. on an upstream response, apply the status-code health rule and stream it back;
//! 5. on an upstream failure, apply the connection health rule and either resolve
//!    again or answer with a terminal 502.
use std::{sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    header::{self, HeaderValue},
    http::request::Parts,
};

use crate::{
    config::models::PorticoConfig,
    core::{
        access_log::normalize_remote_addr,
        backend::BackendRecord,
        context::ClientConnection,
        health,
        response::{RequestSummary, ResponseWrapper, X_DEBUG, is_synthesized},
    },
    ports::{
        access_log::AccessLogSink,
        backend_directory::BackendDirectory,
        upstream::{UpstreamClient, UpstreamError, UpstreamTarget},
    },
};

/// Hop-by-hop headers never forwarded to a backend.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Knobs of the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of retries after the first failed attempt. Zero disables retry.
    pub retry_ceiling: u32,
    pub dead_backend_on_500: bool,
    /// Deadline for one attempt to get a response head
    pub tcp_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            dead_backend_on_500: true,
            tcp_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&PorticoConfig> for DispatchConfig {
    fn from(config: &PorticoConfig) -> Self {
        Self {
            retry_ceiling: config.server.retry_on_error,
            dead_backend_on_500: config.server.dead_backend_on_500,
            tcp_timeout: config.server.tcp_timeout(),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug)]
enum RetryDecision {
    Retry,
    /// Terminal 502 with the given message
    Abort(&'static str),
}

pub struct Dispatcher {
    directory: Arc<dyn BackendDirectory>,
    upstream: Arc<dyn UpstreamClient>,
    access_log: Arc<dyn AccessLogSink>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn BackendDirectory>,
        upstream: Arc<dyn UpstreamClient>,
        access_log: Arc<dyn AccessLogSink>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            directory,
            upstream,
            access_log,
            config,
        }
    }

    pub fn directory(&self) -> &Arc<dyn BackendDirectory> {
        &self.directory
    }

    /// Handle one inbound request end to end. Never fails: every outcome is a
    /// response, synthesized when nothing better is available.
    pub async fn handle(
        &self,
        req: Request<AxumBody>,
        conn: &ClientConnection,
    ) -> Response<AxumBody> {
        let debug = req.headers().contains_key(X_DEBUG);
        let (parts, body) = req.into_parts();
        let host = host_header(&parts).unwrap_or_default();
        let mut wrapper = ResponseWrapper::new(
            debug,
            RequestSummary::from_parts(&parts),
            self.access_log.clone(),
            conn.stats.clone(),
        );

        // Buffered once so every retry replays the same bytes.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Failed to read request body");
                return wrapper.error(StatusCode::BAD_REQUEST, "Cannot read the request body");
            }
        };
        let _in_flight = conn.stats.begin_request();

        loop {
            let record = match self.directory.resolve(&host).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::info!(host = %host, status = %e.status, "{}", e.message);
                    return wrapper.error(e.status, &e.message);
                }
            };
            wrapper.context_mut().meta = Some(record.meta());

            if record.is_redirect() {
                tracing::debug!(host = %host, location = %record.href, "Redirecting to backend URL");
                return wrapper.redirect(&record.href);
            }

            let Some(remote) = conn.remote_addr else {
                tracing::warn!(host = %host, "Cannot read the remote address");
                return wrapper.error(StatusCode::BAD_REQUEST, "Cannot read the remote address.");
            };
            let remote_addr = normalize_remote_addr(&remote.ip().to_string());
            wrapper.context_mut().remote_addr = Some(remote_addr.clone());
            wrapper.context_mut().timer.mark_backend_start();

            let target = UpstreamTarget {
                hostname: record.hostname.clone(),
                port: record.port,
                secure: record.url().map(|u| u.is_secure()).unwrap_or(false),
            };
            let attempt = match build_upstream_request(&parts, body.clone(), &remote_addr, conn) {
                Ok(outgoing) => self.send_attempt(&target, outgoing, conn).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(response) => {
                    let status = response.status();
                    let verdict = health::classify_status(
                        status,
                        response.headers(),
                        self.error_threshold(),
                        is_synthesized(&response),
                    );
                    self.on_status(&record, status, verdict, &host, &parts.uri)
                        .await;
                    return wrapper.finish(response);
                }
                Err(error) => {
                    wrapper.context_mut().pending_error = Some(error);
                    match self
                        .on_proxy_error(&record, &mut wrapper, conn, &host, &parts.uri)
                        .await
                    {
                        RetryDecision::Retry => {
                            tracing::info!(host = %host, "Retrying on {host}");
                        }
                        RetryDecision::Abort(message) => {
                            return wrapper.error(StatusCode::BAD_GATEWAY, message);
                        }
                    }
                }
            }
        }
    }

    /// One attempt against `target`. A TCP timeout flagged on the client
    /// connection ends the attempt like the attempt deadline does.
    async fn send_attempt(
        &self,
        target: &UpstreamTarget,
        outgoing: Request<AxumBody>,
        conn: &ClientConnection,
    ) -> Result<Response<AxumBody>, UpstreamError> {
        let timeout = self.config.tcp_timeout;
        tokio::select! {
            result = self.upstream.send(target, outgoing, timeout) => result,
            _ = conn.stats.tcp_timed_out() => Err(UpstreamError::TcpTimeout(timeout.as_secs())),
        }
    }

    fn error_threshold(&self) -> u16 {
        health::error_threshold(
            self.config.dead_backend_on_500,
            self.directory.active_health_checks_running(),
        )
    }

    /// Connection-level failure handling: health rule, then the retry decision.
    async fn on_proxy_error(
        &self,
        record: &BackendRecord,
        wrapper: &mut ResponseWrapper,
        conn: &ClientConnection,
        host: &str,
        uri: &Uri,
    ) -> RetryDecision {
        let ctx = wrapper.context_mut();
        let error = ctx
            .pending_error
            .take()
            .unwrap_or_else(|| UpstreamError::Other("unknown upstream failure".into()));

        if error.is_backend_failure() {
            if health::should_mark_dead_on_error(&error, record.total_candidates) {
                self.directory.mark_dead(&record.meta()).await;
            }
            tracing::warn!(
                host,
                backend_id = record.id,
                error = %error,
                "{host}: backend #{} is dead ({error}) while handling request for {uri}",
                record.id
            );
        } else {
            tracing::warn!(
                host,
                backend_id = record.id,
                error = %error,
                "{host}: backend #{} reported an error ({error}) while handling request for {uri}",
                record.id
            );
        }

        if conn.stats.is_destroyed() || wrapper.headers_sent() {
            tracing::warn!(host, "{host}: Response socket already closed, aborting.");
            return RetryDecision::Abort("Cannot retry on error");
        }

        if wrapper.context().retry_count >= self.config.retry_ceiling {
            if self.config.retry_ceiling == 0 {
                return RetryDecision::Abort("Retry on error is disabled");
            }
            tracing::warn!(
                host,
                "{host}: Retry limit reached ({}), aborting.",
                self.config.retry_ceiling
            );
            return RetryDecision::Abort("Reached max retries limit");
        }

        wrapper.context_mut().retry_count += 1;
        RetryDecision::Retry
    }

    /// Acts on the status-code health verdict of a received response head.
    async fn on_status(
        &self,
        record: &BackendRecord,
        status: StatusCode,
        verdict: health::StatusVerdict,
        host: &str,
        uri: &Uri,
    ) {
        match verdict {
            health::StatusVerdict::Healthy => {}
            health::StatusVerdict::Maintenance => {
                tracing::debug!(host, backend_id = record.id, "Backend in maintenance (503 with Retry-After)");
            }
            health::StatusVerdict::Failed => {
                if health::can_mark_dead(record.total_candidates) {
                    self.directory.mark_dead(&record.meta()).await;
                }
                tracing::info!(
                    host,
                    backend_id = record.id,
                    status = status.as_u16(),
                    "{host}: backend #{} is dead (HTTP error code {}) while handling request for {uri}",
                    record.id,
                    status.as_u16()
                );
            }
        }
    }
}

/// Host the request was addressed to: the `Host` header, or the URI authority
/// for HTTP/2 requests.
pub fn host_header(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

/// Copy of the inbound request aimed at a backend, with forwarding headers set.
fn build_upstream_request(
    parts: &Parts,
    body: Bytes,
    remote_addr: &str,
    conn: &ClientConnection,
) -> Result<Request<AxumBody>, UpstreamError> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = path
        .parse()
        .map_err(|e| UpstreamError::InvalidRequest(format!("{path}: {e}")))?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    #[allow(clippy::collapsible_if)]
    if !headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
            headers.insert(header::HOST, value);
        }
    }
    set_forwarded_headers(&mut headers, remote_addr, conn)?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(AxumBody::from(body))
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// `x-forwarded-*` and `x-real-ip`, overriding whatever the client sent.
pub fn set_forwarded_headers(
    headers: &mut HeaderMap,
    remote_addr: &str,
    conn: &ClientConnection,
) -> Result<(), UpstreamError> {
    let remote = HeaderValue::from_str(remote_addr)
        .map_err(|e| UpstreamError::InvalidRequest(format!("remote address: {e}")))?;
    let proto = HeaderValue::from_static(conn.scheme());
    headers.insert("x-forwarded-for", remote.clone());
    headers.insert("x-real-ip", remote);
    headers.insert("x-forwarded-protocol", proto.clone());
    headers.insert("x-forwarded-proto", proto);
    headers.insert("x-forwarded-port", HeaderValue::from(conn.local_port));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        core::backend::BackendMeta,
        ports::{
            access_log::MemoryAccessLog,
            backend_directory::{DirectoryError, ResolveError, SniRow},
            upstream::UpstreamResult,
        },
    };

    struct StubDirectory {
        backends: Vec<&'static str>,
        resolves: AtomicUsize,
        dead: Mutex<Vec<BackendMeta>>,
        active_checks: bool,
    }

    impl StubDirectory {
        fn new(backends: Vec<&'static str>) -> Self {
            Self {
                backends,
                resolves: AtomicUsize::new(0),
                dead: Mutex::new(Vec::new()),
                active_checks: false,
            }
        }

        fn dead_marks(&self) -> usize {
            self.dead.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BackendDirectory for StubDirectory {
        async fn resolve(&self, host_header: &str) -> Result<BackendRecord, ResolveError> {
            if host_header != "a.example.com" {
                return Err(ResolveError::unknown_host());
            }
            let n = self.resolves.fetch_add(1, Ordering::SeqCst);
            let id = n % self.backends.len();
            Ok(BackendRecord::new(
                id,
                self.backends.len(),
                "frontend:a.example.com",
                host_header,
                self.backends[id],
            )
            .unwrap())
        }

        async fn mark_dead(&self, meta: &BackendMeta) {
            self.dead.lock().unwrap().push(meta.clone());
        }

        async fn sni_snapshot(&self) -> Result<Vec<SniRow>, DirectoryError> {
            Ok(Vec::new())
        }

        fn watch_sni(&self) -> mpsc::Receiver<Vec<SniRow>> {
            mpsc::channel(1).1
        }

        fn active_health_checks_running(&self) -> bool {
            self.active_checks
        }
    }

    enum Behavior {
        Refuse,
        Reset,
        Status(u16),
    }

    struct StubUpstream {
        behavior: Behavior,
        seen: Mutex<Vec<Request<AxumBody>>>,
    }

    impl StubUpstream {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for StubUpstream {
        async fn send(
            &self,
            _target: &UpstreamTarget,
            req: Request<AxumBody>,
            _timeout: Duration,
        ) -> UpstreamResult<Response<AxumBody>> {
            self.seen.lock().unwrap().push(req);
            match self.behavior {
                Behavior::Refuse => Err(UpstreamError::ConnectionRefused("refused".into())),
                Behavior::Reset => Err(UpstreamError::Other("connection reset".into())),
                Behavior::Status(code) => {
                    let mut response = Response::new(AxumBody::from("ok"));
                    *response.status_mut() = StatusCode::from_u16(code).unwrap();
                    Ok(response)
                }
            }
        }
    }

    fn conn() -> ClientConnection {
        let remote: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        ClientConnection::new(Some(remote), 8080, false)
    }

    fn request() -> Request<AxumBody> {
        Request::builder()
            .uri("/hello?x=1")
            .header(header::HOST, "a.example.com")
            .header(header::CONNECTION, "keep-alive, x-private")
            .header("x-private", "secret")
            .body(AxumBody::from("payload"))
            .unwrap()
    }

    fn dispatcher(
        directory: Arc<StubDirectory>,
        upstream: Arc<StubUpstream>,
        retry_ceiling: u32,
    ) -> Dispatcher {
        Dispatcher::new(
            directory,
            upstream,
            Arc::new(MemoryAccessLog::new()),
            DispatchConfig {
                retry_ceiling,
                ..DispatchConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/", "http://127.0.0.1:2/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Refuse));
        let d = dispatcher(directory.clone(), upstream.clone(), 2);

        let response = d.handle(request(), &conn()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Reached max retries limit\n");
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 3);
        assert_eq!(directory.dead_marks(), 3);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Refuse));
        let d = dispatcher(directory.clone(), upstream, 0);

        let response = d.handle(request(), &conn()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Retry on error is disabled\n");
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(directory.dead_marks(), 0);
    }

    #[tokio::test]
    async fn test_unclassified_error_retries_without_dead_mark() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/", "http://127.0.0.1:2/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Reset));
        let d = dispatcher(directory.clone(), upstream, 1);

        let response = d.handle(request(), &conn()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 2);
        assert_eq!(directory.dead_marks(), 0);
    }

    #[tokio::test]
    async fn test_destroyed_client_connection_stops_retrying() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/", "http://127.0.0.1:2/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Refuse));
        let d = dispatcher(directory.clone(), upstream, 5);
        let conn = conn();
        conn.stats.mark_destroyed();

        let response = d.handle(request(), &conn).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flagged_tcp_timeout_ends_attempt() {
        struct SilentUpstream;

        #[async_trait]
        impl UpstreamClient for SilentUpstream {
            async fn send(
                &self,
                _target: &UpstreamTarget,
                _req: Request<AxumBody>,
                _timeout: Duration,
            ) -> UpstreamResult<Response<AxumBody>> {
                std::future::pending().await
            }
        }

        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/", "http://127.0.0.1:2/"]));
        let d = Dispatcher::new(
            directory.clone(),
            Arc::new(SilentUpstream),
            Arc::new(MemoryAccessLog::new()),
            DispatchConfig::default(),
        );
        let conn = conn();
        let stats = conn.stats.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stats.fire_tcp_timeout();
        });

        let response = tokio::time::timeout(Duration::from_secs(5), d.handle(request(), &conn))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Cannot retry on error\n");
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(directory.dead_marks(), 1);
        assert_eq!(conn.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_host_is_terminal() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(200)));
        let d = dispatcher(directory, upstream.clone(), 3);

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "b.example.com")
            .body(AxumBody::empty())
            .unwrap();
        let response = d.handle(req, &conn()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_remote_address() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(200)));
        let d = dispatcher(directory.clone(), upstream.clone(), 3);

        let response = d.handle(request(), &ClientConnection::new(None, 80, false)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 1);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_headers_and_hop_by_hop() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(200)));
        let d = dispatcher(directory, upstream.clone(), 3);

        let response = d.handle(request(), &conn()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = upstream.seen.lock().unwrap();
        let forwarded = seen[0].headers();
        assert_eq!(forwarded["x-forwarded-for"], "::ffff:10.1.2.3");
        assert_eq!(forwarded["x-real-ip"], "::ffff:10.1.2.3");
        assert_eq!(forwarded["x-forwarded-proto"], "http");
        assert_eq!(forwarded["x-forwarded-protocol"], "http");
        assert_eq!(forwarded["x-forwarded-port"], "8080");
        assert_eq!(forwarded[header::HOST], "a.example.com");
        assert!(!forwarded.contains_key(header::CONNECTION));
        assert!(!forwarded.contains_key("x-private"));
        assert_eq!(seen[0].uri(), "/hello?x=1");
    }

    #[test]
    fn test_handle_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(500)));
        let d = dispatcher(directory, upstream, 3);
        let conn = conn();
        let handling = d.handle(request(), &conn);
        assert_send(&handling);
    }

    #[tokio::test]
    async fn test_status_rules_respect_sole_candidate() {
        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(502)));
        let d = dispatcher(directory.clone(), upstream, 3);
        let response = d.handle(request(), &conn()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(directory.dead_marks(), 0);
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 1);

        let directory = Arc::new(StubDirectory::new(vec!["http://127.0.0.1:1/", "http://127.0.0.1:2/"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(500)));
        let d = dispatcher(directory.clone(), upstream, 3);
        d.handle(request(), &conn()).await;
        assert_eq!(directory.dead_marks(), 1);
        assert_eq!(directory.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_500_ignored_when_active_checks_run() {
        let mut stub = StubDirectory::new(vec!["http://127.0.0.1:1/", "http://127.0.0.1:2/"]);
        stub.active_checks = true;
        let directory = Arc::new(stub);
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(500)));
        let d = dispatcher(directory.clone(), upstream, 3);
        d.handle(request(), &conn()).await;
        assert_eq!(directory.dead_marks(), 0);
    }

    #[tokio::test]
    async fn test_redirect_backend_is_not_proxied() {
        let directory = Arc::new(StubDirectory::new(vec!["http://other.example.com/landing"]));
        let upstream = Arc::new(StubUpstream::new(Behavior::Status(200)));
        let d = dispatcher(directory, upstream.clone(), 3);

        let response = d.handle(request(), &conn()).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://other.example.com/landing"
        );
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forwarded_proto_for_tls() {
        let conn = ClientConnection::new(None, 443, true);
        let mut headers = HeaderMap::new();
        set_forwarded_headers(&mut headers, "2001:db8::1", &conn).unwrap();
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert_eq!(headers["x-forwarded-port"], "443");
        assert_eq!(headers["x-forwarded-for"], "2001:db8::1");
    }
}
