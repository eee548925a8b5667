//! Per-request response wrapper.
//!
//! The dispatcher builds one [`ResponseWrapper`] per inbound request. Whatever
//! response ends up going to the client (proxied, redirect, error page) passes
//! through [`ResponseWrapper::finish`], which runs the "headers about to be sent"
//! hook exactly once and attaches the "response finished" hook to the body.
use std::sync::Arc;

use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::{
    HeaderMap, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
    http::request::Parts,
};

use crate::{
    core::{
        access_log::{AccessLogRecord, http_version_label},
        context::{ConnectionStats, RequestContext},
    },
    ports::access_log::AccessLogSink,
};

/// Request header turning debug response headers on.
pub const X_DEBUG: &str = "x-debug";

pub const X_DEBUG_VERSION: &str = "x-debug-version-portico";
pub const X_DEBUG_BACKEND_URL: &str = "x-debug-backend-url";
pub const X_DEBUG_BACKEND_ID: &str = "x-debug-backend-id";
pub const X_DEBUG_VHOST: &str = "x-debug-vhost";
pub const X_DEBUG_FRONTEND_KEY: &str = "x-debug-frontend-key";
pub const X_DEBUG_TIME_TOTAL: &str = "x-debug-time-total";
pub const X_DEBUG_TIME_BACKEND: &str = "x-debug-time-backend";
pub const X_DEBUG_ERROR: &str = "x-debug-error";

/// Response extension marking an error page generated by the proxy itself.
/// Such responses are never attributed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedError(pub String);

/// Build a proxy generated error page.
pub fn error_page(status: StatusCode, message: &str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .extensions_mut()
        .insert(SynthesizedError(message.to_string()));
    response
}

/// Whether a response was produced by [`error_page`].
pub fn is_synthesized<B>(response: &Response<B>) -> bool {
    response.extensions().get::<SynthesizedError>().is_some()
}

/// The request fields the access-log record needs once the request is gone.
#[derive(Debug, Clone, Default)]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestSummary {
    pub fn from_parts(parts: &Parts) -> Self {
        let header_string = |name: HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            method: parts.method.to_string(),
            url: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            http_version: http_version_label(parts.version).to_string(),
            referer: header_string(header::REFERER),
            user_agent: header_string(header::USER_AGENT),
        }
    }
}

pub struct ResponseWrapper {
    ctx: RequestContext,
    debug: bool,
    headers_sent: bool,
    summary: RequestSummary,
    sink: Arc<dyn AccessLogSink>,
    stats: Arc<ConnectionStats>,
}

impl ResponseWrapper {
    pub fn new(
        debug: bool,
        summary: RequestSummary,
        sink: Arc<dyn AccessLogSink>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            ctx: RequestContext::new(),
            debug,
            headers_sent: false,
            summary,
            sink,
            stats,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.ctx
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Hook run right before the response head goes out. Returns `false` and
    /// leaves the response untouched if a head was already sent.
    pub fn on_headers(&mut self, response: &mut Response<AxumBody>) -> bool {
        if self.headers_sent {
            return false;
        }
        self.headers_sent = true;
        self.ctx.timer.mark_end();

        if self.debug {
            let error = response
                .extensions()
                .get::<SynthesizedError>()
                .map(|e| e.0.clone());
            let headers = response.headers_mut();
            if let Some(message) = error {
                insert_header(headers, X_DEBUG_ERROR, &message);
            }
            self.insert_debug_headers(headers);
        }
        true
    }

    fn insert_debug_headers(&self, headers: &mut HeaderMap) {
        let Some(meta) = &self.ctx.meta else {
            return;
        };
        insert_header(headers, X_DEBUG_VERSION, env!("CARGO_PKG_VERSION"));
        insert_header(headers, X_DEBUG_BACKEND_URL, &meta.backend_url);
        insert_header(headers, X_DEBUG_BACKEND_ID, &meta.backend_id.to_string());
        insert_header(headers, X_DEBUG_VHOST, &meta.virtual_host);
        insert_header(headers, X_DEBUG_FRONTEND_KEY, &meta.frontend);
        insert_header(
            headers,
            X_DEBUG_TIME_TOTAL,
            &self.ctx.timer.total_ms().to_string(),
        );
        insert_header(
            headers,
            X_DEBUG_TIME_BACKEND,
            &self.ctx.timer.backend_ms().to_string(),
        );
    }

    /// Hand the final response to the client side. Runs the header hook and, for
    /// requests that reached a backend, emits the access-log record once the body
    /// has been fully sent or dropped.
    pub fn finish(mut self, mut response: Response<AxumBody>) -> Response<AxumBody> {
        self.on_headers(&mut response);
        if !self.ctx.is_loggable() {
            return response;
        }

        let guard = FinishGuard {
            status: response.status(),
            ctx: self.ctx,
            summary: self.summary,
            sink: self.sink,
            stats: self.stats,
        };
        let (parts, body) = response.into_parts();
        let body = body.map_frame(move |frame| {
            let _finish = &guard;
            frame
        });
        Response::from_parts(parts, AxumBody::new(body))
    }

    /// Synthesized error page with the given status.
    pub fn error(self, status: StatusCode, message: &str) -> Response<AxumBody> {
        self.finish(error_page(status, message))
    }

    /// Permanent redirect to `location`, closing the client connection.
    pub fn redirect(self, location: &str) -> Response<AxumBody> {
        let mut response = Response::new(AxumBody::empty());
        *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
        match HeaderValue::from_str(location) {
            Ok(value) => {
                response.headers_mut().insert(header::LOCATION, value);
            }
            Err(e) => {
                tracing::warn!(location, error = %e, "Redirect location is not a valid header value");
                return self.error(StatusCode::BAD_GATEWAY, "Invalid redirect location");
            }
        }
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        self.finish(response)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Emits the access-log record when the response body is dropped, which happens
/// once hyper has written the last frame or the client went away.
struct FinishGuard {
    status: StatusCode,
    ctx: RequestContext,
    summary: RequestSummary,
    sink: Arc<dyn AccessLogSink>,
    stats: Arc<ConnectionStats>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let (Some(meta), Some(remote_addr)) = (&self.ctx.meta, &self.ctx.remote_addr) else {
            return;
        };
        self.ctx.timer.mark_end();
        let summary = std::mem::take(&mut self.summary);
        self.sink.record(AccessLogRecord {
            remote_addr: remote_addr.clone(),
            current_time: self.ctx.timer.started_at(),
            total_time_ms: self.ctx.timer.total_ms(),
            backend_time_ms: self.ctx.timer.backend_ms(),
            method: summary.method,
            url: summary.url,
            http_version: summary.http_version,
            status_code: self.status.as_u16(),
            socket_bytes_written: Some(self.stats.bytes_written()),
            referer: summary.referer,
            user_agent: summary.user_agent,
            virtual_host: meta.virtual_host.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use hyper::Request;

    use super::*;
    use crate::{core::backend::BackendMeta, ports::access_log::MemoryAccessLog};

    fn meta() -> BackendMeta {
        BackendMeta {
            backend_id: 2,
            total_candidates: 3,
            frontend: "frontend:a.example.com".into(),
            virtual_host: "a.example.com".into(),
            backend_url: "http://127.0.0.1:8080/".into(),
        }
    }

    fn wrapper(debug: bool, sink: &MemoryAccessLog) -> ResponseWrapper {
        let req = Request::builder()
            .uri("/path?q=1")
            .header(header::USER_AGENT, "test-agent")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        ResponseWrapper::new(
            debug,
            RequestSummary::from_parts(&parts),
            Arc::new(sink.clone()),
            Arc::new(ConnectionStats::new()),
        )
    }

    #[test]
    fn test_headers_sent_once() {
        let sink = MemoryAccessLog::new();
        let mut w = wrapper(true, &sink);
        w.context_mut().meta = Some(meta());
        let mut first = Response::new(AxumBody::empty());
        assert!(w.on_headers(&mut first));
        assert!(first.headers().contains_key(X_DEBUG_BACKEND_ID));

        let mut second = Response::new(AxumBody::empty());
        assert!(!w.on_headers(&mut second));
        assert!(second.headers().is_empty());
    }

    #[test]
    fn test_debug_headers_only_when_requested() {
        let sink = MemoryAccessLog::new();
        let mut w = wrapper(false, &sink);
        w.context_mut().meta = Some(meta());
        let mut response = Response::new(AxumBody::empty());
        w.on_headers(&mut response);
        assert!(
            response
                .headers()
                .keys()
                .all(|k| !k.as_str().starts_with("x-debug"))
        );

        let mut w = wrapper(true, &sink);
        w.context_mut().meta = Some(meta());
        let mut response = Response::new(AxumBody::empty());
        w.on_headers(&mut response);
        let headers = response.headers();
        assert_eq!(headers[X_DEBUG_BACKEND_ID], "2");
        assert_eq!(headers[X_DEBUG_VHOST], "a.example.com");
        assert_eq!(headers[X_DEBUG_FRONTEND_KEY], "frontend:a.example.com");
        assert_eq!(headers[X_DEBUG_BACKEND_URL], "http://127.0.0.1:8080/");
        assert!(headers.contains_key(X_DEBUG_VERSION));
        assert!(headers.contains_key(X_DEBUG_TIME_TOTAL));
        assert!(headers.contains_key(X_DEBUG_TIME_BACKEND));
    }

    #[test]
    fn test_error_page_debug_without_meta() {
        let sink = MemoryAccessLog::new();
        let w = wrapper(true, &sink);
        let response = w.error(StatusCode::BAD_REQUEST, "Unknown virtual host");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(is_synthesized(&response));
        assert_eq!(response.headers()[X_DEBUG_ERROR], "Unknown virtual host");
        assert!(!response.headers().contains_key(X_DEBUG_BACKEND_ID));
    }

    #[test]
    fn test_redirect_response() {
        let sink = MemoryAccessLog::new();
        let mut w = wrapper(false, &sink);
        w.context_mut().meta = Some(meta());
        let response = w.redirect("http://other.example.com/landing");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://other.example.com/landing"
        );
        assert_eq!(response.headers()[header::CONNECTION], "close");
        drop(response);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_access_log_emitted_after_body() {
        let sink = MemoryAccessLog::new();
        let mut w = wrapper(false, &sink);
        w.context_mut().meta = Some(meta());
        w.context_mut().remote_addr = Some("::ffff:127.0.0.1".into());
        w.context_mut().timer.mark_backend_start();

        let response = w.finish(Response::new(AxumBody::from("hello")));
        assert!(sink.records().is_empty());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].virtual_host, "a.example.com");
        assert_eq!(records[0].url, "/path?q=1");
        assert_eq!(records[0].status_code, 200);
        assert_eq!(records[0].user_agent.as_deref(), Some("test-agent"));
        assert_eq!(records[0].remote_addr, "::ffff:127.0.0.1");
    }

    #[test]
    fn test_no_record_without_remote_address() {
        let sink = MemoryAccessLog::new();
        let mut w = wrapper(false, &sink);
        w.context_mut().meta = Some(meta());
        let response = w.finish(Response::new(AxumBody::from("x")));
        drop(response);
        assert!(sink.records().is_empty());
    }
}
