//! Upgrade (WebSocket) pass-through.
//!
//! Upgrade requests are resolved like any other request but are neither retried
//! nor health tracked. The raw request goes to the backend over a fresh TCP
//! connection; if the backend switches protocols, bytes are copied both ways
//! until either side closes or the tunnel idles out.
use std::{sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    adapters::connection::ConnectionSupervisor,
    core::{
        access_log::normalize_remote_addr,
        context::ClientConnection,
        dispatcher::{host_header, set_forwarded_headers},
        response::error_page,
    },
    ports::backend_directory::BackendDirectory,
};

/// Largest backend response head accepted for an upgrade.
const MAX_HEAD: usize = 16 * 1024;

/// `Connection: upgrade` together with an `Upgrade` header.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && req.headers().contains_key(header::UPGRADE)
}

pub struct UpgradeProxy {
    directory: Arc<dyn BackendDirectory>,
    tcp_timeout: Duration,
    tunnels: ConnectionSupervisor,
}

impl UpgradeProxy {
    /// `tcp_timeout` bounds the backend connect and the idle time of an
    /// established tunnel.
    pub fn new(directory: Arc<dyn BackendDirectory>, tcp_timeout: Duration) -> Self {
        Self {
            directory,
            tcp_timeout,
            tunnels: ConnectionSupervisor::new(tcp_timeout),
        }
    }

    pub async fn handle(&self, req: Request<AxumBody>, conn: &ClientConnection) -> Response<AxumBody> {
        let (parts, _) = req.into_parts();
        let host = host_header(&parts).unwrap_or_default();

        let record = match self.directory.resolve(&host).await {
            Ok(record) => record,
            Err(e) => {
                tracing::info!(host = %host, "proxyWebSocketRequest: {}", e.message);
                return error_page(e.status, &e.message);
            }
        };

        let mut headers = parts.headers.clone();
        if let Some(remote) = conn.remote_addr {
            let remote_addr = normalize_remote_addr(&remote.ip().to_string());
            if let Err(e) = set_forwarded_headers(&mut headers, &remote_addr, conn) {
                tracing::debug!(host = %host, error = %e, "Skipping forwarded headers");
            }
        }
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let raw_request = build_upgrade_request(parts.method.as_str(), path, &headers);

        let addr = (record.hostname.as_str(), record.port);
        let mut backend = match timeout(self.tcp_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(host = %host, backend = %record.href, error = %e, "Failed to connect to backend for upgrade");
                return error_page(StatusCode::BAD_GATEWAY, "Cannot connect to the backend");
            }
            Err(_) => {
                tracing::warn!(host = %host, backend = %record.href, "Timed out connecting to backend for upgrade");
                return error_page(StatusCode::BAD_GATEWAY, "Cannot connect to the backend");
            }
        };

        if let Err(e) = backend.write_all(&raw_request).await {
            tracing::warn!(host = %host, error = %e, "Failed to send upgrade request to backend");
            return error_page(StatusCode::BAD_GATEWAY, "Cannot connect to the backend");
        }

        let (head, leftover) = match read_response_head(&mut backend).await {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::warn!(host = %host, reason, "Invalid upgrade response from backend");
                return error_page(StatusCode::BAD_GATEWAY, "Invalid upgrade response from backend");
            }
        };

        let mut response = Response::new(AxumBody::empty());
        *response.status_mut() = head.status;
        for (name, value) in head.headers.iter() {
            if head.status == StatusCode::SWITCHING_PROTOCOLS
                && (name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING)
            {
                continue;
            }
            response.headers_mut().append(name.clone(), value.clone());
        }

        if head.status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(host = %host, status = %head.status, "Backend rejected upgrade request");
            return response;
        }

        let request = Request::from_parts(parts, AxumBody::empty());
        let host_for_task = host.clone();
        let tunnels = self.tunnels.clone();
        let peer = conn.remote_addr;
        tokio::spawn(async move {
            match hyper::upgrade::on(request).await {
                Ok(upgraded) => {
                    let (client, handle) = tunnels.wrap(TokioIo::new(upgraded), peer);
                    tunnels
                        .supervise(&handle, forward(client, backend, leftover, &host_for_task))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(host = %host_for_task, error = %e, "Failed to upgrade client connection")
                }
            }
        });
        response
    }
}

/// Copy bytes between the upgraded client and the backend. Every byte moves
/// through `client`, so its activity covers both directions.
async fn forward<C, B>(
    mut client: C,
    mut backend: B,
    leftover: Vec<u8>,
    host: &str,
) -> Result<(), std::io::Error>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        client.write_all(&leftover).await?;
    }
    let (to_backend, to_client) = tokio::io::copy_bidirectional(&mut client, &mut backend).await?;
    tracing::debug!(host, to_backend, to_client, "Upgraded connection closed");
    Ok(())
}

fn build_upgrade_request(method: &str, path: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut request = format!("{method} {path} HTTP/1.1\r\n");
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    request.push_str("\r\n");
    request.into_bytes()
}

#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

/// Read until the end of the response head. Returns the parsed head and any
/// bytes the backend already sent past it.
async fn read_response_head(
    backend: &mut TcpStream,
) -> Result<(ResponseHead, Vec<u8>), &'static str> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = backend
            .read(&mut chunk)
            .await
            .map_err(|_| "read error")?;
        if n == 0 {
            return Err("backend closed the connection");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = parse_response_head(&buf[..end])?;
            return Ok((head, buf[end + 4..].to_vec()));
        }
        if buf.len() > MAX_HEAD {
            return Err("response head too large");
        }
    }
}

fn parse_response_head(data: &[u8]) -> Result<ResponseHead, &'static str> {
    let text = std::str::from_utf8(data).map_err(|_| "response head is not UTF-8")?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or("empty response")?;
    let code = status_line
        .split(' ')
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or("malformed status line")?;
    let status = StatusCode::from_u16(code).map_err(|_| "invalid status code")?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }
    Ok(ResponseHead { status, headers })
}
