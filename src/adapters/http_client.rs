use std::{error::Error as StdError, io, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Uri, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::{
    config::models::ServerConfig,
    ports::upstream::{UpstreamClient, UpstreamError, UpstreamResult, UpstreamTarget},
};

/// Upstream client on hyper-util's pooled client with Rustls for `https://` backends.
///
/// With keep-alive disabled the pool keeps no idle connection, so every attempt
/// opens a fresh socket to the backend and closes it afterwards.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new(keep_alive: bool, max_idle_per_host: usize) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let idle = if keep_alive { max_idle_per_host } else { 0 };
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(idle)
            .build::<_, AxumBody>(https_connector);

        tracing::debug!(keep_alive, max_idle_per_host = idle, "Created upstream HTTP client");
        Ok(Self { client })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(config.http_keep_alive, config.max_sockets)
    }
}

/// Map a client error onto the attempt failure classes. Refused and timed out
/// connects are recognised through the io::Error somewhere in the source chain.
fn classify(error: &hyper_util::client::legacy::Error) -> UpstreamError {
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => {
                    return UpstreamError::ConnectionRefused(io_err.to_string());
                }
                io::ErrorKind::TimedOut => return UpstreamError::TimedOut(io_err.to_string()),
                _ => {}
            }
        }
        source = err.source();
    }
    UpstreamError::Other(error.to_string())
}

#[async_trait]
impl UpstreamClient for HttpClientAdapter {
    async fn send(
        &self,
        target: &UpstreamTarget,
        req: Request<AxumBody>,
        tcp_timeout: Duration,
    ) -> UpstreamResult<Response<AxumBody>> {
        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("{}{}", target.origin(), path)
            .parse::<Uri>()
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        parts.version = Version::HTTP_11;

        tracing::debug!(
            method = %parts.method,
            uri = %parts.uri,
            "Sending request to backend"
        );
        let outgoing = Request::from_parts(parts, body);

        match timeout(tcp_timeout, self.client.request(outgoing)).await {
            Ok(Ok(response)) => {
                let (mut parts, hyper_body) = response.into_parts();
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Ok(Err(e)) => {
                let error = classify(&e);
                tracing::debug!(backend = %target.origin(), error = %e, "Backend request failed");
                Err(error)
            }
            Err(_) => Err(UpstreamError::TcpTimeout(tcp_timeout.as_secs())),
        }
    }
}
