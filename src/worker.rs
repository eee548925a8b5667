//! One worker process: listeners, TLS termination and the per-connection
//! HTTP server feeding the dispatcher.
//!
//! Every worker binds the same ports with `SO_REUSEPORT`, so the kernel spreads
//! incoming connections across the pool. A worker runs a single-threaded tokio
//! runtime; all in-flight requests are tasks on that one loop.
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::Arc,
};

use axum::body::Body as AxumBody;
use eyre::{Result, WrapErr, eyre};
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as AutoBuilder,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{
        connection::ConnectionSupervisor,
        file_directory::FileDirectory,
        http_client::HttpClientAdapter,
        ipc::IpcChannel,
        tls::{TlsContextRegistry, load_default_cert, server_config},
        websocket::{UpgradeProxy, is_upgrade_request},
    },
    config::{PorticoConfig, ServerConfig, load_config},
    core::{
        context::ClientConnection,
        dispatcher::{DispatchConfig, Dispatcher},
    },
    ports::{AccessLogSink, BackendDirectory, UpstreamClient},
    tracing_setup,
    utils::shutdown::ignore_worker_signals,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const LISTEN_BACKLOG: i32 = 1024;

/// A bound listening socket and whether it terminates TLS.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub addr: SocketAddr,
    pub secure: bool,
}

fn reuse_port_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .wrap_err("Failed to create socket")?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into()).wrap_err_with(|| format!("Failed to register {addr}"))
}

/// Bind the HTTP port (and the HTTPS port, if configured) on every configured
/// address. An address that cannot be bound is logged and skipped; binding
/// nothing at all is an error.
pub fn bind_listeners(server: &ServerConfig) -> Result<Vec<BoundListener>> {
    let mut plan: Vec<(&str, u16, bool)> = server
        .bind
        .iter()
        .map(|addr| (addr.as_str(), server.port, false))
        .collect();
    if let Some(https) = &server.https {
        let addrs = https.bind.as_ref().unwrap_or(&server.bind);
        plan.extend(addrs.iter().map(|addr| (addr.as_str(), https.port, true)));
    }

    let mut listeners = Vec::with_capacity(plan.len());
    for (ip, port, secure) in plan {
        let ip: IpAddr = match ip.parse() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(address = ip, error = %e, "Skipping invalid bind address");
                continue;
            }
        };
        match reuse_port_listener(SocketAddr::new(ip, port)) {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                listeners.push(BoundListener {
                    listener,
                    addr,
                    secure,
                });
            }
            Err(e) => tracing::warn!(address = %ip, port, error = %e, "Cannot listen"),
        }
    }

    if listeners.is_empty() {
        return Err(eyre!("No listening socket could be bound"));
    }
    Ok(listeners)
}

/// Everything one worker needs to serve connections.
pub struct WorkerContext {
    id: u32,
    dispatcher: Arc<Dispatcher>,
    upgrades: Arc<UpgradeProxy>,
    connections: ConnectionSupervisor,
    registry: Arc<TlsContextRegistry>,
    tls: Option<TlsAcceptor>,
}

impl WorkerContext {
    pub fn new(
        id: u32,
        config: &PorticoConfig,
        directory: Arc<dyn BackendDirectory>,
        upstream: Arc<dyn UpstreamClient>,
        access_log: Arc<dyn AccessLogSink>,
    ) -> Result<Self> {
        let default_cert = match &config.server.https {
            Some(https) => Some(load_default_cert(&https.cert, &https.key)?),
            None => None,
        };
        let registry = Arc::new(TlsContextRegistry::new(default_cert));
        let tls = config
            .server
            .https
            .as_ref()
            .map(|_| TlsAcceptor::from(Arc::new(server_config(registry.clone()))));

        let dispatcher = Arc::new(Dispatcher::new(
            directory.clone(),
            upstream,
            access_log,
            DispatchConfig::from(config),
        ));
        let upgrades = Arc::new(UpgradeProxy::new(directory, config.server.tcp_timeout()));

        Ok(Self {
            id,
            dispatcher,
            upgrades,
            connections: ConnectionSupervisor::new(config.server.tcp_timeout()),
            registry,
            tls,
        })
    }

    /// Load the current SNI rows, then keep following directory updates.
    pub async fn start_sni_updates(&self) {
        let directory = self.dispatcher.directory().clone();
        self.registry.initialize(directory.as_ref()).await;
        self.registry.clone().follow(directory.watch_sni());
    }

    /// Accept on every listener until `shutdown` is cancelled.
    pub async fn serve(self: Arc<Self>, listeners: Vec<BoundListener>, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();
        for bound in listeners {
            if bound.secure && self.tls.is_none() {
                tracing::warn!(addr = %bound.addr, "No TLS configuration, not serving HTTPS listener");
                continue;
            }
            loops.spawn(self.clone().accept_loop(bound, shutdown.clone()));
        }
        while loops.join_next().await.is_some() {}
        tracing::info!(worker = self.id, "Worker stopped accepting connections");
    }

    async fn accept_loop(self: Arc<Self>, bound: BoundListener, shutdown: CancellationToken) {
        tracing::info!(worker = self.id, addr = %bound.addr, secure = bound.secure, "Listening");
        loop {
            tokio::select! {
                accepted = bound.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(self.clone().serve_connection(
                            stream,
                            peer,
                            bound.addr.port(),
                            bound.secure,
                        ));
                    }
                    Err(e) => tracing::error!(addr = %bound.addr, error = %e, "Failed to accept connection"),
                },
                _ = shutdown.cancelled() => break,
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        local_port: u16,
        secure: bool,
    ) {
        let (stream, handle) = self.connections.accept(stream, Some(peer));
        let conn = ClientConnection::new(Some(peer), local_port, secure)
            .with_stats(handle.stats.clone());
        let worker = self.clone();
        let serve = async move {
            match (&worker.tls, secure) {
                (Some(acceptor), true) => {
                    let tls = acceptor.accept(stream).await.map_err(BoxError::from)?;
                    worker.serve_http(tls, conn).await
                }
                _ => worker.serve_http(stream, conn).await,
            }
        };
        self.connections.supervise(&handle, serve).await;
    }

    async fn serve_http<S>(self: &Arc<Self>, io: S, conn: ClientConnection) -> Result<(), BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let worker = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let worker = worker.clone();
            let conn = conn.clone();
            async move {
                let req = req.map(AxumBody::new);
                let response = if is_upgrade_request(&req) {
                    worker.upgrades.handle(req, &conn).await
                } else {
                    worker.dispatcher.handle(req, &conn).await
                };
                Ok::<_, Infallible>(response)
            }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .http2()
            .serve_connection_with_upgrades(TokioIo::new(io), service)
            .await
    }
}

/// Entry point of the hidden `worker` subcommand.
pub fn run(worker_id: u32, config_path: &Path) -> Result<()> {
    let ipc = IpcChannel::stdout(worker_id);
    tracing_setup::init_worker_tracing(ipc.clone())?;
    let config = load_config(config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to build worker runtime")?;

    runtime.block_on(async move {
        let _signals = ignore_worker_signals()?;

        let directory: Arc<dyn BackendDirectory> = Arc::new(FileDirectory::new(&config.directory)?);
        let upstream: Arc<dyn UpstreamClient> =
            Arc::new(HttpClientAdapter::from_config(&config.server)?);
        let access_log: Arc<dyn AccessLogSink> = Arc::new(ipc.clone());

        let worker = Arc::new(WorkerContext::new(
            worker_id,
            &config,
            directory,
            upstream,
            access_log,
        )?);
        worker.start_sni_updates().await;

        let listeners = bind_listeners(&config.server)?;
        tracing::info!(worker = worker_id, listeners = listeners.len(), "Worker started");

        // A closed IPC channel means the master is gone.
        worker.serve(listeners, ipc.closed()).await;
        Ok(())
    })
}
