//! Portico - a virtual-host reverse proxy with passive backend health tracking.
//!
//! Portico routes each request by its `Host` header to one of the backends a
//! backend directory lists for that virtual host. Failed attempts are retried
//! against a fresh resolution up to a configurable ceiling, and backends that
//! refuse connections or answer with server errors are reported dead to the
//! directory so it stops handing them out.
//!
//! # Features
//! - HTTP/1.1 + HTTP/2, optional TLS with per-domain certificates (SNI) that are
//!   replaced live whenever the directory pushes a new set
//! - Retry state machine with a bounded retry ceiling and 502 on exhaustion
//! - Passive health tracking (connection failures and 5xx responses)
//! - Redirect backends, `x-debug` diagnostic headers, WebSocket pass-through
//! - Master process supervising a self-healing pool of worker processes
//! - Fixed-format access log written by the master, reopened on `SIGUSR1`
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portico::{
//!     AccessLogSink, BackendDirectory, DispatchConfig, Dispatcher, FileDirectory,
//!     HttpClientAdapter, MemoryAccessLog, UpstreamClient,
//! };
//!
//! # fn main() -> eyre::Result<()> {
//! let config = portico::config::load_config("config.toml")?;
//! let directory: Arc<dyn BackendDirectory> = Arc::new(FileDirectory::new(&config.directory)?);
//! let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpClientAdapter::from_config(&config.server)?);
//! let access_log: Arc<dyn AccessLogSink> = Arc::new(MemoryAccessLog::new());
//! let dispatcher = Dispatcher::new(directory, upstream, access_log, DispatchConfig::from(&config));
//! # let _ = dispatcher;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the request logic inside `core`. `worker` and `supervisor` wire adapters into processes.
//!
//! # Error Handling
//! Application-level APIs return `eyre::Result<T>`; the seams between components use
//! domain specific error enums. Clients only ever see a status code and a short message.
pub mod config;
pub mod ports;
pub mod supervisor;
pub mod tracing_setup;
pub mod utils;
pub mod worker;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{
        AccessLogFile, ConnectionSupervisor, FileDirectory, HttpClientAdapter, IpcChannel,
        TlsContextRegistry, UpgradeProxy,
    },
    core::{DispatchConfig, Dispatcher},
    ports::{
        AccessLogSink, BackendDirectory, MemoryAccessLog, UpstreamClient, UpstreamError,
    },
    supervisor::{WorkerCommand, WorkerPool},
    worker::WorkerContext,
};
