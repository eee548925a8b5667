//! Configuration data structures for Portico.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and carry defaults so that a minimal config only names the directory
//! source. Builders here are part of the public API for embedding and tests.
use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

fn default_workers() -> usize {
    10
}

fn default_access_log() -> PathBuf {
    PathBuf::from("/var/log/portico_access.log")
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_bind() -> Vec<String> {
    vec!["0.0.0.0".to_string(), "::1".to_string()]
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_retry_on_error() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_sockets() -> usize {
    100
}

fn default_dead_backend_ttl() -> u64 {
    30
}

/// Top level configuration: the serving fleet plus the backend directory source.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PorticoConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub directory: DirectoryConfig,
}

/// Worker fleet and per-request dispatch settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Number of worker processes forked by the master
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Access log file, owned by the master
    #[serde(default = "default_access_log")]
    pub access_log: PathBuf,
    /// Plain HTTP port
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Addresses every port is bound on (one IPv4 and one IPv6 entry by default)
    #[serde(default = "default_bind")]
    pub bind: Vec<String>,
    /// Idle timeout of client connections and of a single upstream attempt, in seconds
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout: u64,
    /// Retry ceiling; 0 disables retry on error
    #[serde(default = "default_retry_on_error")]
    pub retry_on_error: u32,
    /// Count HTTP 500 from a backend as a failure
    #[serde(default = "default_true")]
    pub dead_backend_on_500: bool,
    /// Reuse upstream connections between requests
    #[serde(default)]
    pub http_keep_alive: bool,
    /// Max idle upstream connections kept per backend when keep-alive is on
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    #[serde(default)]
    pub https: Option<HttpsConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            access_log: default_access_log(),
            port: default_http_port(),
            bind: default_bind(),
            tcp_timeout: default_tcp_timeout(),
            retry_on_error: default_retry_on_error(),
            dead_backend_on_500: true,
            http_keep_alive: false,
            max_sockets: default_max_sockets(),
            https: None,
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    inner: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.inner.workers = workers;
        self
    }

    pub fn access_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.access_log = path.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.inner.port = port;
        self
    }

    pub fn bind(mut self, addrs: Vec<String>) -> Self {
        self.inner.bind = addrs;
        self
    }

    pub fn tcp_timeout(mut self, secs: u64) -> Self {
        self.inner.tcp_timeout = secs;
        self
    }

    pub fn retry_on_error(mut self, ceiling: u32) -> Self {
        self.inner.retry_on_error = ceiling;
        self
    }

    pub fn dead_backend_on_500(mut self, enabled: bool) -> Self {
        self.inner.dead_backend_on_500 = enabled;
        self
    }

    pub fn http_keep_alive(mut self, enabled: bool) -> Self {
        self.inner.http_keep_alive = enabled;
        self
    }

    /// Enable HTTPS with a default certificate/key pair
    pub fn https(mut self, port: u16, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.inner.https = Some(HttpsConfig {
            port,
            cert: cert.into(),
            key: key.into(),
            bind: None,
        });
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.inner.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.inner.bind.is_empty() {
            return Err("at least one bind address is required".to_string());
        }
        Ok(self.inner)
    }
}

/// HTTPS listener. `cert`/`key` is the default pair used when no SNI entry matches.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpsConfig {
    #[serde(default = "default_https_port")]
    pub port: u16,
    /// Path to PEM encoded certificate chain
    pub cert: PathBuf,
    /// Path to PEM encoded private key
    pub key: PathBuf,
    /// Bind addresses; falls back to `server.bind`
    #[serde(default)]
    pub bind: Option<Vec<String>>,
}

/// Where the file-backed backend directory reads frontends and SNI rows from.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    /// Seconds a passive dead mark excludes a backend from selection
    #[serde(default = "default_dead_backend_ttl")]
    pub dead_backend_ttl: u64,
    /// Whether an external active health checker is running
    #[serde(default)]
    pub active_health_checks: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("frontends.toml"),
            dead_backend_ttl: default_dead_backend_ttl(),
            active_health_checks: false,
        }
    }
}

/// Contents of the directory source file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DirectorySource {
    /// Virtual host (exact, `*.parent` wildcard or `*`) to frontend definition
    #[serde(default)]
    pub frontends: HashMap<String, FrontendEntry>,
    #[serde(default)]
    pub sni: Vec<SniEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FrontendEntry {
    /// Display name of the application behind the frontend
    #[serde(default)]
    pub name: Option<String>,
    pub backends: Vec<String>,
}

/// One per-domain certificate, referenced by file path.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SniEntry {
    pub domain: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Output format of the master's own log stream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.workers, 10);
        assert_eq!(cfg.port, 80);
        assert_eq!(cfg.retry_on_error, 3);
        assert!(cfg.dead_backend_on_500);
        assert!(!cfg.http_keep_alive);
        assert_eq!(cfg.tcp_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        assert!(ServerConfig::builder().workers(0).build().is_err());
        let cfg = ServerConfig::builder()
            .workers(2)
            .retry_on_error(0)
            .build()
            .unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.retry_on_error, 0);
    }
}
