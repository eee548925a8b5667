use std::{fmt, str::FromStr};

use thiserror::Error;
use url::Url;

/// Errors related to backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: Url,
    hostname: String,
    port: u16,
}

impl BackendUrl {
    /// Parse and validate a backend URL (`http://` or `https://` with a host)
    pub fn new(url: &str) -> BackendResult<Self> {
        let parsed = Url::parse(url).map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let hostname = parsed
            .host_str()
            .ok_or_else(|| BackendError::InvalidUrl(format!("Backend URL has no host: {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| BackendError::InvalidUrl(format!("Backend URL has no port: {url}")))?;

        Ok(BackendUrl {
            url: parsed,
            hostname,
            port,
        })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A URL carrying anything beyond the root path aliases the virtual host to an
    /// external location instead of a proxied backend.
    pub fn is_redirect(&self) -> bool {
        self.url.path() != "/" || self.url.query().is_some()
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// One physical backend behind a named frontend, as resolved by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    /// Position of the backend within its frontend
    pub id: usize,
    /// Number of alternative backends configured for the frontend
    pub total_candidates: usize,
    /// Directory key of the frontend, e.g. `frontend:www.example.com`
    pub frontend_name: String,
    /// Virtual host the request was resolved for
    pub virtual_host: String,
    /// Backend URL exactly as configured
    pub href: String,
    pub hostname: String,
    pub port: u16,
}

impl BackendRecord {
    /// Build a record from a configured backend URL.
    pub fn new(
        id: usize,
        total_candidates: usize,
        frontend_name: impl Into<String>,
        virtual_host: impl Into<String>,
        href: &str,
    ) -> BackendResult<Self> {
        let url = BackendUrl::new(href)?;
        Ok(Self {
            id,
            total_candidates,
            frontend_name: frontend_name.into(),
            virtual_host: virtual_host.into(),
            href: href.to_string(),
            hostname: url.hostname().to_string(),
            port: url.port(),
        })
    }

    pub fn url(&self) -> BackendResult<BackendUrl> {
        BackendUrl::new(&self.href)
    }

    pub fn is_redirect(&self) -> bool {
        self.url().map(|u| u.is_redirect()).unwrap_or(false)
    }

    pub fn meta(&self) -> BackendMeta {
        BackendMeta {
            backend_id: self.id,
            total_candidates: self.total_candidates,
            frontend: self.frontend_name.clone(),
            virtual_host: self.virtual_host.clone(),
            backend_url: self.href.clone(),
        }
    }
}

/// The slice of a [`BackendRecord`] carried by a request and handed back to the
/// directory when the backend is marked dead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendMeta {
    pub backend_id: usize,
    pub total_candidates: usize,
    pub frontend: String,
    pub virtual_host: String,
    pub backend_url: String,
}
