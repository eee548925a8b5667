use std::net::IpAddr;

use crate::config::models::{DirectorySource, HttpsConfig, PorticoConfig, ServerConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid bind address '{address}': {reason}")]
    InvalidBindAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Invalid frontend '{vhost}': {message}")]
    InvalidFrontend { vhost: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire configuration, collecting every error found.
    pub fn validate(config: &PorticoConfig) -> ValidationResult<()> {
        let mut errors = Self::validate_server(&config.server);

        if config.directory.path.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "directory.path".to_string(),
            });
        }

        Self::into_result(errors)
    }

    /// Validate a directory source file's frontends.
    pub fn validate_directory(source: &DirectorySource) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (vhost, frontend) in &source.frontends {
            if frontend.backends.is_empty() {
                errors.push(ValidationError::InvalidFrontend {
                    vhost: vhost.clone(),
                    message: "no backends configured".to_string(),
                });
            }
            for backend in &frontend.backends {
                match url::Url::parse(backend) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                    Ok(parsed) => errors.push(ValidationError::InvalidFrontend {
                        vhost: vhost.clone(),
                        message: format!("unsupported scheme '{}' in {backend}", parsed.scheme()),
                    }),
                    Err(e) => errors.push(ValidationError::InvalidFrontend {
                        vhost: vhost.clone(),
                        message: format!("invalid backend URL '{backend}': {e}"),
                    }),
                }
            }
        }

        for row in &source.sni {
            if row.domain.trim().is_empty() {
                errors.push(ValidationError::InvalidTls {
                    message: "SNI entry with an empty domain".to_string(),
                });
            }
        }

        Self::into_result(errors)
    }

    fn validate_server(server: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if server.workers == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if server.tcp_timeout == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.tcp_timeout".to_string(),
                message: "must be greater than 0 seconds".to_string(),
            });
        }

        if server.http_keep_alive && server.max_sockets == 0 {
            errors.push(ValidationError::InvalidField {
                field: "server.max_sockets".to_string(),
                message: "must be greater than 0 when http_keep_alive is enabled".to_string(),
            });
        }

        if server.bind.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "server.bind".to_string(),
            });
        }
        for address in &server.bind {
            if let Err(e) = Self::validate_bind_address(address) {
                errors.push(e);
            }
        }

        if let Some(https) = &server.https {
            errors.extend(Self::validate_https(server, https));
        }

        errors
    }

    fn validate_bind_address(address: &str) -> ValidationResult<()> {
        address
            .parse::<IpAddr>()
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidBindAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    fn validate_https(server: &ServerConfig, https: &HttpsConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if https.port == server.port {
            errors.push(ValidationError::InvalidTls {
                message: format!("https port {} collides with the http port", https.port),
            });
        }
        if !https.cert.exists() {
            errors.push(ValidationError::InvalidTls {
                message: format!("certificate file not found: {}", https.cert.display()),
            });
        }
        if !https.key.exists() {
            errors.push(ValidationError::InvalidTls {
                message: format!("private key file not found: {}", https.key.display()),
            });
        }
        for address in https.bind.iter().flatten() {
            if let Err(e) = Self::validate_bind_address(address) {
                errors.push(e);
            }
        }

        errors
    }

    fn into_result(errors: Vec<ValidationError>) -> ValidationResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().expect("length checked")),
            _ => Err(ValidationError::ValidationFailed {
                message: errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::{DirectoryConfig, FrontendEntry};

    fn base_config() -> PorticoConfig {
        PorticoConfig {
            server: ServerConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServerConfigValidator::validate(&base_config()).is_ok());
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut cfg = base_config();
        cfg.server.bind = vec!["not-an-ip".to_string()];
        let err = ServerConfigValidator::validate(&cfg).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidBindAddress { .. }));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut cfg = base_config();
        cfg.server.workers = 0;
        cfg.server.tcp_timeout = 0;
        let err = ServerConfigValidator::validate(&cfg).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("server.workers"));
        assert!(message.contains("server.tcp_timeout"));
    }

    #[test]
    fn test_https_missing_files() {
        let mut cfg = base_config();
        cfg.server.https = Some(HttpsConfig {
            port: 443,
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
            bind: None,
        });
        let err = ServerConfigValidator::validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("certificate file not found"));
    }

    #[test]
    fn test_directory_backend_urls() {
        let mut frontends = HashMap::new();
        frontends.insert(
            "a.example.com".to_string(),
            FrontendEntry {
                name: None,
                backends: vec!["ftp://10.0.0.1".to_string()],
            },
        );
        frontends.insert(
            "b.example.com".to_string(),
            FrontendEntry {
                name: None,
                backends: vec![],
            },
        );
        let source = DirectorySource {
            frontends,
            sni: vec![],
        };
        let err = ServerConfigValidator::validate_directory(&source).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unsupported scheme"));
        assert!(message.contains("no backends configured"));
    }
}
