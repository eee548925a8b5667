use std::{collections::HashMap, fmt, io::BufReader, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::ports::backend_directory::{BackendDirectory, SniRow};

/// Errors turning PEM material into a TLS context
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TlsError {
    #[error("Invalid certificate PEM for {domain}: {reason}")]
    Certificate { domain: String, reason: String },

    #[error("No certificate found for {0}")]
    NoCertificate(String),

    #[error("Invalid private key for {domain}: {reason}")]
    PrivateKey { domain: String, reason: String },

    #[error("No private key found for {0}")]
    NoPrivateKey(String),
}

/// Build a signing context from PEM encoded chain and key.
pub fn certified_key_from_pem(
    domain: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<CertifiedKey, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Certificate {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(domain.to_string()));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| TlsError::PrivateKey {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(domain.to_string()))?;

    let signing_key =
        rustls::crypto::aws_lc_rs::sign::any_supported_type(&key).map_err(|e| {
            TlsError::PrivateKey {
                domain: domain.to_string(),
                reason: e.to_string(),
            }
        })?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Load the listener's default certificate from disk.
pub fn load_default_cert(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read_to_string(cert_path)
        .wrap_err_with(|| format!("failed to open cert file {}", cert_path.display()))?;
    let key_pem = std::fs::read_to_string(key_path)
        .wrap_err_with(|| format!("failed to open key file {}", key_path.display()))?;
    let key = certified_key_from_pem("default", &cert_pem, &key_pem)?;
    Ok(Arc::new(key))
}

/// Live mapping domain -> TLS context, consulted during every handshake.
///
/// Each update replaces the whole mapping. Lookups are exact; a miss falls back
/// to the listener's default certificate.
pub struct TlsContextRegistry {
    contexts: ArcSwap<HashMap<String, Arc<CertifiedKey>>>,
    default: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for TlsContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContextRegistry")
            .field("domains", &self.domains())
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl TlsContextRegistry {
    pub fn new(default: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            contexts: ArcSwap::from_pointee(HashMap::new()),
            default,
        }
    }

    /// Install `rows` as the complete mapping. Rows with unusable material are
    /// logged and left out. Returns the number of installed domains.
    pub fn replace(&self, rows: &[SniRow]) -> usize {
        let mut next = HashMap::with_capacity(rows.len());
        for row in rows {
            match certified_key_from_pem(&row.domain, &row.cert_pem, &row.key_pem) {
                Ok(key) => {
                    tracing::info!(domain = %row.domain, "Update sni of {}", row.domain);
                    next.insert(row.domain.clone(), Arc::new(key));
                }
                Err(e) => tracing::warn!(domain = %row.domain, error = %e, "Ignoring SNI row"),
            }
        }
        let installed = next.len();
        self.contexts.store(Arc::new(next));
        installed
    }

    pub fn lookup(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.contexts.load().get(domain).cloned()
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.contexts.load().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Load the initial snapshot from the directory.
    pub async fn initialize(&self, directory: &dyn BackendDirectory) {
        match directory.sni_snapshot().await {
            Ok(rows) => {
                self.replace(&rows);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to load SNI snapshot"),
        }
    }

    /// Apply every pushed batch until the directory closes the channel.
    pub fn follow(self: Arc<Self>, mut updates: mpsc::Receiver<Vec<SniRow>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(rows) = updates.recv().await {
                self.replace(&rows);
            }
            tracing::debug!("SNI update channel closed");
        })
    }
}

impl ResolvesServerCert for TlsContextRegistry {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.lookup(name))
            .or_else(|| self.default.clone())
    }
}

/// Server config resolving certificates through `registry`.
pub fn server_config(registry: Arc<TlsContextRegistry>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(registry);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use rustls::pki_types::ServerName;
    use tokio::io::duplex;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use super::*;

    struct Generated {
        row: SniRow,
        cert_der: CertificateDer<'static>,
    }

    fn generate(domain: &str) -> Generated {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        Generated {
            row: SniRow {
                domain: domain.to_string(),
                cert_pem: cert.pem(),
                key_pem: signing_key.serialize_pem(),
            },
            cert_der: cert.der().clone(),
        }
    }

    #[test]
    fn test_replacement_drops_absent_domains() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let registry = TlsContextRegistry::new(None);
        let a = generate("a.example.com");
        let b = generate("b.example.com");

        assert_eq!(registry.replace(&[a.row.clone(), b.row.clone()]), 2);
        assert!(registry.lookup("a.example.com").is_some());

        assert_eq!(registry.replace(&[b.row.clone()]), 1);
        assert!(registry.lookup("a.example.com").is_none());
        assert!(registry.lookup("b.example.com").is_some());
        assert_eq!(registry.domains(), vec!["b.example.com".to_string()]);
    }

    #[test]
    fn test_exact_match_only() {
        let registry = TlsContextRegistry::new(None);
        registry.replace(&[generate("example.com").row]);
        assert!(registry.lookup("www.example.com").is_none());
        assert!(registry.lookup("EXAMPLE.COM").is_none());
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let registry = TlsContextRegistry::new(None);
        let good = generate("good.example.com");
        let bad = SniRow {
            domain: "bad.example.com".into(),
            cert_pem: "not a certificate".into(),
            key_pem: good.row.key_pem.clone(),
        };
        assert_eq!(registry.replace(&[bad, good.row]), 1);
        assert_eq!(registry.domains(), vec!["good.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_follow_applies_pushed_batches() {
        let registry = Arc::new(TlsContextRegistry::new(None));
        let (tx, rx) = mpsc::channel(4);
        let task = registry.clone().follow(rx);

        tx.send(vec![generate("a.example.com").row]).await.unwrap();
        tx.send(vec![generate("c.example.com").row]).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(registry.domains(), vec!["c.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_uses_domain_context() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let sni = generate("b.example.com");
        let fallback = generate("default.example.com");
        let default_key =
            certified_key_from_pem("default", &fallback.row.cert_pem, &fallback.row.key_pem)
                .unwrap();
        let registry = Arc::new(TlsContextRegistry::new(Some(Arc::new(default_key))));
        registry.replace(&[sni.row.clone()]);

        let acceptor = TlsAcceptor::from(Arc::new(server_config(registry)));
        let mut roots = rustls::RootCertStore::empty();
        roots.add(sni.cert_der.clone()).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let (client_io, server_io) = duplex(16 * 1024);
        let server = tokio::spawn(async move { acceptor.accept(server_io).await.map(|_| ()) });
        let name = ServerName::try_from("b.example.com").unwrap();
        let client = connector.connect(name, client_io).await;

        assert!(client.is_ok(), "{:?}", client.err());
        assert!(server.await.unwrap().is_ok());
    }
}
