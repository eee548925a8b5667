use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{
        loader::load_directory_source,
        models::{DirectoryConfig, DirectorySource, SniEntry},
    },
    core::backend::{BackendMeta, BackendRecord},
    ports::backend_directory::{BackendDirectory, DirectoryError, ResolveError, SniRow},
};

struct Frontend {
    /// Directory key, `frontend:<vhost pattern>`
    key: String,
    backends: Vec<String>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct DirectoryState {
    frontends: HashMap<String, Arc<Frontend>>,
    sni: Vec<SniEntry>,
}

impl DirectoryState {
    fn from_source(source: DirectorySource) -> Self {
        let frontends = source
            .frontends
            .into_iter()
            .map(|(vhost, entry)| {
                let vhost = vhost.to_ascii_lowercase();
                let frontend = Frontend {
                    key: format!("frontend:{vhost}"),
                    backends: entry.backends,
                    // Workers start at different positions of the rotation.
                    cursor: AtomicUsize::new(rand::random::<u32>() as usize),
                };
                (vhost, Arc::new(frontend))
            })
            .collect();
        Self {
            frontends,
            sni: source.sni,
        }
    }

    /// Exact host, then `*.parent` wildcards walking up, then `*`.
    fn lookup(&self, host: &str) -> Option<Arc<Frontend>> {
        if let Some(frontend) = self.frontends.get(host) {
            return Some(frontend.clone());
        }
        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(frontend) = self.frontends.get(&format!("*.{parent}")) {
                return Some(frontend.clone());
            }
            rest = parent;
        }
        self.frontends.get("*").cloned()
    }
}

/// Strip the port and lowercase a `Host` header value.
fn normalize_host(host_header: &str) -> String {
    let host = host_header.trim();
    let host = if host.starts_with('[') {
        // [v6]:port
        host.split_once(']')
            .map(|(addr, _)| &host[..addr.len() + 1])
            .unwrap_or(host)
    } else {
        host.split_once(':').map(|(h, _)| h).unwrap_or(host)
    };
    host.to_ascii_lowercase()
}

fn read_sni_rows(entries: &[SniEntry]) -> Vec<SniRow> {
    entries
        .iter()
        .filter_map(|entry| match read_sni_row(entry) {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!(domain = %entry.domain, error = %e, "Skipping SNI row");
                None
            }
        })
        .collect()
}

fn read_sni_row(entry: &SniEntry) -> Result<SniRow, DirectoryError> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).map_err(|e| DirectoryError::CertMaterial {
            domain: entry.domain.clone(),
            reason: format!("{}: {e}", path.display()),
        })
    };
    Ok(SniRow {
        domain: entry.domain.clone(),
        cert_pem: read(&entry.cert)?,
        key_pem: read(&entry.key)?,
    })
}

/// Backend directory read from a local file and reloaded when the file changes.
///
/// Dead marks live in this process only; they expire after the configured TTL.
/// They are keyed by backend URL so a reload that reorders or removes backends
/// never moves a mark onto another backend.
pub struct FileDirectory {
    path: PathBuf,
    state: Arc<ArcSwap<DirectoryState>>,
    dead: scc::HashMap<(String, String), Instant>,
    dead_ttl: Duration,
    active_health_checks: bool,
    watch_taken: Mutex<bool>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl FileDirectory {
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let source = load_directory_source(&config.path)?;
        tracing::info!(
            path = %config.path.display(),
            frontends = source.frontends.len(),
            sni = source.sni.len(),
            "Loaded backend directory"
        );
        Ok(Self {
            path: config.path.clone(),
            state: Arc::new(ArcSwap::from_pointee(DirectoryState::from_source(source))),
            dead: scc::HashMap::new(),
            dead_ttl: Duration::from_secs(config.dead_backend_ttl),
            active_health_checks: config.active_health_checks,
            watch_taken: Mutex::new(false),
            watcher: Mutex::new(None),
        })
    }

    async fn is_dead(&self, frontend: &str, backend_url: &str) -> bool {
        let key = (frontend.to_string(), backend_url.to_string());
        let deadline = self.dead.get_async(&key).await.map(|entry| *entry.get());
        match deadline {
            Some(deadline) if deadline > Instant::now() => true,
            Some(_) => {
                // Expired mark: the backend is alive again.
                let _ = self.dead.remove_async(&key).await;
                false
            }
            None => false,
        }
    }

    fn spawn_watcher(&self, tx: mpsc::Sender<Vec<SniRow>>) -> Result<notify::RecommendedWatcher> {
        let (event_tx, mut event_rx) = mpsc::channel::<()>(1);
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid directory source path"))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify() || event.kind.is_create())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&file_name))
                        {
                            tracing::debug!("Directory source changed: {:?}", event.kind);
                            let _ = event_tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch directory source")?;

        let path = self.path.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while event_rx.recv().await.is_some() {
                let source = match load_directory_source(&path) {
                    Ok(source) => source,
                    Err(e) => {
                        tracing::warn!(error = %e, "Keeping previous directory, reload failed");
                        continue;
                    }
                };
                let next = DirectoryState::from_source(source);
                let rows = read_sni_rows(&next.sni);
                state.store(Arc::new(next));
                tracing::info!(sni = rows.len(), "Reloaded backend directory");
                if tx.send(rows).await.is_err() {
                    break;
                }
            }
        });
        Ok(watcher)
    }
}

#[async_trait]
impl BackendDirectory for FileDirectory {
    async fn resolve(&self, host_header: &str) -> Result<BackendRecord, ResolveError> {
        let host = normalize_host(host_header);
        let state = self.state.load();
        let frontend = state.lookup(&host).ok_or_else(ResolveError::unknown_host)?;

        let total = frontend.backends.len();
        if total == 0 {
            return Err(ResolveError::no_backend());
        }
        let start = frontend.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..total {
            let id = (start + offset) % total;
            if self.is_dead(&frontend.key, &frontend.backends[id]).await {
                continue;
            }
            return BackendRecord::new(id, total, &frontend.key, &host, &frontend.backends[id])
                .map_err(|e| {
                    tracing::warn!(frontend = %frontend.key, backend_id = id, error = %e, "Invalid backend entry");
                    ResolveError::no_backend()
                });
        }
        Err(ResolveError::no_backend())
    }

    async fn mark_dead(&self, meta: &BackendMeta) {
        let deadline = Instant::now() + self.dead_ttl;
        // An existing mark keeps its original deadline.
        if self
            .dead
            .insert_async((meta.frontend.clone(), meta.backend_url.clone()), deadline)
            .await
            .is_ok()
        {
            tracing::info!(
                frontend = %meta.frontend,
                backend_id = meta.backend_id,
                ttl_secs = self.dead_ttl.as_secs(),
                "Backend marked dead"
            );
        }
    }

    async fn sni_snapshot(&self) -> Result<Vec<SniRow>, DirectoryError> {
        Ok(read_sni_rows(&self.state.load().sni))
    }

    fn watch_sni(&self) -> mpsc::Receiver<Vec<SniRow>> {
        let (tx, rx) = mpsc::channel(8);
        let Ok(mut taken) = self.watch_taken.lock() else {
            return rx;
        };
        if *taken {
            tracing::warn!("SNI watch already taken");
            return rx;
        }
        *taken = true;

        match self.spawn_watcher(tx) {
            Ok(watcher) => {
                if let Ok(mut slot) = self.watcher.lock() {
                    *slot = Some(watcher);
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to watch backend directory"),
        }
        rx
    }

    fn active_health_checks_running(&self) -> bool {
        self.active_health_checks
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use hyper::StatusCode;
    use tempfile::{TempDir, tempdir};

    use super::*;

    const SOURCE: &str = r#"
[frontends."a.example.com"]
backends = ["http://127.0.0.1:8001/", "http://127.0.0.1:8002/"]

[frontends."*.example.com"]
backends = ["http://127.0.0.1:9000/"]

[frontends."*"]
backends = ["http://127.0.0.1:7000/"]

[frontends."alias.example.org"]
backends = ["http://www.example.org/welcome"]
"#;

    fn toml_source(source: &str) -> DirectorySource {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frontends.toml");
        std::fs::write(&path, source).unwrap();
        load_directory_source(&path).unwrap()
    }

    fn directory(source: &str) -> (TempDir, FileDirectory) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frontends.toml");
        File::create(&path)
            .unwrap()
            .write_all(source.as_bytes())
            .unwrap();
        let config = DirectoryConfig {
            path,
            dead_backend_ttl: 30,
            active_health_checks: false,
        };
        let directory = FileDirectory::new(&config).unwrap();
        (dir, directory)
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("A.Example.com:8080"), "a.example.com");
        assert_eq!(normalize_host("a.example.com"), "a.example.com");
        assert_eq!(normalize_host("[::1]:80"), "[::1]");
    }

    #[tokio::test]
    async fn test_lookup_order() {
        let (_dir, directory) = directory(SOURCE);

        let exact = directory.resolve("a.example.com:80").await.unwrap();
        assert_eq!(exact.frontend_name, "frontend:a.example.com");
        assert_eq!(exact.total_candidates, 2);
        assert_eq!(exact.virtual_host, "a.example.com");

        let wildcard = directory.resolve("deep.b.example.com").await.unwrap();
        assert_eq!(wildcard.frontend_name, "frontend:*.example.com");
        assert_eq!(wildcard.port, 9000);

        let fallback = directory.resolve("other.net").await.unwrap();
        assert_eq!(fallback.frontend_name, "frontend:*");

        let redirect = directory.resolve("alias.example.org").await.unwrap();
        assert!(redirect.is_redirect());
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let (_dir, directory) = directory(
            r#"
[frontends."a.example.com"]
backends = ["http://127.0.0.1:8001/"]
"#,
        );
        let err = directory.resolve("b.example.com").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_round_robin_skips_dead_backend() {
        let (_dir, directory) = directory(SOURCE);
        let first = directory.resolve("a.example.com").await.unwrap();
        let second = directory.resolve("a.example.com").await.unwrap();
        assert_ne!(first.id, second.id);

        directory.mark_dead(&first.meta()).await;
        for _ in 0..4 {
            let record = directory.resolve("a.example.com").await.unwrap();
            assert_eq!(record.id, second.id);
        }

        directory.mark_dead(&second.meta()).await;
        let err = directory.resolve("a.example.com").await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.message, "Cannot find a valid backend");
    }

    #[tokio::test]
    async fn test_mark_dead_is_idempotent() {
        let (_dir, directory) = directory(SOURCE);
        let record = directory.resolve("a.example.com").await.unwrap();
        directory.mark_dead(&record.meta()).await;
        let key = (record.frontend_name.clone(), record.href.clone());
        let deadline = directory.dead.get_async(&key).await.map(|e| *e.get());

        directory.mark_dead(&record.meta()).await;
        assert_eq!(directory.dead.len(), 1);
        assert_eq!(directory.dead.get_async(&key).await.map(|e| *e.get()), deadline);
    }

    #[tokio::test]
    async fn test_dead_mark_expires() {
        let (_dir, mut directory) = directory(SOURCE);
        directory.dead_ttl = Duration::from_millis(20);
        let record = directory.resolve("a.example.com").await.unwrap();
        directory.mark_dead(&record.meta()).await;
        assert!(directory.is_dead(&record.frontend_name, &record.href).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!directory.is_dead(&record.frontend_name, &record.href).await);
        assert_eq!(directory.dead.len(), 0);
    }

    #[tokio::test]
    async fn test_dead_mark_follows_backend_across_reload() {
        let (_dir, directory) = directory(SOURCE);
        let mut record = directory.resolve("a.example.com").await.unwrap();
        while record.href != "http://127.0.0.1:8001/" {
            record = directory.resolve("a.example.com").await.unwrap();
        }
        directory.mark_dead(&record.meta()).await;

        // Same frontend, backends swapped and a new one appended.
        let reordered: DirectorySource = toml_source(
            r#"
[frontends."a.example.com"]
backends = ["http://127.0.0.1:8002/", "http://127.0.0.1:8001/", "http://127.0.0.1:8003/"]
"#,
        );
        directory
            .state
            .store(Arc::new(DirectoryState::from_source(reordered)));

        let mut seen = Vec::new();
        for _ in 0..6 {
            let record = directory.resolve("a.example.com").await.unwrap();
            assert_ne!(record.href, "http://127.0.0.1:8001/");
            seen.push(record.href);
        }
        assert!(seen.iter().any(|href| href == "http://127.0.0.1:8002/"));
        assert!(seen.iter().any(|href| href == "http://127.0.0.1:8003/"));
    }

    #[tokio::test]
    async fn test_sni_rows_skip_unreadable_material() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("a.crt");
        let key = dir.path().join("a.key");
        std::fs::write(&cert, "CERT").unwrap();
        std::fs::write(&key, "KEY").unwrap();
        let source = format!(
            r#"
[[sni]]
domain = "a.example.com"
cert = "{}"
key = "{}"

[[sni]]
domain = "missing.example.com"
cert = "{}"
key = "{}"
"#,
            cert.display(),
            key.display(),
            dir.path().join("nope.crt").display(),
            key.display()
        );
        let (_src_dir, directory) = directory(&source);
        let rows = directory.sni_snapshot().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].domain, "a.example.com");
        assert_eq!(rows[0].cert_pem, "CERT");
    }

    #[tokio::test]
    async fn test_watch_pushes_full_sni_set() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("b.crt");
        let key = dir.path().join("b.key");
        std::fs::write(&cert, "CERT-B").unwrap();
        std::fs::write(&key, "KEY-B").unwrap();

        let (src_dir, directory) = directory(SOURCE);
        let mut rx = directory.watch_sni();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let updated = format!(
            "{SOURCE}\n[[sni]]\ndomain = \"b.example.com\"\ncert = \"{}\"\nkey = \"{}\"\n",
            cert.display(),
            key.display()
        );
        std::fs::write(src_dir.path().join("frontends.toml"), updated).unwrap();

        // The file may be observed half written; wait for the complete set.
        let rows = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let rows = rx.recv().await.expect("Channel closed unexpectedly");
                if !rows.is_empty() {
                    return rows;
                }
            }
        })
        .await
        .expect("Timed out waiting for SNI update");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].domain, "b.example.com");
    }
}
