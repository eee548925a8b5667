//! Master process: keeps a fixed-size pool of worker processes alive and owns
//! the access-log file.
//!
//! Each worker slot moves through
//! `Starting -> Running -> (ExitedIntentional | ExitedCrashed) -> Respawning -> Starting`.
//! A worker's stdout is its IPC channel; a monitor task per worker relays
//! every message and waits for the process to exit.
use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr, eyre};
use tokio::{
    io::BufReader,
    process::{Child, ChildStdout, Command},
    sync::{Mutex as TokioMutex, broadcast::error::RecvError, oneshot},
    task::JoinHandle,
};

use crate::{
    adapters::{access_log_file::AccessLogFile, ipc},
    config::PorticoConfig,
    ports::AccessLogSink,
    utils::shutdown::{MasterSignal, MasterSignals},
};

/// Placeholder in [`WorkerCommand`] arguments replaced by the worker id.
pub const WORKER_ID_PLACEHOLDER: &str = "{id}";

const RESPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Monitors respawn through `spawn_worker`, which spawns the next monitor;
/// the boxed type breaks that cycle.
type MonitorFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// How long to keep reading a dead worker's pipe, which stays open while any
/// of its own children hold it.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    ExitedIntentional,
    ExitedCrashed,
    Respawning,
}

/// How a worker process is started.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary with the hidden `worker` subcommand.
    pub fn current_exe(config_path: &Path) -> Result<Self> {
        let program = std::env::current_exe().wrap_err("Cannot locate the portico binary")?;
        Ok(Self::new(
            program,
            vec![
                "--config".to_string(),
                config_path.display().to_string(),
                "worker".to_string(),
                "--worker-id".to_string(),
                WORKER_ID_PLACEHOLDER.to_string(),
            ],
        ))
    }

    fn build(&self, id: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(
            self.args
                .iter()
                .map(|arg| arg.replace(WORKER_ID_PLACEHOLDER, &id.to_string())),
        );
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

struct WorkerSlot {
    pid: Option<u32>,
    state: WorkerState,
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

/// Snapshot of one worker for status reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: u32,
    pub pid: Option<u32>,
    pub state: WorkerState,
}

pub struct WorkerPool {
    size: usize,
    command: WorkerCommand,
    access_log: Arc<dyn AccessLogSink>,
    slots: TokioMutex<HashMap<u32, WorkerSlot>>,
    shutting_down: AtomicBool,
}

fn describe_exit(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

impl WorkerPool {
    pub fn new(size: usize, command: WorkerCommand, access_log: Arc<dyn AccessLogSink>) -> Arc<Self> {
        Arc::new(Self {
            size,
            command,
            access_log,
            slots: TokioMutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start every worker of the pool.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for id in 0..self.size as u32 {
            self.spawn_worker(id).await?;
        }
        tracing::info!(workers = self.size, "Worker pool started");
        Ok(())
    }

    pub async fn status(&self) -> Vec<WorkerStatus> {
        let slots = self.slots.lock().await;
        let mut status: Vec<WorkerStatus> = slots
            .iter()
            .map(|(id, slot)| WorkerStatus {
                id: *id,
                pid: slot.pid,
                state: slot.state,
            })
            .collect();
        status.sort_by_key(|s| s.id);
        status
    }

    async fn set_state(&self, id: u32, state: WorkerState) {
        if let Some(slot) = self.slots.lock().await.get_mut(&id) {
            slot.state = state;
        }
    }

    async fn spawn_worker(self: &Arc<Self>, id: u32) -> Result<()> {
        {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(id).or_insert(WorkerSlot {
                pid: None,
                state: WorkerState::Starting,
                kill: None,
                monitor: None,
            });
            slot.state = WorkerState::Starting;
        }

        let mut child = self
            .command
            .build(id)
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn worker {id}"))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("Worker {id} has no stdout pipe"))?;
        let (kill_tx, kill_rx) = oneshot::channel();

        let mut slots = self.slots.lock().await;
        if self.shutting_down.load(Ordering::Relaxed) {
            // Shutdown raced the respawn; dropping the child kills it.
            drop(child);
            return Ok(());
        }
        let monitor = tokio::spawn(self.clone().monitor(id, child, stdout, kill_rx));
        slots.insert(
            id,
            WorkerSlot {
                pid,
                state: WorkerState::Running,
                kill: Some(kill_tx),
                monitor: Some(monitor),
            },
        );
        tracing::info!(worker = id, pid, "Worker started");
        Ok(())
    }

    fn monitor(
        self: Arc<Self>,
        id: u32,
        child: Child,
        stdout: ChildStdout,
        kill: oneshot::Receiver<()>,
    ) -> MonitorFuture {
        Box::pin(self.run_monitor(id, child, stdout, kill))
    }

    async fn run_monitor(
        self: Arc<Self>,
        id: u32,
        mut child: Child,
        stdout: ChildStdout,
        kill: oneshot::Receiver<()>,
    ) {
        let sink = self.access_log.clone();
        let mut relay = tokio::spawn(async move {
            ipc::relay(BufReader::new(stdout), id, sink.as_ref()).await
        });
        let pid = child.id();

        let (status, intentional) = tokio::select! {
            status = child.wait() => (status, false),
            _ = kill => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(worker = id, pid, error = %e, "Failed to kill worker");
                }
                (child.wait().await, true)
            }
        };
        // Drain whatever the worker wrote before exiting.
        let relayed = match tokio::time::timeout(RELAY_DRAIN_TIMEOUT, &mut relay).await {
            Ok(joined) => joined.unwrap_or(0),
            Err(_) => {
                relay.abort();
                0
            }
        };

        let intentional = intentional || self.shutting_down.load(Ordering::Relaxed);
        let (code, signal) = match &status {
            Ok(status) => describe_exit(status),
            Err(_) => (None, None),
        };

        if intentional {
            self.set_state(id, WorkerState::ExitedIntentional).await;
            tracing::info!(worker = id, pid, code, signal, relayed, "Worker stopped");
            return;
        }

        self.set_state(id, WorkerState::ExitedCrashed).await;
        match &status {
            Ok(_) => tracing::error!(
                worker = id,
                pid,
                code,
                signal,
                "worker {} died (code: {:?}, signal: {:?}), respawning",
                pid.unwrap_or_default(),
                code,
                signal
            ),
            Err(e) => tracing::error!(worker = id, pid, error = %e, "Lost track of worker, respawning"),
        }

        self.set_state(id, WorkerState::Respawning).await;
        while !self.shutting_down.load(Ordering::Relaxed) {
            match self.spawn_worker(id).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "Failed to respawn worker");
                    tokio::time::sleep(RESPAWN_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Kill every live worker and wait for their monitors to finish. No drain
    /// of in-flight requests is attempted.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let monitors: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock().await;
            slots
                .values_mut()
                .filter_map(|slot| {
                    if let Some(kill) = slot.kill.take() {
                        let _ = kill.send(());
                    }
                    slot.monitor.take()
                })
                .collect()
        };
        for monitor in monitors {
            let _ = monitor.await;
        }
        tracing::info!("All workers stopped");
    }
}

/// Run the master until a shutdown signal arrives: reopen the access log on
/// SIGUSR1, stop every worker and flush the access log on SIGINT/SIGTERM.
pub async fn supervise(pool: Arc<WorkerPool>, access_log: AccessLogFile, signals: &MasterSignals) {
    let mut rx = signals.subscribe();
    loop {
        match rx.recv().await {
            Ok(MasterSignal::ReopenAccessLog) => access_log.reopen(),
            Ok(MasterSignal::Shutdown) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed master signals");
            }
        }
    }

    tracing::info!("Shutting down");
    pool.shutdown().await;
    access_log.flush().await;
}

/// Entry point of the `serve` subcommand.
pub async fn run(config: PorticoConfig, config_path: &Path) -> Result<()> {
    let (access_log, _writer) = AccessLogFile::open(&config.server.access_log).await?;
    let signals = Arc::new(MasterSignals::new());
    let signal_task = signals.clone().spawn();

    let pool = WorkerPool::new(
        config.server.workers,
        WorkerCommand::current_exe(config_path)?,
        Arc::new(access_log.clone()),
    );
    pool.start().await?;

    supervise(pool.clone(), access_log, &signals).await;
    signal_task.abort();
    tracing::info!("Master exiting");
    Ok(())
}
