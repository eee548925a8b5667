use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::{Result, WrapErr};
use tokio::{signal, sync::broadcast, task::JoinHandle};

/// Signals the master acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterSignal {
    /// SIGINT or SIGTERM: stop every worker and exit
    Shutdown,
    /// SIGUSR1: flush and reopen the access-log file
    ReopenAccessLog,
}

/// Turns OS signals into [`MasterSignal`]s for every subscriber.
pub struct MasterSignals {
    tx: broadcast::Sender<MasterSignal>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl MasterSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MasterSignal> {
        self.tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Deliver `signal` as if the OS had sent it. A second shutdown is ignored.
    pub fn trigger(&self, signal: MasterSignal) {
        if signal == MasterSignal::Shutdown
            && self
                .shutdown_initiated
                .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            tracing::warn!("Shutdown already initiated, ignoring signal");
            return;
        }
        if let Err(e) = self.tx.send(signal) {
            tracing::error!("Failed to deliver {:?}: {}", signal, e);
        }
    }

    /// Spawn [`Self::run_signal_handler`] on the current runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            self.run_signal_handler()
                .await
                .wrap_err("Signal handler failed")
        })
    }

    /// Listen for OS signals until a shutdown signal arrives.
    pub async fn run_signal_handler(&self) -> Result<()> {
        let mut sigterm = os::Listener::terminate()?;
        let mut sigusr1 = os::Listener::user_defined1()?;
        tracing::info!(
            "Signal handler started. Listening for SIGTERM, SIGINT (shutdown) and SIGUSR1 (reopen access log)"
        );

        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down");
                    self.trigger(MasterSignal::Shutdown);
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                    self.trigger(MasterSignal::Shutdown);
                    return Ok(());
                }
                _ = sigusr1.recv() => {
                    tracing::info!("Received SIGUSR1, reopening access log");
                    self.trigger(MasterSignal::ReopenAccessLog);
                }
            }
        }
    }
}

impl Default for MasterSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
mod os {
    use eyre::{Result, WrapErr};
    use tokio::signal::unix::{Signal, SignalKind, signal};

    pub struct Listener(Signal);

    impl Listener {
        fn register(kind: SignalKind, name: &str) -> Result<Self> {
            signal(kind)
                .map(Listener)
                .wrap_err_with(|| format!("Failed to register {name} handler"))
        }

        pub fn terminate() -> Result<Self> {
            Self::register(SignalKind::terminate(), "SIGTERM")
        }

        pub fn user_defined1() -> Result<Self> {
            Self::register(SignalKind::user_defined1(), "SIGUSR1")
        }

        pub fn user_defined2() -> Result<Self> {
            Self::register(SignalKind::user_defined2(), "SIGUSR2")
        }

        pub fn interrupt() -> Result<Self> {
            Self::register(SignalKind::interrupt(), "SIGINT")
        }

        pub async fn recv(&mut self) {
            self.0.recv().await;
        }
    }
}

// On non-Unix systems only Ctrl+C is available.
#[cfg(not(unix))]
mod os {
    use eyre::Result;

    pub struct Listener;

    impl Listener {
        pub fn terminate() -> Result<Self> {
            Ok(Self)
        }

        pub fn user_defined1() -> Result<Self> {
            Ok(Self)
        }

        pub async fn recv(&mut self) {
            std::future::pending::<()>().await
        }
    }
}

/// Swallow SIGUSR1, SIGUSR2 and SIGINT in a worker. The master owns shutdown
/// and log rotation; a worker only stops when its IPC channel closes.
#[cfg(unix)]
pub fn ignore_worker_signals() -> Result<JoinHandle<()>> {
    let mut usr1 = os::Listener::user_defined1()?;
    let mut usr2 = os::Listener::user_defined2()?;
    let mut int = os::Listener::interrupt()?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = usr1.recv() => tracing::debug!("Ignoring SIGUSR1"),
                _ = usr2.recv() => tracing::debug!("Ignoring SIGUSR2"),
                _ = int.recv() => tracing::debug!("Ignoring SIGINT"),
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn ignore_worker_signals() -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async {}))
}
