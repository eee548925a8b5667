use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{adapters::ipc::IpcChannel, config::LogFormat};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with JSON output for the master
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install JSON tracing subscriber")?;

    tracing::info!("Portico structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install console tracing subscriber")?;

    tracing::info!("Portico console logging initialized");
    Ok(())
}

pub fn init_master_tracing(format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Json => init_tracing(),
        LogFormat::Pretty => init_console_tracing(),
    }
}

/// Worker logging: every formatted event becomes an IPC `log` message on
/// stdout, re-emitted by the master.
pub fn init_worker_tracing(channel: IpcChannel) -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .without_time()
                .with_ansi(false)
                .with_target(true)
                .with_writer(channel),
        )
        .try_init()
        .wrap_err("Failed to install worker tracing subscriber")
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::adapters::ipc::WorkerMessage;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_worker_events_become_ipc_messages() {
        let buf = SharedBuf::default();
        let channel = IpcChannel::new(7, buf.clone());
        let subscriber = Registry::default().with(
            tracing_subscriber::fmt::layer()
                .compact()
                .without_time()
                .with_ansi(false)
                .with_writer(channel),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(backend_id = 2, "backend #2 is dead");
        });

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let message = WorkerMessage::decode(out.lines().next().unwrap()).unwrap();
        match message {
            WorkerMessage::Log { from, data } => {
                assert_eq!(from, 7);
                assert!(data.contains("backend #2 is dead"));
                assert!(data.contains("backend_id=2"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
