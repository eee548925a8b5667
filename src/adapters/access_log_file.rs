use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{core::access_log::AccessLogRecord, ports::access_log::AccessLogSink};

enum Command {
    Record(AccessLogRecord),
    /// Flush buffered lines, then reopen the file (after rotation)
    Reopen,
    Flush(oneshot::Sender<()>),
}

/// Access-log file owned by the master. Lines are appended by a writer task;
/// [`AccessLogFile::record`] never blocks.
#[derive(Clone)]
pub struct AccessLogFile {
    tx: mpsc::UnboundedSender<Command>,
}

async fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .wrap_err_with(|| format!("Failed to open access log {}", path.display()))?;
    Ok(BufWriter::new(file))
}

impl AccessLogFile {
    /// Open (or create) `path` and start the writer task. The task ends once
    /// every handle is dropped, after flushing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, JoinHandle<()>)> {
        let path = path.into();
        let writer = open_append(&path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(path, writer, rx));
        Ok((Self { tx }, task))
    }

    /// Reopen the file handle without losing buffered lines.
    pub fn reopen(&self) {
        let _ = self.tx.send(Command::Reopen);
    }

    /// Wait until every line recorded so far is on disk.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl AccessLogSink for AccessLogFile {
    fn record(&self, record: AccessLogRecord) {
        if self.tx.send(Command::Record(record)).is_err() {
            tracing::warn!("Access log writer is gone, dropping record");
        }
    }
}

async fn run_writer(
    path: PathBuf,
    mut writer: BufWriter<File>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => {
                let mut line = record.format_line();
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::error!(path = %path.display(), error = %e, "Failed to write access log");
                }
                // Batch whatever is already queued before touching the disk.
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        tracing::error!(path = %path.display(), error = %e, "Failed to flush access log");
                    }
                }
            }
            Command::Reopen => {
                if let Err(e) = writer.flush().await {
                    tracing::error!(path = %path.display(), error = %e, "Failed to flush access log");
                }
                match open_append(&path).await {
                    Ok(reopened) => {
                        writer = reopened;
                        tracing::info!(path = %path.display(), "Reopened access log");
                    }
                    Err(e) => tracing::error!(error = %e, "Keeping previous access log handle"),
                }
            }
            Command::Flush(ack) => {
                if let Err(e) = writer.flush().await {
                    tracing::error!(path = %path.display(), error = %e, "Failed to flush access log");
                }
                let _ = ack.send(());
            }
        }
    }
    let _ = writer.flush().await;
}
