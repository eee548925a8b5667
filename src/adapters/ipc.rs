//! Worker to master message channel.
//!
//! Workers write one JSON object per line on stdout:
//!
//! ```text
//! {"type":"log","from":3,"data":"..."}
//! {"type":"access_log","data":{"remote_addr":"::ffff:10.0.0.7", ...}}
//! ```
//!
//! The master reads each worker's stdout with [`relay`], re-emits log lines
//! through its own tracing subscriber and hands access-log records to the
//! access-log writer.
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

use crate::{core::access_log::AccessLogRecord, ports::access_log::AccessLogSink};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IpcError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("IPC channel closed: {0}")]
    Closed(#[source] io::Error),
}

/// Everything a worker tells its master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// One formatted log line
    Log { from: u32, data: String },
    /// One completed request
    AccessLog { data: AccessLogRecord },
}

impl WorkerMessage {
    pub fn encode(&self) -> Result<String, IpcError> {
        serde_json::to_string(self).map_err(IpcError::Encode)
    }

    pub fn decode(line: &str) -> Result<Self, IpcError> {
        serde_json::from_str(line).map_err(IpcError::Decode)
    }
}

/// Writing end of the channel, shared by the worker's tracing writer and its
/// access-log sink.
#[derive(Clone)]
pub struct IpcChannel {
    worker_id: u32,
    out: Arc<Mutex<Box<dyn Write + Send>>>,
    closed: CancellationToken,
}

impl IpcChannel {
    pub fn new(worker_id: u32, out: impl Write + Send + 'static) -> Self {
        Self {
            worker_id,
            out: Arc::new(Mutex::new(Box::new(out))),
            closed: CancellationToken::new(),
        }
    }

    pub fn stdout(worker_id: u32) -> Self {
        Self::new(worker_id, io::stdout())
    }

    /// Cancelled once a write failed, i.e. the master is gone.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn send(&self, message: &WorkerMessage) -> Result<(), IpcError> {
        let line = message.encode()?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| IpcError::Closed(io::Error::other("IPC writer lock poisoned")))?;
        let written = out
            .write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush());
        if let Err(e) = written {
            self.closed.cancel();
            return Err(IpcError::Closed(e));
        }
        Ok(())
    }

    pub fn send_log(&self, data: impl Into<String>) -> Result<(), IpcError> {
        self.send(&WorkerMessage::Log {
            from: self.worker_id,
            data: data.into(),
        })
    }
}

impl AccessLogSink for IpcChannel {
    fn record(&self, record: AccessLogRecord) {
        // A failed send cancels `closed`, which stops the worker.
        let _ = self.send(&WorkerMessage::AccessLog { data: record });
    }
}

/// Buffers one formatted tracing event and ships each of its lines as a
/// [`WorkerMessage::Log`] when dropped.
pub struct IpcLineWriter {
    channel: IpcChannel,
    buf: Vec<u8>,
}

impl Write for IpcLineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for IpcLineWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if self.channel.send_log(line).is_err() {
                break;
            }
        }
    }
}

impl<'a> MakeWriter<'a> for IpcChannel {
    type Writer = IpcLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        IpcLineWriter {
            channel: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Read a worker's message stream until EOF. Log lines are re-emitted through
/// tracing, access-log records go to `access_log`. Undecodable lines are logged
/// and skipped. Returns the number of messages relayed.
pub async fn relay<R>(reader: R, worker_id: u32, access_log: &dyn AccessLogSink) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut relayed = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(worker = worker_id, error = %e, "Failed to read from worker");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match WorkerMessage::decode(&line) {
            Ok(WorkerMessage::Log { from, data }) => {
                tracing::info!(target: "portico::worker", worker = from, "{data}");
                relayed += 1;
            }
            Ok(WorkerMessage::AccessLog { data }) => {
                access_log.record(data);
                relayed += 1;
            }
            Err(e) => {
                tracing::warn!(worker = worker_id, error = %e, line = %line, "Dropping undecodable worker message");
            }
        }
    }
    relayed
}
