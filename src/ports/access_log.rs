use std::sync::{Arc, Mutex};

use crate::core::access_log::AccessLogRecord;

/// AccessLogSink receives one record per completed request.
///
/// Recording must not block the request path; implementations hand the record
/// off (to the IPC channel, a writer task ...) and return.
pub trait AccessLogSink: Send + Sync + 'static {
    fn record(&self, record: AccessLogRecord);
}

/// Sink keeping records in memory. Used by embedders that consume records
/// themselves and by tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryAccessLog {
    records: Arc<Mutex<Vec<AccessLogRecord>>>,
}

impl MemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccessLogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl AccessLogSink for MemoryAccessLog {
    fn record(&self, record: AccessLogRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(_) => tracing::error!("Failed to acquire lock for access log records"),
        }
    }
}
