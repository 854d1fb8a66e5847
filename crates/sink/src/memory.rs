use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use gha_telemetry_core::models::MetricRecord;
use tokio::sync::Mutex;

use crate::{SinkError, TelemetrySink};

/// Keeps submitted records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricRecord>>,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    /// While set, every submission fails with [`SinkError::Unavailable`].
    pub fn set_failing(&self, fail: bool) { self.fail.store(fail, Ordering::SeqCst); }

    pub async fn records(&self) -> Vec<MetricRecord> { self.records.lock().await.clone() }

    /// Submissions attempted, including failed ones.
    pub fn attempts(&self) -> usize { self.attempts.load(Ordering::SeqCst) }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn submit(&self, record: &MetricRecord) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("memory sink set to fail".to_string()));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
