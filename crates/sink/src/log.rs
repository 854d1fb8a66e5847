use async_trait::async_trait;
use gha_telemetry_core::models::MetricRecord;

use crate::{SinkError, TelemetrySink};

/// Writes each record as a tracing event. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn submit(&self, record: &MetricRecord) -> Result<(), SinkError> {
        tracing::info!(
            name = %record.name,
            timestamp = %record.timestamp,
            properties = ?record.properties,
            measurements = ?record.measurements,
            "Telemetry record"
        );
        Ok(())
    }
}
