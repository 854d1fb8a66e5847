//! Destinations for telemetry records.

pub mod appinsights;
pub mod log;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use gha_telemetry_core::{config::TelemetryConfig, models::MetricRecord};
use thiserror::Error;

pub use appinsights::{AppInsightsSink, ConnectionString};
pub use log::LogSink;
pub use memory::MemorySink;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The backend could not be reached or failed; the record may be retried.
    #[error("Telemetry backend unavailable: {0}")]
    Unavailable(String),

    #[error("Telemetry backend rejected the record: {0}")]
    Rejected(String),

    #[error("Telemetry configuration error: {0}")]
    Configuration(String),
}

/// Accepts metric records. `submit` returns only once the backend has accepted the
/// record, so callers can decide whether the source message may be acknowledged.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn submit(&self, record: &MetricRecord) -> Result<(), SinkError>;
}

/// Application Insights when a connection string is configured, otherwise log only.
pub fn create_sink(config: &TelemetryConfig) -> Result<Arc<dyn TelemetrySink>, SinkError> {
    match config.connection_string.as_deref() {
        Some(connection_string) if !connection_string.trim().is_empty() => {
            let connection_string = ConnectionString::parse(connection_string)?;
            tracing::info!(
                "Sending telemetry to Application Insights at {}",
                connection_string.ingestion_endpoint
            );
            Ok(Arc::new(AppInsightsSink::new(connection_string, config.request_timeout())?))
        }
        _ => {
            tracing::warn!("No telemetry connection string configured; records will only be logged");
            Ok(Arc::new(LogSink))
        }
    }
}
