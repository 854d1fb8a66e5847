pub mod enrich;
pub mod worker;

use std::sync::Arc;

pub use enrich::{EnrichError, Enricher, PoolResolver};
use gha_telemetry_core::config::Config;
use gha_telemetry_queue::QueueClient;
use gha_telemetry_sink::TelemetrySink;
pub use worker::{BatchOutcome, Worker};

/// Create the queue worker from configuration.
pub fn create_worker(
    config: &Config,
    queue: Arc<dyn QueueClient>,
    sink: Arc<dyn TelemetrySink>,
) -> Worker {
    let pools = PoolResolver::new(config.telemetry.pool_label_prefixes.clone());
    Worker::new(queue, sink, Enricher::new(pools), config.worker.clone())
}
