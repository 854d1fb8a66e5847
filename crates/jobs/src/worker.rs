use std::{fmt, sync::Arc, time::Duration};

use futures_util::{StreamExt, stream};
use gha_telemetry_core::{
    config::WorkerConfig,
    models::{MetricRecord, WebhookEnvelope},
};
use gha_telemetry_queue::{QueueClient, QueueError, QueuedMessage};
use gha_telemetry_sink::{SinkError, TelemetrySink};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::enrich::Enricher;

/// Summary of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    /// Messages whose records were submitted and which were deleted.
    pub completed: usize,
    /// Messages left in the queue for redelivery.
    pub failed: usize,
    pub dead_lettered: usize,
    pub records: usize,
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} completed={} failed={} dead_lettered={} records={}",
            self.received, self.completed, self.failed, self.dead_lettered, self.records
        )
    }
}

enum Disposition {
    Completed,
    Failed,
    DeadLettered,
}

/// Consumes the webhook queue and forwards enriched records to the sink.
pub struct Worker {
    queue: Arc<dyn QueueClient>,
    sink: Arc<dyn TelemetrySink>,
    enricher: Enricher,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        sink: Arc<dyn TelemetrySink>,
        enricher: Enricher,
        config: WorkerConfig,
    ) -> Self {
        Self { queue, sink, enricher, config }
    }

    /// Poll until `cancel` fires. A batch in progress is always finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "Worker started: poll_interval={:?} batch={} visibility_timeout={:?}",
            self.config.poll_interval(),
            self.config.max_messages_per_batch,
            self.config.visibility_timeout()
        );
        while !cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(outcome) if outcome.received > 0 => tracing::info!("Processed batch: {}", outcome),
                Ok(_) => tracing::debug!("Queue empty"),
                Err(err) => tracing::error!("Failed to fetch messages: {}", err),
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        tracing::info!("Worker stopped");
    }

    /// Like [`Worker::run`], but once `cancel` fires the batch in progress gets at most
    /// `shutdown_timeout` to finish. Returns `false` if it had to be abandoned.
    pub async fn run_until_cancelled(&self, cancel: CancellationToken) -> bool {
        let run = self.run(cancel.clone());
        tokio::pin!(run);
        tokio::select! {
            () = &mut run => return true,
            () = cancel.cancelled() => {}
        }
        if tokio::time::timeout(self.config.shutdown_timeout(), run).await.is_ok() {
            return true;
        }
        // Undeleted messages are redelivered after their visibility timeout.
        tracing::warn!(
            "Worker did not stop within {:?}; abandoning in-flight messages",
            self.config.shutdown_timeout()
        );
        false
    }

    /// Fetch one batch and process every message in it.
    pub async fn poll_once(&self) -> Result<BatchOutcome, QueueError> {
        let batch = self
            .queue
            .dequeue_batch(self.config.max_messages_per_batch, self.config.visibility_timeout())
            .await?;
        let dequeued_at = Instant::now();
        let mut outcome = BatchOutcome { received: batch.len(), ..Default::default() };
        let results = stream::iter(batch)
            .map(|message| self.process(message, dequeued_at))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        for (disposition, records) in results {
            outcome.records += records;
            match disposition {
                Disposition::Completed => outcome.completed += 1,
                Disposition::Failed => outcome.failed += 1,
                Disposition::DeadLettered => outcome.dead_lettered += 1,
            }
        }
        Ok(outcome)
    }

    /// Returns the disposition and the number of records submitted.
    async fn process(
        &self,
        mut message: QueuedMessage,
        dequeued_at: Instant,
    ) -> (Disposition, usize) {
        if message.dequeue_count > self.config.max_dequeue_count {
            let reason = format!(
                "dequeued {} times, limit is {}",
                message.dequeue_count, self.config.max_dequeue_count
            );
            return (self.dead_letter(&message, &reason).await, 0);
        }
        let envelope = match WebhookEnvelope::from_bytes(&message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("Undecodable message {}: {}", message.id, err);
                return (self.dead_letter(&message, "undecodable envelope").await, 0);
            }
        };
        let records = match self.enricher.enrich(&envelope) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    "Malformed {} payload in delivery {}: {}",
                    envelope.event_type,
                    envelope.delivery_id,
                    err
                );
                return (self.dead_letter(&message, "malformed payload").await, 0);
            }
        };

        if let Err(err) = self.submit_all(&mut message, dequeued_at, &records).await {
            tracing::warn!(
                "Failed to submit records for delivery {}, leaving message {} for redelivery: {}",
                envelope.delivery_id,
                message.id,
                err
            );
            return (Disposition::Failed, 0);
        }
        if let Err(err) = self.queue.delete(&message).await {
            tracing::warn!(
                "Submitted delivery {} but failed to delete message {}: {}",
                envelope.delivery_id,
                message.id,
                err
            );
            return (Disposition::Failed, records.len());
        }
        tracing::debug!(
            "Processed {} delivery {}: {} records",
            envelope.event_type,
            envelope.delivery_id,
            records.len()
        );
        (Disposition::Completed, records.len())
    }

    /// Submit records in order, extending the message's visibility every half timeout
    /// until submission finishes. The schedule counts from `dequeued_at`, so a message
    /// that waited behind others in the batch is extended straight away if it is due.
    async fn submit_all(
        &self,
        message: &mut QueuedMessage,
        dequeued_at: Instant,
        records: &[MetricRecord],
    ) -> Result<(), SinkError> {
        let submit = async {
            for record in records {
                self.sink.submit(record).await?;
            }
            Ok::<(), SinkError>(())
        };
        tokio::pin!(submit);
        let visibility_timeout = self.config.visibility_timeout();
        let period = (visibility_timeout / 2).max(Duration::from_secs(1));
        let mut ticker = interval_at(dequeued_at + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut submit => return result,
                _ = ticker.tick() => {
                    match self.queue.extend_visibility(message, visibility_timeout).await {
                        Ok(()) => tracing::debug!("Extended visibility of message {}", message.id),
                        Err(err) => tracing::warn!(
                            "Failed to extend visibility of message {}: {}",
                            message.id,
                            err
                        ),
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, message: &QueuedMessage, reason: &str) -> Disposition {
        match self.queue.dead_letter(message, reason).await {
            Ok(()) => {
                tracing::warn!("Dead-lettered message {}: {}", message.id, reason);
                Disposition::DeadLettered
            }
            Err(err) => {
                tracing::error!("Failed to dead-letter message {}: {}", message.id, err);
                Disposition::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use gha_telemetry_core::models::{EventType, MetricName};
    use gha_telemetry_queue::MemoryQueue;
    use gha_telemetry_sink::MemorySink;
    use tokio::sync::Mutex;

    use super::*;

    const WORKFLOW_RUN: &[u8] = include_bytes!("../../../testdata/workflow_run_completed.json");
    const WORKFLOW_JOB: &[u8] = include_bytes!("../../../testdata/workflow_job_completed.json");

    fn config() -> WorkerConfig {
        WorkerConfig {
            poll_interval_secs: 5,
            max_messages_per_batch: 32,
            visibility_timeout_secs: 300,
            max_dequeue_count: 3,
            concurrency: 4,
            ..Default::default()
        }
    }

    fn worker(queue: &Arc<MemoryQueue>, sink: Arc<dyn TelemetrySink>) -> Worker {
        Worker::new(queue.clone(), sink, Enricher::default(), config())
    }

    async fn enqueue(queue: &MemoryQueue, event_type: &str, body: &[u8]) {
        let envelope =
            WebhookEnvelope::new(EventType::from(event_type), "delivery-1", None, body).unwrap();
        queue.enqueue(&envelope.to_bytes().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_is_submitted_and_deleted() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;
        enqueue(&queue, "workflow_job", WORKFLOW_JOB).await;

        let outcome = worker(&queue, sink.clone()).poll_once().await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome { received: 2, completed: 2, failed: 0, dead_lettered: 0, records: 4 }
        );
        assert!(queue.is_empty().await);
        let records = sink.records().await;
        assert_eq!(records.len(), 4);
        assert_eq!(records.iter().filter(|r| r.name == MetricName::WorkflowStep).count(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let queue = Arc::new(MemoryQueue::new());
        let outcome = worker(&queue, Arc::new(MemorySink::new())).poll_once().await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_keeps_message() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        let worker = worker(&queue, sink.clone());
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;

        sink.set_failing(true);
        let outcome = worker.poll_once().await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(queue.len().await, 1);

        // Hidden until the visibility timeout expires.
        sink.set_failing(false);
        assert_eq!(worker.poll_once().await.unwrap().received, 0);
        tokio::time::advance(Duration::from_secs(300)).await;

        let outcome = worker.poll_once().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert!(queue.is_empty().await);
        assert_eq!(sink.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_message_yields_identical_records() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        let worker = worker(&queue, sink.clone());
        // The same envelope delivered twice, as after a crash between submit and delete.
        let envelope =
            WebhookEnvelope::new(EventType::WorkflowRun, "delivery-1", None, WORKFLOW_RUN).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        queue.enqueue(&bytes).await.unwrap();
        worker.poll_once().await.unwrap();
        queue.enqueue(&bytes).await.unwrap();
        worker.poll_once().await.unwrap();

        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], records[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_over_dequeue_limit_is_dead_lettered() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        let worker = worker(&queue, sink.clone());
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;

        sink.set_failing(true);
        for _ in 0..3 {
            assert_eq!(worker.poll_once().await.unwrap().failed, 1);
            tokio::time::advance(Duration::from_secs(300)).await;
        }
        sink.set_failing(false);
        let outcome = worker.poll_once().await.unwrap();
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(sink.attempts(), 3);
        assert!(sink.records().await.is_empty());
        assert!(queue.is_empty().await);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dequeue_count, 4);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dead_lettered() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        queue.enqueue(b"not an envelope").await.unwrap();
        let outcome = worker(&queue, sink.clone()).poll_once().await.unwrap();
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(sink.attempts(), 0);
        assert_eq!(queue.dead_letters().await[0].reason, "undecodable envelope");
    }

    #[tokio::test]
    async fn test_unrecognized_event_is_deleted_without_records() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        enqueue(&queue, "star", br#"{"action":"created"}"#).await;
        let outcome = worker(&queue, sink.clone()).poll_once().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.records, 0);
        assert!(queue.is_empty().await);
        assert_eq!(sink.attempts(), 0);
    }

    /// Sleeps around a check that no message of the batch has become visible again.
    struct SlowSink {
        queue: Arc<MemoryQueue>,
        before_check: Duration,
        after_check: Duration,
        stolen: Mutex<usize>,
    }

    impl SlowSink {
        fn new(queue: &Arc<MemoryQueue>, before_check: u64, after_check: u64) -> Self {
            Self {
                queue: queue.clone(),
                before_check: Duration::from_secs(before_check),
                after_check: Duration::from_secs(after_check),
                stolen: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TelemetrySink for SlowSink {
        async fn submit(&self, _record: &MetricRecord) -> Result<(), SinkError> {
            tokio::time::sleep(self.before_check).await;
            let visible = self.queue.dequeue_batch(32, Duration::from_secs(300)).await.unwrap();
            *self.stolen.lock().await += visible.len();
            tokio::time::sleep(self.after_check).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_is_extended_during_slow_submission() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(SlowSink::new(&queue, 350, 100));
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;

        let outcome = worker(&queue, sink.clone()).poll_once().await.unwrap();
        assert_eq!(*sink.stolen.lock().await, 0);
        assert_eq!(outcome.completed, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_message_is_extended_from_dequeue_time() {
        let queue = Arc::new(MemoryQueue::new());
        // The second message starts at 240s, past its first extension point of 150s.
        let sink = Arc::new(SlowSink::new(&queue, 140, 100));
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;

        let config = WorkerConfig { concurrency: 1, ..config() };
        let worker = Worker::new(queue.clone(), sink.clone(), Enricher::default(), config);
        let outcome = worker.poll_once().await.unwrap();
        assert_eq!(*sink.stolen.lock().await, 0);
        assert_eq!(
            outcome,
            BatchOutcome { received: 2, completed: 2, failed: 0, dead_lettered: 0, records: 2 }
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(MemorySink::new());
        let worker = Arc::new(worker(&queue, sink.clone()));
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(12)).await;
        enqueue(&queue, "workflow_job", WORKFLOW_JOB).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert_eq!(sink.records().await.len(), 4);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_batch_is_abandoned_after_shutdown_timeout() {
        let queue = Arc::new(MemoryQueue::new());
        let sink = Arc::new(SlowSink::new(&queue, 350, 100));
        let worker = Arc::new(worker(&queue, sink));
        enqueue(&queue, "workflow_run", WORKFLOW_RUN).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run_until_cancelled(cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();
        assert!(!handle.await.unwrap());
        let waited = cancelled_at.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_stops_promptly() {
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(&queue, Arc::new(MemorySink::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(worker.run_until_cancelled(cancel).await);
    }
}
