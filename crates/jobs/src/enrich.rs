//! Turn queued webhook envelopes into metric records.
//!
//! A run yields one `WorkflowRun` record once it has completed. A job yields one
//! `WorkflowJob` record once it has completed, plus one `WorkflowStep` record for every
//! step that has both timestamps. Every record carries the ids of its ancestors so the
//! run → job → step hierarchy can be rebuilt downstream.

use gha_telemetry_core::models::{MetricName, MetricRecord, WebhookEnvelope};
use gha_telemetry_github::{
    PayloadError, WebhookEvent, WorkflowJobPayload, WorkflowRunPayload, events::Repository,
};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Derives a pool name from runner labels.
///
/// The first label containing one of the prefixes yields the text after the prefix.
/// Labels matching no prefix give an empty pool name.
#[derive(Debug, Clone)]
pub struct PoolResolver {
    prefixes: Vec<String>,
}

impl Default for PoolResolver {
    fn default() -> Self { Self::new(vec!["ManagedDevOps.Pool=".to_string()]) }
}

impl PoolResolver {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes: prefixes.into_iter().filter(|p| !p.is_empty()).collect() }
    }

    pub fn resolve(&self, labels: &[String]) -> String {
        for label in labels {
            for prefix in &self.prefixes {
                if let Some((_, pool)) = label.split_once(prefix.as_str()) {
                    return pool.to_string();
                }
            }
        }
        String::new()
    }
}

fn rfc3339(value: Option<OffsetDateTime>) -> String {
    value.and_then(|v| v.format(&Rfc3339).ok()).unwrap_or_default()
}

/// Seconds from `start` to `end`, clamped at zero.
fn seconds_between(start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) -> Option<f64> {
    let (start, end) = (start?, end?);
    Some((end - start).as_seconds_f64().max(0.0))
}

#[derive(Debug, Clone, Default)]
pub struct Enricher {
    pools: PoolResolver,
}

impl Enricher {
    pub fn new(pools: PoolResolver) -> Self { Self { pools } }

    /// Records for one envelope. Unsupported event types and non-terminal events
    /// produce no records.
    pub fn enrich(&self, envelope: &WebhookEnvelope) -> Result<Vec<MetricRecord>, EnrichError> {
        let Some(event) = WebhookEvent::parse(&envelope.event_type, envelope.raw_body())? else {
            return Ok(vec![]);
        };
        let delivery_id = envelope.delivery_id.as_str();
        Ok(match &event {
            WebhookEvent::WorkflowRun(payload) => {
                self.run_record(delivery_id, payload).into_iter().collect()
            }
            WebhookEvent::WorkflowJob(payload) => self.job_records(delivery_id, payload),
        })
    }

    fn base(
        &self,
        name: MetricName,
        kind: &str,
        timestamp: OffsetDateTime,
        delivery_id: &str,
        action: &str,
        repository: &Repository,
    ) -> MetricRecord {
        let mut record = MetricRecord::new(name, timestamp);
        record.set_property("type", kind);
        record.set_property("delivery_id", delivery_id);
        record.set_property("action", action);
        record.set_property("repository_id", repository.id);
        record.set_property("repository", &repository.name);
        record.set_property("repository_full_name", &repository.full_name);
        record
    }

    fn run_record(&self, delivery_id: &str, payload: &WorkflowRunPayload) -> Option<MetricRecord> {
        let run = &payload.workflow_run;
        let Some(completed_at) = run.completed_at() else {
            tracing::debug!("Skipping run {} with status {}", run.id, run.status);
            return None;
        };
        let mut record = self.base(
            MetricName::WorkflowRun,
            "workflow_run",
            completed_at,
            delivery_id,
            &payload.action,
            &payload.repository,
        );
        record.set_property("workflow_run_id", run.id);
        record.set_property("workflow_id", run.workflow_id);
        record.set_property("workflow_name", &run.name);
        record.set_property("status", &run.status);
        record.set_property("conclusion", run.conclusion.as_deref().unwrap_or_default());
        record.set_property("event_trigger", &run.event);
        record.set_property("head_branch", run.head_branch.as_deref().unwrap_or_default());
        record.set_property("head_sha", &run.head_sha);
        record.set_property("triggered_by", &payload.sender.login);
        record.set_property("run_number", run.run_number);
        record.set_property("run_attempt", run.run_attempt);
        record.set_property("runner_name", run.runner_name.as_deref().unwrap_or_default());
        record.set_property(
            "runner_group_name",
            run.runner_group_name.as_deref().unwrap_or_default(),
        );
        record.set_property("labels", run.labels.join(","));
        record.set_property("pool_name", self.pools.resolve(&run.labels));
        record.set_property("run_url", &run.html_url);
        record.set_property("created_at", rfc3339(run.created_at));
        record.set_property("started_at", rfc3339(run.run_started_at));
        record.set_property("completed_at", rfc3339(Some(completed_at)));
        if let Some(duration) = seconds_between(run.run_started_at, Some(completed_at)) {
            record.set_measurement("duration_seconds", duration);
        }
        if let Some(queued) = seconds_between(run.created_at, run.run_started_at) {
            record.set_measurement("queue_duration_seconds", queued);
        }
        Some(record)
    }

    fn job_records(&self, delivery_id: &str, payload: &WorkflowJobPayload) -> Vec<MetricRecord> {
        let job = &payload.workflow_job;
        let workflow_name = job.workflow_name.as_deref().unwrap_or_default();
        let runner_name = job.runner_name.as_deref().unwrap_or_default();
        let runner_group_name = job.runner_group_name.as_deref().unwrap_or_default();
        let pool_name = self.pools.resolve(&job.labels);
        let mut records = Vec::with_capacity(job.steps.len() + 1);

        if let Some(completed_at) = job.completed_at {
            let mut record = self.base(
                MetricName::WorkflowJob,
                "workflow_job",
                completed_at,
                delivery_id,
                &payload.action,
                &payload.repository,
            );
            record.set_property("job_id", job.id);
            record.set_property("job_name", &job.name);
            record.set_property("workflow_run_id", job.run_id);
            record.set_property("workflow_name", workflow_name);
            record.set_property("status", &job.status);
            record.set_property("conclusion", job.conclusion.as_deref().unwrap_or_default());
            record.set_property("head_branch", job.head_branch.as_deref().unwrap_or_default());
            record.set_property("triggered_by", &payload.sender.login);
            record.set_property("runner_name", runner_name);
            record.set_property("runner_group_name", runner_group_name);
            record.set_property("labels", job.labels.join(","));
            record.set_property("pool_name", &pool_name);
            record.set_property("job_url", &job.html_url);
            record.set_property("run_url", &job.run_url);
            record.set_property("created_at", rfc3339(job.created_at));
            record.set_property("started_at", rfc3339(job.started_at));
            record.set_property("completed_at", rfc3339(Some(completed_at)));
            if let Some(duration) = seconds_between(job.started_at, Some(completed_at)) {
                record.set_measurement("duration_seconds", duration);
            }
            if let Some(queued) = seconds_between(job.created_at, job.started_at) {
                record.set_measurement("queue_duration_seconds", queued);
            }
            records.push(record);
        } else {
            tracing::debug!("Skipping job {} with status {}", job.id, job.status);
        }

        for step in &job.steps {
            let (Some(started_at), Some(completed_at)) = (step.started_at, step.completed_at)
            else {
                continue;
            };
            let mut record = self.base(
                MetricName::WorkflowStep,
                "workflow_job_step",
                completed_at,
                delivery_id,
                &payload.action,
                &payload.repository,
            );
            record.set_property("step_id", format!("{}-{}", job.id, step.number));
            record.set_property("step_name", &step.name);
            record.set_property("step_number", step.number);
            record.set_property("job_id", job.id);
            record.set_property("job_name", &job.name);
            record.set_property("workflow_run_id", job.run_id);
            record.set_property("workflow_name", workflow_name);
            record.set_property("status", &step.status);
            record.set_property("conclusion", step.conclusion.as_deref().unwrap_or_default());
            record.set_property("runner_name", runner_name);
            record.set_property("pool_name", &pool_name);
            record.set_property("job_url", &job.html_url);
            record.set_property("run_url", &job.run_url);
            record.set_property("started_at", rfc3339(Some(started_at)));
            record.set_property("completed_at", rfc3339(Some(completed_at)));
            if let Some(duration) = seconds_between(Some(started_at), Some(completed_at)) {
                record.set_measurement("duration_seconds", duration);
            }
            records.push(record);
        }
        records
    }
}
