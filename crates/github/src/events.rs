//! Typed `workflow_run` and `workflow_job` webhook payloads.
//!
//! Only the fields the pipeline uses are declared; anything else GitHub sends is
//! ignored. Required fields must be present or decoding fails.

use gha_telemetry_core::models::EventType;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::PayloadError;

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: String,
    pub workflow_id: u64,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub head_sha: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub run_number: u64,
    #[serde(default = "default_run_attempt")]
    pub run_attempt: u32,
    #[serde(default)]
    pub event: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub run_started_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub runner_group_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_run_attempt() -> u32 { 1 }

impl WorkflowRun {
    pub fn is_completed(&self) -> bool { self.status == "completed" }

    /// GitHub has no completion timestamp on runs; the last update of a completed run
    /// is its completion.
    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        if self.is_completed() { self.updated_at } else { None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub number: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub run_id: u64,
    #[serde(default)]
    pub run_url: String,
    pub name: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub runner_group_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunPayload {
    pub action: String,
    pub workflow_run: WorkflowRun,
    pub repository: Repository,
    pub sender: Sender,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobPayload {
    pub action: String,
    pub workflow_job: WorkflowJob,
    pub repository: Repository,
    pub sender: Sender,
}

/// A decoded webhook of one of the supported event types.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    WorkflowRun(WorkflowRunPayload),
    WorkflowJob(WorkflowJobPayload),
}

impl WebhookEvent {
    /// Decode `body` according to `event_type`.
    ///
    /// Returns `Ok(None)` for event types the pipeline does not handle; their bodies are
    /// not inspected.
    pub fn parse(event_type: &EventType, body: &[u8]) -> Result<Option<Self>, PayloadError> {
        let event = match event_type {
            EventType::WorkflowRun => {
                let payload: WorkflowRunPayload = serde_json::from_slice(body)
                    .map_err(|source| PayloadError::Malformed { event_type: "workflow_run", source })?;
                if payload.workflow_run.id == 0 {
                    return Err(PayloadError::Invalid {
                        event_type: "workflow_run",
                        reason: "workflow_run.id is zero",
                    });
                }
                Self::WorkflowRun(payload)
            }
            EventType::WorkflowJob => {
                let payload: WorkflowJobPayload = serde_json::from_slice(body)
                    .map_err(|source| PayloadError::Malformed { event_type: "workflow_job", source })?;
                if payload.workflow_job.id == 0 {
                    return Err(PayloadError::Invalid {
                        event_type: "workflow_job",
                        reason: "workflow_job.id is zero",
                    });
                }
                if payload.workflow_job.run_id == 0 {
                    return Err(PayloadError::Invalid {
                        event_type: "workflow_job",
                        reason: "workflow_job.run_id is zero",
                    });
                }
                Self::WorkflowJob(payload)
            }
            EventType::Unrecognized(_) => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn action(&self) -> &str {
        match self {
            Self::WorkflowRun(payload) => &payload.action,
            Self::WorkflowJob(payload) => &payload.action,
        }
    }

    pub fn repository(&self) -> &Repository {
        match self {
            Self::WorkflowRun(payload) => &payload.repository,
            Self::WorkflowJob(payload) => &payload.repository,
        }
    }
}
