use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use time::OffsetDateTime;

/// Value of the `X-GitHub-Event` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    WorkflowRun,
    WorkflowJob,
    Unrecognized(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowRun => "workflow_run",
            Self::WorkflowJob => "workflow_job",
            Self::Unrecognized(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool { !matches!(self, Self::Unrecognized(_)) }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "workflow_run" => Self::WorkflowRun,
            "workflow_job" => Self::WorkflowJob,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "workflow_run" => Self::WorkflowRun,
            "workflow_job" => Self::WorkflowJob,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Unrecognized(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A webhook delivery as carried from intake to the queue.
///
/// The GitHub payload is kept verbatim as embedded JSON so the worker decodes exactly
/// what GitHub sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event_type: EventType,
    pub delivery_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub payload: Box<RawValue>,
}

impl WebhookEnvelope {
    /// Wrap a raw request body. Fails if the body is not JSON.
    pub fn new(
        event_type: EventType,
        delivery_id: impl Into<String>,
        signature: Option<String>,
        body: &[u8],
    ) -> serde_json::Result<Self> {
        let payload = serde_json::from_slice::<Box<RawValue>>(body)?;
        Ok(Self {
            event_type,
            delivery_id: delivery_id.into(),
            received_at: OffsetDateTime::now_utc(),
            signature,
            payload,
        })
    }

    pub fn raw_body(&self) -> &[u8] { self.payload.get().as_bytes() }

    /// Queue wire format.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> { serde_json::to_vec(self) }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> { serde_json::from_slice(bytes) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MetricName {
    WorkflowRun,
    WorkflowJob,
    WorkflowStep,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowRun => "WorkflowRun",
            Self::WorkflowJob => "WorkflowJob",
            Self::WorkflowStep => "WorkflowStep",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One telemetry record handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: MetricName,
    pub properties: BTreeMap<String, String>,
    pub measurements: BTreeMap<String, f64>,
    /// When the originating event completed.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl MetricRecord {
    pub fn new(name: MetricName, timestamp: OffsetDateTime) -> Self {
        Self { name, properties: BTreeMap::new(), measurements: BTreeMap::new(), timestamp }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn measurement(&self, key: &str) -> Option<f64> { self.measurements.get(key).copied() }

    pub fn set_property(&mut self, key: &str, value: impl ToString) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn set_measurement(&mut self, key: &str, value: f64) {
        self.measurements.insert(key.to_string(), value);
    }
}
