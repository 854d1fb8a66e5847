use gha_telemetry_core::models::EventType;
use thiserror::Error;

use crate::events::WebhookEvent;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventKind {
    WorkflowRun,
    WorkflowJob,
    Unsupported,
}

/// A supported event whose body could not be decoded.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed {event_type} payload: {source}")]
    Malformed {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid {event_type} payload: {reason}")]
    Invalid { event_type: &'static str, reason: &'static str },
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowRun(_) => EventKind::WorkflowRun,
            Self::WorkflowJob(_) => EventKind::WorkflowJob,
        }
    }
}

/// Decide what the intake should do with a delivery.
///
/// Supported event types are fully decoded so that a malformed body is reported
/// here, before anything is queued.
pub fn classify(event_type: &str, payload: &[u8]) -> Result<EventKind, PayloadError> {
    match WebhookEvent::parse(&EventType::from(event_type), payload)? {
        Some(event) => Ok(event.kind()),
        None => Ok(EventKind::Unsupported),
    }
}
