pub mod classify;
pub mod events;
pub mod signature;
pub mod webhook;

pub use classify::{EventKind, PayloadError, classify};
pub use events::{WebhookEvent, WorkflowJobPayload, WorkflowRunPayload};
