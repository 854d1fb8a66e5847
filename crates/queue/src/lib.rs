//! Durable hand-off between webhook intake and the telemetry worker.
//!
//! Delivery is at-least-once. A dequeued message is hidden for its visibility timeout
//! and becomes visible again unless it is deleted with the pop receipt it was handed
//! out with.

pub mod memory;
pub mod sqlite;

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use async_trait::async_trait;
use gha_telemetry_core::config::QueueConfig;
use thiserror::Error;
use time::OffsetDateTime;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue operation timed out")]
    Timeout,

    /// The message was redelivered since it was dequeued; another consumer may own it.
    #[error("Pop receipt no longer valid for message {0}")]
    ReceiptMismatch(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::Timeout,
            err => Self::Unavailable(err.to_string()),
        }
    }
}

/// A message handed out by [`QueueClient::dequeue_batch`].
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    /// Required to delete the message or extend its visibility. Replaced on every
    /// extension.
    pub pop_receipt: String,
    /// Number of times the message has been dequeued, including this one.
    pub dequeue_count: u32,
    pub body: Vec<u8>,
    pub enqueued_at: OffsetDateTime,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Append a message, returning its id.
    async fn enqueue(&self, body: &[u8]) -> Result<String, QueueError>;

    /// Take up to `max_count` visible messages and hide them for `visibility_timeout`.
    /// An empty queue yields an empty batch.
    async fn dequeue_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError>;

    async fn delete(&self, message: &QueuedMessage) -> Result<(), QueueError>;

    /// Hide the message for `visibility_timeout` from now. On success the message
    /// carries a fresh pop receipt and the old one is invalid.
    async fn extend_visibility(
        &self,
        message: &mut QueuedMessage,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Move the message out of the live queue.
    async fn dead_letter(&self, message: &QueuedMessage, reason: &str) -> Result<(), QueueError>;

    async fn close(&self);
}

/// Open the queue named by `config.url` (`sqlite:...` or `memory:`).
pub async fn connect(config: &QueueConfig) -> Result<Arc<dyn QueueClient>> {
    if config.url == "memory:" {
        tracing::warn!("Using in-memory queue; messages will not survive a restart");
        return Ok(Arc::new(MemoryQueue::new()));
    }
    if config.url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteQueue::connect(&config.url, &config.name).await?));
    }
    bail!("Unsupported queue URL: {}", config.url)
}

pub(crate) fn new_token() -> String { hex::encode(rand::random::<[u8; 16]>()) }

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_by_scheme() {
        let queue =
            connect(&QueueConfig { url: "memory:".to_string(), name: "q".to_string() }).await;
        assert!(queue.is_ok());
        let queue = connect(&QueueConfig {
            url: "amqp://localhost".to_string(),
            name: "q".to_string(),
        })
        .await;
        assert!(queue.is_err());
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = new_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_token());
    }
}
