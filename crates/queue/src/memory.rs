use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::{sync::Mutex, time::Instant};

use crate::{QueueClient, QueueError, QueuedMessage, new_token};

struct Entry {
    id: String,
    body: Vec<u8>,
    enqueued_at: OffsetDateTime,
    visible_at: Instant,
    dequeue_count: u32,
    pop_receipt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub body: Vec<u8>,
    pub dequeue_count: u32,
    pub reason: String,
}

#[derive(Default)]
struct State {
    messages: VecDeque<Entry>,
    dead_letters: Vec<DeadLetter>,
}

/// Single-process queue. Visibility is tracked with tokio's clock, so paused-time tests
/// can expire it with `tokio::time::advance`.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self { Self::default() }

    /// Make every operation fail with [`QueueError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages still in the live queue, visible or not.
    pub async fn len(&self) -> usize { self.state.lock().await.messages.len() }

    pub async fn is_empty(&self) -> bool { self.len().await == 0 }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue disabled".to_string()));
        }
        Ok(())
    }
}

impl State {
    fn position(&self, message: &QueuedMessage) -> Result<usize, QueueError> {
        let Some(index) = self.messages.iter().position(|e| e.id == message.id) else {
            return Err(QueueError::MessageNotFound(message.id.clone()));
        };
        if self.messages[index].pop_receipt.as_deref() != Some(message.pop_receipt.as_str()) {
            return Err(QueueError::ReceiptMismatch(message.id.clone()));
        }
        Ok(index)
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn enqueue(&self, body: &[u8]) -> Result<String, QueueError> {
        self.check()?;
        let id = new_token();
        self.state.lock().await.messages.push_back(Entry {
            id: id.clone(),
            body: body.to_vec(),
            enqueued_at: OffsetDateTime::now_utc(),
            visible_at: Instant::now(),
            dequeue_count: 0,
            pop_receipt: None,
        });
        Ok(id)
    }

    async fn dequeue_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut batch = Vec::new();
        for entry in state.messages.iter_mut() {
            if batch.len() >= max_count {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let pop_receipt = new_token();
            entry.visible_at = now + visibility_timeout;
            entry.dequeue_count += 1;
            entry.pop_receipt = Some(pop_receipt.clone());
            batch.push(QueuedMessage {
                id: entry.id.clone(),
                pop_receipt,
                dequeue_count: entry.dequeue_count,
                body: entry.body.clone(),
                enqueued_at: entry.enqueued_at,
            });
        }
        Ok(batch)
    }

    async fn delete(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let index = state.position(message)?;
        state.messages.remove(index);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        message: &mut QueuedMessage,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let index = state.position(message)?;
        let pop_receipt = new_token();
        let entry = &mut state.messages[index];
        entry.visible_at = Instant::now() + visibility_timeout;
        entry.pop_receipt = Some(pop_receipt.clone());
        message.pop_receipt = pop_receipt;
        Ok(())
    }

    async fn dead_letter(&self, message: &QueuedMessage, reason: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let index = state.position(message)?;
        if let Some(entry) = state.messages.remove(index) {
            state.dead_letters.push(DeadLetter {
                id: entry.id,
                body: entry.body,
                dequeue_count: entry.dequeue_count,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_empty_queue_yields_empty_batch() {
        let queue = MemoryQueue::new();
        assert!(queue.dequeue_batch(32, VISIBILITY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_respects_max_count() {
        let queue = MemoryQueue::new();
        for i in 0..5u8 {
            queue.enqueue(&[i]).await.unwrap();
        }
        let first = queue.dequeue_batch(3, VISIBILITY).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].body, vec![0]);
        let second = queue.dequeue_batch(3, VISIBILITY).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(queue.dequeue_batch(3, VISIBILITY).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeleted_message_is_redelivered() {
        let queue = MemoryQueue::new();
        queue.enqueue(b"hello").await.unwrap();
        let first = queue.dequeue_batch(1, VISIBILITY).await.unwrap().remove(0);
        assert_eq!(first.dequeue_count, 1);

        tokio::time::advance(VISIBILITY - Duration::from_secs(1)).await;
        assert!(queue.dequeue_batch(1, VISIBILITY).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = queue.dequeue_batch(1, VISIBILITY).await.unwrap().remove(0);
        assert_eq!(second.id, first.id);
        assert_eq!(second.dequeue_count, 2);
        assert_ne!(second.pop_receipt, first.pop_receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_receipt_cannot_delete() {
        let queue = MemoryQueue::new();
        queue.enqueue(b"hello").await.unwrap();
        let stale = queue.dequeue_batch(1, VISIBILITY).await.unwrap().remove(0);
        tokio::time::advance(VISIBILITY).await;
        let current = queue.dequeue_batch(1, VISIBILITY).await.unwrap().remove(0);

        assert!(matches!(queue.delete(&stale).await, Err(QueueError::ReceiptMismatch(_))));
        assert_eq!(queue.len().await, 1);
        queue.delete(&current).await.unwrap();
        assert!(queue.is_empty().await);
        assert!(matches!(queue.delete(&current).await, Err(QueueError::MessageNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_visibility_rotates_receipt() {
        let queue = MemoryQueue::new();
        queue.enqueue(b"hello").await.unwrap();
        let mut message = queue.dequeue_batch(1, VISIBILITY).await.unwrap().remove(0);
        let old = message.clone();

        tokio::time::advance(Duration::from_secs(20)).await;
        queue.extend_visibility(&mut message, VISIBILITY).await.unwrap();
        assert_ne!(message.pop_receipt, old.pop_receipt);

        // Past the first deadline, still hidden.
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(queue.dequeue_batch(1, VISIBILITY).await.unwrap().is_empty());

        assert!(matches!(queue.delete(&old).await, Err(QueueError::ReceiptMismatch(_))));
        queue.delete(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter() {
        let queue = MemoryQueue::new();
        queue.enqueue(b"poison").await.unwrap();
        let message = queue.dequeue_batch(1, VISIBILITY).await.unwrap().remove(0);
        queue.dead_letter(&message, "undecodable").await.unwrap();
        assert!(queue.is_empty().await);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"poison");
        assert_eq!(dead[0].reason, "undecodable");
    }

    #[tokio::test]
    async fn test_unavailable() {
        let queue = MemoryQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(queue.enqueue(b"x").await, Err(QueueError::Unavailable(_))));
        queue.set_unavailable(false);
        queue.enqueue(b"x").await.unwrap();
    }
}
