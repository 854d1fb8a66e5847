use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    Row, Sqlite, SqlitePool,
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow},
};
use time::OffsetDateTime;

use crate::{QueueClient, QueueError, QueuedMessage, new_token};

/// Queue stored in a SQLite database. Several processes may share the database file;
/// each dequeue claims its batch in a single statement.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    queue: String,
}

fn now_millis() -> i64 { (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64 }

fn millis(duration: Duration) -> i64 { duration.as_millis().min(i64::MAX as u128) as i64 }

impl SqliteQueue {
    pub async fn connect(url: &str, queue: &str) -> Result<Self> {
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            tracing::info!(url = %url, "Creating queue database");
            Sqlite::create_database(url).await.context("Failed to create queue database")?;
        }
        let options = SqliteConnectOptions::from_str(url)
            .context("Invalid queue URL")?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to queue database")?;
        Self::from_pool(pool, queue).await
    }

    /// Use an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool, queue: &str) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run queue migrations")?;
        tracing::info!("Queue {} ready", queue);
        Ok(Self { pool, queue: queue.to_string() })
    }

    /// Distinguish a stale receipt from a message that is gone.
    async fn missing(&self, message: &QueuedMessage) -> QueueError {
        let exists = sqlx::query("SELECT 1 FROM queue_messages WHERE id = ? AND queue = ?")
            .bind(&message.id)
            .bind(&self.queue)
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => QueueError::ReceiptMismatch(message.id.clone()),
            Ok(None) => QueueError::MessageNotFound(message.id.clone()),
            Err(e) => e.into(),
        }
    }
}

fn message_from_row(row: &SqliteRow) -> Result<QueuedMessage, QueueError> {
    let enqueued_at: i64 = row.try_get("enqueued_at")?;
    let dequeue_count: i64 = row.try_get("dequeue_count")?;
    Ok(QueuedMessage {
        id: row.try_get("id")?,
        pop_receipt: row.try_get("pop_receipt")?,
        dequeue_count: u32::try_from(dequeue_count)
            .map_err(|e| QueueError::Serialisation(e.to_string()))?,
        body: row.try_get("body")?,
        enqueued_at: OffsetDateTime::from_unix_timestamp_nanos(enqueued_at as i128 * 1_000_000)
            .map_err(|e| QueueError::Serialisation(e.to_string()))?,
    })
}

#[async_trait]
impl QueueClient for SqliteQueue {
    async fn enqueue(&self, body: &[u8]) -> Result<String, QueueError> {
        let id = new_token();
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue, body, enqueued_at, visible_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&self.queue)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn dequeue_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        let now = now_millis();
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?,
                dequeue_count = dequeue_count + 1,
                pop_receipt = lower(hex(randomblob(16)))
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue = ? AND visible_at <= ?
                ORDER BY enqueued_at, rowid
                LIMIT ?
            )
            RETURNING id, pop_receipt, dequeue_count, body, enqueued_at
            "#,
        )
        .bind(now.saturating_add(millis(visibility_timeout)))
        .bind(&self.queue)
        .bind(now)
        .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        let mut batch = rows.iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;
        batch.sort_by_key(|m| m.enqueued_at);
        Ok(batch)
    }

    async fn delete(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue = ? AND pop_receipt = ?")
                .bind(&message.id)
                .bind(&self.queue)
                .bind(&message.pop_receipt)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(self.missing(message).await);
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        message: &mut QueuedMessage,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        let pop_receipt = new_token();
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, pop_receipt = ?
            WHERE id = ? AND queue = ? AND pop_receipt = ?
            "#,
        )
        .bind(now_millis().saturating_add(millis(visibility_timeout)))
        .bind(&pop_receipt)
        .bind(&message.id)
        .bind(&self.queue)
        .bind(&message.pop_receipt)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.missing(message).await);
        }
        message.pop_receipt = pop_receipt;
        Ok(())
    }

    async fn dead_letter(&self, message: &QueuedMessage, reason: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letters (id, queue, body, enqueued_at, dead_lettered_at, dequeue_count, reason)
            SELECT id, queue, body, enqueued_at, ?, dequeue_count, ?
            FROM queue_messages
            WHERE id = ? AND queue = ? AND pop_receipt = ?
            "#,
        )
        .bind(now_millis())
        .bind(reason)
        .bind(&message.id)
        .bind(&self.queue)
        .bind(&message.pop_receipt)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.missing(message).await);
        }
        sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue = ?")
            .bind(&message.id)
            .bind(&self.queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) { self.pool.close().await }
}
