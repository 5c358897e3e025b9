//! At-least-once task queue over SQLite.
//!
//! Delivery semantics mirror a visibility-timeout queue: `receive`
//! atomically claims the oldest visible row and hides it for the
//! configured timeout; the worker acks (deletes) only after the task has
//! run, so a crashed worker's item becomes receivable again once the
//! timeout elapses. Rows that reach the attempt cap are never delivered
//! again and stay in place for inspection.
//!
//! Payloads are JSON objects so task arguments stay language-neutral.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::config::QueueConfig;

/// A claimed queue item. `attempt` is 1-based: the first delivery of an
/// item carries `attempt == 1`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub kind: String,
    pub payload: String,
    pub attempt: i64,
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Insert an immediately-visible item. Returns its receipt id.
    pub async fn enqueue(&self, kind: &str, payload: &serde_json::Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO ingest_queue (id, kind, payload, attempts, visible_at, enqueued_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(kind)
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the oldest visible item, if any.
    ///
    /// The claim is a single atomic update: it bumps the attempt counter
    /// and pushes `visible_at` past the visibility timeout, so no other
    /// worker can receive the same item until the timeout elapses. An
    /// item is claimable for one initial delivery plus `max_attempts`
    /// redeliveries.
    pub async fn receive(&self) -> Result<Option<Delivery>> {
        let now = Utc::now().timestamp();
        let hidden_until = now + self.config.visibility_timeout_secs;

        let row = sqlx::query(
            r#"
            UPDATE ingest_queue
            SET attempts = attempts + 1, visible_at = ?
            WHERE id = (
                SELECT id FROM ingest_queue
                WHERE visible_at <= ? AND attempts <= ?
                ORDER BY enqueued_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, kind, payload, attempts
            "#,
        )
        .bind(hidden_until)
        .bind(now)
        .bind(self.config.max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            receipt: row.get("id"),
            kind: row.get("kind"),
            payload: row.get("payload"),
            attempt: row.get("attempts"),
        }))
    }

    /// Long-poll receive: polls once per second for up to
    /// `wait_time_secs` before giving up with `None`.
    pub async fn receive_wait(&self) -> Result<Option<Delivery>> {
        let mut remaining = self.config.wait_time_secs;
        loop {
            if let Some(delivery) = self.receive().await? {
                return Ok(Some(delivery));
            }
            if remaining == 0 {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }
    }

    /// Acknowledge a delivery: the item is removed for good. Called only
    /// after the task has run (late ack).
    pub async fn ack(&self, receipt: &str) -> Result<()> {
        sqlx::query("DELETE FROM ingest_queue WHERE id = ?")
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return a claimed item to the queue with retry backoff:
    /// `base_delay * 2^(attempt-1)` seconds from now. Used when a claimed
    /// delivery cannot be dispatched at all.
    pub async fn release(&self, receipt: &str, attempt: i64) -> Result<()> {
        let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
        let delay = self
            .config
            .retry_base_delay_secs
            .saturating_mul(1_i64 << exponent);
        let visible_at = Utc::now().timestamp() + delay;
        sqlx::query("UPDATE ingest_queue SET visible_at = ? WHERE id = ?")
            .bind(visible_at)
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Items still awaiting delivery or redelivery.
    pub async fn depth(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_queue WHERE attempts <= ?")
            .bind(self.config.max_attempts)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::pool_with_schema;

    fn test_config() -> QueueConfig {
        QueueConfig {
            visibility_timeout_secs: 3600,
            wait_time_secs: 0,
            max_attempts: 3,
            retry_base_delay_secs: 30,
        }
    }

    async fn make_visible(pool: &SqlitePool, receipt: &str) {
        sqlx::query("UPDATE ingest_queue SET visible_at = 0 WHERE id = ?")
            .bind(receipt)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn visible_at(pool: &SqlitePool, receipt: &str) -> i64 {
        sqlx::query_scalar("SELECT visible_at FROM ingest_queue WHERE id = ?")
            .bind(receipt)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_receive_ack_workflow() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), test_config());

        queue
            .enqueue("ingest_document", &serde_json::json!({"document_id": "d1"}))
            .await
            .unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.kind, "ingest_document");
        assert_eq!(delivery.attempt, 1);
        let payload: serde_json::Value = serde_json::from_str(&delivery.payload).unwrap();
        assert_eq!(payload["document_id"], "d1");

        queue.ack(&delivery.receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_item_is_hidden_until_timeout() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), test_config());

        queue
            .enqueue("ingest_document", &serde_json::json!({"document_id": "d1"}))
            .await
            .unwrap();
        let first = queue.receive().await.unwrap().unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        // Simulate the visibility timeout elapsing: the same item comes
        // back with a bumped attempt counter.
        make_visible(&pool, &first.receipt).await;
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.receipt, first.receipt);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn attempt_cap_dead_letters_item() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), test_config());

        let receipt = queue
            .enqueue("ingest_document", &serde_json::json!({"document_id": "d1"}))
            .await
            .unwrap();

        // One initial delivery plus max_attempts redeliveries.
        for expected_attempt in 1..=4 {
            make_visible(&pool, &receipt).await;
            let delivery = queue.receive().await.unwrap().unwrap();
            assert_eq!(delivery.attempt, expected_attempt);
        }

        // Redeliveries exhausted: never delivered again even when visible.
        make_visible(&pool, &receipt).await;
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_applies_doubling_backoff() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), test_config());

        let receipt = queue
            .enqueue("ingest_document", &serde_json::json!({"document_id": "d1"}))
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue.release(&delivery.receipt, delivery.attempt).await.unwrap();
        let after_first = visible_at(&pool, &receipt).await;
        let now = Utc::now().timestamp();
        // attempt 1 → base delay
        assert!(after_first >= now + 25 && after_first <= now + 35);

        make_visible(&pool, &receipt).await;
        let delivery = queue.receive().await.unwrap().unwrap();
        queue.release(&delivery.receipt, delivery.attempt).await.unwrap();
        let after_second = visible_at(&pool, &receipt).await;
        let now = Utc::now().timestamp();
        // attempt 2 → doubled
        assert!(after_second >= now + 55 && after_second <= now + 65);
    }

    #[tokio::test]
    async fn oldest_item_is_delivered_first() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), test_config());

        let first = queue
            .enqueue("ingest_document", &serde_json::json!({"document_id": "a"}))
            .await
            .unwrap();
        let second = queue
            .enqueue("ingest_document", &serde_json::json!({"document_id": "b"}))
            .await
            .unwrap();

        // Equal enqueue timestamps fall back to id order; force distinct
        // enqueue times to make the assertion deterministic.
        sqlx::query("UPDATE ingest_queue SET enqueued_at = enqueued_at - 10 WHERE id = ?")
            .bind(&first)
            .execute(&pool)
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.receipt, first);
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.receipt, second);
    }
}
