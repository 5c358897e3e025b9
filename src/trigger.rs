//! Document creation and post-commit task scheduling.
//!
//! Enqueueing must not race the transaction that creates the document: a
//! worker that receives the task before the row is visible would report
//! it missing. [`Uow`] therefore carries an explicit list of post-commit
//! actions — plain data, not callbacks — that run only after the
//! transaction has committed.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::models::{ChunkingStatus, Document};
use crate::queue::TaskQueue;
use crate::store;
use crate::worker::KIND_INGEST;

/// Action deferred until the unit of work commits.
#[derive(Debug)]
pub enum PostCommit {
    ScheduleIngestion { document_id: String },
}

/// A transaction plus the actions to run once it commits. Dropping the
/// unit of work without committing rolls back and discards the actions.
pub struct Uow<'a> {
    tx: sqlx::Transaction<'a, sqlx::Sqlite>,
    post_commit: Vec<PostCommit>,
}

impl<'a> Uow<'a> {
    pub async fn begin(pool: &'a SqlitePool) -> Result<Uow<'a>> {
        Ok(Self {
            tx: pool.begin().await?,
            post_commit: Vec::new(),
        })
    }

    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        &mut self.tx
    }

    pub fn defer(&mut self, action: PostCommit) {
        self.post_commit.push(action);
    }

    /// Commit, then run the deferred actions in order.
    pub async fn commit(self, queue: &TaskQueue) -> Result<()> {
        self.tx.commit().await?;
        for action in self.post_commit {
            match action {
                PostCommit::ScheduleIngestion { document_id } => {
                    schedule_ingestion(queue, &document_id).await?;
                }
            }
        }
        Ok(())
    }
}

/// Fire-and-forget enqueue of one ingestion task.
pub async fn schedule_ingestion(queue: &TaskQueue, document_id: &str) -> Result<()> {
    queue
        .enqueue(KIND_INGEST, &serde_json::json!({ "document_id": document_id }))
        .await?;
    info!(document_id, "ingestion scheduled");
    Ok(())
}

/// Register an uploaded file as a new document and schedule exactly one
/// ingestion attempt once the creating transaction has committed.
/// Replays of an already-done record do not enqueue.
pub async fn create_document(
    pool: &SqlitePool,
    queue: &TaskQueue,
    name: &str,
    file_key: Option<&str>,
    owner: Option<&str>,
) -> Result<String> {
    let doc = Document {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        file_key: file_key.map(|k| k.to_string()),
        extracted_text: None,
        chunking_status: ChunkingStatus::Pending,
        last_error: None,
        retry_count: 0,
        owner: owner.map(|o| o.to_string()),
        created_at: Utc::now().timestamp(),
    };

    let mut uow = Uow::begin(pool).await?;
    store::insert_document(uow.conn(), &doc).await?;
    if !doc.chunking_done() {
        uow.defer(PostCommit::ScheduleIngestion {
            document_id: doc.id.clone(),
        });
    }
    uow.commit(queue).await?;

    info!(document_id = %doc.id, name, "document created");
    Ok(doc.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::testing::pool_with_schema;

    #[tokio::test]
    async fn create_enqueues_exactly_once_after_commit() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), QueueConfig::default());

        let id = create_document(&pool, &queue, "report.txt", Some("blobs/report.txt"), None)
            .await
            .unwrap();

        let doc = store::get_document(&pool, &id).await.unwrap().unwrap();
        assert_eq!(doc.chunking_status, ChunkingStatus::Pending);

        assert_eq!(queue.depth().await.unwrap(), 1);
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.kind, KIND_INGEST);
        let payload: serde_json::Value = serde_json::from_str(&delivery.payload).unwrap();
        assert_eq!(payload["document_id"], id.as_str());
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_uow_rolls_back_and_does_not_enqueue() {
        let (_dir, pool) = pool_with_schema().await;
        let queue = TaskQueue::new(pool.clone(), QueueConfig::default());

        let doc = Document {
            id: "abandoned".to_string(),
            name: "x".to_string(),
            file_key: None,
            extracted_text: None,
            chunking_status: ChunkingStatus::Pending,
            last_error: None,
            retry_count: 0,
            owner: None,
            created_at: 0,
        };
        {
            let mut uow = Uow::begin(&pool).await.unwrap();
            store::insert_document(uow.conn(), &doc).await.unwrap();
            uow.defer(PostCommit::ScheduleIngestion {
                document_id: doc.id.clone(),
            });
            // Dropped without commit.
        }

        assert!(store::get_document(&pool, "abandoned")
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
