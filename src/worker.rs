//! Worker pool and task dispatch.
//!
//! A fixed number of independent receive loops pull deliveries from the
//! task queue, decode them through an explicit [`TaskRegistry`], run the
//! matching handler to completion, and ack afterwards (late ack: a worker
//! that dies mid-task leaves its delivery to visibility-timeout
//! redelivery). Task handlers never raise, so a handled failure still
//! acks — redelivery is reserved for crashed workers.

use anyhow::{bail, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::blobstore::BlobStore;
use crate::config::Config;
use crate::ingest;
use crate::queue::{Delivery, TaskQueue};
use crate::store;

/// Task kind for document ingestion.
pub const KIND_INGEST: &str = "ingest_document";

#[derive(Debug, Deserialize)]
struct IngestPayload {
    document_id: String,
}

/// A decoded task, ready to run.
#[derive(Debug)]
pub enum Task {
    IngestDocument { document_id: String },
}

/// Statically-typed mapping from task kind to decoded task. Constructed
/// once at startup; there is no runtime scanning for handlers.
pub struct TaskRegistry;

impl TaskRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, kind: &str, payload: &str) -> Result<Task> {
        match kind {
            KIND_INGEST => {
                let payload: IngestPayload = serde_json::from_str(payload)?;
                Ok(Task::IngestDocument {
                    document_id: payload.document_id,
                })
            }
            other => bail!("unknown task kind: {}", other),
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the worker pool until Ctrl-C. Each worker drains its current
/// delivery before stopping.
pub async fn run_worker(
    pool: SqlitePool,
    blobs: Arc<dyn BlobStore>,
    config: Arc<Config>,
) -> Result<()> {
    let queue = TaskQueue::new(pool.clone(), config.queue.clone());
    let registry = Arc::new(TaskRegistry::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    info!(
        concurrency = config.worker.concurrency,
        storage = %blobs.describe(),
        "worker pool starting"
    );

    let mut handles = Vec::new();
    for worker_id in 0..config.worker.concurrency {
        handles.push(tokio::spawn(worker_loop(
            worker_id,
            pool.clone(),
            queue.clone(),
            Arc::clone(&blobs),
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&shutdown),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; draining workers");
    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.await;
    }

    let swallowed = ingest::swallowed_error_writes();
    if swallowed > 0 {
        warn!(count = swallowed, "error-status writes were swallowed this run");
    }
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    pool: SqlitePool,
    queue: TaskQueue,
    blobs: Arc<dyn BlobStore>,
    config: Arc<Config>,
    registry: Arc<TaskRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    info!(worker_id, "worker started");
    while !shutdown.load(Ordering::Relaxed) {
        let delivery = match queue.receive_wait().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!(worker_id, error = %e, "queue receive failed");
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        handle_delivery(&pool, &queue, blobs.as_ref(), &config, &registry, delivery).await;
    }
    info!(worker_id, "worker stopped");
}

async fn handle_delivery(
    pool: &SqlitePool,
    queue: &TaskQueue,
    blobs: &dyn BlobStore,
    config: &Config,
    registry: &TaskRegistry,
    delivery: Delivery,
) {
    let task = match registry.decode(&delivery.kind, &delivery.payload) {
        Ok(task) => task,
        Err(e) => {
            // Not dispatchable at all; give it back with backoff until the
            // attempt cap dead-letters it.
            warn!(kind = %delivery.kind, error = %e, "undeliverable task; releasing");
            if let Err(e) = queue.release(&delivery.receipt, delivery.attempt).await {
                error!(error = %e, "failed to release delivery");
            }
            return;
        }
    };

    match task {
        Task::IngestDocument { document_id } => {
            if delivery.attempt > 1 {
                if let Err(e) = store::record_attempt(pool, &document_id, delivery.attempt).await {
                    warn!(document_id, error = %e, "failed to record delivery attempt");
                }
            }
            let outcome = ingest::run_ingestion(pool, blobs, config, &document_id).await;
            info!(
                document_id,
                outcome = outcome.as_str(),
                attempt = delivery.attempt,
                "ingestion task finished"
            );
        }
    }

    if let Err(e) = queue.ack(&delivery.receipt).await {
        error!(error = %e, "failed to ack delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::FsBlobStore;
    use crate::config::{ChunkingConfig, DbConfig, QueueConfig, StorageConfig, WorkerConfig};
    use crate::db::testing::pool_with_schema;
    use crate::models::ChunkingStatus;
    use crate::trigger;

    #[test]
    fn registry_decodes_ingest_tasks() {
        let registry = TaskRegistry::new();
        let task = registry
            .decode(KIND_INGEST, r#"{"document_id": "d1"}"#)
            .unwrap();
        match task {
            Task::IngestDocument { document_id } => assert_eq!(document_id, "d1"),
        }
    }

    #[test]
    fn registry_rejects_unknown_kind_and_bad_payload() {
        let registry = TaskRegistry::new();
        assert!(registry.decode("resize_image", "{}").is_err());
        assert!(registry.decode(KIND_INGEST, "not json").is_err());
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            db: DbConfig {
                path: dir.path().join("test.sqlite"),
            },
            storage: StorageConfig {
                backend: "filesystem".to_string(),
                root: Some(dir.path().join("blobs")),
                bucket: None,
                region: "us-east-2".to_string(),
                prefix: String::new(),
                endpoint_url: None,
            },
            queue: QueueConfig {
                wait_time_secs: 0,
                ..QueueConfig::default()
            },
            chunking: ChunkingConfig { max_tokens: 10 },
            worker: WorkerConfig {
                concurrency: 1,
                spool_dir: Some(dir.path().join("spool")),
            },
        }
    }

    #[tokio::test]
    async fn delivery_runs_ingestion_and_acks() {
        let (dir, pool) = pool_with_schema().await;
        let config = test_config(&dir);
        let blob_root = dir.path().join("blobs");
        std::fs::create_dir_all(&blob_root).unwrap();
        std::fs::write(blob_root.join("report.txt"), b"Body text.\n\nMore text.").unwrap();

        let queue = TaskQueue::new(pool.clone(), config.queue.clone());
        let blobs = FsBlobStore::new(blob_root);
        let registry = TaskRegistry::new();

        let id = trigger::create_document(&pool, &queue, "report.txt", Some("report.txt"), None)
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        handle_delivery(&pool, &queue, &blobs, &config, &registry, delivery).await;

        let doc = store::get_document(&pool, &id).await.unwrap().unwrap();
        assert_eq!(doc.chunking_status, ChunkingStatus::Done);
        // Acked: nothing left to deliver.
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_task_still_acks() {
        let (dir, pool) = pool_with_schema().await;
        let config = test_config(&dir);
        let blobs = FsBlobStore::new(dir.path().join("blobs"));

        let queue = TaskQueue::new(pool.clone(), config.queue.clone());
        let registry = TaskRegistry::new();

        // No attachment: the task fails, records the error, and the
        // delivery is still acked (caught failures do not retry).
        let id = trigger::create_document(&pool, &queue, "bare.txt", None, None)
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        handle_delivery(&pool, &queue, &blobs, &config, &registry, delivery).await;

        let doc = store::get_document(&pool, &id).await.unwrap().unwrap();
        assert_eq!(doc.chunking_status, ChunkingStatus::Error);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_kind_is_released_not_acked() {
        let (dir, pool) = pool_with_schema().await;
        let config = test_config(&dir);
        let blobs = FsBlobStore::new(dir.path().join("blobs"));

        let queue = TaskQueue::new(pool.clone(), config.queue.clone());
        let registry = TaskRegistry::new();

        queue
            .enqueue("resize_image", &serde_json::json!({}))
            .await
            .unwrap();
        let delivery = queue.receive().await.unwrap().unwrap();
        handle_delivery(&pool, &queue, &blobs, &config, &registry, delivery).await;

        // Still queued, hidden behind the release backoff.
        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
