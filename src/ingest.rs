//! The document ingestion task.
//!
//! [`run_ingestion`] drives a single document from `pending` (or any
//! unknown prior state) to `done` or `error`:
//!
//! 1. load the record — absent ids terminate with `missing`
//! 2. short-circuit if already done (queues redeliver; this makes the
//!    task idempotent)
//! 3. mark `processing` with a targeted update
//! 4. validate that a file is attached
//! 5. spool the blob to a local temp file in bounded blocks, preserving
//!    the filename extension for format detection
//! 6. extract text (empty text is fine)
//! 7. generate chunks (zero chunks is fine, logged as a warning)
//! 8. commit chunks + final status in one transaction
//! 9. remove the spool file on every exit path
//!
//! No failure escapes the task boundary: steps 3–8 map onto
//! [`IngestError`], get recorded on the document best-effort, and come
//! back as the `error` outcome. The queue therefore only redelivers work
//! whose worker died mid-task, not work that failed and was recorded.

use sqlx::SqlitePool;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::blobstore::BlobStore;
use crate::chunker::chunk_text_and_embed;
use crate::config::Config;
use crate::extract::{parse_file, ExtractError};
use crate::models::{Document, IngestOutcome};
use crate::store;

/// Error-status writes that themselves failed and were dropped. Exposed
/// so operators can tell "no failures" apart from "failures we could not
/// record".
static SWALLOWED_ERROR_WRITES: AtomicU64 = AtomicU64::new(0);

pub fn swallowed_error_writes() -> u64 {
    SWALLOWED_ERROR_WRITES.load(Ordering::Relaxed)
}

/// Failure taxonomy for one ingestion run. Every variant follows the same
/// path: recorded on the document, returned as outcome `error`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document has no attached file")]
    MissingAttachment,
    #[error("storage read failed: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("spool I/O failed: {0}")]
    Spool(#[from] std::io::Error),
    #[error("text extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("database write failed: {0}")]
    Db(#[from] sqlx::Error),
}

/// Run one ingestion task to completion. Never panics past its boundary
/// and never raises: the return value is the whole contract.
pub async fn run_ingestion(
    pool: &SqlitePool,
    blobs: &dyn BlobStore,
    config: &Config,
    document_id: &str,
) -> IngestOutcome {
    let doc = match store::get_document(pool, document_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            warn!(document_id, "document not found for ingestion");
            return IngestOutcome::Missing;
        }
        Err(e) => {
            error!(document_id, error = %e, "failed to load document");
            return fail(pool, document_id, &format!("failed to load document: {}", e)).await;
        }
    };

    if doc.chunking_done() {
        info!(document_id, "document already processed; skipping");
        return IngestOutcome::AlreadyDone;
    }

    match process(pool, blobs, config, &doc).await {
        Ok(chunk_count) => {
            info!(document_id, chunk_count, "chunking completed");
            IngestOutcome::Ok
        }
        Err(e) => {
            error!(document_id, error = %e, "ingestion failed");
            fail(pool, document_id, &e.to_string()).await
        }
    }
}

/// Steps 3–8. Any error here is caught by the caller.
async fn process(
    pool: &SqlitePool,
    blobs: &dyn BlobStore,
    config: &Config,
    doc: &Document,
) -> Result<usize, IngestError> {
    store::mark_processing(pool, &doc.id).await?;

    let file_key = doc.file_key.as_deref().ok_or(IngestError::MissingAttachment)?;

    let spool = materialize(blobs, config, doc, file_key).await?;
    let result = extract_and_commit(pool, config, doc, spool.path()).await;
    cleanup(spool, &doc.id);
    result
}

/// Steps 6–8, separated so the spool file outlives them and step 9 runs
/// on both the success and the failure path.
async fn extract_and_commit(
    pool: &SqlitePool,
    config: &Config,
    doc: &Document,
    spool_path: &Path,
) -> Result<usize, IngestError> {
    let text = parse_file(spool_path)?;

    let chunks = chunk_text_and_embed(&text, &doc.id, config.chunking.max_tokens);
    if chunks.is_empty() {
        warn!(document_id = %doc.id, "no chunks produced");
    }

    store::commit_chunks(pool, &doc.id, &text, &chunks).await?;
    Ok(chunks.len())
}

/// Step 5: stream the blob into a temp file in bounded blocks, keeping the
/// original extension (falling back to the display name's) so the
/// extractor can dispatch on it.
async fn materialize(
    blobs: &dyn BlobStore,
    config: &Config,
    doc: &Document,
    file_key: &str,
) -> Result<NamedTempFile, IngestError> {
    use futures_util::TryStreamExt;

    let spool_dir = config.worker.spool_path();
    std::fs::create_dir_all(&spool_dir)?;

    let mut spool = tempfile::Builder::new()
        .prefix("pulpmill-")
        .suffix(&spool_suffix(file_key, &doc.name))
        .tempfile_in(&spool_dir)?;

    let mut stream = blobs.fetch(file_key).await.map_err(IngestError::Storage)?;
    while let Some(block) = stream.try_next().await.map_err(IngestError::Storage)? {
        spool.write_all(&block)?;
    }
    spool.flush()?;

    Ok(spool)
}

fn spool_suffix(file_key: &str, name: &str) -> String {
    let ext = Path::new(file_key)
        .extension()
        .and_then(|e| e.to_str())
        .or_else(|| Path::new(name).extension().and_then(|e| e.to_str()));
    match ext {
        Some(ext) => format!(".{}", ext),
        None => String::new(),
    }
}

/// Step 9. Removal failures are logged, never propagated; the drop impl
/// is the backstop for paths that bypass this.
fn cleanup(spool: NamedTempFile, document_id: &str) {
    if let Err(e) = spool.close() {
        warn!(document_id, error = %e, "failed to remove spool file");
    }
}

/// Record the failure on the document, best-effort. If even that write
/// fails it is swallowed: the outcome still tells the caller, and the
/// counter keeps the silent path observable.
async fn fail(pool: &SqlitePool, document_id: &str, message: &str) -> IngestOutcome {
    if let Err(e) = store::record_error(pool, document_id, message).await {
        SWALLOWED_ERROR_WRITES.fetch_add(1, Ordering::Relaxed);
        warn!(document_id, error = %e, "failed to record error status; giving up");
    }
    IngestOutcome::Error
}
