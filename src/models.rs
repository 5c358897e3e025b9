//! Core data models used throughout Pulpmill.
//!
//! These types represent the documents and chunks that flow through the
//! ingestion pipeline, plus the lifecycle status and task outcome enums.

/// Chunking lifecycle status of a document.
///
/// Transitions are driven exclusively by the ingestion task:
/// `Pending → Processing → Done`, with `Error` reachable from any
/// non-terminal state. There is no transition out of `Done`; leaving
/// `Error` requires an explicit operator reprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl ChunkingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingStatus::Pending => "pending",
            ChunkingStatus::Processing => "processing",
            ChunkingStatus::Done => "done",
            ChunkingStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkingStatus::Pending),
            "processing" => Some(ChunkingStatus::Processing),
            "done" => Some(ChunkingStatus::Done),
            "error" => Some(ChunkingStatus::Error),
            _ => None,
        }
    }
}

/// A registered document and its chunking lifecycle state.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Display name, usually the uploaded file name.
    pub name: String,
    /// Blob-store key of the uploaded file. `None` means no attachment.
    pub file_key: Option<String>,
    /// Full extracted text, populated by a successful ingestion run.
    pub extracted_text: Option<String>,
    pub chunking_status: ChunkingStatus,
    /// Human-readable reason for the most recent failure, if any.
    pub last_error: Option<String>,
    /// Delivery attempts beyond the first, recorded by the worker.
    pub retry_count: i64,
    pub owner: Option<String>,
    /// Unix epoch seconds.
    pub created_at: i64,
}

impl Document {
    /// Compatibility view of the status enum for consumers that expect a
    /// boolean. Derived, never stored independently; the database mirrors
    /// this with a generated column.
    pub fn chunking_done(&self) -> bool {
        self.chunking_status == ChunkingStatus::Done
    }
}

/// A bounded slice of a document's extracted text.
///
/// `chunk_index` is 0-based, contiguous, and unique per document; it
/// defines reading order.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    /// Estimated token count of `content`.
    pub token_count: i64,
    /// Embedding vector, opaque to the pipeline. Populated downstream.
    pub embedding: Option<Vec<u8>>,
    /// Unix epoch seconds.
    pub created_at: i64,
}

/// Result of a single ingestion task invocation.
///
/// Exactly one of these per run. `Missing` and `AlreadyDone` are not
/// errors; `Error` means the document was left in `ChunkingStatus::Error`
/// with `last_error` populated (best-effort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ok,
    AlreadyDone,
    Missing,
    Error,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Ok => "ok",
            IngestOutcome::AlreadyDone => "already_done",
            IngestOutcome::Missing => "missing",
            IngestOutcome::Error => "error",
        }
    }
}
