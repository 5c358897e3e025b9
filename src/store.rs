//! Document and chunk persistence.
//!
//! All document mutations from the pipeline go through targeted field
//! updates — never whole-record saves — so concurrent writes to unrelated
//! fields are not clobbered. The only multi-statement write is
//! [`commit_chunks`], which finalizes a successful ingestion run in a
//! single transaction.

use sqlx::{Row, SqlitePool};

use crate::models::{Chunk, ChunkingStatus, Document};

pub async fn get_document(
    pool: &SqlitePool,
    id: &str,
) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, file_key, extracted_text, chunking_status, last_error, retry_count, owner, created_at
         FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(row_to_document).transpose()
}

pub async fn insert_document<'e, E>(db: E, doc: &Document) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO documents (id, name, file_key, extracted_text, chunking_status, last_error, retry_count, owner, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.name)
    .bind(&doc.file_key)
    .bind(&doc.extracted_text)
    .bind(doc.chunking_status.as_str())
    .bind(&doc.last_error)
    .bind(doc.retry_count)
    .bind(&doc.owner)
    .bind(doc.created_at)
    .execute(db)
    .await?;

    Ok(())
}

/// Mark a document as being processed. Targeted update.
pub async fn mark_processing(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE documents SET chunking_status = ? WHERE id = ?")
        .bind(ChunkingStatus::Processing.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failure: status to `error`, reason into `last_error`.
pub async fn record_error(
    pool: &SqlitePool,
    id: &str,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE documents SET chunking_status = ?, last_error = ? WHERE id = ?")
        .bind(ChunkingStatus::Error.as_str())
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the queue delivery attempt that is processing this document.
/// Informational only; `retry_count` counts deliveries beyond the first.
pub async fn record_attempt(
    pool: &SqlitePool,
    id: &str,
    delivery_attempt: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE documents SET retry_count = ? WHERE id = ?")
        .bind(delivery_attempt.saturating_sub(1))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reset a document so an operator can schedule another run. Returns
/// false if the id does not exist.
pub async fn reset_for_reprocess(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE documents SET chunking_status = ?, last_error = NULL WHERE id = ?",
    )
    .bind(ChunkingStatus::Pending.as_str())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Finalize a successful run: bulk-insert the chunks and flip the document
/// to `done` in one transaction.
///
/// Chunk inserts use `INSERT OR IGNORE`, so rows colliding with a prior
/// partial run (same `(document_id, chunk_index)`) are silently skipped
/// instead of failing the batch.
pub async fn commit_chunks(
    pool: &SqlitePool,
    document_id: &str,
    extracted_text: &str,
    chunks: &[Chunk],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chunks (id, document_id, chunk_index, content, token_count, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.token_count)
        .bind(&chunk.embedding)
        .bind(chunk.created_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE documents SET extracted_text = ?, chunking_status = ?, last_error = NULL WHERE id = ?",
    )
    .bind(extracted_text)
    .bind(ChunkingStatus::Done.as_str())
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn chunk_count(pool: &SqlitePool, document_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document, sqlx::Error> {
    let status_str: String = row.get("chunking_status");
    let chunking_status = ChunkingStatus::parse(&status_str).ok_or_else(|| {
        sqlx::Error::Decode(format!("invalid chunking_status: {}", status_str).into())
    })?;

    Ok(Document {
        id: row.get("id"),
        name: row.get("name"),
        file_key: row.get("file_key"),
        extracted_text: row.get("extracted_text"),
        chunking_status,
        last_error: row.get("last_error"),
        retry_count: row.get("retry_count"),
        owner: row.get("owner"),
        created_at: row.get("created_at"),
    })
}
