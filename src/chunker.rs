//! Paragraph-boundary chunk generator.
//!
//! Splits extracted text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence; paragraphs larger than the budget are
//! hard-split at whitespace. Indices are contiguous starting at 0.
//!
//! The generator is pure: it never touches the document record. Embedding
//! vectors are opaque to this pipeline and left unset; a downstream
//! consumer may backfill them.

use chrono::Utc;
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio used for the budget and the stored
/// token-count estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Split `text` into chunks for `document_id`, respecting `max_tokens`.
///
/// Empty or whitespace-only text yields an empty vector; a document with
/// nothing to index is a valid, chunkless result.
pub fn chunk_text_and_embed(text: &str, document_id: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let created_at = Utc::now().timestamp();

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut index: i64 = 0;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Flush the buffer if this paragraph would push it past the budget.
        let projected = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if projected > max_chars && !current.is_empty() {
            chunks.push(make_chunk(document_id, index, &current, created_at));
            index += 1;
            current.clear();
        }

        if trimmed.len() > max_chars {
            // Oversized paragraph: hard-split at whitespace where possible.
            if !current.is_empty() {
                chunks.push(make_chunk(document_id, index, &current, created_at));
                index += 1;
                current.clear();
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let piece = split_front(remaining, max_chars);
                chunks.push(make_chunk(document_id, index, piece.trim(), created_at));
                index += 1;
                remaining = &remaining[piece.len()..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        chunks.push(make_chunk(document_id, index, &current, created_at));
    }

    chunks
}

/// Take up to `max_chars` bytes off the front of `text`, preferring to cut
/// after a space or newline and never inside a UTF-8 character.
fn split_front(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut cut = max_chars;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let at = text[..cut]
        .rfind(|c: char| c == ' ' || c == '\n')
        .map(|pos| pos + 1)
        .unwrap_or(cut);
    &text[..at]
}

fn make_chunk(document_id: &str, index: i64, content: &str, created_at: i64) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        content: content.to_string(),
        token_count: estimate_tokens(content),
        embedding: None,
        created_at,
    }
}

fn estimate_tokens(content: &str) -> i64 {
    content.len().div_ceil(CHARS_PER_TOKEN) as i64
}
