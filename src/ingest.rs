//! Document ingestion: chunking, embedding, and the dual index write.
//!
//! An ingestion job runs, in order: outline scan (best-effort, non-fatal
//! when nothing is found), chunking, embedding, and the dual index write.
//! The write replaces a document's chunks wholesale inside one SQLite
//! transaction covering `chunks`, `chunks_fts`, and `chunk_vectors`, so a
//! chunk never becomes lexically searchable without also being
//! vector-searchable (or vice versa) — partial visibility would make the
//! fusion ranker silently under-score it.
//!
//! Jobs get a bounded retry budget; a job that exhausts it is recorded in
//! the `dead_letters` table for manual inspection and the document simply
//! stays thin (queries against it retrieve fewer or zero chunks).

use anyhow::{bail, Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{info, warn};

use crate::chunker::chunk_text;
use crate::config::Config;
use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::models::{ChunkDraft, DeadLetter};
use crate::sanitizer::{SanitizeContext, Sanitizer};

/// Per-attempt backoff base for ingestion retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Summary of a completed ingestion job.
#[derive(Debug, Clone)]
pub struct IngestStats {
    pub document_id: i64,
    pub chunks: usize,
    pub vectors: usize,
    pub outline_entries: usize,
}

/// One heading pulled from a table-of-contents-shaped region of the text.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineEntry {
    pub title: String,
    pub page: i64,
}

/// Register a document and return its id. Chunks are added separately by
/// [`run_ingest_job`].
pub async fn create_document(
    pool: &SqlitePool,
    title: &str,
    author: &str,
    storage_ref: &str,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO documents (title, author, storage_ref, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(title)
    .bind(author)
    .bind(storage_ref)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Run one ingestion attempt for a document's full text.
///
/// When an embedder is supplied every chunk gets a vector in the same
/// transaction; without one the document is lexically searchable only.
pub async fn run_ingest_job(
    pool: &SqlitePool,
    config: &Config,
    document_id: i64,
    text: &str,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<IngestStats> {
    let outline = scan_outline(text);
    if !outline.is_empty() {
        info!(document_id, entries = outline.len(), "outline scan found headings");
    }

    let drafts = chunk_text(
        text,
        config.chunking.max_chars,
        config.chunking.overlap_chars,
    );

    let embeddings = match embedder {
        Some(provider) => Some(embed_drafts(provider, &drafts, config.embedding.batch_size).await?),
        None => None,
    };

    let vectors = embeddings.as_ref().map(Vec::len).unwrap_or(0);
    replace_chunks(pool, document_id, &drafts, embeddings.as_deref()).await?;

    info!(document_id, chunks = drafts.len(), vectors, "document ingested");
    Ok(IngestStats {
        document_id,
        chunks: drafts.len(),
        vectors,
        outline_entries: outline.len(),
    })
}

/// [`run_ingest_job`] under the retry contract: up to
/// `ingest.max_attempts` tries with linear backoff, then a dead-letter
/// record and the final error.
pub async fn ingest_with_retries(
    pool: &SqlitePool,
    config: &Config,
    document_id: i64,
    storage_ref: &str,
    text: &str,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<IngestStats> {
    let max_attempts = config.ingest.max_attempts;
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(RETRY_BACKOFF * (attempt - 1)).await;
        }

        match run_ingest_job(pool, config, document_id, text, embedder).await {
            Ok(stats) => return Ok(stats),
            Err(e) => {
                warn!(document_id, attempt, max_attempts, error = %e, "ingestion attempt failed");
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| anyhow::anyhow!("ingestion failed"));
    // Record the full cause chain, not just the outermost context.
    record_dead_letter(pool, document_id, storage_ref, &format!("{err:#}"), max_attempts).await?;
    Err(err.context(format!(
        "ingestion of document {document_id} dead-lettered after {max_attempts} attempts"
    )))
}

async fn embed_drafts(
    provider: &dyn EmbeddingProvider,
    drafts: &[ChunkDraft],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
    let mut embeddings = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size.max(1)) {
        let mut vectors = provider.embed(batch).await.context("Embedding batch failed")?;
        if vectors.len() != batch.len() {
            bail!(
                "Embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }
        embeddings.append(&mut vectors);
    }

    Ok(embeddings)
}

/// Replace a document's chunks across all three tables in one
/// transaction.
async fn replace_chunks(
    pool: &SqlitePool,
    document_id: i64,
    drafts: &[ChunkDraft],
    embeddings: Option<&[Vec<f32>]>,
) -> Result<()> {
    if let Some(vectors) = embeddings {
        if vectors.len() != drafts.len() {
            bail!(
                "{} embeddings for {} chunks of document {}",
                vectors.len(),
                drafts.len(),
                document_id
            );
        }
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (position, draft) in drafts.iter().enumerate() {
        let hash = format!("{:x}", Sha256::digest(draft.text.as_bytes()));

        let inserted = sqlx::query(
            "INSERT INTO chunks (document_id, ordinal, page, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(draft.ordinal)
        .bind(draft.page)
        .bind(&draft.text)
        .bind(&hash)
        .execute(&mut *tx)
        .await?;
        let chunk_id = inserted.last_insert_rowid();

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(chunk_id)
            .bind(document_id)
            .bind(&draft.text)
            .execute(&mut *tx)
            .await?;

        if let Some(vectors) = embeddings {
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(document_id)
            .bind(vec_to_blob(&vectors[position]))
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

async fn record_dead_letter(
    pool: &SqlitePool,
    document_id: i64,
    storage_ref: &str,
    error_message: &str,
    retry_count: u32,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO dead_letters (document_id, storage_ref, error_message, retry_count, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(document_id)
    .bind(storage_ref)
    .bind(error_message)
    .bind(retry_count as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    warn!(document_id, storage_ref, retry_count, "ingestion job dead-lettered");
    Ok(())
}

/// All dead-lettered jobs, newest first.
pub async fn list_dead_letters(pool: &SqlitePool) -> Result<Vec<DeadLetter>> {
    let rows = sqlx::query(
        "SELECT id, document_id, storage_ref, error_message, retry_count, created_at \
         FROM dead_letters ORDER BY id DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| DeadLetter {
            id: row.get("id"),
            document_id: row.get("document_id"),
            storage_ref: row.get("storage_ref"),
            error_message: row.get("error_message"),
            retry_count: row.get("retry_count"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Best-effort scan for table-of-contents lines (`Title .... 12`).
///
/// Headings are flat; nested outlines are reported as a flat list on
/// purpose. Titles pass through the sanitizer's ToC rules so leader dots
/// and page markers never reach a prompt via outline text.
pub fn scan_outline(text: &str) -> Vec<OutlineEntry> {
    // Compiled per call; outline scans happen once per ingestion job.
    let line_re = match Regex::new(r"^(?P<title>\S.*?)\s*\.{3,}\s*(?P<page>\d+)\s*$") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let sanitizer = Sanitizer::new();

    let mut entries = Vec::new();
    for line in text.lines() {
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        let Ok(page) = caps["page"].parse::<i64>() else {
            continue;
        };
        let raw_title = caps["title"].trim();
        let cleaned = sanitizer
            .sanitize(raw_title, SanitizeContext::Toc)
            .sanitized_text;
        // Short titles trip the sanitizer's length floor; they are still
        // fine as outline entries.
        let title = if cleaned.is_empty() || cleaned == crate::sanitizer::TOO_SHORT_PLACEHOLDER {
            raw_title.to_string()
        } else {
            cleaned
        };
        if title.is_empty() {
            continue;
        }
        entries.push(OutlineEntry { title, page });
    }

    entries
}
