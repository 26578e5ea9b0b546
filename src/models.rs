//! Core data models used throughout Libris.
//!
//! These types represent the documents, chunks, and answers that flow
//! through the ingestion and retrieval pipeline, plus the wire shapes
//! exposed by the HTTP API.

use serde::{Deserialize, Serialize};

/// Normalized document stored in SQLite. Immutable once chunked;
/// re-ingestion replaces its chunks wholesale.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub author: String,
    /// Reference to the raw file in external storage (a path, for now).
    pub storage_ref: String,
    pub created_at: i64,
}

/// A bounded, page-attributed segment of a document's text — the unit
/// of retrieval. Never mutated, only replaced.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    /// Monotonic position within the document; defines reading order
    /// and overlap continuity.
    pub ordinal: i64,
    /// Page of the most recently seen page marker when the chunk was cut.
    pub page: i64,
    pub text: String,
    pub hash: String,
}

/// Chunk text produced by the chunker before it has a database identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub ordinal: i64,
    pub page: i64,
    pub text: String,
}

/// A chunk with its retrieval provenance, alive for one query.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: i64,
    pub document_id: i64,
    pub page: i64,
    pub text: String,
    /// 1-based rank in the lexical result list, if present there.
    pub lexical_rank: Option<usize>,
    /// 1-based rank in the vector result list, if present there.
    pub vector_rank: Option<usize>,
    pub rrf_score: f64,
}

/// One cited statement inside an [`Answer`]. The cited chunk must have
/// been part of the context supplied to the generator; that invariant is
/// enforced during response validation, not trusted from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub text: String,
    pub source_chunk_id: i64,
    pub page_number: i64,
}

/// Structured, cited answer with a confidence score in `[0.0, 1.0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer_summary: String,
    pub claims: Vec<Claim>,
    pub confidence_score: f64,
}

/// Logical query request: `{query, scope_id?, top_k?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Restrict retrieval to a single document.
    #[serde(default)]
    pub scope_id: Option<i64>,
    /// Overrides `retrieval_top_k` from the live configuration.
    #[serde(default)]
    pub top_k: Option<i64>,
}

/// Exactly one of `answer` / `fallback_message` is ever populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
}

impl QueryResponse {
    pub fn answered(answer: Answer) -> Self {
        Self {
            answer: Some(answer),
            fallback_message: None,
        }
    }

    pub fn fallback(message: impl Into<String>) -> Self {
        Self {
            answer: None,
            fallback_message: Some(message.into()),
        }
    }
}

/// Persisted record of an ingestion job that exhausted its retry budget,
/// awaiting manual handling.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub document_id: i64,
    pub storage_ref: String,
    pub error_message: String,
    pub retry_count: i64,
    pub created_at: i64,
}
