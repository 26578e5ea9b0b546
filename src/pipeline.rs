//! The query pipeline: retrieval, fusion, gating, and generation.
//!
//! One [`QueryPipeline`] instance serves the whole process. Each query:
//!
//! 1. snapshots the live [`RagConfig`](crate::config_store::RagConfig)
//!    once, so mid-query updates cannot produce a mixed view
//! 2. runs the lexical search and the embed→vector search concurrently
//! 3. fuses the two ranked lists with RRF
//! 4. applies the Retrieval Gate (`min_chunks`)
//! 5. sanitizes chunk text and formats the citation-tagged context
//! 6. calls the generator under a hard deadline
//! 7. applies the Generation Gate (`confidence_threshold`)
//!
//! A query resolves to exactly one of an answer or a fallback message.
//! Branch failures degrade rather than abort: a dead vector branch leaves
//! lexical-only retrieval, and any generation failure or timeout resolves
//! to the fallback path.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config_store::ConfigStore;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::fusion::{fuse_or_lexical, RRF_K};
use crate::generator::{
    build_grounded_prompt, format_context, parse_answer, AnswerGenerator, GENERATION_FALLBACK,
    RETRIEVAL_FALLBACK,
};
use crate::models::{QueryRequest, QueryResponse, RetrievedChunk};
use crate::sanitizer::{SanitizeContext, Sanitizer};
use crate::{lexical, vector};

pub struct QueryPipeline {
    pool: SqlitePool,
    config_store: Arc<ConfigStore>,
    sanitizer: Sanitizer,
    embedder: Option<Box<dyn EmbeddingProvider>>,
    generator: Option<Box<dyn AnswerGenerator>>,
    generation_timeout: Duration,
}

impl QueryPipeline {
    pub fn new(
        pool: SqlitePool,
        config_store: Arc<ConfigStore>,
        embedder: Option<Box<dyn EmbeddingProvider>>,
        generator: Option<Box<dyn AnswerGenerator>>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            config_store,
            sanitizer: Sanitizer::new(),
            embedder,
            generator,
            generation_timeout,
        }
    }

    /// Run retrieval only: concurrent dual search, fusion, hydration.
    /// Returns fused chunks best-first, at most `top_k` of them.
    pub async fn retrieve(
        &self,
        query: &str,
        scope_id: Option<i64>,
        top_k: i64,
    ) -> Result<Vec<RetrievedChunk>> {
        let cfg = self.config_store.get();
        self.retrieve_with(query, scope_id, top_k, cfg.relevance_threshold)
            .await
    }

    async fn retrieve_with(
        &self,
        query: &str,
        scope_id: Option<i64>,
        top_k: i64,
        min_similarity: f64,
    ) -> Result<Vec<RetrievedChunk>> {
        let lexical_fut = lexical::search(&self.pool, query, scope_id, top_k);
        let vector_fut = self.vector_branch(query, scope_id, top_k, min_similarity);
        let (lexical_res, vector_res) = tokio::join!(lexical_fut, vector_fut);

        // A dead lexical index degrades to an empty list; the query then
        // rides the vector branch alone or trips the retrieval gate.
        let lexical_list = lexical_res.unwrap_or_else(|e| {
            warn!(error = %e, "lexical search failed, degrading to empty result");
            Vec::new()
        });
        let vector_list = vector_res;

        let mut fused = fuse_or_lexical(&lexical_list, &vector_list, RRF_K);
        fused.truncate(top_k as usize);

        self.hydrate(&fused, &lexical_list, &vector_list).await
    }

    /// Answer a query end to end. The response carries exactly one of an
    /// answer or a fallback message.
    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryResponse> {
        if request.query.trim().is_empty() {
            bail!("query must not be empty");
        }

        let cfg = self.config_store.get();
        let top_k = request.top_k.unwrap_or(cfg.retrieval_top_k).max(1);

        let retrieved = self
            .retrieve_with(&request.query, request.scope_id, top_k, cfg.relevance_threshold)
            .await?;

        // Retrieval Gate: no evidence at all always falls back; thin
        // evidence falls back only while fallback is enabled.
        if retrieved.is_empty() {
            return Ok(QueryResponse::fallback(RETRIEVAL_FALLBACK));
        }
        if cfg.enable_fallback && (retrieved.len() as i64) < cfg.min_chunks {
            debug!(
                found = retrieved.len(),
                min_chunks = cfg.min_chunks,
                "retrieval gate closed"
            );
            return Ok(QueryResponse::fallback(RETRIEVAL_FALLBACK));
        }

        // Untrusted document text is filtered before prompt assembly.
        let cleaned: Vec<RetrievedChunk> = retrieved
            .into_iter()
            .map(|mut chunk| {
                let outcome = self.sanitizer.sanitize(&chunk.text, SanitizeContext::General);
                chunk.text = outcome.sanitized_text;
                chunk
            })
            .collect();

        let (context, included_ids) = format_context(&cleaned, cfg.max_context_length);
        if included_ids.is_empty() {
            return Ok(QueryResponse::fallback(RETRIEVAL_FALLBACK));
        }

        let Some(generator) = self.generator.as_deref() else {
            debug!("generation provider disabled, resolving to fallback");
            return Ok(QueryResponse::fallback(GENERATION_FALLBACK));
        };

        let prompt = build_grounded_prompt(&request.query, &context);
        let raw = match tokio::time::timeout(
            self.generation_timeout,
            generator.generate(&prompt, cfg.temperature),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "generation failed, resolving to fallback");
                return Ok(QueryResponse::fallback(GENERATION_FALLBACK));
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.generation_timeout.as_secs(),
                    "generation timed out, resolving to fallback"
                );
                return Ok(QueryResponse::fallback(GENERATION_FALLBACK));
            }
        };

        let allowed: HashSet<i64> = included_ids.iter().copied().collect();
        let answer = match parse_answer(&raw, &allowed) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "generator reply failed validation, resolving to fallback");
                return Ok(QueryResponse::fallback(GENERATION_FALLBACK));
            }
        };

        // Generation Gate.
        if cfg.enable_fallback && answer.confidence_score < cfg.confidence_threshold {
            debug!(
                confidence = answer.confidence_score,
                threshold = cfg.confidence_threshold,
                "generation gate closed"
            );
            return Ok(QueryResponse::fallback(GENERATION_FALLBACK));
        }

        Ok(QueryResponse::answered(answer))
    }

    /// The embed-then-search half of dual retrieval. Failures degrade to
    /// an empty list so the lexical branch alone can carry the query.
    async fn vector_branch(
        &self,
        query: &str,
        scope_id: Option<i64>,
        top_k: i64,
        min_similarity: f64,
    ) -> Vec<(i64, f64)> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Vec::new();
        };

        let query_vec = match embed_query(embedder, query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed, degrading to lexical-only");
                return Vec::new();
            }
        };

        match vector::search(&self.pool, &query_vec, scope_id, top_k, min_similarity).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "vector search failed, degrading to lexical-only");
                Vec::new()
            }
        }
    }

    /// Load chunk rows for the fused ids, preserving fused order, and
    /// annotate each with its per-index provenance.
    async fn hydrate(
        &self,
        fused: &[(i64, f64)],
        lexical_list: &[(i64, f64)],
        vector_list: &[(i64, f64)],
    ) -> Result<Vec<RetrievedChunk>> {
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; fused.len()].join(", ");
        let sql = format!(
            "SELECT id, document_id, page, text FROM chunks WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for (chunk_id, _) in fused {
            query = query.bind(*chunk_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<i64, (i64, i64, String)> = rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get("id");
                let document_id: i64 = row.get("document_id");
                let page: i64 = row.get("page");
                let text: String = row.get("text");
                (id, (document_id, page, text))
            })
            .collect();

        let lexical_ranks = rank_map(lexical_list);
        let vector_ranks = rank_map(vector_list);

        let mut out = Vec::with_capacity(fused.len());
        for (chunk_id, rrf_score) in fused {
            // Ids come from the indices in the same database; a miss here
            // means the row vanished between search and hydration.
            let Some((document_id, page, text)) = by_id.remove(chunk_id) else {
                warn!(chunk_id, "fused chunk missing from chunk store, skipping");
                continue;
            };
            out.push(RetrievedChunk {
                chunk_id: *chunk_id,
                document_id,
                page,
                text,
                lexical_rank: lexical_ranks.get(chunk_id).copied(),
                vector_rank: vector_ranks.get(chunk_id).copied(),
                rrf_score: *rrf_score,
            });
        }

        Ok(out)
    }
}

/// 1-based rank of each chunk id in a best-first list.
fn rank_map(list: &[(i64, f64)]) -> HashMap<i64, usize> {
    list.iter()
        .enumerate()
        .map(|(position, (chunk_id, _))| (*chunk_id, position + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_map_is_one_based() {
        let list = vec![(30, 0.9), (10, 0.5), (20, 0.1)];
        let ranks = rank_map(&list);
        assert_eq!(ranks.get(&30), Some(&1));
        assert_eq!(ranks.get(&10), Some(&2));
        assert_eq!(ranks.get(&20), Some(&3));
        assert_eq!(ranks.get(&99), None);
    }
}
