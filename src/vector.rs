//! Nearest-neighbor search over stored chunk embeddings.
//!
//! Vectors live in the `chunk_vectors` table as little-endian f32 blobs;
//! similarity is computed in-process (cosine), and results are ordered by
//! ascending distance (`1 − cosine similarity`, lower = more similar).
//!
//! The index itself is not scope-aware. A document-scoped search fetches a
//! larger unfiltered result set and intersects it with the scope's chunk
//! ids; if that intersection falls short of the requested limit, no
//! backfill is attempted. This is a documented limitation, not silently
//! corrected.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::embedding::{blob_to_vec, cosine_similarity};

/// Over-fetch factor for scoped searches.
const SCOPE_OVERFETCH: i64 = 4;

/// Ranked vector search. Returns `(chunk_id, distance)` ascending by
/// distance. Candidates whose similarity falls below `min_similarity`
/// are discarded.
pub async fn search(
    pool: &SqlitePool,
    query_vec: &[f32],
    scope_id: Option<i64>,
    limit: i64,
    min_similarity: f64,
) -> Result<Vec<(i64, f64)>> {
    let fetch_limit = match scope_id {
        Some(_) => limit.saturating_mul(SCOPE_OVERFETCH),
        None => limit,
    };

    let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
        .fetch_all(pool)
        .await?;

    let mut candidates: Vec<(i64, f64)> = rows
        .iter()
        .map(|row| {
            let chunk_id: i64 = row.get("chunk_id");
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            let similarity = cosine_similarity(query_vec, &vec) as f64;
            (chunk_id, 1.0 - similarity)
        })
        .filter(|(_, distance)| 1.0 - distance >= min_similarity)
        .collect();

    candidates.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    candidates.truncate(fetch_limit as usize);

    if let Some(document_id) = scope_id {
        let allowed = scoped_chunk_ids(pool, document_id).await?;
        candidates.retain(|(chunk_id, _)| allowed.contains(chunk_id));
        // No backfill: a scoped search can return fewer than `limit` hits.
        candidates.truncate(limit as usize);
    }

    Ok(candidates)
}

async fn scoped_chunk_ids(pool: &SqlitePool, document_id: i64) -> Result<HashSet<i64>> {
    let rows = sqlx::query_scalar::<_, i64>("SELECT id FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().collect())
}
