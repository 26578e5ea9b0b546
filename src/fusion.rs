//! Reciprocal Rank Fusion of the lexical and vector result lists.
//!
//! Each input list is a best-first sequence of `(chunk_id, score)`; the
//! list position implies a 1-based rank and the raw scores are ignored by
//! the fusion itself (rank-based merging is what makes BM25 scores and
//! cosine distances comparable). A chunk appearing in both lists sums a
//! contribution from each, so it strictly outranks a chunk appearing in
//! only one list at the same individual rank.

use std::collections::HashMap;
use tracing::warn;

/// Standard RRF dampening constant.
pub const RRF_K: f64 = 60.0;

/// Fuse two ranked lists with `rrf_score = Σ 1/(k + rank)`.
///
/// Output covers every distinct chunk id from either list, sorted by
/// descending score with ties broken by ascending chunk id for
/// determinism.
///
/// # Errors
///
/// Rejects a non-finite or non-positive `k`; real inputs cannot fail.
pub fn reciprocal_rank_fusion(
    lexical: &[(i64, f64)],
    vector: &[(i64, f64)],
    k: f64,
) -> anyhow::Result<Vec<(i64, f64)>> {
    if !k.is_finite() || k <= 0.0 {
        anyhow::bail!("RRF constant must be a positive finite number, got {}", k);
    }

    let mut scores: HashMap<i64, f64> = HashMap::new();

    for list in [lexical, vector] {
        for (position, (chunk_id, _)) in list.iter().enumerate() {
            let rank = position as f64 + 1.0;
            *scores.entry(*chunk_id).or_insert(0.0) += 1.0 / (k + rank);
        }
    }

    let mut fused: Vec<(i64, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    Ok(fused)
}

/// Fusion with the degrade contract: on any internal fusion failure the
/// lexical list is returned unchanged, so a query never fails on fusion.
pub fn fuse_or_lexical(
    lexical: &[(i64, f64)],
    vector: &[(i64, f64)],
    k: f64,
) -> Vec<(i64, f64)> {
    match reciprocal_rank_fusion(lexical, vector, k) {
        Ok(fused) => fused,
        Err(e) => {
            warn!(error = %e, "rank fusion failed, degrading to lexical results");
            lexical.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(fused: &[(i64, f64)]) -> Vec<i64> {
        fused.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_both_lists_outrank_single_list_at_equal_rank() {
        // Chunk 1 is rank 1 in both lists; chunks 2 and 3 are rank 1 in
        // only one list each.
        let lexical = vec![(1, 9.0), (2, 5.0)];
        let vector = vec![(1, 0.1), (3, 0.2)];
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K).unwrap();

        let score = |id: i64| fused.iter().find(|(c, _)| *c == id).unwrap().1;
        assert!(score(1) > score(2));
        assert!(score(1) > score(3));
        // 1/(60+1) + 1/(60+1) vs 1/(60+2)
        assert!((score(1) - 2.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_list_contributes_zero() {
        let lexical = vec![(7, 3.0)];
        let vector: Vec<(i64, f64)> = Vec::new();
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K).unwrap();
        assert_eq!(fused.len(), 1);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_ties_break_by_chunk_id_ascending() {
        // Chunks 5 and 2 each appear at rank 1 of exactly one list.
        let lexical = vec![(5, 1.0)];
        let vector = vec![(2, 0.5)];
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K).unwrap();
        assert_eq!(ids(&fused), vec![2, 5]);
    }

    #[test]
    fn test_output_is_total_order_over_union() {
        let lexical = vec![(1, 9.0), (2, 8.0), (3, 7.0)];
        let vector = vec![(3, 0.1), (4, 0.2)];
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K).unwrap();
        let mut seen = ids(&fused);
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4]);
        // Scores are non-increasing.
        for pair in fused.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_empty_inputs() {
        let fused = reciprocal_rank_fusion(&[], &[], RRF_K).unwrap();
        assert!(fused.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let lexical = vec![(3, 1.0), (1, 0.9), (2, 0.8)];
        let vector = vec![(2, 0.1), (3, 0.3)];
        let a = reciprocal_rank_fusion(&lexical, &vector, RRF_K).unwrap();
        let b = reciprocal_rank_fusion(&lexical, &vector, RRF_K).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_degrade_returns_lexical_unchanged() {
        let lexical = vec![(1, 9.0), (2, 5.0)];
        let vector = vec![(3, 0.1)];
        let fused = fuse_or_lexical(&lexical, &vector, f64::NAN);
        assert_eq!(fused, lexical);
    }
}
