//! Lexical (BM25) search over the FTS5 chunk index.
//!
//! The `chunks_fts` virtual table is written in the same transaction as
//! the `chunks` rows (see [`crate::ingest`]), so the index never drifts
//! from the primary chunk store.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// Ranked lexical search. Returns `(chunk_id, score)` ordered best-first,
/// one entry per chunk. Higher score = better match (FTS5 rank negated).
pub async fn search(
    pool: &SqlitePool,
    query: &str,
    scope_id: Option<i64>,
    limit: i64,
) -> Result<Vec<(i64, f64)>> {
    let match_expr = escape_match_query(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let rows = match scope_id {
        Some(document_id) => {
            sqlx::query(
                r#"
                SELECT chunk_id, rank
                FROM chunks_fts
                WHERE chunks_fts MATCH ? AND document_id = ?
                ORDER BY rank
                LIMIT ?
                "#,
            )
            .bind(&match_expr)
            .bind(document_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT chunk_id, rank
                FROM chunks_fts
                WHERE chunks_fts MATCH ?
                ORDER BY rank
                LIMIT ?
                "#,
            )
            .bind(&match_expr)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    let results = rows
        .iter()
        .map(|row| {
            let chunk_id: i64 = row.get("chunk_id");
            let rank: f64 = row.get("rank");
            (chunk_id, -rank) // negate so higher = better
        })
        .collect();

    Ok(results)
}

/// Escape a user query into FTS5 MATCH syntax.
///
/// Each whitespace-separated term becomes a quoted token (internal quotes
/// doubled), joined with OR. Untrusted punctuation therefore cannot be
/// parsed as FTS5 operators, at the cost of not supporting them.
fn escape_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_plain_terms() {
        assert_eq!(
            escape_match_query("rust retrieval"),
            "\"rust\" OR \"retrieval\""
        );
    }

    #[test]
    fn test_escape_neutralizes_operators() {
        let escaped = escape_match_query("NEAR(a b) AND c*");
        assert!(escaped.contains("\"NEAR(a\""));
        assert!(!escaped.contains(" AND \"")); // AND became a quoted token
    }

    #[test]
    fn test_escape_doubles_quotes() {
        assert_eq!(escape_match_query("say \"hi\""), "\"say\" OR \"\"\"hi\"\"\"");
    }

    #[test]
    fn test_escape_drops_pure_punctuation() {
        assert_eq!(escape_match_query("?? -- !!"), "");
        assert_eq!(escape_match_query(""), "");
    }
}
