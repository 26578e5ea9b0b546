//! Paragraph-boundary text chunker.
//!
//! Splits document body text into page-attributed [`ChunkDraft`]s that
//! respect a configurable character budget. Splitting occurs on paragraph
//! boundaries (`\n\n`) to preserve semantic coherence; when a chunk is
//! closed, the next one is seeded with the trailing words of the previous
//! chunk so context survives the boundary.
//!
//! Page markers are form-feed characters (`\u{0C}`): each one increments a
//! 1-based page counter, and every chunk records the page in effect when
//! its first paragraph was read.
//!
//! A single paragraph larger than the budget is kept whole rather than cut
//! mid-sentence. That can produce an oversized chunk; this is a policy
//! choice to avoid fragmenting context.

use crate::models::ChunkDraft;

/// Cap on the number of words carried over as overlap.
const OVERLAP_WORDS: usize = 50;

pub fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<ChunkDraft> {
    let mut chunks: Vec<ChunkDraft> = Vec::new();
    let mut buf = String::new();
    // Page of the first paragraph in the buffer; None while the buffer
    // holds only overlap seed text.
    let mut buf_page: Option<i64> = None;
    let mut has_paragraph = false;
    let mut ordinal: i64 = 0;

    for (page_idx, page_text) in text.split('\u{0C}').enumerate() {
        let page = page_idx as i64 + 1;

        for para in page_text.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }

            let would_be = if buf.is_empty() {
                trimmed.len()
            } else {
                buf.len() + 2 + trimmed.len() // +2 for \n\n separator
            };

            if would_be > max_chars && has_paragraph {
                let closed = std::mem::take(&mut buf);
                chunks.push(ChunkDraft {
                    ordinal,
                    page: buf_page.unwrap_or(page),
                    text: closed.clone(),
                });
                ordinal += 1;
                buf = trailing_overlap(&closed, overlap_chars);
                buf_page = None;
                has_paragraph = false;
            }

            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
            if buf_page.is_none() {
                buf_page = Some(page);
            }
            has_paragraph = true;
        }
    }

    if has_paragraph {
        chunks.push(ChunkDraft {
            ordinal,
            page: buf_page.unwrap_or(1),
            text: buf,
        });
    }

    chunks
}

/// Take the trailing words of a closed chunk, up to `overlap_chars`
/// characters and at most [`OVERLAP_WORDS`] words, to seed the next chunk.
fn trailing_overlap(text: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 {
        return String::new();
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let mut taken: Vec<&str> = Vec::new();
    let mut len = 0usize;

    for word in words.iter().rev().take(OVERLAP_WORDS) {
        let next_len = if taken.is_empty() {
            word.len()
        } else {
            len + 1 + word.len()
        };
        if next_len > overlap_chars {
            break;
        }
        taken.push(word);
        len = next_len;
    }

    taken.reverse();
    taken.join(" ")
}
