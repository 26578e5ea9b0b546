//! Grounded answer generation.
//!
//! Defines the [`AnswerGenerator`] trait and concrete implementations:
//! - **[`DisabledGenerator`]** — returns errors; every query resolves to
//!   the fallback path when it is configured.
//! - **[`OpenAiGenerator`]** — calls the OpenAI chat completions API.
//!
//! The module also owns the prompt/response contract around the model:
//! [`format_context`] renders retrieved chunks into a citation-tagged
//! context block, [`build_grounded_prompt`] wraps it in the grounding
//! instructions, and [`parse_answer`] validates the model's JSON reply —
//! claims citing chunks that were never in the context are dropped, and
//! the confidence score is coerced into `[0.0, 1.0]`. The model's output
//! is never trusted as-is.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::models::{Answer, Claim, RetrievedChunk};

/// Returned when retrieval cannot support an answer at all.
pub const RETRIEVAL_FALLBACK: &str =
    "I could not find enough relevant information in the indexed documents to answer this question.";

/// Returned when generation fails, times out, or produces an answer below
/// the confidence threshold.
pub const GENERATION_FALLBACK: &str =
    "I was unable to produce a well-grounded answer for this question. Please try rephrasing it or narrowing the scope.";

/// Interface every generation backend must implement. Takes a fully
/// rendered prompt and returns the raw model output.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str, temperature: f64) -> Result<String>;
}

/// A no-op generator that always returns errors.
///
/// Used when `generation.provider = "disabled"` in the configuration.
pub struct DisabledGenerator;

#[async_trait]
impl AnswerGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str, _temperature: f64) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

/// Generator using the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable. Transport timeout
/// comes from config; the pipeline applies its own overall deadline on
/// top.
pub struct OpenAiGenerator {
    model: String,
    timeout_secs: u64,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, temperature: f64) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "user", "content": prompt }
            ],
        });

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid chat completion response: missing content"))?;

        Ok(content.to_string())
    }
}

/// Create the appropriate [`AnswerGenerator`] based on configuration.
pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Render retrieved chunks into a citation-tagged context block.
///
/// Chunks are emitted in the order given (best-first). A chunk that would
/// push the block past `max_context_length` characters is skipped along
/// with everything after it. Returns the block and the ids of the chunks
/// actually included — the only ids a valid claim may cite.
pub fn format_context(chunks: &[RetrievedChunk], max_context_length: usize) -> (String, Vec<i64>) {
    let mut block = String::new();
    let mut included = Vec::new();

    for chunk in chunks {
        let entry = format!(
            "[CHUNK id={} page={}]\n{}\n\n",
            chunk.chunk_id, chunk.page, chunk.text
        );
        if block.len() + entry.len() > max_context_length {
            break;
        }
        block.push_str(&entry);
        included.push(chunk.chunk_id);
    }

    (block, included)
}

/// Build the grounded-answer prompt around a context block and query.
///
/// The instructions pin the model to the supplied context, require cited
/// claims, and demand a single JSON object so [`parse_answer`] has a
/// stable shape to validate.
pub fn build_grounded_prompt(query: &str, context: &str) -> String {
    format!(
        "You are answering a question using only the document excerpts below.\n\
         Each excerpt is tagged [CHUNK id=<id> page=<page>].\n\
         \n\
         Rules:\n\
         - Use only information present in the excerpts. Do not use outside knowledge.\n\
         - Every claim must cite the id and page of the excerpt that supports it.\n\
         - If the excerpts do not contain the answer, say so and report low confidence.\n\
         \n\
         Respond with a single JSON object, no surrounding prose:\n\
         {{\n\
           \"answer_summary\": \"<concise answer>\",\n\
           \"claims\": [\n\
             {{\"text\": \"<supported statement>\", \"source_chunk_id\": <id>, \"page_number\": <page>}}\n\
           ],\n\
           \"confidence_score\": <0.0 to 1.0>\n\
         }}\n\
         \n\
         Excerpts:\n\
         {context}\n\
         Question: {query}\n"
    )
}

/// Placeholder summary when the model omits one.
pub const MISSING_SUMMARY: &str = "No answer provided.";

/// Validate and coerce a raw model reply into an [`Answer`].
///
/// Accepts the JSON object with or without a markdown fence around it.
/// Coercions applied rather than rejected:
/// - missing `answer_summary` → [`MISSING_SUMMARY`]
/// - missing/non-array `claims` → empty list
/// - missing, non-numeric, or out-of-range `confidence_score` → `0.0`
/// - claims with missing/malformed fields → dropped
/// - claims citing a chunk id not in `allowed_chunk_ids` → dropped (and
///   logged), since the model cannot be trusted to cite honestly
///
/// Only unparseable JSON is an error; the caller resolves that to the
/// fallback path.
pub fn parse_answer(raw: &str, allowed_chunk_ids: &HashSet<i64>) -> Result<Answer> {
    let stripped = strip_json_fence(raw);
    let json: serde_json::Value =
        serde_json::from_str(stripped).context("Generator reply is not valid JSON")?;

    let answer_summary = json
        .get("answer_summary")
        .and_then(|s| s.as_str())
        .unwrap_or(MISSING_SUMMARY)
        .to_string();

    let confidence_score = json
        .get("confidence_score")
        .and_then(|c| c.as_f64())
        .filter(|c| (0.0..=1.0).contains(c))
        .unwrap_or(0.0);

    let mut claims = Vec::new();
    if let Some(items) = json.get("claims").and_then(|c| c.as_array()) {
        for item in items {
            let claim: Claim = match serde_json::from_value(item.clone()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "dropping malformed claim from generator reply");
                    continue;
                }
            };
            if !allowed_chunk_ids.contains(&claim.source_chunk_id) {
                warn!(
                    source_chunk_id = claim.source_chunk_id,
                    "dropping claim citing a chunk outside the supplied context"
                );
                continue;
            }
            claims.push(claim);
        }
    }

    Ok(Answer {
        answer_summary,
        claims,
        confidence_score,
    })
}

fn strip_json_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
