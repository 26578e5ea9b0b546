//! Live, process-wide retrieval/generation tuning parameters.
//!
//! Unlike the file configuration in [`crate::config`], the [`RagConfig`]
//! held here can be replaced at runtime through the HTTP API. Readers
//! always see a fully-valid snapshot: updates validate the complete
//! parameter set first and then swap the shared `Arc` in one step, so a
//! config in which `min_chunks > retrieval_top_k` is never observable,
//! not even transiently.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Tunable parameters of the retrieval and generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagConfig {
    /// Number of fused chunks handed to the generator.
    pub retrieval_top_k: i64,
    /// Minimum evidence the Retrieval Gate requires before generation.
    pub min_chunks: i64,
    /// Generation Gate threshold; answers at or above it pass.
    pub confidence_threshold: f64,
    pub relevance_threshold: f64,
    /// Character budget of the formatted context block.
    pub max_context_length: usize,
    pub temperature: f64,
    pub enable_fallback: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            retrieval_top_k: 10,
            min_chunks: 2,
            confidence_threshold: 0.7,
            relevance_threshold: 0.5,
            max_context_length: 4000,
            temperature: 0.1,
            enable_fallback: true,
        }
    }
}

/// Rejected configuration update. Surfaced to HTTP clients as a 400,
/// never a server fault.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("retrieval_top_k must be at least 1")]
    TopKTooSmall,
    #[error("min_chunks must be at least 1")]
    MinChunksTooSmall,
    #[error("confidence_threshold must be between 0.0 and 1.0")]
    ConfidenceOutOfRange,
    #[error("relevance_threshold must be between 0.0 and 1.0")]
    RelevanceOutOfRange,
    #[error("max_context_length must be at least 100")]
    ContextTooSmall,
    #[error("temperature must be between 0.0 and 2.0")]
    TemperatureOutOfRange,
    #[error("min_chunks cannot be greater than retrieval_top_k")]
    MinChunksExceedsTopK,
}

impl RagConfig {
    /// Validate the full parameter set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retrieval_top_k < 1 {
            return Err(ConfigError::TopKTooSmall);
        }
        if self.min_chunks < 1 {
            return Err(ConfigError::MinChunksTooSmall);
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::ConfidenceOutOfRange);
        }
        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(ConfigError::RelevanceOutOfRange);
        }
        if self.max_context_length < 100 {
            return Err(ConfigError::ContextTooSmall);
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::TemperatureOutOfRange);
        }
        if self.min_chunks > self.retrieval_top_k {
            return Err(ConfigError::MinChunksExceedsTopK);
        }
        Ok(())
    }
}

/// Holds the one live [`RagConfig`] for the process.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<RagConfig>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RagConfig::default())),
        }
    }

    /// Current configuration snapshot. The returned `Arc` stays valid
    /// and internally consistent even if an update lands mid-query.
    pub fn get(&self) -> Arc<RagConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validate and atomically replace the live configuration. On
    /// rejection the prior configuration remains untouched.
    pub fn update(&self, new_config: RagConfig) -> Result<Arc<RagConfig>, ConfigError> {
        new_config.validate()?;
        let next = Arc::new(new_config);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = next.clone();
        info!(config = ?next, "rag configuration updated");
        Ok(next)
    }

    /// Restore the documented defaults.
    pub fn reset(&self) -> Arc<RagConfig> {
        let next = Arc::new(RagConfig::default());
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = next.clone();
        info!("rag configuration reset to defaults");
        next
    }
}
