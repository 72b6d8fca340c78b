//! Replay backend: candidates recorded earlier, keyed by item id.
//!
//! Accepts plain `{"item_id", "raw_output" | "sql"}` lines as well as a
//! previous run's `verdicts.jsonl`, so a run can be re-scored under a
//! different equivalence policy without calling any model.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use scoring::TokenUsage;
use serde::Deserialize;

use super::{GenerationError, RateLimiter, RawCompletion, RetryPolicy};
use crate::config::{ConfigError, ModelConfig};

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    item_id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    raw_output: Option<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    candidate_sql: Option<String>,
    #[serde(default)]
    tokens: Option<TokenUsage>,
}

pub struct ReplayAdapter {
    id: String,
    candidates: HashMap<String, RawCompletion>,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl ReplayAdapter {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self, ConfigError> {
        let path = cfg
            .replay_path
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid(format!("model '{}' needs replay_path", cfg.id)))?;
        Self::load(&cfg.id, path, cfg.model.as_deref())
            .map_err(|e| ConfigError::Invalid(format!("model '{}': {e}", cfg.id)))
    }

    /// Load `path`. When `model_filter` is set, records tagged with another
    /// model are skipped; untagged records are always kept.
    pub fn load(id: &str, path: &Path, model_filter: Option<&str>) -> Result<Self, GenerationError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GenerationError::ParseFailure(format!("{}: {e}", path.display())))?;
        let adapter = Self::parse(id, &text, model_filter)?;
        tracing::info!(
            model = %id,
            path = %path.display(),
            candidates = adapter.candidates.len(),
            "Loaded replay candidates"
        );
        Ok(adapter)
    }

    pub fn parse(id: &str, text: &str, model_filter: Option<&str>) -> Result<Self, GenerationError> {
        let mut candidates = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(line)
                .map_err(|e| GenerationError::ParseFailure(format!("line {}: {e}", idx + 1)))?;
            if let (Some(filter), Some(model)) = (model_filter, record.model.as_deref()) {
                if filter != model {
                    continue;
                }
            }
            let Some(text) = record.raw_output.or(record.sql).or(record.candidate_sql) else {
                continue;
            };
            candidates.insert(
                record.item_id,
                RawCompletion {
                    text,
                    tokens: record.tokens,
                },
            );
        }
        Ok(Self {
            id: id.to_string(),
            candidates,
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            limiter: Arc::new(RateLimiter::unlimited()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub(super) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(super) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub(super) fn complete(&self, item_id: &str) -> Result<RawCompletion, GenerationError> {
        self.candidates
            .get(item_id)
            .cloned()
            .ok_or_else(|| GenerationError::Missing(item_id.to_string()))
    }
}
