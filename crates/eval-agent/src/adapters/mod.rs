//! Model Adapters.
//!
//! A closed set of backends behind one `generate` capability. Adding a
//! backend means adding a variant. Every call goes through the shared
//! [`RetryPolicy`] and the backend's [`RateLimiter`]; failures come back as a
//! [`ModelCandidate`] with `generation_error` set, never as an `Err`.

pub mod anthropic;
pub mod errors;
pub mod openai;
pub mod rate_limit;
pub mod replay;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use scoring::{extract_sql, ModelCandidate, TokenUsage};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::config::{BackendKind, ConfigError, ModelConfig};
use crate::db::Dialect;
use crate::prompts::{build_prompt, Prompt};

pub use errors::{GenerationError, RetryCategory};
pub use rate_limit::RateLimiter;
pub use replay::ReplayAdapter;
pub use retry::{retry_with_policy, RetryPolicy};

/// Text returned by one backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCompletion {
    pub text: String,
    pub tokens: Option<TokenUsage>,
}

/// Connection settings shared by the HTTP backends.
pub struct HttpBackend {
    pub id: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    client: reqwest::Client,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl HttpBackend {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self, ConfigError> {
        let api_key = cfg.api_key()?;
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            model: cfg.remote_model().to_string(),
            api_key,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            client,
            retry: RetryPolicy::from(&cfg.retry),
            limiter: Arc::new(RateLimiter::new(cfg.requests_per_minute, cfg.max_in_flight)),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

pub enum ModelAdapter {
    /// Local model server speaking `/chat/completions`.
    OpenAiCompatible(HttpBackend),
    /// Hosted Messages API.
    Anthropic(HttpBackend),
    /// Candidates recorded earlier, keyed by item id.
    Replay(ReplayAdapter),
}

impl ModelAdapter {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self, ConfigError> {
        match cfg.kind {
            BackendKind::OpenaiCompatible => Ok(Self::OpenAiCompatible(HttpBackend::from_config(cfg)?)),
            BackendKind::Anthropic => Ok(Self::Anthropic(HttpBackend::from_config(cfg)?)),
            BackendKind::Replay => Ok(Self::Replay(ReplayAdapter::from_config(cfg)?)),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::OpenAiCompatible(b) | Self::Anthropic(b) => &b.id,
            Self::Replay(r) => r.id(),
        }
    }

    fn retry_policy(&self) -> &RetryPolicy {
        match self {
            Self::OpenAiCompatible(b) | Self::Anthropic(b) => &b.retry,
            Self::Replay(r) => r.retry_policy(),
        }
    }

    fn limiter(&self) -> &RateLimiter {
        match self {
            Self::OpenAiCompatible(b) | Self::Anthropic(b) => &b.limiter,
            Self::Replay(r) => r.limiter(),
        }
    }

    /// One backend call, no retries.
    async fn complete(&self, item_id: &str, prompt: &Prompt) -> Result<RawCompletion, GenerationError> {
        match self {
            Self::OpenAiCompatible(b) => openai::complete(b, prompt).await,
            Self::Anthropic(b) => anthropic::complete(b, prompt).await,
            Self::Replay(r) => r.complete(item_id),
        }
    }

    /// Turn a question and schema into a sanitized candidate.
    pub async fn generate(
        &self,
        item_id: &str,
        question: &str,
        schema: &str,
        dialect: Dialect,
    ) -> ModelCandidate {
        let started = Instant::now();
        let prompt = build_prompt(schema, question, dialect);
        let key = format!("{}/{}", self.id(), item_id);

        let prompt = &prompt;
        let retried = retry_with_policy(self.retry_policy(), &key, |_| async move {
            let _permit = self.limiter().acquire().await;
            self.complete(item_id, prompt).await
        })
        .await;
        let latency = started.elapsed();

        match retried.result {
            Ok(raw) => match extract_sql(&raw.text) {
                Some(sql) => ModelCandidate::succeeded(
                    item_id,
                    self.id(),
                    raw.text,
                    sql,
                    latency,
                    retried.attempts,
                    raw.tokens,
                ),
                None => {
                    let mut candidate = ModelCandidate::failed(
                        item_id,
                        self.id(),
                        GenerationError::EmptyOutput.to_string(),
                        latency,
                        retried.attempts,
                    );
                    candidate.raw_output = raw.text;
                    candidate.tokens = raw.tokens;
                    candidate
                }
            },
            Err(e) => {
                tracing::debug!(model = %self.id(), item = %item_id, error = %e, "Generation failed");
                ModelCandidate::failed(item_id, self.id(), e.to_string(), latency, retried.attempts)
            }
        }
    }
}

/// Send a prepared request and decode a JSON body, classifying failures.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, GenerationError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        return Err(GenerationError::from_status(status.as_u16(), &body, retry_after));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| GenerationError::ParseFailure(e.to_string()))
}
