//! Embedding providers, the caching [`Embedder`], and vector utilities.
//!
//! - **[`EmbeddingProvider`]**: one network (or fake) call per batch. No retry.
//! - **[`Embedder`]**: cache lookup, batching, truncation, and retry around a provider.
//! - **[`EmbeddingCache`]**: persistent or in-memory vector cache keyed by text hash.
//!
//! # Provider Selection
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledProvider`] |
//! | `"openai"` | [`OpenAIProvider`] |
//!
//! # Retry Strategy
//!
//! The [`Embedder`] retries transient provider errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: base, 2×base, 4×base, … (capped at 2^5 × base)
//!
//! Exhausting the retry budget yields [`Error::RetriesExhausted`], which
//! propagates to the caller.

mod cache;

pub use cache::{cache_key, EmbeddingCache, MemoryEmbeddingCache, SqliteEmbeddingCache};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Approximate chars-per-token ratio used for truncation and cost estimates.
const CHARS_PER_TOKEN: usize = 4;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// A backend that turns a batch of texts into vectors.
///
/// Implementations make exactly one attempt per call and classify failures
/// as [`Error::TransientProvider`] (worth retrying) or [`Error::Provider`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::Provider("embedding provider is disabled".into()))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model and dimensions.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::validation("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::validation("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::validation("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            endpoint: OPENAI_EMBEDDINGS_URL.to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await?;
            return parse_openai_response(&json, texts.len());
        }

        let body_text = response.text().await.unwrap_or_default();
        let message = format!("OpenAI API error {}: {}", status, body_text);

        // Rate limited or server error: worth another attempt.
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Error::TransientProvider(message))
        } else {
            Err(Error::Provider(message))
        }
    }
}

/// Parse the OpenAI embeddings response, ordering vectors by `data[].index`.
fn parse_openai_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Provider("invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Provider("invalid OpenAI response: missing embedding".into()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    if indexed.len() != expected {
        return Err(Error::Provider(format!(
            "OpenAI returned {} embeddings for {} inputs",
            indexed.len(),
            expected
        )));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

/// Create the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => Err(Error::validation(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Embedder ============

/// Cache-first, retrying front end to an [`EmbeddingProvider`].
///
/// Cache failures are logged and treated as misses; they never fail a call.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn EmbeddingCache>,
    batch_size: usize,
    max_input_tokens: usize,
    max_retries: u32,
    retry_base: Duration,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self::from_config(provider, cache, &EmbeddingConfig::default())
    }

    pub fn from_config(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn EmbeddingCache>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: config.batch_size.max(1),
            max_input_tokens: config.max_input_tokens,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("empty embedding response".into()))
    }

    /// Embed `texts`, returning vectors in input order.
    ///
    /// Cached texts never reach the provider. The rest are truncated to the
    /// token budget and sent in batches of at most `batch_size`, one batch at
    /// a time.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = cache_key(text);
            match self.cache.get(&key).await {
                Ok(Some(vector)) => results[i] = Some(vector),
                Ok(None) => pending.push((i, key)),
                Err(e) => {
                    warn!(error = %e, "embedding cache lookup failed");
                    pending.push((i, key));
                }
            }
        }

        debug!(
            total = texts.len(),
            cached = texts.len() - pending.len(),
            "embedding batch"
        );

        for batch in pending.chunks(self.batch_size) {
            let inputs: Vec<String> = batch
                .iter()
                .map(|(i, _)| truncate_to_tokens(&texts[*i], self.max_input_tokens))
                .collect();

            let vectors = self.call_with_retry(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(Error::Provider(format!(
                    "provider returned {} embeddings for {} inputs",
                    vectors.len(),
                    inputs.len()
                )));
            }

            for ((i, key), vector) in batch.iter().zip(vectors) {
                if let Err(e) = self.cache.put(key, &vector).await {
                    warn!(error = %e, "embedding cache write failed");
                }
                results[*i] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|v| v.ok_or_else(|| Error::Provider("missing embedding".into())))
            .collect()
    }

    async fn call_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt: u32 = 0;
        loop {
            match self.provider.embed(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_base * (1u32 << attempt.min(5));
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt + 1,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Cut `text` to roughly `max_tokens` tokens using the chars-per-token heuristic.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Expected spend in dollars for embedding `texts`.
pub fn estimate_cost(texts: &[String], price_per_1k_tokens: f64) -> f64 {
    let chars: usize = texts.iter().map(|t| t.chars().count()).sum();
    let tokens = chars as f64 / CHARS_PER_TOKEN as f64;
    tokens / 1000.0 * price_per_1k_tokens
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
