//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "data/memex.sqlite"
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//! min_chunk_size = 100
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-large"
//! dims = 3072
//!
//! [sync.sources.gmail]
//! accounts = ["personal", "work"]
//! max_items = 10000
//! ```
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! documented on each field.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// A configuration with every default applied and the database at `path`.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Sizes are measured in characters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

impl ChunkSizes {
    pub const TEXT: ChunkSizes = ChunkSizes {
        chunk_size: 1000,
        chunk_overlap: 200,
        min_chunk_size: 100,
    };

    pub const EMAIL: ChunkSizes = ChunkSizes {
        chunk_size: 800,
        chunk_overlap: 150,
        min_chunk_size: 10,
    };
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_email_sizes")]
    pub email: ChunkSizes,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSizes::TEXT.chunk_size,
            chunk_overlap: ChunkSizes::TEXT.chunk_overlap,
            min_chunk_size: ChunkSizes::TEXT.min_chunk_size,
            email: ChunkSizes::EMAIL,
        }
    }
}

impl ChunkingConfig {
    pub fn text_sizes(&self) -> ChunkSizes {
        ChunkSizes {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            min_chunk_size: self.min_chunk_size,
        }
    }
}

fn default_chunk_size() -> usize {
    ChunkSizes::TEXT.chunk_size
}
fn default_chunk_overlap() -> usize {
    ChunkSizes::TEXT.chunk_overlap
}
fn default_min_chunk_size() -> usize {
    ChunkSizes::TEXT.min_chunk_size
}
fn default_email_sizes() -> ChunkSizes {
    ChunkSizes::EMAIL
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    #[serde(default = "default_price_per_1k_tokens")]
    pub price_per_1k_tokens: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_timeout_secs(),
            max_input_tokens: default_max_input_tokens(),
            price_per_1k_tokens: default_price_per_1k_tokens(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_tokens() -> usize {
    8000
}
fn default_price_per_1k_tokens() -> f64 {
    0.00013
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Each search branch fetches `top_k * candidate_multiplier` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Content items whose chunks are embedded together (one embedding call
    /// per batch, split further by `embedding.batch_size`) during `index_all`.
    #[serde(default = "default_semantic_batch_size")]
    pub semantic_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            semantic_batch_size: default_semantic_batch_size(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_candidate_multiplier() -> usize {
    2
}
fn default_semantic_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            max_items: default_max_items(),
        }
    }
}

fn default_page_size() -> usize {
    100
}
fn default_max_items() -> usize {
    10_000
}

impl SyncConfig {
    /// Register a source with its known accounts.
    pub fn with_source(mut self, name: &str, accounts: &[&str], max_items: usize) -> Self {
        self.sources.insert(
            name.to_string(),
            SourceConfig {
                accounts: accounts.iter().map(|a| a.to_string()).collect(),
                max_items,
            },
        );
        self
    }

    /// Pre-flight check that `(source, account)` is configured.
    ///
    /// Returns the source's settings, or [`Error::Validation`] for an unknown
    /// source or an account not listed under it.
    pub fn validate_target(&self, source: &str, account: &str) -> crate::Result<&SourceConfig> {
        let cfg = self
            .sources
            .get(source)
            .ok_or_else(|| Error::validation(format!("Unknown source: {}", source)))?;
        if !cfg.accounts.iter().any(|a| a == account) {
            return Err(Error::validation(format!(
                "Unknown account '{}' for source '{}'",
                account, source
            )));
        }
        Ok(cfg)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    for (label, sizes) in [
        ("chunking", config.chunking.text_sizes()),
        ("chunking.email", config.chunking.email),
    ] {
        if sizes.chunk_size == 0 {
            anyhow::bail!("{}.chunk_size must be > 0", label);
        }
        if sizes.chunk_overlap >= sizes.chunk_size {
            anyhow::bail!("{}.chunk_overlap must be < chunk_size", label);
        }
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 || config.retrieval.semantic_batch_size == 0 {
        anyhow::bail!("retrieval.candidate_multiplier and semantic_batch_size must be >= 1");
    }

    if config.sync.page_size == 0 {
        anyhow::bail!("sync.page_size must be > 0");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    for (name, source) in &config.sync.sources {
        if source.accounts.is_empty() {
            anyhow::bail!("sync.sources.{}.accounts must list at least one account", name);
        }
        if source.max_items == 0 {
            anyhow::bail!("sync.sources.{}.max_items must be > 0", name);
        }
    }

    Ok(())
}
