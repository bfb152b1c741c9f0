use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    /// Base URL of the AI backend (embedding + generation service).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Administrative switch. When false, no backend call is ever made.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long a probe result is served without re-probing.
    #[serde(default = "default_cache_duration_ms")]
    pub cache_duration_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            enabled: true,
            cache_duration_ms: default_cache_duration_ms(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_true() -> bool {
    true
}
fn default_cache_duration_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Blend weight for normalized keyword scores in mixed mode.
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
    /// Blend weight for normalized semantic scores in mixed mode.
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    /// Result limit applied when a request does not specify one.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Number of chunk candidates fetched per channel before merging.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Minimum cosine similarity for vector hits, if set.
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: default_weight(),
            semantic_weight: default_weight(),
            default_limit: default_limit(),
            candidate_k: default_candidate_k(),
            similarity_threshold: None,
        }
    }
}

fn default_weight() -> f64 {
    0.5
}
fn default_limit() -> usize {
    50
}
fn default_candidate_k() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Number of mixed-search results retrieved as answer context.
    #[serde(default = "default_context_k")]
    pub context_k: usize,
    /// Hard cap on supplement rounds per request.
    #[serde(default = "default_max_supplement_rounds")]
    pub max_supplement_rounds: usize,
    /// Size of streamed content-delta fragments, in characters.
    #[serde(default = "default_delta_chunk_chars")]
    pub delta_chunk_chars: usize,
    /// Context truncation budget, in characters.
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_k: default_context_k(),
            max_supplement_rounds: default_max_supplement_rounds(),
            delta_chunk_chars: default_delta_chunk_chars(),
            max_context_length: default_max_context_length(),
        }
    }
}

fn default_context_k() -> usize {
    5
}
fn default_max_supplement_rounds() -> usize {
    3
}
fn default_delta_chunk_chars() -> usize {
    24
}
fn default_max_context_length() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct TagsConfig {
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            max_tags: default_max_tags(),
        }
    }
}

fn default_max_tags() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Config {
    /// Default configuration for commands that can run without a config
    /// file (tag suggestion, status checks against localhost).
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if !(0.0..=1.0).contains(&config.retrieval.keyword_weight)
        || !(0.0..=1.0).contains(&config.retrieval.semantic_weight)
    {
        anyhow::bail!("retrieval weights must be in [0.0, 1.0]");
    }

    if config.retrieval.keyword_weight + config.retrieval.semantic_weight <= 0.0 {
        anyhow::bail!("retrieval weights must not both be zero");
    }

    if let Some(t) = config.retrieval.similarity_threshold {
        if !(-1.0..=1.0).contains(&t) {
            anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }
    }

    if config.chat.max_supplement_rounds == 0 {
        anyhow::bail!("chat.max_supplement_rounds must be >= 1");
    }

    if config.chat.delta_chunk_chars == 0 {
        anyhow::bail!("chat.delta_chunk_chars must be >= 1");
    }

    if config.ai.base_url.trim().is_empty() {
        anyhow::bail!("ai.base_url must not be empty");
    }

    Ok(config)
}
