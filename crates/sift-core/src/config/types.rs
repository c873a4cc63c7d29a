use serde::{Deserialize, Serialize};
use sift_index::ChunkerConfig;
use sift_pipeline::PipelineConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunker: ChunkerSection,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub rag: RagConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_max_retries() -> u32 {
    3
}

/// Chat completion backend (any OpenAI-compatible endpoint).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            max_retries: default_max_retries(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_requests_per_minute() -> u32 {
    3000
}

fn default_cache_entries() -> usize {
    10_000
}

/// Embedding backend. Unset `base_url` and `api_key` fall back to the `[llm]` values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Query embedding cache size; 0 disables the cache.
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_embedding_model(),
            api_key: None,
            requests_per_minute: default_requests_per_minute(),
            cache_entries: default_cache_entries(),
        }
    }
}

fn default_sqlite_path() -> String {
    "./data/sift.db".into()
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            qdrant_url: default_qdrant_url(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

/// Window sizes plus the ingestion file size cap.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChunkerSection {
    #[serde(flatten)]
    pub window: ChunkerConfig,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for ChunkerSection {
    fn default() -> Self {
        Self {
            window: ChunkerConfig::default(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_vector_weight() -> f32 {
    sift_index::DEFAULT_VECTOR_WEIGHT
}

fn default_search_limit() -> u32 {
    10
}

fn default_max_limit() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_search_limit")]
    pub default_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            default_limit: default_search_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_context_chunks() -> u32 {
    8
}

fn default_history_limit() -> usize {
    20
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RagConfig {
    #[serde(default = "default_context_chunks")]
    pub context_chunks: u32,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Replaces the built-in system instruction when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            context_chunks: default_context_chunks(),
            vector_weight: default_vector_weight(),
            history_limit: default_history_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: None,
        }
    }
}
