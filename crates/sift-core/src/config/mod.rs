mod env;
mod types;


pub use types::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

/// Config file used when neither `--config` nor `SIFT_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

impl Config {
    /// Load configuration from a TOML file with env var overrides, then validate it.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if the
    /// resulting values are invalid.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        let window = &self.chunker.window;
        if window.window_lines == 0 {
            bail!("chunker.window_lines must be at least 1");
        }
        if window.window_lines < window.min_chunk_lines {
            bail!(
                "chunker.window_lines ({}) must be at least chunker.min_chunk_lines ({})",
                window.window_lines,
                window.min_chunk_lines
            );
        }
        if window.overlap_lines >= window.window_lines {
            bail!(
                "chunker.overlap_lines ({}) must be smaller than chunker.window_lines ({})",
                window.overlap_lines,
                window.window_lines
            );
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }
        if self.pipeline.max_attempts == 0 {
            bail!("pipeline.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pipeline.min_batch_store_ratio) {
            bail!("pipeline.min_batch_store_ratio must be within [0, 1]");
        }
        if self.pipeline.collection.trim().is_empty() {
            bail!("pipeline.collection must not be empty");
        }
        for (name, weight) in [
            ("search.vector_weight", self.search.vector_weight),
            ("rag.vector_weight", self.rag.vector_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                bail!("{name} must be within [0, 1], got {weight}");
            }
        }
        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            bail!(
                "search.default_limit must be within [1, {}]",
                self.search.max_limit
            );
        }
        if self.rag.context_chunks == 0 {
            bail!("rag.context_chunks must be at least 1");
        }
        if self.rag.request_timeout_secs == 0 {
            bail!("rag.request_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Embedding endpoint, defaulting to the chat endpoint.
    #[must_use]
    pub fn embedding_base_url(&self) -> &str {
        self.embedding
            .base_url
            .as_deref()
            .unwrap_or(&self.llm.base_url)
    }

    /// Embedding API key, defaulting to the chat API key.
    #[must_use]
    pub fn embedding_api_key(&self) -> Option<&str> {
        self.embedding
            .api_key
            .as_deref()
            .or(self.llm.api_key.as_deref())
    }
}

/// Resolve the config file path: explicit argument, then `SIFT_CONFIG`, then the default.
#[must_use]
pub fn resolve_config_path(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_owned();
    }
    if let Ok(path) = std::env::var("SIFT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
