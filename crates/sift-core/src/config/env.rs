use std::time::Duration;

use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIFT_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("SIFT_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_REQUESTS_PER_MINUTE")
            && let Ok(n) = v.parse::<u32>()
        {
            self.embedding.requests_per_minute = n;
        }
        if let Ok(v) = std::env::var("SIFT_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("SIFT_QDRANT_URL") {
            self.storage.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("SIFT_PIPELINE_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.pipeline.workers = n;
        }
        if let Ok(v) = std::env::var("SIFT_PIPELINE_BATCH_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.pipeline.batch_size = n;
        }
        if let Ok(v) = std::env::var("SIFT_PIPELINE_MAX_ATTEMPTS")
            && let Ok(n) = v.parse::<u32>()
        {
            self.pipeline.max_attempts = n;
        }
        if let Ok(v) = std::env::var("SIFT_PIPELINE_POLL_INTERVAL_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            self.pipeline.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("SIFT_SEARCH_VECTOR_WEIGHT") {
            if let Ok(w) = v.parse::<f32>() {
                self.search.vector_weight = w;
            } else {
                tracing::warn!("ignoring invalid SIFT_SEARCH_VECTOR_WEIGHT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("SIFT_RAG_CONTEXT_CHUNKS")
            && let Ok(n) = v.parse::<u32>()
        {
            self.rag.context_chunks = n;
        }
        if let Ok(v) = std::env::var("SIFT_RAG_HISTORY_LIMIT")
            && let Ok(n) = v.parse::<usize>()
        {
            self.rag.history_limit = n;
        }
        if let Ok(v) = std::env::var("SIFT_RAG_REQUEST_TIMEOUT")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.rag.request_timeout_secs = secs;
        }
    }
}
