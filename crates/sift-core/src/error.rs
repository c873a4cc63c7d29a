use std::time::Duration;

use sift_memory::ConversationId;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    #[error("message is empty")]
    EmptyMessage,

    #[error("answer timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("LLM error: {0}")]
    Llm(#[from] sift_llm::LlmError),

    #[error("memory error: {0}")]
    Memory(#[from] sift_memory::MemoryError),

    #[error("search error: {0}")]
    Search(#[from] sift_index::IndexError),
}

pub type Result<T> = std::result::Result<T, RagError>;
