//! Error types for sift-index.

use std::num::TryFromIntError;

/// Rejections from the chunker. Callers treat these as "skip this file".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("file content is empty")]
    EmptyContent,

    #[error("file too short to chunk ({lines} lines)")]
    TooShort { lines: usize },
}

/// Errors that can occur during indexing and search.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` database error.
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] sift_memory::VectorStoreError),

    /// Embedding provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] sift_llm::LlmError),

    /// The FTS5 table has not been built yet.
    #[error("text index missing")]
    TextIndexMissing,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid fusion weights: {0}")]
    InvalidWeights(String),

    /// Integer conversion error.
    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
