use std::num::TryFromIntError;

use sift_memory::RepositoryId;
use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("repository {repository_id} already has a pending or processing embedding job")]
    AlreadyQueued { repository_id: RepositoryId },

    #[error("embedding job {0} not found")]
    JobNotFound(JobId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("index error: {0}")]
    Index(#[from] sift_index::IndexError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] sift_memory::VectorStoreError),

    #[error("embedding error: {0}")]
    Llm(#[from] sift_llm::LlmError),

    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
