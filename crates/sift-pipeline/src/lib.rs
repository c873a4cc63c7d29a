//! Durable embedding jobs: a SQLite-backed queue, a scheduler and a bounded worker pool
//! that embed pending chunks in batches with retry and backoff.

pub mod error;
pub mod job;
pub mod pipeline;
pub mod store;

pub use error::{PipelineError, Result};
pub use job::{EmbeddingJob, JobId, JobPriority, JobStatus, QueueStats};
pub use pipeline::{EmbeddingPipeline, PipelineConfig, is_settled};
pub use store::JobStore;
