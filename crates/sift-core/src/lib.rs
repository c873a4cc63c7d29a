//! Configuration, prompt assembly and the retrieval-augmented answer orchestrator.

pub mod config;
pub mod error;
pub mod prompt;
pub mod rag;

pub use config::Config;
pub use error::{RagError, Result};
pub use rag::{RagAnswer, RagEvent, RagOrchestrator};
