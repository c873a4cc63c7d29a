//! Completion and embedding provider abstraction with OpenAI-compatible backends.

pub mod embed;
pub mod error;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod openai;
pub mod provider;
pub mod rate_limit;
pub mod retry;
mod sse;

pub use embed::{CachedEmbedder, EmbeddingProvider};
pub use error::LlmError;
pub use provider::LlmProvider;
