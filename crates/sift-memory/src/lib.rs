//! SQLite persistence, vector stores and conversation storage.

pub mod conversation;
pub mod error;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod sqlite;
pub mod types;
pub mod vector_store;

pub use conversation::{Conversation, ContextRef, ConversationMessage, ConversationStore};
pub use error::MemoryError;
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::QdrantOps;
pub use sqlite::{ConversationSummary, SqliteConversationStore, open_pool, run_migrations};
pub use types::{ConversationId, RepositoryId};
pub use vector_store::{
    ChunkPayload, PointFilter, ScoredVectorPoint, VectorPoint, VectorStore, VectorStoreError,
};
