//! Vector index seam: chunk embeddings stored under the chunk id with a typed payload.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::types::RepositoryId;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    /// The backing service rejected or failed an operation.
    #[error("vector backend failed to {op}: {message}")]
    Backend { op: &'static str, message: String },

    #[error("collection {0} does not exist")]
    MissingCollection(String),

    #[error("collection {collection} holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid point payload: {0}")]
    Payload(String),
}

impl VectorStoreError {
    pub(crate) fn backend(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            op,
            message: err.to_string(),
        }
    }
}

/// Payload stored next to every chunk vector. Field names double as the payload keys
/// filters match on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkPayload {
    pub repository_id: Option<RepositoryId>,
    pub file_path: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub function_names: Vec<String>,
    pub class_names: Vec<String>,
    pub content_hash: String,
}

impl ChunkPayload {
    pub const REPOSITORY_ID: &'static str = "repository_id";
    pub const FILE_PATH: &'static str = "file_path";
    pub const LANGUAGE: &'static str = "language";

    #[must_use]
    pub fn for_repository(repository_id: RepositoryId) -> Self {
        Self {
            repository_id: Some(repository_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    /// Chunk id; doubles as the point id.
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// Restricts a search to points whose payload matches every set field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointFilter {
    pub repository_id: Option<RepositoryId>,
    pub language: Option<String>,
    pub file_path: Option<String>,
}

impl PointFilter {
    #[must_use]
    pub fn repository(repository_id: RepositoryId) -> Self {
        Self {
            repository_id: Some(repository_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.repository_id.is_none() && self.language.is_none() && self.file_path.is_none()
    }

    #[must_use]
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        self.repository_id
            .is_none_or(|id| payload.repository_id == Some(id))
            && self
                .language
                .as_deref()
                .is_none_or(|lang| payload.language == lang)
            && self
                .file_path
                .as_deref()
                .is_none_or(|path| payload.file_path == path)
    }
}

#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    /// Cosine similarity, higher is closer.
    pub score: f32,
    pub payload: ChunkPayload,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Vector index capability: cosine similarity over named collections of chunk vectors.
pub trait VectorStore: Send + Sync {
    /// Create `collection` with the given dimension if it does not exist yet.
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Nearest neighbours of `vector`, best first.
    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<PointFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(repo: i64, lang: &str, path: &str) -> ChunkPayload {
        ChunkPayload {
            repository_id: Some(RepositoryId(repo)),
            file_path: path.into(),
            language: lang.into(),
            ..ChunkPayload::default()
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = PointFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&payload(1, "go", "a.go")));
        assert!(filter.matches(&ChunkPayload::default()));
    }

    #[test]
    fn filter_requires_every_field() {
        let filter = PointFilter::repository(RepositoryId(1)).language("go");
        assert!(filter.matches(&payload(1, "go", "a.go")));
        assert!(!filter.matches(&payload(2, "go", "a.go")));
        assert!(!filter.matches(&payload(1, "rust", "a.rs")));
        assert!(!filter.matches(&ChunkPayload::default()));

        let by_file = PointFilter::default().file_path("cmd/main.go");
        assert!(by_file.matches(&payload(9, "go", "cmd/main.go")));
        assert!(!by_file.matches(&payload(9, "go", "cmd/other.go")));
    }

    #[test]
    fn payload_keys_match_serialized_fields() {
        let value = serde_json::to_value(payload(4, "go", "x.go")).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        for key in [
            ChunkPayload::REPOSITORY_ID,
            ChunkPayload::FILE_PATH,
            ChunkPayload::LANGUAGE,
        ] {
            assert!(obj.contains_key(key), "{key}");
        }
        assert_eq!(obj[ChunkPayload::REPOSITORY_ID], serde_json::json!(4));
    }

    #[test]
    fn partial_payload_deserializes() {
        let p: ChunkPayload =
            serde_json::from_value(serde_json::json!({ "language": "go" })).unwrap();
        assert_eq!(p.language, "go");
        assert_eq!(p.repository_id, None);
    }
}
