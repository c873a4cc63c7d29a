//! Ingestion: source files → chunks in the store, with stale vector cleanup.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use sift_memory::{RepositoryId, VectorStore};

use crate::chunker::{ChunkerConfig, SourceFile, chunk_file};
use crate::error::Result;
use crate::languages::{Lang, detect_language};
use crate::store::ChunkStore;

/// Summary of an ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub chunks_created: usize,
    pub chunks_unchanged: usize,
    pub chunks_removed: usize,
    /// `(file path, error)` for files that could not be stored.
    pub errors: Vec<(String, String)>,
    pub duration_ms: u64,
}

/// Writes chunked files into the [`ChunkStore`] and drops vectors of replaced chunks.
pub struct Ingestor {
    store: ChunkStore,
    vectors: Arc<dyn VectorStore>,
    collection: String,
    config: ChunkerConfig,
}

impl Ingestor {
    #[must_use]
    pub fn new(
        store: ChunkStore,
        vectors: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        config: ChunkerConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            collection: collection.into(),
            config,
        }
    }

    /// Chunk and store `files` for one repository.
    ///
    /// With `full` set, the files given are taken as the complete repository and chunks of
    /// any other stored file are removed.
    ///
    /// # Errors
    ///
    /// Returns an error only if listing stored files fails during a full ingest; per-file
    /// failures are collected in the report.
    pub async fn ingest_files(
        &self,
        repository_id: RepositoryId,
        files: impl IntoIterator<Item = SourceFile>,
        full: bool,
    ) -> Result<IngestReport> {
        let start = Instant::now();
        let mut report = IngestReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stale_refs: Vec<String> = Vec::new();

        for file in files {
            report.files_scanned += 1;
            seen.insert(file.path.clone());

            let chunks = match chunk_file(&file, &self.config) {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::debug!(file = %file.path, "skipping file: {e}");
                    Vec::new()
                }
            };
            if chunks.is_empty() {
                report.files_skipped += 1;
            }

            match self
                .store
                .replace_file_chunks(repository_id, &file.path, &chunks)
                .await
            {
                Ok(outcome) => {
                    if !chunks.is_empty() {
                        report.files_indexed += 1;
                    }
                    report.chunks_created += outcome.created;
                    report.chunks_unchanged += outcome.unchanged;
                    report.chunks_removed += outcome.removed;
                    stale_refs.extend(outcome.stale_vector_refs);
                }
                Err(e) => {
                    tracing::warn!(file = %file.path, "failed to store chunks: {e:#}");
                    report.errors.push((file.path.clone(), e.to_string()));
                }
            }
        }

        if full {
            for path in self.store.file_paths(repository_id).await? {
                if seen.contains(&path) {
                    continue;
                }
                match self.store.remove_file(repository_id, &path).await {
                    Ok(outcome) => {
                        tracing::debug!(file = %path, removed = outcome.removed, "removed vanished file");
                        report.chunks_removed += outcome.removed;
                        stale_refs.extend(outcome.stale_vector_refs);
                    }
                    Err(e) => report.errors.push((path, e.to_string())),
                }
            }
        }

        self.drop_vectors(stale_refs).await;

        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            repository_id = %repository_id,
            files = report.files_scanned,
            indexed = report.files_indexed,
            skipped = report.files_skipped,
            created = report.chunks_created,
            removed = report.chunks_removed,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "ingestion complete"
        );
        Ok(report)
    }

    /// Best-effort removal of vector points whose chunks are gone.
    async fn drop_vectors(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        match self.vectors.collection_exists(&self.collection).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("vector store unavailable, {} stale vectors left: {e:#}", ids.len());
                return;
            }
        }
        let count = ids.len();
        if let Err(e) = self.vectors.delete_by_ids(&self.collection, ids).await {
            tracing::warn!(count, "failed to delete stale vectors: {e:#}");
        } else {
            tracing::debug!(count, "deleted stale vectors");
        }
    }
}

/// Walk `root` honouring `.gitignore`, returning readable source files of a known
/// language no larger than `max_bytes`. Paths are relative to `root` with `/`
/// separators, sorted.
#[must_use]
pub fn collect_files(root: &Path, max_bytes: u64) -> Vec<SourceFile> {
    let mut files: Vec<SourceFile> = ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("walk error: {e}");
                None
            }
        })
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|entry| {
            let path = entry.path();
            let lang = detect_language(path);
            if lang == Lang::Unknown {
                return None;
            }
            let size = entry.metadata().ok()?.len();
            if size > max_bytes {
                tracing::debug!(file = %path.display(), size, "file exceeds size cap");
                return None;
            }
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::debug!(file = %path.display(), "unreadable file: {e}");
                    return None;
                }
            };
            let rel = path.strip_prefix(root).unwrap_or(path);
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some(SourceFile {
                path: rel,
                content,
                language: Some(lang.id().to_owned()),
                size,
            })
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}
