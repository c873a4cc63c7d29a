//! `SQLite` chunk table and its FTS5 text index.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sift_memory::RepositoryId;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::chunker::{ChunkMetadata, CodeChunk};
use crate::error::{IndexError, Result};
use crate::languages::Lang;

const CHUNK_COLUMNS: &str = "id, repository_id, file_path, file_name, language, start_line, \
     end_line, content, content_hash, metadata, vector_ref";

/// Index build statements, run in order inside one transaction.
const TEXT_INDEX_DDL: &[&str] = &[
    "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(\
        content, function_names, class_names, file_path, file_name, imports, \
        chunk_id UNINDEXED)",
    "DROP TRIGGER IF EXISTS chunks_fts_ai",
    "DROP TRIGGER IF EXISTS chunks_fts_ad",
    "DROP TRIGGER IF EXISTS chunks_fts_au",
    "CREATE TRIGGER chunks_fts_ai AFTER INSERT ON chunks BEGIN \
        INSERT INTO chunks_fts (content, function_names, class_names, file_path, file_name, imports, chunk_id) \
        VALUES (new.content, new.function_names, new.class_names, new.file_path, new.file_name, new.imports, new.id); \
     END",
    "CREATE TRIGGER chunks_fts_ad AFTER DELETE ON chunks BEGIN \
        DELETE FROM chunks_fts WHERE chunk_id = old.id; \
     END",
    "CREATE TRIGGER chunks_fts_au AFTER UPDATE OF content, function_names, class_names, file_path, file_name, imports ON chunks BEGIN \
        DELETE FROM chunks_fts WHERE chunk_id = old.id; \
        INSERT INTO chunks_fts (content, function_names, class_names, file_path, file_name, imports, chunk_id) \
        VALUES (new.content, new.function_names, new.class_names, new.file_path, new.file_name, new.imports, new.id); \
     END",
    "DELETE FROM chunks_fts",
    "INSERT INTO chunks_fts (content, function_names, class_names, file_path, file_name, imports, chunk_id) \
     SELECT content, function_names, class_names, file_path, file_name, imports, id FROM chunks",
];

/// A stored chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub repository_id: RepositoryId,
    pub file_path: String,
    pub file_name: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub content_hash: String,
    pub metadata: ChunkMetadata,
    /// Vector point id, set once the chunk has been embedded.
    pub vector_ref: Option<String>,
}

impl Chunk {
    /// Build the stored form of a freshly chunked window.
    #[must_use]
    pub fn from_code(repository_id: RepositoryId, code: &CodeChunk) -> Self {
        Self {
            id: chunk_id(
                repository_id,
                &code.file_path,
                code.start_line,
                &code.content_hash,
            ),
            repository_id,
            file_name: file_name(&code.file_path).to_owned(),
            file_path: code.file_path.clone(),
            language: code.language.id().to_owned(),
            start_line: code.start_line,
            end_line: code.end_line,
            content: code.content.clone(),
            content_hash: code.content_hash.clone(),
            metadata: code.metadata.clone(),
            vector_ref: None,
        }
    }
}

/// Deterministic chunk id: UUIDv5 over repository, path, start line and content hash.
#[must_use]
pub fn chunk_id(
    repository_id: RepositoryId,
    file_path: &str,
    start_line: u32,
    content_hash: &str,
) -> String {
    let key = format!("{repository_id}:{file_path}:{start_line}:{content_hash}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: String,
    repository_id: RepositoryId,
    file_path: String,
    file_name: String,
    language: String,
    start_line: i64,
    end_line: i64,
    content: String,
    content_hash: String,
    metadata: String,
    vector_ref: Option<String>,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = IndexError;

    fn try_from(row: ChunkRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            repository_id: row.repository_id,
            file_path: row.file_path,
            file_name: row.file_name,
            language: row.language,
            start_line: u32::try_from(row.start_line)?,
            end_line: u32::try_from(row.end_line)?,
            content: row.content,
            content_hash: row.content_hash,
            metadata: serde_json::from_str(&row.metadata)?,
            vector_ref: row.vector_ref,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScoredChunkRow {
    #[sqlx(flatten)]
    chunk: ChunkRow,
    score: f64,
}

fn rows_to_chunks(rows: Vec<ChunkRow>) -> Result<Vec<Chunk>> {
    rows.into_iter().map(Chunk::try_from).collect()
}

/// What a file replacement changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub created: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Vector point ids of removed chunks that had been embedded.
    pub stale_vector_refs: Vec<String>,
}

/// Free-text query against the chunk text index.
#[derive(Debug, Clone)]
pub struct LexicalQuery {
    pub text: String,
    pub repository_id: Option<RepositoryId>,
    /// Free-form language name, normalized before filtering.
    pub language: Option<String>,
    /// File extension suffix, with or without the leading dot.
    pub extension: Option<String>,
    pub limit: u32,
}

impl LexicalQuery {
    #[must_use]
    pub fn new(text: impl Into<String>, limit: u32) -> Self {
        Self {
            text: text.into(),
            repository_id: None,
            language: None,
            extension: None,
            limit,
        }
    }

    #[must_use]
    pub fn repository(mut self, repository_id: RepositoryId) -> Self {
        self.repository_id = Some(repository_id);
        self
    }

    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

/// A text index hit with its raw (negated BM25) score; larger is better.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk: Chunk,
    pub score: f64,
}

/// Turn free text into an FTS5 expression: quoted terms joined with `OR`.
///
/// Returns `None` when the text has no alphanumeric terms.
#[must_use]
pub fn fts_query(text: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn normalize_language(language: &str) -> String {
    match Lang::from_name(language) {
        Lang::Unknown => language.trim().to_ascii_lowercase(),
        lang => lang.id().to_owned(),
    }
}

fn normalize_extension(extension: &str) -> String {
    let ext = extension.trim();
    if ext.starts_with('.') {
        ext.to_owned()
    } else {
        format!(".{ext}")
    }
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("no such table"))
}

/// Chunk persistence over a shared `SQLite` pool.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
}

impl ChunkStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Make the stored chunks of one file match `chunks`, in one transaction.
    ///
    /// Chunks whose deterministic id is unchanged are left alone and keep their vector
    /// reference. Chunks that no longer exist are deleted and their vector references
    /// returned so the caller can drop the points.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails or metadata cannot be serialized.
    pub async fn replace_file_chunks(
        &self,
        repository_id: RepositoryId,
        file_path: &str,
        chunks: &[CodeChunk],
    ) -> Result<ReplaceOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT id, vector_ref FROM chunks WHERE repository_id = ? AND file_path = ?",
        )
        .bind(repository_id)
        .bind(file_path)
        .fetch_all(&mut *tx)
        .await?;
        let existing: HashMap<String, Option<String>> = existing.into_iter().collect();

        let incoming: Vec<Chunk> = chunks
            .iter()
            .map(|c| Chunk::from_code(repository_id, c))
            .collect();
        let incoming_ids: HashSet<&str> = incoming.iter().map(|c| c.id.as_str()).collect();

        let mut outcome = ReplaceOutcome::default();

        for (id, vector_ref) in &existing {
            if incoming_ids.contains(id.as_str()) {
                continue;
            }
            sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            outcome.removed += 1;
            if let Some(r) = vector_ref {
                outcome.stale_vector_refs.push(r.clone());
            }
        }

        let now = Utc::now();
        for chunk in &incoming {
            if existing.contains_key(&chunk.id) {
                outcome.unchanged += 1;
                continue;
            }
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO chunks (id, repository_id, file_path, file_name, language, \
                 start_line, end_line, content, content_hash, metadata, function_names, \
                 class_names, imports, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(repository_id)
            .bind(&chunk.file_path)
            .bind(&chunk.file_name)
            .bind(&chunk.language)
            .bind(i64::from(chunk.start_line))
            .bind(i64::from(chunk.end_line))
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(chunk.metadata.functions.join(" "))
            .bind(chunk.metadata.classes.join(" "))
            .bind(chunk.metadata.imports.join(" "))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() > 0 {
                outcome.created += 1;
            } else {
                outcome.unchanged += 1;
            }
        }

        tx.commit().await?;
        tracing::debug!(
            repository_id = %repository_id,
            file = file_path,
            created = outcome.created,
            unchanged = outcome.unchanged,
            removed = outcome.removed,
            "replaced file chunks"
        );
        Ok(outcome)
    }

    /// Delete every chunk of one file.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn remove_file(
        &self,
        repository_id: RepositoryId,
        file_path: &str,
    ) -> Result<ReplaceOutcome> {
        self.replace_file_chunks(repository_id, file_path, &[]).await
    }

    /// Distinct file paths with stored chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn file_paths(&self, repository_id: RepositoryId) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar(
            "SELECT DISTINCT file_path FROM chunks WHERE repository_id = ? ORDER BY file_path",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        let row: Option<ChunkRow> =
            sqlx::query_as(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Chunk::try_from).transpose()
    }

    /// Chunks for the given ids, keyed by id. Unknown ids are absent from the map.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn chunks_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Chunk>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows: Vec<ChunkRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| Chunk::try_from(row).map(|c| (c.id.clone(), c)))
            .collect()
    }

    /// Chunks without a vector reference, in file and line order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn chunks_needing_embedding(&self, repository_id: RepositoryId) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE repository_id = ? AND vector_ref IS NULL \
             ORDER BY file_path, start_line"
        ))
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_chunks(rows)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_chunks(&self, repository_id: RepositoryId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE repository_id = ?")
            .bind(repository_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count)?)
    }

    /// Record vector references chunk by chunk. Returns how many were stored; failures
    /// are logged and leave the chunk unembedded.
    pub async fn set_vector_refs(&self, refs: &[(String, String)]) -> usize {
        let mut stored = 0;
        for (chunk_id, vector_ref) in refs {
            match sqlx::query("UPDATE chunks SET vector_ref = ? WHERE id = ?")
                .bind(vector_ref)
                .bind(chunk_id)
                .execute(&self.pool)
                .await
            {
                Ok(result) if result.rows_affected() > 0 => stored += 1,
                Ok(_) => tracing::warn!(chunk_id = %chunk_id, "chunk vanished before its vector ref was stored"),
                Err(e) => tracing::warn!(chunk_id = %chunk_id, "failed to store vector ref: {e:#}"),
            }
        }
        stored
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn vector_refs_for_repository(
        &self,
        repository_id: RepositoryId,
    ) -> Result<Vec<String>> {
        let refs = sqlx::query_scalar(
            "SELECT vector_ref FROM chunks WHERE repository_id = ? AND vector_ref IS NOT NULL",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(refs)
    }

    /// Forget all vector references of a repository so it can be embedded again.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn clear_vector_refs(&self, repository_id: RepositoryId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE chunks SET vector_ref = NULL WHERE repository_id = ? AND vector_ref IS NOT NULL",
        )
        .bind(repository_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Create or rebuild the FTS5 index and the triggers that keep it in sync.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` lacks FTS5 or a statement fails.
    pub async fn build_text_index(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in TEXT_INDEX_DDL {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!("built chunk text index");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn text_index_exists(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chunks_fts'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Weighted BM25 search over body, function names, class names, path, file name
    /// and imports.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidQuery`] if the text has no searchable terms,
    /// [`IndexError::TextIndexMissing`] if the index was never built, or a database
    /// error.
    pub async fn text_search(&self, query: &LexicalQuery) -> Result<Vec<LexicalHit>> {
        let expression = fts_query(&query.text)
            .ok_or_else(|| IndexError::InvalidQuery(format!("no searchable terms in {:?}", query.text)))?;
        let language = query.language.as_deref().map(normalize_language);
        let extension = query.extension.as_deref().map(normalize_extension);

        let sql = format!(
            "SELECT {columns}, f.score AS score \
             FROM (SELECT chunk_id, -bm25(chunks_fts, 10.0, 8.0, 8.0, 5.0, 5.0, 2.0, 0.0) AS score \
                   FROM chunks_fts WHERE chunks_fts MATCH ?) f \
             JOIN chunks c ON c.id = f.chunk_id \
             WHERE (? IS NULL OR c.repository_id = ?) \
             AND (? IS NULL OR c.language = ?) \
             AND (? IS NULL OR c.file_path LIKE '%' || ?) \
             ORDER BY f.score DESC, c.file_path, c.start_line \
             LIMIT ?",
            columns = CHUNK_COLUMNS
                .split(", ")
                .map(|col| format!("c.{col} AS {col}"))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let rows: Vec<ScoredChunkRow> = sqlx::query_as(&sql)
            .bind(&expression)
            .bind(query.repository_id)
            .bind(query.repository_id)
            .bind(language.as_deref())
            .bind(language.as_deref())
            .bind(extension.as_deref())
            .bind(extension.as_deref())
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                if is_missing_table(&e) {
                    IndexError::TextIndexMissing
                } else {
                    IndexError::Sqlite(e)
                }
            })?;

        rows.into_iter()
            .map(|row| {
                Ok(LexicalHit {
                    score: row.score,
                    chunk: Chunk::try_from(row.chunk)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkerConfig, SourceFile, chunk_file};

    async fn store() -> ChunkStore {
        let pool = sift_memory::open_pool(":memory:").await.unwrap();
        ChunkStore::new(pool)
    }

    fn go_source(lines: usize, marker: &str) -> String {
        let mut out = vec!["package main".to_owned(), String::new()];
        out.push(format!("func {marker}() {{"));
        while out.len() < lines {
            out.push(format!("\t_ = {}", out.len()));
        }
        out.join("\n")
    }

    fn chunks_of(path: &str, content: String) -> Vec<CodeChunk> {
        chunk_file(&SourceFile::new(path, content), &ChunkerConfig::default()).unwrap()
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let a = chunk_id(RepositoryId(1), "a.go", 1, "h");
        assert_eq!(a, chunk_id(RepositoryId(1), "a.go", 1, "h"));
        assert_ne!(a, chunk_id(RepositoryId(2), "a.go", 1, "h"));
        assert_ne!(a, chunk_id(RepositoryId(1), "a.go", 101, "h"));
    }

    #[test]
    fn fts_query_quotes_and_dedups_terms() {
        assert_eq!(
            fts_query("HandleRequest, handle_request handlerequest").as_deref(),
            Some("\"HandleRequest\" OR \"handle_request\"")
        );
        assert_eq!(fts_query("  ?? -- "), None);
    }

    #[test]
    fn filters_are_normalized() {
        assert_eq!(normalize_language("golang"), "go");
        assert_eq!(normalize_language("Elixir"), "elixir");
        assert_eq!(normalize_extension("go"), ".go");
        assert_eq!(normalize_extension(".rs"), ".rs");
    }

    #[tokio::test]
    async fn replace_is_idempotent_and_keeps_vector_refs() {
        let store = store().await;
        let repo = RepositoryId(1);
        let chunks = chunks_of("main.go", go_source(200, "Serve"));

        let first = store.replace_file_chunks(repo, "main.go", &chunks).await.unwrap();
        assert_eq!(first.created, 2);

        let ids: Vec<String> = chunks
            .iter()
            .map(|c| Chunk::from_code(repo, c).id)
            .collect();
        let stored = store
            .set_vector_refs(&[(ids[0].clone(), ids[0].clone())])
            .await;
        assert_eq!(stored, 1);

        let second = store.replace_file_chunks(repo, "main.go", &chunks).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.removed, 0);
        let chunk = store.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(chunk.vector_ref.as_deref(), Some(ids[0].as_str()));
        assert_eq!(store.chunks_needing_embedding(repo).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_content_replaces_stale_chunks() {
        let store = store().await;
        let repo = RepositoryId(1);
        let old = chunks_of("main.go", go_source(60, "Old"));
        store.replace_file_chunks(repo, "main.go", &old).await.unwrap();
        let old_id = Chunk::from_code(repo, &old[0]).id;
        store.set_vector_refs(&[(old_id.clone(), "v-old".into())]).await;

        let new = chunks_of("main.go", go_source(60, "New"));
        let outcome = store.replace_file_chunks(repo, "main.go", &new).await.unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.stale_vector_refs, vec!["v-old".to_owned()]);
        assert!(store.get(&old_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_file_and_file_paths() {
        let store = store().await;
        let repo = RepositoryId(3);
        store
            .replace_file_chunks(repo, "a.go", &chunks_of("a.go", go_source(20, "A")))
            .await
            .unwrap();
        store
            .replace_file_chunks(repo, "b.go", &chunks_of("b.go", go_source(20, "B")))
            .await
            .unwrap();
        assert_eq!(store.file_paths(repo).await.unwrap(), ["a.go", "b.go"]);

        let outcome = store.remove_file(repo, "a.go").await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(store.file_paths(repo).await.unwrap(), ["b.go"]);
        assert_eq!(store.count_chunks(repo).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn vector_refs_roundtrip_and_clear() {
        let store = store().await;
        let repo = RepositoryId(2);
        let chunks = chunks_of("x.go", go_source(200, "X"));
        store.replace_file_chunks(repo, "x.go", &chunks).await.unwrap();
        let ids: Vec<String> = chunks.iter().map(|c| Chunk::from_code(repo, c).id).collect();

        let refs: Vec<(String, String)> = ids.iter().map(|id| (id.clone(), id.clone())).collect();
        let missing = ("nope".to_owned(), "nope".to_owned());
        let mut with_missing = refs.clone();
        with_missing.push(missing);
        assert_eq!(store.set_vector_refs(&with_missing).await, 2);

        let mut stored = store.vector_refs_for_repository(repo).await.unwrap();
        stored.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(stored, expected);

        assert_eq!(store.clear_vector_refs(repo).await.unwrap(), 2);
        assert_eq!(store.chunks_needing_embedding(repo).await.unwrap().len(), 2);

        let by_id = store.chunks_by_ids(&ids).await.unwrap();
        assert_eq!(by_id.len(), 2);
        assert_eq!(by_id[&ids[1]].start_line, 101);
    }

    #[tokio::test]
    async fn text_search_requires_index() {
        let store = store().await;
        assert!(!store.text_index_exists().await.unwrap());
        let err = store
            .text_search(&LexicalQuery::new("anything", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::TextIndexMissing));
    }

    #[tokio::test]
    async fn text_search_ranks_and_filters() {
        let store = store().await;
        store.build_text_index().await.unwrap();
        assert!(store.text_index_exists().await.unwrap());

        let repo = RepositoryId(1);
        store
            .replace_file_chunks(repo, "srv/handler.go", &chunks_of("srv/handler.go", go_source(30, "HandleRequest")))
            .await
            .unwrap();
        store
            .replace_file_chunks(repo, "srv/other.go", &chunks_of("srv/other.go", go_source(30, "Unrelated")))
            .await
            .unwrap();
        store
            .replace_file_chunks(RepositoryId(2), "x.go", &chunks_of("x.go", go_source(30, "HandleRequest")))
            .await
            .unwrap();

        let hits = store
            .text_search(&LexicalQuery::new("HandleRequest", 10).repository(repo))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.file_path, "srv/handler.go");
        assert!(hits[0].score > 0.0);

        let hits = store
            .text_search(&LexicalQuery::new("HandleRequest", 10).language("golang").extension("go"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store
            .text_search(&LexicalQuery::new("HandleRequest", 10).extension(".py"))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn text_index_follows_deletes() {
        let store = store().await;
        store.build_text_index().await.unwrap();
        let repo = RepositoryId(1);
        store
            .replace_file_chunks(repo, "a.go", &chunks_of("a.go", go_source(30, "Vanishing")))
            .await
            .unwrap();
        store.remove_file(repo, "a.go").await.unwrap();
        let hits = store
            .text_search(&LexicalQuery::new("Vanishing", 10))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let store = store().await;
        store.build_text_index().await.unwrap();
        let err = store
            .text_search(&LexicalQuery::new("!!!", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidQuery(_)));
    }
}
