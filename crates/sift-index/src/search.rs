//! Hybrid retrieval: BM25 text search fused with vector similarity.

use std::collections::HashMap;
use std::sync::Arc;

use sift_llm::EmbeddingProvider;
use sift_llm::embed::embed_one;
use sift_memory::{PointFilter, RepositoryId, VectorStore};

use crate::error::{IndexError, Result};
use crate::highlight::highlight;
use crate::store::{Chunk, ChunkStore, LexicalHit, LexicalQuery, fts_query};

/// Blend weight used when the caller passes an out-of-range vector weight.
pub const DEFAULT_VECTOR_WEIGHT: f32 = 0.7;
/// Upper bound on results per query.
pub const DEFAULT_MAX_LIMIT: u32 = 100;

const WEIGHT_SUM_TOLERANCE: f32 = 0.05;

/// Coarse relevance bucket derived from a score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    High,
    Medium,
    Low,
}

impl Relevance {
    #[must_use]
    pub fn from_score(score: f32) -> Self {
        if score >= 0.85 {
            Self::High
        } else if score >= 0.60 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Relevance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk scored by a single retrieval source.
#[derive(Debug, Clone)]
pub struct SimilarityResult {
    pub chunk: Chunk,
    pub score: f32,
    pub distance: f32,
    pub relevance: Relevance,
}

impl SimilarityResult {
    #[must_use]
    pub fn new(chunk: Chunk, score: f32) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            chunk,
            score,
            distance: 1.0 - score,
            relevance: Relevance::from_score(score),
        }
    }
}

/// A chunk with its fused score and the per-source scores that produced it.
#[derive(Debug, Clone)]
pub struct HybridResult {
    pub chunk: Chunk,
    pub score: f32,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
    pub relevance: Relevance,
    pub highlight: String,
}

/// Explicit two-weight form of the fusion blend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub lexical: f32,
    pub vector: f32,
}

impl FusionWeights {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidWeights`] if a weight is outside [0, 1] or both are
    /// non-zero and do not sum to 1 (within 0.05).
    pub fn new(lexical: f32, vector: f32) -> Result<Self> {
        for (name, w) in [("lexical", lexical), ("vector", vector)] {
            if !(0.0..=1.0).contains(&w) {
                return Err(IndexError::InvalidWeights(format!(
                    "{name} weight {w} outside [0, 1]"
                )));
            }
        }
        if lexical > 0.0 && vector > 0.0 && ((lexical + vector) - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(IndexError::InvalidWeights(format!(
                "weights {lexical} + {vector} must sum to 1"
            )));
        }
        Ok(Self { lexical, vector })
    }

    /// Single-weight form: lexical gets `1 - vector_weight`. Out-of-range or NaN input
    /// falls back to [`DEFAULT_VECTOR_WEIGHT`].
    #[must_use]
    pub fn from_vector_weight(vector_weight: f32) -> Self {
        let vector = if (0.0..=1.0).contains(&vector_weight) {
            vector_weight
        } else {
            tracing::debug!(vector_weight, "vector weight out of range, using default");
            DEFAULT_VECTOR_WEIGHT
        };
        Self {
            lexical: 1.0 - vector,
            vector,
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::from_vector_weight(DEFAULT_VECTOR_WEIGHT)
    }
}

/// Lexical and vector retrieval over one chunk store and one vector collection.
pub struct HybridSearch {
    store: ChunkStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    max_limit: u32,
}

impl std::fmt::Debug for HybridSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridSearch")
            .field("collection", &self.collection)
            .field("max_limit", &self.max_limit)
            .finish_non_exhaustive()
    }
}

impl HybridSearch {
    #[must_use]
    pub fn new(
        store: ChunkStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            collection: collection.into(),
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }

    #[must_use]
    pub fn with_max_limit(mut self, max_limit: u32) -> Self {
        self.max_limit = max_limit.max(1);
        self
    }

    #[must_use]
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn check_request(&self, query: &str, limit: u32) -> Result<u32> {
        if limit == 0 {
            return Err(IndexError::InvalidQuery("limit must be at least 1".into()));
        }
        if fts_query(query).is_none() {
            return Err(IndexError::InvalidQuery(format!(
                "no searchable terms in {query:?}"
            )));
        }
        Ok(limit.min(self.max_limit))
    }

    async fn text_hits(&self, query: &LexicalQuery) -> Result<Vec<LexicalHit>> {
        match self.store.text_search(query).await {
            Err(IndexError::TextIndexMissing) => {
                tracing::info!("text index missing, building it before retrying");
                self.store.build_text_index().await?;
                self.store.text_search(query).await
            }
            other => other,
        }
    }

    /// BM25 search with scores normalized by the best hit into [0, 1].
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty query or zero limit, or the text index
    /// error if the index cannot be built.
    pub async fn lexical_search(&self, query: &LexicalQuery) -> Result<Vec<SimilarityResult>> {
        let limit = self.check_request(&query.text, query.limit)?;
        let query = LexicalQuery {
            limit,
            ..query.clone()
        };
        let hits = self.text_hits(&query).await?;
        Ok(normalize_lexical(hits))
    }

    /// Nearest chunks to the embedded query, optionally restricted to one repository.
    /// A missing collection yields no results.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding, the vector search or the chunk lookup fails.
    pub async fn vector_search(
        &self,
        repository_id: Option<RepositoryId>,
        query: &str,
        limit: u32,
    ) -> Result<Vec<SimilarityResult>> {
        let limit = self.check_request(query, limit)?;
        self.vector_candidates(repository_id, query, limit).await
    }

    async fn vector_candidates(
        &self,
        repository_id: Option<RepositoryId>,
        query: &str,
        limit: u32,
    ) -> Result<Vec<SimilarityResult>> {
        if !self.vectors.collection_exists(&self.collection).await? {
            tracing::debug!(collection = %self.collection, "vector collection missing");
            return Ok(Vec::new());
        }

        let vector = embed_one(self.embedder.as_ref(), query).await?;
        let filter = repository_id.map(PointFilter::repository);
        let points = self
            .vectors
            .search(&self.collection, vector, u64::from(limit), filter)
            .await?;

        let ids: Vec<String> = points.iter().map(|p| p.id.clone()).collect();
        let mut chunks = self.store.chunks_by_ids(&ids).await?;
        Ok(points
            .into_iter()
            .filter_map(|p| {
                let chunk = chunks.remove(&p.id)?;
                Some(SimilarityResult::new(chunk, p.score))
            })
            .collect())
    }

    /// Run both searches concurrently and fuse them.
    ///
    /// Each side asks for `2 × limit` candidates. The fused score is
    /// `vector × w + lexical × (1 − w)`; a side with zero weight is not queried. A
    /// vector-side failure degrades to lexical-only results.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty query or zero limit, or a lexical search
    /// error.
    pub async fn hybrid_search(
        &self,
        repository_id: Option<RepositoryId>,
        query: &str,
        limit: u32,
        vector_weight: f32,
    ) -> Result<Vec<HybridResult>> {
        let limit = self.check_request(query, limit)?;
        let weights = FusionWeights::from_vector_weight(vector_weight);
        let candidates = limit.saturating_mul(2);

        let lexical_query = LexicalQuery {
            repository_id,
            ..LexicalQuery::new(query, candidates)
        };
        let lexical = async {
            if weights.lexical > 0.0 {
                self.text_hits(&lexical_query).await.map(normalize_lexical)
            } else {
                Ok(Vec::new())
            }
        };
        let vector = async {
            if weights.vector > 0.0 {
                self.vector_candidates(repository_id, query, candidates).await
            } else {
                Ok(Vec::new())
            }
        };
        let (lexical, vector) = tokio::join!(lexical, vector);

        let lexical = lexical?;
        let vector = vector.unwrap_or_else(|e| {
            tracing::warn!("vector search failed, using lexical results only: {e:#}");
            Vec::new()
        });

        let mut fused = fuse(vector, lexical, weights);
        fused.truncate(limit as usize);
        for result in &mut fused {
            result.highlight = highlight(&result.chunk.content, query);
        }
        tracing::debug!(
            results = fused.len(),
            vector_weight = weights.vector,
            "hybrid search complete"
        );
        Ok(fused)
    }
}

fn normalize_lexical(hits: Vec<LexicalHit>) -> Vec<SimilarityResult> {
    let max = hits.iter().map(|h| h.score).fold(0.0_f64, f64::max);
    hits.into_iter()
        .map(|hit| {
            #[allow(clippy::cast_possible_truncation)]
            let score = if max > 0.0 { (hit.score / max) as f32 } else { 1.0 };
            SimilarityResult::new(hit.chunk, score)
        })
        .collect()
}

/// Weighted sum keyed by chunk id. Equal scores keep first-contribution order, vector
/// results first.
fn fuse(
    vector: Vec<SimilarityResult>,
    lexical: Vec<SimilarityResult>,
    weights: FusionWeights,
) -> Vec<HybridResult> {
    let mut order: HashMap<String, usize> = HashMap::new();
    let mut fused: Vec<HybridResult> = Vec::new();

    let contributions = vector
        .into_iter()
        .map(|r| (r, true))
        .chain(lexical.into_iter().map(|r| (r, false)));
    for (result, from_vector) in contributions {
        let weight = if from_vector {
            weights.vector
        } else {
            weights.lexical
        };
        let idx = *order.entry(result.chunk.id.clone()).or_insert_with(|| {
            fused.push(HybridResult {
                chunk: result.chunk.clone(),
                score: 0.0,
                lexical_score: None,
                vector_score: None,
                relevance: Relevance::Low,
                highlight: String::new(),
            });
            fused.len() - 1
        });
        let entry = &mut fused[idx];
        entry.score += result.score * weight;
        if from_vector {
            entry.vector_score = Some(result.score);
        } else {
            entry.lexical_score = Some(result.score);
        }
    }

    for entry in &mut fused {
        entry.score = entry.score.clamp(0.0, 1.0);
        entry.relevance = Relevance::from_score(entry.score);
    }
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
}
