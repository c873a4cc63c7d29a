use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::error::LlmError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Converts batches of texts into fixed-dimension vectors.
///
/// Implementations must return exactly one vector per input text, in input order.
/// Dropping the returned future cancels the request.
pub trait EmbeddingProvider: Send + Sync {
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>>;

    fn name(&self) -> &str;

    /// Release held resources. Later calls to `embed_batch` fail with `LlmError::Closed`.
    fn close(&self) {}
}

/// Embed a single text through a batch provider.
///
/// # Errors
///
/// Propagates provider errors; returns `CountMismatch` if the provider returns no vector.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>, LlmError> {
    let texts = [text.to_owned()];
    let mut vectors = provider.embed_batch(&texts).await?;
    if vectors.len() != 1 {
        return Err(LlmError::CountMismatch {
            expected: 1,
            actual: vectors.len(),
        });
    }
    Ok(vectors.swap_remove(0))
}

/// Caches vectors by exact input text in front of another provider.
///
/// The cache is best-effort: a poisoned lock behaves like an empty cache, and once
/// `max_entries` would be exceeded the map is cleared before inserting.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
    max_entries: usize,
}

impl CachedEmbedder {
    #[must_use]
    pub fn new(inner: Arc<dyn EmbeddingProvider>, max_entries: usize) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().map_or(0, |c| c.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        match self.cache.read() {
            Ok(cache) => texts.iter().map(|t| cache.get(t).cloned()).collect(),
            Err(_) => vec![None; texts.len()],
        }
    }

    fn store(&self, texts: &[String], vectors: &[Vec<f32>]) {
        let Ok(mut cache) = self.cache.write() else {
            return;
        };
        if cache.len() + texts.len() > self.max_entries {
            cache.clear();
        }
        for (text, vector) in texts.iter().zip(vectors).take(self.max_entries) {
            cache.insert(text.clone(), vector.clone());
        }
    }
}

impl EmbeddingProvider for CachedEmbedder {
    fn embed_batch<'a>(
        &'a self,
        texts: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, LlmError>> {
        Box::pin(async move {
            let mut slots = self.lookup(texts);
            let (miss_idx, misses): (Vec<usize>, Vec<String>) = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.is_none())
                .map(|(i, _)| (i, texts[i].clone()))
                .unzip();

            if !misses.is_empty() {
                tracing::debug!(
                    hits = texts.len() - misses.len(),
                    misses = misses.len(),
                    "embedding cache lookup"
                );
                let fresh = self.inner.embed_batch(&misses).await?;
                if fresh.len() != misses.len() {
                    return Err(LlmError::CountMismatch {
                        expected: misses.len(),
                        actual: fresh.len(),
                    });
                }
                self.store(&misses, &fresh);
                for (i, vector) in miss_idx.into_iter().zip(fresh) {
                    slots[i] = Some(vector);
                }
            }

            Ok(slots.into_iter().flatten().collect())
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn close(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEmbedder;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn cache_hits_skip_inner_provider() {
        let inner = Arc::new(MockEmbedder::new(4));
        let cached = CachedEmbedder::new(inner.clone(), 100);

        let first = cached.embed_batch(&texts(&["a", "b"])).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(inner.call_count(), 1);

        let second = cached.embed_batch(&texts(&["b", "a"])).await.unwrap();
        assert_eq!(second, vec![first[1].clone(), first[0].clone()]);
        assert_eq!(inner.call_count(), 1);
    }

    #[tokio::test]
    async fn partial_hits_only_send_misses() {
        let inner = Arc::new(MockEmbedder::new(4));
        let cached = CachedEmbedder::new(inner.clone(), 100);

        cached.embed_batch(&texts(&["a"])).await.unwrap();
        let out = cached.embed_batch(&texts(&["a", "c", "d"])).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(inner.call_count(), 2);
        assert_eq!(inner.calls()[1], texts(&["c", "d"]));
    }

    #[tokio::test]
    async fn cache_cleared_when_full() {
        let inner = Arc::new(MockEmbedder::new(2));
        let cached = CachedEmbedder::new(inner.clone(), 2);

        cached.embed_batch(&texts(&["a", "b"])).await.unwrap();
        assert_eq!(cached.len(), 2);
        cached.embed_batch(&texts(&["c"])).await.unwrap();
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn inner_errors_not_cached() {
        let inner = Arc::new(MockEmbedder::new(2).fail_calls([0]));
        let cached = CachedEmbedder::new(inner.clone(), 10);

        assert!(cached.embed_batch(&texts(&["a"])).await.is_err());
        assert!(cached.is_empty());
        assert!(cached.embed_batch(&texts(&["a"])).await.is_ok());
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn embed_one_returns_single_vector() {
        let inner = MockEmbedder::new(3);
        let v = embed_one(&inner, "hello").await.unwrap();
        assert_eq!(v.len(), 3);
    }
}
