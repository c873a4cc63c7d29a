use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use crate::vector_store::{
    ChunkPayload, PointFilter, ScoredVectorPoint, VectorPoint, VectorStore, VectorStoreError,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A chunk vector kept at unit length so search is a plain dot product.
struct Entry {
    unit: Vec<f32>,
    payload: ChunkPayload,
}

struct Collection {
    dim: usize,
    /// Ordered by chunk id so equal scores come back in id order.
    entries: BTreeMap<String, Entry>,
}

impl Collection {
    fn check_dim(&self, name: &str, actual: usize) -> Result<(), VectorStoreError> {
        if actual == self.dim {
            Ok(())
        } else {
            Err(VectorStoreError::DimensionMismatch {
                collection: name.to_owned(),
                expected: self.dim,
                actual,
            })
        }
    }

    fn nearest(&self, query: &[f32], limit: usize, filter: &PointFilter) -> Vec<ScoredVectorPoint> {
        let mut scored: Vec<ScoredVectorPoint> = self
            .entries
            .iter()
            .filter(|(_, e)| filter.matches(&e.payload))
            .map(|(id, e)| ScoredVectorPoint {
                id: id.clone(),
                score: dot(query, &e.unit),
                payload: e.payload.clone(),
            })
            .collect();
        // Stable: ties keep the id order of the map.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }
}

/// Process-local vector index with exact cosine search. Backs the tests and runs
/// without a Qdrant server.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points in `collection`, or `None` if it does not exist.
    #[must_use]
    pub fn point_count(&self, collection: &str) -> Option<usize> {
        self.collections
            .read()
            .ok()
            .and_then(|cols| cols.get(collection).map(|c| c.entries.len()))
    }

    fn read<T>(
        &self,
        op: &'static str,
        collection: &str,
        f: impl FnOnce(&Collection) -> Result<T, VectorStoreError>,
    ) -> Result<T, VectorStoreError> {
        let cols = self
            .collections
            .read()
            .map_err(|e| VectorStoreError::backend(op, e))?;
        let col = cols
            .get(collection)
            .ok_or_else(|| VectorStoreError::MissingCollection(collection.to_owned()))?;
        f(col)
    }

    fn write<T>(
        &self,
        op: &'static str,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> Result<T, VectorStoreError>,
    ) -> Result<T, VectorStoreError> {
        let mut cols = self
            .collections
            .write()
            .map_err(|e| VectorStoreError::backend(op, e))?;
        let col = cols
            .get_mut(collection)
            .ok_or_else(|| VectorStoreError::MissingCollection(collection.to_owned()))?;
        f(col)
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let collections = self.collections.read().map_or(0, |c| c.len());
        f.debug_struct("InMemoryVectorStore")
            .field("collections", &collections)
            .finish()
    }
}

fn unit(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector;
    }
    vector.into_iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let dim = usize::try_from(vector_size)
                .map_err(|e| VectorStoreError::backend("create collection", e))?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::backend("create collection", e))?;
            match cols.get(&collection) {
                Some(existing) => existing.check_dim(&collection, dim),
                None => {
                    cols.insert(
                        collection,
                        Collection {
                            dim,
                            entries: BTreeMap::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::backend("check collection", e))?;
            Ok(cols.contains_key(&collection))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.collections
                .write()
                .map_err(|e| VectorStoreError::backend("delete collection", e))?
                .remove(&collection);
            Ok(())
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.write("upsert", &collection, |col| {
                // Reject the whole batch before touching any entry.
                for p in &points {
                    col.check_dim(&collection, p.vector.len())?;
                }
                for p in points {
                    col.entries.insert(
                        p.id,
                        Entry {
                            unit: unit(p.vector),
                            payload: p.payload,
                        },
                    );
                }
                Ok(())
            })
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<PointFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.read("search", &collection, |col| {
                col.check_dim(&collection, vector.len())?;
                let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                Ok(col.nearest(&unit(vector), limit, &filter.unwrap_or_default()))
            })
        })
    }

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            self.write("delete points", &collection, |col| {
                for id in &ids {
                    col.entries.remove(id);
                }
                Ok(())
            })
        })
    }
}
