//! Qdrant-backed vector index.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId,
    PointStruct, PointsIdsList, ScoredPoint, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder, point_id::PointIdOptions, value::Kind,
};

use crate::vector_store::{
    ChunkPayload, PointFilter, ScoredVectorPoint, VectorPoint, VectorStore, VectorStoreError,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type QdrantResult<T> = Result<T, Box<qdrant_client::QdrantError>>;

/// Thin wrapper over [`Qdrant`] client encapsulating the collection operations sift needs.
#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps").finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// Create a new `QdrantOps` connected to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the Qdrant client cannot be created.
    pub fn new(url: &str) -> QdrantResult<Self> {
        let client = Qdrant::from_url(url).build().map_err(Box::new)?;
        Ok(Self { client })
    }

    /// Ensure a collection exists with cosine distance vectors.
    ///
    /// Idempotent: no-op if the collection already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached or collection creation fails.
    pub async fn ensure_collection(&self, collection: &str, vector_size: u64) -> QdrantResult<()> {
        if self
            .client
            .collection_exists(collection)
            .await
            .map_err(Box::new)?
        {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine)),
            )
            .await
            .map_err(Box::new)?;
        tracing::info!(collection, vector_size, "created Qdrant collection");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached.
    pub async fn collection_exists(&self, collection: &str) -> QdrantResult<bool> {
        self.client
            .collection_exists(collection)
            .await
            .map_err(Box::new)
    }

    /// # Errors
    ///
    /// Returns an error if the collection cannot be deleted.
    pub async fn delete_collection(&self, collection: &str) -> QdrantResult<()> {
        self.client
            .delete_collection(collection)
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn upsert(&self, collection: &str, points: Vec<PointStruct>) -> QdrantResult<()> {
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    /// Search for similar vectors, returning scored points with payloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<Filter>,
    ) -> QdrantResult<Vec<ScoredPoint>> {
        let mut builder = SearchPointsBuilder::new(collection, vector, limit).with_payload(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        let results = self.client.search_points(builder).await.map_err(Box::new)?;
        Ok(results.result)
    }

    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn delete_by_ids(&self, collection: &str, ids: Vec<PointId>) -> QdrantResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    /// Convert a JSON payload map to a Qdrant payload map.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if a value cannot be represented.
    pub fn json_to_payload(
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, qdrant_client::qdrant::Value>, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(payload.into_iter().collect()))
    }
}

impl VectorStore for QdrantOps {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.ensure_collection(&collection, vector_size)
                .await
                .map_err(|e| VectorStoreError::backend("create collection", e))
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.collection_exists(&collection)
                .await
                .map_err(|e| VectorStoreError::backend("check collection", e))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.delete_collection(&collection)
                .await
                .map_err(|e| VectorStoreError::backend("delete collection", e))
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let qdrant_points = points
                .into_iter()
                .map(|p| {
                    let payload = payload_to_qdrant(&p.payload)
                        .map_err(|e| VectorStoreError::Payload(e.to_string()))?;
                    Ok(PointStruct::new(p.id, p.vector, payload))
                })
                .collect::<Result<Vec<_>, VectorStoreError>>()?;
            self.upsert(&collection, qdrant_points)
                .await
                .map_err(|e| VectorStoreError::backend("upsert", e))
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
            let qdrant_filter = filter.filter(|f| !f.is_empty()).map(point_filter_to_qdrant);
            let results = self
                .search(&collection, vector, limit, qdrant_filter)
                .await
                .map_err(|e| VectorStoreError::backend("search", e))?;
            Ok(results.into_iter().map(scored_point_to_vector).collect())
        })
    }

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let point_ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();
            self.delete_by_ids(&collection, point_ids)
                .await
                .map_err(|e| VectorStoreError::backend("delete points", e))
        })
    }
}

fn payload_to_qdrant(
    payload: &ChunkPayload,
) -> Result<HashMap<String, qdrant_client::qdrant::Value>, serde_json::Error> {
    match serde_json::to_value(payload)? {
        serde_json::Value::Object(map) => QdrantOps::json_to_payload(map.into_iter().collect()),
        _ => Ok(HashMap::new()),
    }
}

fn point_filter_to_qdrant(filter: PointFilter) -> Filter {
    let mut must = Vec::new();
    if let Some(id) = filter.repository_id {
        must.push(Condition::matches(ChunkPayload::REPOSITORY_ID, id.0));
    }
    if let Some(language) = filter.language {
        must.push(Condition::matches(ChunkPayload::LANGUAGE, language));
    }
    if let Some(path) = filter.file_path {
        must.push(Condition::matches(ChunkPayload::FILE_PATH, path));
    }
    Filter::must(must)
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> Option<serde_json::Value> {
    Some(match value.kind? {
        Kind::StringValue(s) => serde_json::Value::String(s),
        Kind::IntegerValue(i) => serde_json::Value::Number(i.into()),
        Kind::DoubleValue(d) => serde_json::Number::from_f64(d).map(serde_json::Value::Number)?,
        Kind::BoolValue(b) => serde_json::Value::Bool(b),
        Kind::ListValue(list) => serde_json::Value::Array(
            list.values
                .into_iter()
                .filter_map(qdrant_value_to_json)
                .collect(),
        ),
        _ => return None,
    })
}

/// Points written by other tools may carry a partial payload; missing fields default.
fn scored_point_to_vector(point: ScoredPoint) -> ScoredVectorPoint {
    let json: serde_json::Map<String, serde_json::Value> = point
        .payload
        .into_iter()
        .filter_map(|(k, v)| Some((k, qdrant_value_to_json(v)?)))
        .collect();
    let payload = serde_json::from_value(serde_json::Value::Object(json)).unwrap_or_default();

    let id = match point.id.and_then(|pid| pid.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };

    ScoredVectorPoint {
        id,
        score: point.score,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepositoryId;

    #[test]
    fn new_valid_url() {
        assert!(QdrantOps::new("http://localhost:6334").is_ok());
    }

    #[test]
    fn new_invalid_url() {
        assert!(QdrantOps::new("not a valid url").is_err());
    }

    #[test]
    fn debug_format() {
        let ops = QdrantOps::new("http://localhost:6334").unwrap();
        assert!(format!("{ops:?}").contains("QdrantOps"));
    }

    #[test]
    fn json_to_payload_keeps_fields() {
        let payload = HashMap::from([
            ("file_path".to_owned(), serde_json::json!("src/main.go")),
            ("repository_id".to_owned(), serde_json::json!(7)),
        ]);
        let converted = QdrantOps::json_to_payload(payload).unwrap();
        assert_eq!(converted.len(), 2);
        assert!(matches!(
            converted["repository_id"].kind,
            Some(Kind::IntegerValue(7))
        ));
    }

    #[test]
    fn filter_conversion_maps_set_fields() {
        let q = point_filter_to_qdrant(PointFilter::repository(RepositoryId(3)));
        assert_eq!(q.must.len(), 1);
        assert!(q.must_not.is_empty());

        let q = point_filter_to_qdrant(
            PointFilter::repository(RepositoryId(3))
                .language("go")
                .file_path("main.go"),
        );
        assert_eq!(q.must.len(), 3);
    }

    #[test]
    fn chunk_payload_converts_to_qdrant() {
        let payload = ChunkPayload {
            file_path: "src/main.go".into(),
            function_names: vec!["main".into()],
            ..ChunkPayload::for_repository(RepositoryId(7))
        };
        let converted = payload_to_qdrant(&payload).unwrap();
        assert_eq!(converted.len(), 8);
        assert!(matches!(
            converted[ChunkPayload::REPOSITORY_ID].kind,
            Some(Kind::IntegerValue(7))
        ));
    }

    #[test]
    fn scored_point_conversion() {
        let point = ScoredPoint {
            id: Some(PointId::from("00000000-0000-0000-0000-000000000001".to_owned())),
            score: 0.75,
            payload: HashMap::from([(
                "language".to_owned(),
                qdrant_client::qdrant::Value::from("go"),
            )]),
            ..ScoredPoint::default()
        };
        let converted = scored_point_to_vector(point);
        assert_eq!(converted.id, "00000000-0000-0000-0000-000000000001");
        assert!((converted.score - 0.75).abs() < f32::EPSILON);
        assert_eq!(converted.payload.language, "go");
        assert_eq!(converted.payload.repository_id, None);
    }
}
