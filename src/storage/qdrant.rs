//! Qdrant-backed vector store.
//!
//! One collection per translation memory, dense vectors compared with
//! `Distance::Euclid` (the engine interprets reported distances as L2 over
//! unit vectors). The canonical entry id is not a valid Qdrant point id,
//! so points are keyed by a deterministic UUID v5 of the canonical id and
//! the id itself lives in the payload, indexed as a keyword field along
//! with the components used by prefix predicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, Condition, CountPointsBuilder, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter,
    PointStruct, QueryPointsBuilder, ScrollPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::config::QdrantConfig;
use qdrant_client::{Payload, Qdrant};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::entry::Entry;
use crate::storage::{Predicate, ScoredEntry, StoreError, VectorStore};

/// Upper bound used when a caller asks for an unlimited vector search;
/// Qdrant requires an explicit limit.
pub const MAX_SCAN: usize = 10_000;

/// Page size for filter-only scans.
const SCROLL_PAGE: u32 = 512;

/// Connection configuration for [`QdrantStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantStoreConfig {
    /// Qdrant gRPC endpoint.
    pub url: String,
    /// API key, if the server requires one.
    pub api_key: Option<String>,
    /// Collection holding this translation memory.
    pub collection: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Skip client/server compatibility probing on connect.
    pub check_compatibility: bool,
}

impl Default for QdrantStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:6334".to_string(),
            api_key: None,
            collection: "translation_memory".to_string(),
            timeout_ms: 30_000,
            check_compatibility: true,
        }
    }
}

/// [`VectorStore`] implementation over a Qdrant collection.
pub struct QdrantStore {
    client: Qdrant,
    config: QdrantStoreConfig,
    // 0 = schema not created yet.
    dimension: AtomicUsize,
}

impl std::fmt::Debug for QdrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantStore")
            .field("url", &self.config.url)
            .field("collection", &self.config.collection)
            .field("dimension", &self.dimension.load(Ordering::SeqCst))
            .finish()
    }
}

impl QdrantStore {
    /// Connect to the configured Qdrant endpoint.
    pub fn connect(config: QdrantStoreConfig) -> Result<Self, StoreError> {
        let mut client_config = QdrantConfig::from_url(&config.url)
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .connect_timeout(std::time::Duration::from_millis(config.timeout_ms / 2));
        if let Some(api_key) = &config.api_key {
            client_config = client_config.api_key(api_key.clone());
        }
        if !config.check_compatibility {
            client_config = client_config.skip_compatibility_check();
        }
        let client = Qdrant::new(client_config)
            .map_err(|e| StoreError::Connection(format!("{}: {e}", config.url)))?;
        Ok(Self {
            client,
            config,
            dimension: AtomicUsize::new(0),
        })
    }

    fn collection(&self) -> &str {
        &self.config.collection
    }

    fn require_dimension(&self) -> Result<usize, StoreError> {
        match self.dimension.load(Ordering::SeqCst) {
            0 => Err(StoreError::SchemaMissing),
            dim => Ok(dim),
        }
    }

    /// Deterministic Qdrant point id for a canonical entry id.
    pub fn point_id(canonical_id: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical_id.as_bytes()).to_string()
    }

    fn compile(predicate: &Predicate) -> Result<Filter, StoreError> {
        let mut must: Vec<Condition> = Vec::new();
        Self::compile_into(predicate, &mut must)?;
        Ok(Filter::must(must))
    }

    fn compile_into(predicate: &Predicate, must: &mut Vec<Condition>) -> Result<(), StoreError> {
        match predicate {
            Predicate::IdEq(id) => must.push(Condition::matches("id", id.clone())),
            Predicate::IdIn(ids) => {
                if ids.is_empty() {
                    return Err(StoreError::Predicate("empty IN list".into()));
                }
                must.push(Condition::matches("id", ids.clone()));
            }
            Predicate::UnitPrefix { file_id, unit_id } => {
                must.push(Condition::matches("fileId", file_id.clone()));
                must.push(Condition::matches("unitId", unit_id.clone()));
            }
            Predicate::SegmentPrefix {
                file_id,
                unit_id,
                segment_index,
            } => {
                must.push(Condition::matches("fileId", file_id.clone()));
                must.push(Condition::matches("unitId", unit_id.clone()));
                must.push(Condition::matches("segmentIndex", i64::from(*segment_index)));
            }
            Predicate::LanguageEq(language) => {
                must.push(Condition::matches("language", language.clone()))
            }
            Predicate::And(predicates) => {
                for predicate in predicates {
                    Self::compile_into(predicate, must)?;
                }
            }
        }
        Ok(())
    }

    fn entry_from_payload(
        payload: HashMap<String, Value>,
        vector: Option<Vec<f32>>,
    ) -> Result<Entry, StoreError> {
        let mut columns = serde_json::Map::new();
        for (key, value) in payload {
            columns.insert(key, json_from_qdrant(value));
        }
        Entry::from_columns(&columns, vector).map_err(StoreError::from)
    }
}

fn json_from_qdrant(value: Value) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(json_from_qdrant).collect())
        }
        Some(Kind::StructValue(object)) => serde_json::Value::Object(
            object
                .fields
                .into_iter()
                .map(|(k, v)| (k, json_from_qdrant(v)))
                .collect(),
        ),
    }
}

fn vector_from_output(vectors: Option<qdrant_client::qdrant::VectorsOutput>) -> Option<Vec<f32>> {
    use qdrant_client::qdrant::vectors_output::VectorsOptions;
    match vectors?.vectors_options? {
        VectorsOptions::Vector(vector) => Some(vector.data),
        VectorsOptions::Vectors(_) => None,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_schema(&self, dim: usize) -> Result<(), StoreError> {
        if dim == 0 {
            return Err(StoreError::Schema("dimension must be non-zero".into()));
        }

        let exists = self.client.collection_exists(self.collection()).await?;
        if !exists {
            info!(
                collection = self.collection(),
                dim, "creating translation memory collection"
            );
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(self.collection()).vectors_config(
                        VectorParamsBuilder::new(dim as u64, Distance::Euclid),
                    ),
                )
                .await?;

            for (field, field_type) in [
                ("id", FieldType::Keyword),
                ("language", FieldType::Keyword),
                ("fileId", FieldType::Keyword),
                ("unitId", FieldType::Keyword),
                ("segmentIndex", FieldType::Integer),
            ] {
                self.client
                    .create_field_index(
                        CreateFieldIndexCollectionBuilder::new(
                            self.collection(),
                            field,
                            field_type,
                        ),
                    )
                    .await?;
            }
        }

        self.dimension.store(dim, Ordering::SeqCst);
        Ok(())
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        predicate: Option<&Predicate>,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let dim = self.require_dimension()?;
        if vector.len() != dim {
            return Err(StoreError::WrongVectorLength {
                expected: dim,
                got: vector.len(),
            });
        }

        let mut request = QueryPointsBuilder::new(self.collection())
            .query(vector.to_vec())
            .limit(limit.unwrap_or(MAX_SCAN) as u64)
            .with_payload(true)
            .with_vectors(true);
        if let Some(predicate) = predicate {
            request = request.filter(Self::compile(predicate)?);
        }

        let response = self
            .client
            .query(request)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let vector = vector_from_output(point.vectors);
            let entry = Self::entry_from_payload(point.payload, vector)?;
            hits.push(ScoredEntry {
                entry,
                // Euclid scores are distances, already ascending.
                distance: point.score,
            });
        }
        Ok(hits)
    }

    async fn query(
        &self,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>, StoreError> {
        let filter = Self::compile(predicate)?;
        let mut collected = Vec::new();
        let mut offset: Option<qdrant_client::qdrant::PointId> = None;

        loop {
            let page_limit = match limit {
                Some(limit) => {
                    let remaining = limit.saturating_sub(collected.len());
                    if remaining == 0 {
                        break;
                    }
                    remaining.min(SCROLL_PAGE as usize) as u32
                }
                None => SCROLL_PAGE,
            };

            let mut request = ScrollPointsBuilder::new(self.collection())
                .filter(filter.clone())
                .limit(page_limit)
                .with_payload(true)
                .with_vectors(true);
            if let Some(offset) = offset.clone() {
                request = request.offset(offset);
            }

            let response = self
                .client
                .scroll(request)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

            for point in response.result {
                let vector = vector_from_output(point.vectors);
                collected.push(Self::entry_from_payload(point.payload, vector)?);
            }

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(collected)
    }

    async fn upsert_batch(&self, entries: Vec<Entry>) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let dim = self.require_dimension()?;

        let mut points = Vec::with_capacity(entries.len());
        for entry in &entries {
            let vector = match &entry.vector {
                Some(vector) if vector.len() == dim => vector.clone(),
                Some(vector) => {
                    return Err(StoreError::WrongVectorLength {
                        expected: dim,
                        got: vector.len(),
                    })
                }
                None => {
                    return Err(StoreError::Batch(format!(
                        "entry `{}` has no vector",
                        entry.canonical_id()
                    )))
                }
            };
            let payload = Payload::try_from(serde_json::Value::Object(entry.to_columns()))
                .map_err(|e| StoreError::Batch(e.to_string()))?;
            points.push(PointStruct::new(
                Self::point_id(&entry.canonical_id()),
                vector,
                payload,
            ));
        }

        let count = points.len();
        debug!(collection = self.collection(), count, "upserting batch");
        self.client
            .upsert_points(
                qdrant_client::qdrant::UpsertPointsBuilder::new(self.collection(), points)
                    .wait(true),
            )
            .await
            .map_err(|e| StoreError::Batch(e.to_string()))?;
        Ok(count)
    }

    async fn delete_where(&self, predicate: &Predicate) -> Result<u64, StoreError> {
        let filter = Self::compile(predicate)?;
        let matched = self.count(Some(predicate)).await?;
        self.client
            .delete_points(
                DeletePointsBuilder::new(self.collection())
                    .points(filter)
                    .wait(true),
            )
            .await?;
        Ok(matched)
    }

    async fn count(&self, predicate: Option<&Predicate>) -> Result<u64, StoreError> {
        let mut request = CountPointsBuilder::new(self.collection()).exact(true);
        if let Some(predicate) = predicate {
            request = request.filter(Self::compile(predicate)?);
        }
        let response = self.client.count(request).await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    fn dimension(&self) -> Option<usize> {
        match self.dimension.load(Ordering::SeqCst) {
            0 => None,
            dim => Some(dim),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_deterministic() {
        let a = QdrantStore::point_id("f:u:1:en");
        let b = QdrantStore::point_id("f:u:1:en");
        let c = QdrantStore::point_id("f:u:2:en");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn compile_rejects_empty_in_list() {
        assert!(QdrantStore::compile(&Predicate::IdIn(vec![])).is_err());
    }

    #[test]
    fn compile_expands_prefix_predicates() {
        let filter = QdrantStore::compile(&Predicate::SegmentPrefix {
            file_id: "f".into(),
            unit_id: "u".into(),
            segment_index: 2,
        })
        .unwrap();
        assert_eq!(filter.must.len(), 3);
    }

    #[test]
    fn json_conversion_preserves_scalars() {
        let value = Value {
            kind: Some(Kind::StringValue("hello".into())),
        };
        assert_eq!(json_from_qdrant(value), serde_json::json!("hello"));

        let value = Value {
            kind: Some(Kind::IntegerValue(42)),
        };
        assert_eq!(json_from_qdrant(value), serde_json::json!(42));
    }
}
