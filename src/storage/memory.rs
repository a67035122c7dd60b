//! In-memory vector store.
//!
//! Brute-force L2 scan over a `BTreeMap` keyed by canonical id. Satisfies
//! the full [`VectorStore`] contract, so the engine's test suite (and
//! small embedded setups) can run without a Qdrant server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::entry::Entry;
use crate::storage::{Predicate, ScoredEntry, StoreError, VectorStore};

/// In-memory [`VectorStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<String, Entry>>,
    // 0 = schema not created yet.
    dimension: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_dimension(&self) -> Result<usize, StoreError> {
        match self.dimension.load(Ordering::SeqCst) {
            0 => Err(StoreError::SchemaMissing),
            dim => Ok(dim),
        }
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn ensure_schema(&self, dim: usize) -> Result<(), StoreError> {
        if dim == 0 {
            return Err(StoreError::Schema("dimension must be non-zero".into()));
        }
        let previous = self
            .dimension
            .compare_exchange(0, dim, Ordering::SeqCst, Ordering::SeqCst);
        match previous {
            Ok(_) => Ok(()),
            Err(existing) if existing == dim => Ok(()),
            Err(existing) => Err(StoreError::Schema(format!(
                "table already created with dimension {existing}, requested {dim}"
            ))),
        }
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

        let rows = self.rows.read().await;
        let mut hits: Vec<ScoredEntry> = rows
            .values()
            .filter(|entry| predicate.map_or(true, |p| p.matches(entry)))
            .filter_map(|entry| {
                entry.vector.as_ref().map(|v| ScoredEntry {
                    entry: entry.clone(),
                    distance: l2_distance(vector, v),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn query(
        &self,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>, StoreError> {
        let rows = self.rows.read().await;
        let mut matched: Vec<Entry> = rows
            .values()
            .filter(|entry| predicate.matches(entry))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn upsert_batch(&self, entries: Vec<Entry>) -> Result<usize, StoreError> {
        let dim = self.require_dimension()?;
        for entry in &entries {
            match &entry.vector {
                Some(vector) if vector.len() == dim => {}
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
            }
        }

        let mut rows = self.rows.write().await;
        let inserted = entries.len();
        for entry in entries {
            rows.insert(entry.canonical_id(), entry);
        }
        Ok(inserted)
    }

    async fn delete_where(&self, predicate: &Predicate) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let doomed: Vec<String> = rows
            .values()
            .filter(|entry| predicate.matches(entry))
            .map(Entry::canonical_id)
            .collect();
        for id in &doomed {
            rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn count(&self, predicate: Option<&Predicate>) -> Result<u64, StoreError> {
        let rows = self.rows.read().await;
        let count = match predicate {
            None => rows.len(),
            Some(p) => rows.values().filter(|entry| p.matches(entry)).count(),
        };
        Ok(count as u64)
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
    use crate::entry::EntryId;

    fn entry(unit_id: &str, index: u32, language: &str, vector: Vec<f32>) -> Entry {
        Entry {
            id: EntryId::new("f1", unit_id, index, language),
            pure_text: format!("text {unit_id} {index}"),
            element: String::new(),
            original: "demo.xlf".into(),
            segment_count: 1,
            vector: Some(vector),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent_but_dimension_is_fixed() {
        let store = MemoryStore::new();
        store.ensure_schema(3).await.unwrap();
        store.ensure_schema(3).await.unwrap();
        assert!(store.ensure_schema(4).await.is_err());
        assert_eq!(store.dimension(), Some(3));
    }

    #[tokio::test]
    async fn rejects_wrong_vector_length() {
        let store = MemoryStore::new();
        store.ensure_schema(3).await.unwrap();
        let bad = entry("u1", 1, "en", vec![1.0, 0.0]);
        assert!(matches!(
            store.upsert_batch(vec![bad]).await,
            Err(StoreError::WrongVectorLength { expected: 3, got: 2 })
        ));
    }

    #[tokio::test]
    async fn vector_search_orders_by_distance() {
        let store = MemoryStore::new();
        store.ensure_schema(2).await.unwrap();
        store
            .upsert_batch(vec![
                entry("u1", 1, "en", vec![1.0, 0.0]),
                entry("u2", 1, "en", vec![0.0, 1.0]),
                entry("u3", 1, "en", vec![0.8, 0.6]),
            ])
            .await
            .unwrap();

        let hits = store
            .vector_search(&[1.0, 0.0], None, Some(2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.id.unit_id, "u1");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn search_respects_language_predicate() {
        let store = MemoryStore::new();
        store.ensure_schema(2).await.unwrap();
        store
            .upsert_batch(vec![
                entry("u1", 1, "en", vec![1.0, 0.0]),
                entry("u1", 1, "es", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .vector_search(&[1.0, 0.0], Some(&Predicate::LanguageEq("es".into())), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id.language, "es");
    }

    #[tokio::test]
    async fn delete_where_reports_count() {
        let store = MemoryStore::new();
        store.ensure_schema(2).await.unwrap();
        store
            .upsert_batch(vec![
                entry("u1", 1, "en", vec![1.0, 0.0]),
                entry("u1", 2, "en", vec![1.0, 0.0]),
                entry("u2", 1, "en", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_where(&Predicate::UnitPrefix {
                file_id: "f1".into(),
                unit_id: "u1".into(),
            })
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = MemoryStore::new();
        store.ensure_schema(2).await.unwrap();
        store
            .upsert_batch(vec![entry("u1", 1, "en", vec![1.0, 0.0])])
            .await
            .unwrap();
        let mut replacement = entry("u1", 1, "en", vec![0.0, 1.0]);
        replacement.pure_text = "replaced".into();
        store.upsert_batch(vec![replacement]).await.unwrap();

        assert_eq!(store.count(None).await.unwrap(), 1);
        let rows = store
            .query(&Predicate::IdEq("f1:u1:1:en".into()), None)
            .await
            .unwrap();
        assert_eq!(rows[0].pure_text, "replaced");
    }
}
