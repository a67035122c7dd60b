//! Vector-store abstraction.
//!
//! The engine talks to its store through the narrow [`VectorStore`]
//! contract: schema creation with a fixed vector dimension, distance-
//! ordered vector search with an optional predicate, filter-only scans,
//! batched upsert, and delete-by-predicate. Two adapters implement it:
//! a Qdrant-backed one ([`qdrant::QdrantStore`]) and an in-memory
//! brute-force one ([`memory::MemoryStore`]) used by tests and embedded
//! setups.

pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use thiserror::Error;

use crate::entry::Entry;

/// Storage-related errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("predicate compilation error: {0}")]
    Predicate(String),

    #[error("batch operation error: {0}")]
    Batch(String),

    #[error("vector length {got} does not match table dimension {expected}")]
    WrongVectorLength { expected: usize, got: usize },

    #[error("schema not created yet; call ensure_schema first")]
    SchemaMissing,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("qdrant error: {0}")]
    Qdrant(Box<qdrant_client::QdrantError>),
}

impl From<qdrant_client::QdrantError> for StoreError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        StoreError::Qdrant(Box::new(err))
    }
}

/// Row filter supported by every adapter.
///
/// The canonical-id contract is "equality, `starts_with(id, prefix)`, and
/// `IN` over id strings". Prefixes always end at a component boundary
/// (`fileId:unitId:` or `fileId:unitId:segmentIndex:`), and components may
/// themselves contain colons, so the prefix forms are expressed over the
/// id components instead of by string matching.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `id == value` (full canonical id).
    IdEq(String),
    /// `id IN (values)`.
    IdIn(Vec<String>),
    /// `starts_with(id, "fileId:unitId:")`.
    UnitPrefix { file_id: String, unit_id: String },
    /// `starts_with(id, "fileId:unitId:segmentIndex:")`.
    SegmentPrefix {
        file_id: String,
        unit_id: String,
        segment_index: u32,
    },
    /// `language == value`.
    LanguageEq(String),
    /// Conjunction.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Conjunction builder that flattens nested `And`s.
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut flat = Vec::new();
        for predicate in predicates {
            match predicate {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().expect("single element")
        } else {
            Predicate::And(flat)
        }
    }

    /// Evaluate against a hydrated entry. Adapters without native filter
    /// pushdown (and tests) share this evaluation.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Predicate::IdEq(id) => entry.canonical_id() == *id,
            Predicate::IdIn(ids) => {
                let id = entry.canonical_id();
                ids.iter().any(|candidate| *candidate == id)
            }
            Predicate::UnitPrefix { file_id, unit_id } => {
                entry.id.file_id == *file_id && entry.id.unit_id == *unit_id
            }
            Predicate::SegmentPrefix {
                file_id,
                unit_id,
                segment_index,
            } => {
                entry.id.file_id == *file_id
                    && entry.id.unit_id == *unit_id
                    && entry.id.segment_index == *segment_index
            }
            Predicate::LanguageEq(language) => entry.id.language == *language,
            Predicate::And(predicates) => predicates.iter().all(|p| p.matches(entry)),
        }
    }
}

/// A vector-search hit: the hydrated entry plus its reported distance.
///
/// Distance is L2 over unit-length vectors, so it lies in `[0, 2]`;
/// results are ordered ascending.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: Entry,
    pub distance: f32,
}

/// Contract over the columnar vector store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the table/collection with a fixed-length vector column if it
    /// does not exist yet. Idempotent.
    async fn ensure_schema(&self, dim: usize) -> Result<(), StoreError>;

    /// Distance-ordered search, optionally filtered. `limit: None` means
    /// "as many as the backend allows" (candidates are pruned by score
    /// downstream).
    async fn vector_search(
        &self,
        vector: &[f32],
        predicate: Option<&Predicate>,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredEntry>, StoreError>;

    /// Filter-only scan.
    async fn query(
        &self,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>, StoreError>;

    /// Insert a batch of rows. Every entry must carry a vector of the
    /// schema dimension; the caller is responsible for deleting existing
    /// rows with the same ids first. Returns the number inserted.
    async fn upsert_batch(&self, entries: Vec<Entry>) -> Result<usize, StoreError>;

    /// Delete every row matching the predicate. Returns the matched count
    /// where the backend reports one.
    async fn delete_where(&self, predicate: &Predicate) -> Result<u64, StoreError>;

    /// Row count, optionally filtered.
    async fn count(&self, predicate: Option<&Predicate>) -> Result<u64, StoreError>;

    /// The dimension fixed at schema creation, if created.
    fn dimension(&self) -> Option<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryId;

    fn entry(file_id: &str, unit_id: &str, index: u32, language: &str) -> Entry {
        Entry {
            id: EntryId::new(file_id, unit_id, index, language),
            pure_text: String::new(),
            element: String::new(),
            original: String::new(),
            segment_count: 1,
            vector: None,
            metadata: None,
        }
    }

    #[test]
    fn unit_prefix_ignores_colons_inside_components() {
        // "a:b" + "c" and "a" + "b:c" render the same string prefix but
        // are different units; the structural predicate tells them apart.
        let left = entry("a:b", "c", 1, "en");
        let right = entry("a", "b:c", 1, "en");
        let predicate = Predicate::UnitPrefix {
            file_id: "a:b".into(),
            unit_id: "c".into(),
        };
        assert!(predicate.matches(&left));
        assert!(!predicate.matches(&right));
    }

    #[test]
    fn and_flattens() {
        let predicate = Predicate::and([
            Predicate::LanguageEq("en".into()),
            Predicate::And(vec![Predicate::IdEq("f:u:1:en".into())]),
        ]);
        match predicate {
            Predicate::And(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn id_in_matches_any() {
        let e = entry("f", "u", 1, "en");
        let hit = Predicate::IdIn(vec!["x".into(), "f:u:1:en".into()]);
        let miss = Predicate::IdIn(vec!["x".into()]);
        assert!(hit.matches(&e));
        assert!(!miss.matches(&e));
    }
}
