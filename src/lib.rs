//! Hybrid translation memory engine.
//!
//! A bilingual segment store that retrieves previously translated
//! material by combining lexical (longest-common-substring) similarity
//! with dense-vector semantic similarity, and pairs each source-language
//! hit with its best target-language counterpart.
//!
//! The pipeline: XLIFF 2.x / TMX 1.4b files stream through a SAX-driven
//! ingestor into a JSONL intermediate, which the batch importer embeds
//! and bulk-loads into the vector store. Queries enter through
//! [`engine::TmEngine`], which vectorizes the query text, searches the
//! store under a language restriction, applies metadata filters, scores
//! candidates lexically, pairs targets, and ranks the results.

pub mod config;
pub mod embedding;
pub mod engine;
pub mod entry;
pub mod error;
pub mod filter;
pub mod import;
pub mod ingest;
pub mod logging;
pub mod match_quality;
pub mod storage;

pub use crate::config::EngineConfig;
pub use crate::embedding::{Embedder, EmbeddingError, FastEmbedConfig, FastEmbedder, HashedEmbedder};
pub use crate::engine::{NewEntry, TmEngine, TranslationMatch};
pub use crate::entry::{
    Entry, EntryId, EntryMetadata, PendingEntry, SegmentProvenance, WorkflowState,
};
pub use crate::error::{Result, TmError};
pub use crate::filter::{SearchFilter, TranslationFilters};
pub use crate::import::{
    BatchImporter, ImportConfig, ImportProgress, ImportStats, NullProgress, ProgressObserver,
    StderrProgress,
};
pub use crate::ingest::{ingest_tmx, ingest_xliff, IngestOptions, IngestSummary};
pub use crate::logging::{initialize_logging, LoggingConfig};
pub use crate::match_quality::{similarity, PENALTY};
pub use crate::storage::{
    memory::MemoryStore, qdrant::QdrantStore, qdrant::QdrantStoreConfig, Predicate, ScoredEntry,
    StoreError, VectorStore,
};
