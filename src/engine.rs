//! The translation memory engine: search and write API.
//!
//! A [`TmEngine`] owns one embedder and one vector-store connection for
//! its lifetime. Writes are serialized per instance; reads run
//! concurrently and treat concurrent upserts on the same id as
//! last-writer-wins. Queries combine vector distance (semantic score)
//! with lexical similarity (fuzzy score) into the hybrid score that
//! drives thresholding, and a richer ranking score that drives ordering.
//!
//! Every operation takes an optional caller-supplied cancellation token
//! alongside the engine's own shutdown token. A cancelled operation
//! returns [`TmError::Cancelled`] and discards partial results; writes
//! are never left half-applied beyond the store's own delete-then-insert
//! visibility.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::embedding::Embedder;
use crate::entry::{Entry, EntryId, EntryMetadata, WorkflowState};
use crate::error::{Result, TmError};
use crate::filter::{SearchFilter, TranslationFilters};
use crate::import::{BatchImporter, ImportStats, ProgressObserver};
use crate::ingest::{ingest_tmx, ingest_xliff, IngestOptions};
use crate::match_quality;
use crate::storage::{Predicate, ScoredEntry, VectorStore};

/// Fallback-pairing scan width: how many unit-prefix rows are considered
/// when no exact-index target exists.
const PAIRING_SCAN_LIMIT: usize = 50;

/// Input record for [`TmEngine::store_lang_entry`].
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub file_id: String,
    pub original: String,
    pub unit_id: String,
    pub language: String,
    pub pure_text: String,
    pub element: String,
    /// Precomputed embedding; embedded from `pure_text` when absent.
    pub vector: Option<Vec<f32>>,
    pub segment_index: u32,
    pub segment_count: u32,
    pub metadata: Option<EntryMetadata>,
}

impl NewEntry {
    pub fn new(
        file_id: impl Into<String>,
        original: impl Into<String>,
        unit_id: impl Into<String>,
        language: impl Into<String>,
        pure_text: impl Into<String>,
        element: impl Into<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            original: original.into(),
            unit_id: unit_id.into(),
            language: language.into(),
            pure_text: pure_text.into(),
            element: element.into(),
            vector: None,
            segment_index: 0,
            segment_count: 1,
            metadata: None,
        }
    }

    pub fn with_segment(mut self, segment_index: u32, segment_count: u32) -> Self {
        self.segment_index = segment_index;
        self.segment_count = segment_count;
        self
    }

    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    fn entry_id(&self) -> EntryId {
        EntryId::new(
            self.file_id.clone(),
            self.unit_id.clone(),
            self.segment_index,
            self.language.clone(),
        )
    }
}

/// One bilingual hit from translation search.
#[derive(Debug, Clone)]
pub struct TranslationMatch {
    pub source: Entry,
    pub target: Entry,
    /// Name of the engine instance that produced the match.
    pub origin: String,
    /// Vector-distance derived score, 0–100.
    pub semantic: u8,
    /// Lexical score, 0–100.
    pub fuzzy: u8,
}

impl TranslationMatch {
    /// Rounded arithmetic mean of the semantic and fuzzy scores.
    pub fn hybrid_score(&self) -> u8 {
        hybrid_of(self.semantic, self.fuzzy)
    }
}

fn hybrid_of(semantic: u8, fuzzy: u8) -> u8 {
    // Integer round-half-up of (semantic + fuzzy) / 2.
    ((u16::from(semantic) + u16::from(fuzzy) + 1) / 2) as u8
}

/// Convert a reported L2 distance over unit vectors into a 0–100 score.
fn semantic_score(distance: f32) -> u8 {
    (((2.0 - f64::from(distance)).max(0.0) / 2.0) * 100.0).round() as u8
}

/// The engine. See the module docs for the concurrency model.
pub struct TmEngine {
    name: String,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: EngineConfig,
    write_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for TmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmEngine")
            .field("name", &self.name)
            .field("dimension", &self.store.dimension())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TmEngine {
    /// Open an engine over a store and embedder. Probes the embedder for
    /// its output dimension and creates the store schema when needed.
    pub async fn open(
        config: EngineConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let dim = embedder.probe_dimension().await?;
        store.ensure_schema(dim).await?;
        info!(name = %config.name, dim, "translation memory engine opened");
        Ok(Self {
            name: config.name.clone(),
            store,
            embedder,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idempotent shutdown: pending cooperative loops observe the
    /// cancellation and later calls fail with `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
            info!(name = %self.name, "engine closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TmError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Cooperative cancellation point: honors both the engine's shutdown
    /// token and the caller's token.
    fn check_cancelled(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        if self.shutdown.is_cancelled() || cancel.map_or(false, |c| c.is_cancelled()) {
            return Err(TmError::Cancelled);
        }
        Ok(())
    }

    async fn vector_for(&self, pure_text: &str, provided: Option<Vec<f32>>, id: &EntryId) -> Result<Vec<f32>> {
        let vector = match provided {
            Some(vector) => vector,
            None => self.embedder.embed(pure_text).await?,
        };
        if let Some(dim) = self.store.dimension() {
            if vector.len() != dim {
                return Err(TmError::DimensionMismatch {
                    id: id.to_string(),
                    expected: dim,
                    got: vector.len(),
                });
            }
        }
        Ok(vector)
    }

    /// Store one entry, replacing any row with the same canonical id.
    ///
    /// Idempotent on unchanged content: when `pure_text`, `element` and
    /// `original` all match the stored row, nothing is written and the
    /// stored row is returned.
    #[instrument(skip_all, fields(engine = %self.name))]
    pub async fn store_lang_entry(
        &self,
        new: NewEntry,
        cancel: Option<&CancellationToken>,
    ) -> Result<Entry> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let id = new.entry_id();
        let _write = self.write_lock.lock().await;
        self.check_cancelled(cancel)?;

        let existing = self
            .store
            .query(&Predicate::IdEq(id.to_string()), Some(1))
            .await?
            .into_iter()
            .next();
        if let Some(existing) = existing {
            if existing.pure_text == new.pure_text
                && existing.element == new.element
                && existing.original == new.original
            {
                debug!(id = %id, "content unchanged, skipping write");
                return Ok(existing);
            }
        }

        let vector = self.vector_for(&new.pure_text, new.vector.clone(), &id).await?;
        let entry = Entry {
            id: id.clone(),
            pure_text: new.pure_text,
            element: new.element,
            original: new.original,
            segment_count: new.segment_count,
            vector: Some(vector),
            metadata: new.metadata.filter(|m| !m.is_empty()),
        };

        self.store
            .delete_where(&Predicate::IdEq(id.to_string()))
            .await?;
        self.store.upsert_batch(vec![entry.clone()]).await?;
        Ok(entry)
    }

    /// Store a batch: embed in order, one bulk delete over the batch ids,
    /// one bulk insert.
    #[instrument(skip_all, fields(engine = %self.name, count = entries.len()))]
    pub async fn store_batch_entries(
        &self,
        entries: Vec<NewEntry>,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(0);
        }
        let _write = self.write_lock.lock().await;

        let mut rows = Vec::with_capacity(entries.len());
        let mut ids = Vec::with_capacity(entries.len());
        for new in entries {
            self.check_cancelled(cancel)?;
            let id = new.entry_id();
            let vector = self.vector_for(&new.pure_text, new.vector.clone(), &id).await?;
            ids.push(id.to_string());
            rows.push(Entry {
                id,
                pure_text: new.pure_text,
                element: new.element,
                original: new.original,
                segment_count: new.segment_count,
                vector: Some(vector),
                metadata: new.metadata.filter(|m| !m.is_empty()),
            });
        }

        self.store.delete_where(&Predicate::IdIn(ids)).await?;
        let inserted = self.store.upsert_batch(rows).await?;
        Ok(inserted)
    }

    /// Delete one entry, or every segment of a unit's language side when
    /// `segment_index` is `None`. Returns `false` when nothing matched.
    pub async fn delete_lang_entry(
        &self,
        file_id: &str,
        unit_id: &str,
        language: &str,
        segment_index: Option<u32>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let _write = self.write_lock.lock().await;
        self.check_cancelled(cancel)?;

        let predicate = match segment_index {
            Some(segment_index) => Predicate::IdEq(
                EntryId::new(file_id, unit_id, segment_index, language).to_string(),
            ),
            None => Predicate::and([
                Predicate::UnitPrefix {
                    file_id: file_id.to_string(),
                    unit_id: unit_id.to_string(),
                },
                Predicate::LanguageEq(language.to_string()),
            ]),
        };
        let removed = self.store.delete_where(&predicate).await?;
        Ok(removed > 0)
    }

    pub async fn entry_exists(
        &self,
        file_id: &str,
        unit_id: &str,
        segment_index: u32,
        language: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let id = EntryId::new(file_id, unit_id, segment_index, language);
        let rows = self
            .store
            .query(&Predicate::IdEq(id.to_string()), Some(1))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Fetch one entry by its canonical id components. Fails with
    /// `NotFound` for absent ids.
    pub async fn get_lang_entry(
        &self,
        file_id: &str,
        unit_id: &str,
        segment_index: u32,
        language: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Entry> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let id = EntryId::new(file_id, unit_id, segment_index, language);
        self.store
            .query(&Predicate::IdEq(id.to_string()), Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or(TmError::NotFound { id: id.to_string() })
    }

    /// Case-insensitive substring search over one language, returning all
    /// language variants of every matching segment.
    ///
    /// Each result maps `language -> element` for one unique segment
    /// descriptor `(fileId, unitId, segmentIndex)`, in first-seen order.
    #[instrument(skip_all, fields(engine = %self.name, language))]
    pub async fn concordance_search(
        &self,
        fragment: &str,
        language: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let needle = fragment.to_lowercase();
        let rows = self
            .store
            .query(&Predicate::LanguageEq(language.to_string()), None)
            .await?;

        let mut seen: Vec<(String, String, u32)> = Vec::new();
        let mut results = Vec::new();
        for entry in rows {
            self.check_cancelled(cancel)?;
            if results.len() >= limit {
                break;
            }
            if !entry.pure_text.to_lowercase().contains(&needle) {
                continue;
            }
            if let Some(filter) = filter {
                if !filter.matches(entry.metadata.as_ref()) {
                    continue;
                }
            }

            let descriptor = (
                entry.id.file_id.clone(),
                entry.id.unit_id.clone(),
                entry.id.segment_index,
            );
            if seen.contains(&descriptor) {
                continue;
            }
            seen.push(descriptor.clone());

            let variants = self
                .store
                .query(
                    &Predicate::SegmentPrefix {
                        file_id: descriptor.0,
                        unit_id: descriptor.1,
                        segment_index: descriptor.2,
                    },
                    None,
                )
                .await?;

            let mut mapping = BTreeMap::new();
            for variant in variants {
                if let Err(e) = validate_fragment(&variant.canonical_id(), &variant.element) {
                    warn!(error = %e, "dropping variant with malformed element");
                    continue;
                }
                mapping.insert(variant.id.language.clone(), variant.element);
            }
            if !mapping.is_empty() {
                results.push(mapping);
            }
        }
        Ok(results)
    }

    /// Monolingual semantic search: embed the query, vector-search within
    /// one language, apply the metadata filter.
    #[instrument(skip_all, fields(engine = %self.name, language))]
    pub async fn semantic_search(
        &self,
        query_text: &str,
        language: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let vector = self.embedder.embed(query_text).await?;
        self.check_cancelled(cancel)?;
        let hits = self
            .store
            .vector_search(
                &vector,
                Some(&Predicate::LanguageEq(language.to_string())),
                Some(limit),
            )
            .await?;

        let mut entries = Vec::with_capacity(hits.len());
        for ScoredEntry { entry, .. } in hits {
            if let Some(filter) = filter {
                if !filter.matches(entry.metadata.as_ref()) {
                    continue;
                }
            }
            if let Err(e) = validate_fragment(&entry.canonical_id(), &entry.element) {
                warn!(error = %e, "dropping hit with malformed element");
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Bilingual translation search with target pairing and ranking.
    ///
    /// Candidates come from a vector search over the source language,
    /// are thresholded on the hybrid score, paired with their best
    /// target-language counterpart, and returned ordered by the ranking
    /// score (hybrid plus pairing, quality, recency and state bonuses).
    #[instrument(skip_all, fields(engine = %self.name, src_lang, tgt_lang, min_score))]
    pub async fn semantic_translation_search(
        &self,
        query_text: &str,
        src_lang: &str,
        tgt_lang: &str,
        min_score: u8,
        limit: usize,
        filters: Option<&TranslationFilters>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<TranslationMatch>> {
        self.ensure_open()?;
        self.check_cancelled(cancel)?;
        let vector = self.embedder.embed(query_text).await?;
        self.check_cancelled(cancel)?;
        let candidates = self
            .store
            .vector_search(
                &vector,
                Some(&Predicate::LanguageEq(src_lang.to_string())),
                None,
            )
            .await?;
        debug!(candidates = candidates.len(), "translation search candidates");

        let source_filter = filters.and_then(TranslationFilters::source_side);
        let target_filter = filters.and_then(TranslationFilters::target_side);

        let mut matches: Vec<(f64, usize, TranslationMatch)> = Vec::new();
        for (position, ScoredEntry { entry, distance }) in candidates.into_iter().enumerate() {
            self.check_cancelled(cancel)?;

            if let Some(filter) = source_filter {
                if !filter.matches(entry.metadata.as_ref()) {
                    continue;
                }
            }

            let semantic = semantic_score(distance);
            let fuzzy = match_quality::similarity(query_text, &entry.pure_text);
            if hybrid_of(semantic, fuzzy) < min_score {
                continue;
            }

            if let Err(e) = validate_fragment(&entry.canonical_id(), &entry.element) {
                warn!(error = %e, "dropping candidate with malformed element");
                continue;
            }

            let Some(target) = self.find_target_entry(&entry, tgt_lang, target_filter).await? else {
                continue;
            };

            let matched = TranslationMatch {
                source: entry,
                target,
                origin: self.name.clone(),
                semantic,
                fuzzy,
            };
            let rank = rank_score(&matched);
            matches.push((rank, position, matched));
        }

        // Rank descending; distance order breaks ties.
        matches.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|(_, _, matched)| matched)
            .collect())
    }

    /// Target pairing: exact id first, then unit-prefix fallback with
    /// segment-index preference.
    async fn find_target_entry(
        &self,
        source: &Entry,
        tgt_lang: &str,
        filter: Option<&SearchFilter>,
    ) -> Result<Option<Entry>> {
        let exact_id = EntryId::new(
            source.id.file_id.clone(),
            source.id.unit_id.clone(),
            source.id.segment_index,
            tgt_lang,
        );
        let exact = self
            .store
            .query(&Predicate::IdEq(exact_id.to_string()), Some(1))
            .await?
            .into_iter()
            .find(|entry| accepts(filter, entry));
        if let Some(entry) = exact {
            if validate_fragment(&entry.canonical_id(), &entry.element).is_ok() {
                return Ok(Some(entry));
            }
        }

        let siblings = self
            .store
            .query(
                &Predicate::and([
                    Predicate::UnitPrefix {
                        file_id: source.id.file_id.clone(),
                        unit_id: source.id.unit_id.clone(),
                    },
                    Predicate::LanguageEq(tgt_lang.to_string()),
                ]),
                Some(PAIRING_SCAN_LIMIT),
            )
            .await?;
        let usable: Vec<Entry> = siblings
            .into_iter()
            .filter(|entry| accepts(filter, entry))
            .filter(|entry| {
                validate_fragment(&entry.canonical_id(), &entry.element)
                    .map_err(|e| warn!(error = %e, "dropping pairing candidate"))
                    .is_ok()
            })
            .collect();

        if source.id.segment_index > 0 {
            if let Some(same) = usable
                .iter()
                .find(|entry| entry.id.segment_index == source.id.segment_index)
            {
                return Ok(Some(same.clone()));
            }
        }
        if let Some(segment_level) = usable.iter().find(|entry| entry.id.segment_index > 0) {
            return Ok(Some(segment_level.clone()));
        }
        Ok(usable.into_iter().next())
    }

    /// Ingest an XLIFF 2.x file and import it. The blocking SAX walk runs
    /// on the blocking pool; the import honors `cancel`.
    pub async fn import_xliff(
        &self,
        path: &Path,
        options: IngestOptions,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancellationToken,
    ) -> Result<ImportStats> {
        self.ensure_open()?;
        let owned = path.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || ingest_xliff(&owned, &options))
            .await
            .map_err(|e| TmError::Io(std::io::Error::other(e)))??;
        let _write = self.write_lock.lock().await;
        BatchImporter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.embedder),
            self.config.import.clone(),
            observer,
        )
        .run(summary, cancel)
        .await
    }

    /// Ingest a TMX 1.4b file and import it.
    pub async fn import_tmx(
        &self,
        path: &Path,
        options: IngestOptions,
        observer: Arc<dyn ProgressObserver>,
        cancel: CancellationToken,
    ) -> Result<ImportStats> {
        self.ensure_open()?;
        let owned = path.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || ingest_tmx(&owned, &options))
            .await
            .map_err(|e| TmError::Io(std::io::Error::other(e)))??;
        let _write = self.write_lock.lock().await;
        BatchImporter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.embedder),
            self.config.import.clone(),
            observer,
        )
        .run(summary, cancel)
        .await
    }
}

fn accepts(filter: Option<&SearchFilter>, entry: &Entry) -> bool {
    filter.map_or(true, |f| f.matches(entry.metadata.as_ref()))
}

/// Re-parse a stored element fragment; failure means the row cannot be
/// hydrated and must be dropped from result sets.
fn validate_fragment(id: &str, element: &str) -> Result<()> {
    let mut reader = quick_xml::Reader::from_str(element);
    let mut depth = 0i64;
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(_)) => depth += 1,
            Ok(quick_xml::events::Event::End(_)) => {
                depth -= 1;
                if depth < 0 {
                    return Err(TmError::hydration(id, "unbalanced end tag"));
                }
            }
            Ok(quick_xml::events::Event::Eof) => {
                if depth != 0 {
                    return Err(TmError::hydration(id, "unclosed element"));
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(TmError::hydration(id, e.to_string())),
        }
    }
}

/// Ranking score: used for ordering only, never for threshold tests.
fn rank_score(matched: &TranslationMatch) -> f64 {
    let mut rank = f64::from(matched.hybrid_score());

    let src_index = matched.source.id.segment_index;
    let tgt_index = matched.target.id.segment_index;
    if src_index > 0 && tgt_index > 0 {
        rank += if src_index == tgt_index { 10.0 } else { 5.0 };
    }

    if let Some(meta) = &matched.target.metadata {
        if let Some(quality) = meta.quality {
            rank += f64::from(quality.clamp(0, 100)) / 20.0;
        }
        if let Some(timestamp) = meta.effective_timestamp() {
            let age_days = (Utc::now() - timestamp).num_seconds().max(0) as f64 / 86_400.0;
            rank += (5.0 * (1.0 - age_days / 365.0)).clamp(0.0, 5.0);
        }
        rank += match meta.state {
            Some(WorkflowState::Final) => 3.0,
            Some(WorkflowState::Reviewed) => 2.0,
            Some(WorkflowState::Translated) => 1.0,
            Some(WorkflowState::Initial) | None => 0.0,
        };
    }
    rank
}
