//! Batch import of ingested entries.
//!
//! Streams the JSONL intermediate produced by an ingestor into the vector
//! store in fixed-size batches: parse line, enqueue, embed the batch,
//! delete any rows with the same ids, insert. Progress is reported
//! through a pluggable observer; the temp file is removed when the import
//! ends, successfully or not.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::entry::PendingEntry;
use crate::error::{Result, TmError};
use crate::ingest::IngestSummary;
use crate::storage::{Predicate, VectorStore};

/// Importer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportConfig {
    /// Entries embedded and written per store round-trip.
    pub batch_size: usize,
    /// Embedding retries per batch before the import fails.
    pub max_retries: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_retries: 1,
        }
    }
}

/// Progress snapshot delivered after every committed batch.
#[derive(Debug, Clone)]
pub struct ImportProgress {
    pub processed: u64,
    pub total: u64,
    pub elapsed: Duration,
    /// Estimated time to completion, absent until a rate is known.
    pub eta: Option<Duration>,
    /// Entries per second so far.
    pub per_second: f64,
}

/// Final import statistics.
#[derive(Debug, Clone)]
pub struct ImportStats {
    pub processed: u64,
    pub skipped_lines: u64,
    pub batches: u64,
    pub elapsed: Duration,
}

/// Observer for import progress.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &ImportProgress);
    fn on_complete(&self, stats: &ImportStats);
}

/// Default observer: prints to stderr.
#[derive(Debug, Default)]
pub struct StderrProgress;

impl ProgressObserver for StderrProgress {
    fn on_progress(&self, progress: &ImportProgress) {
        let eta = progress
            .eta
            .map(|eta| format!("{}s", eta.as_secs()))
            .unwrap_or_else(|| "?".to_string());
        eprintln!(
            "imported {}/{} entries ({:.0}/s, eta {eta})",
            progress.processed, progress.total, progress.per_second
        );
    }

    fn on_complete(&self, stats: &ImportStats) {
        eprintln!(
            "import finished: {} entries in {} batches ({} lines skipped, {:.1}s)",
            stats.processed,
            stats.batches,
            stats.skipped_lines,
            stats.elapsed.as_secs_f64()
        );
    }
}

/// Silent observer for embedded/test use.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressObserver for NullProgress {
    fn on_progress(&self, _progress: &ImportProgress) {}
    fn on_complete(&self, _stats: &ImportStats) {}
}

/// Removes the JSONL temp file when the import ends, on every path.
struct TempFileGuard {
    path: PathBuf,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove import temp file");
            }
        }
    }
}

/// Streams a JSONL intermediate into the store.
pub struct BatchImporter {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: ImportConfig,
    observer: Arc<dyn ProgressObserver>,
}

impl BatchImporter {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: ImportConfig,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            observer,
        }
    }

    /// Run the import. The JSONL file named by `summary` is deleted when
    /// this returns, whether it succeeds, fails, or is cancelled.
    pub async fn run(
        &self,
        summary: IngestSummary,
        cancel: CancellationToken,
    ) -> Result<ImportStats> {
        let _guard = TempFileGuard {
            path: summary.jsonl_path.clone(),
        };
        let started = Instant::now();
        let skipped = Arc::new(AtomicU64::new(0));

        // Bounded channel: the reader backs off while the embed/store
        // pipeline is busy.
        let capacity = self.config.batch_size.max(1) * 2;
        let (tx, mut rx) = mpsc::channel::<PendingEntry>(capacity);
        let reader_task = tokio::spawn(read_lines(
            summary.jsonl_path.clone(),
            tx,
            Arc::clone(&skipped),
            cancel.clone(),
        ));

        let mut batch: Vec<PendingEntry> = Vec::with_capacity(self.config.batch_size);
        let mut processed: u64 = 0;
        let mut batches: u64 = 0;

        let result: Result<()> = loop {
            let next = tokio::select! {
                next = rx.recv() => next,
                _ = cancel.cancelled() => break Err(TmError::Cancelled),
            };
            match next {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= self.config.batch_size {
                        if let Err(e) = self.flush(&mut batch).await {
                            break Err(e);
                        }
                        processed += self.config.batch_size as u64;
                        batches += 1;
                        self.report(processed, summary.entries, started);
                    }
                }
                None => {
                    // End of file: flush the remainder.
                    if batch.is_empty() {
                        break Ok(());
                    }
                    let remainder = batch.len() as u64;
                    if let Err(e) = self.flush(&mut batch).await {
                        break Err(e);
                    }
                    processed += remainder;
                    batches += 1;
                    self.report(processed, summary.entries, started);
                    break Ok(());
                }
            }
        };

        // Stop the reader before the temp file disappears.
        rx.close();
        match reader_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if result.is_ok() => return Err(e),
            Ok(Err(e)) => debug!(error = %e, "reader error after import failure"),
            Err(e) => warn!(error = %e, "import reader task panicked"),
        }
        result?;

        let stats = ImportStats {
            processed,
            skipped_lines: skipped.load(Ordering::SeqCst),
            batches,
            elapsed: started.elapsed(),
        };
        info!(
            processed = stats.processed,
            batches = stats.batches,
            skipped = stats.skipped_lines,
            "import complete"
        );
        self.observer.on_complete(&stats);
        Ok(stats)
    }

    /// Embed and commit one batch. The batch vector is drained on success;
    /// a failure is fatal for the import but leaves previously committed
    /// batches intact.
    async fn flush(&self, batch: &mut Vec<PendingEntry>) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|e| e.pure_text.clone()).collect();

        let mut attempt = 0u32;
        let vectors = loop {
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => break vectors,
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "embedding batch failed, retrying");
                }
                Err(e) => return Err(TmError::ModelUnavailable(e)),
            }
        };

        if let Some(dim) = self.store.dimension() {
            for (entry, vector) in batch.iter().zip(&vectors) {
                if vector.len() != dim {
                    return Err(TmError::DimensionMismatch {
                        id: entry.entry_id().to_string(),
                        expected: dim,
                        got: vector.len(),
                    });
                }
            }
        }

        let ids: Vec<String> = batch.iter().map(|e| e.entry_id().to_string()).collect();
        let entries: Vec<_> = batch
            .drain(..)
            .zip(vectors)
            .map(|(pending, vector)| pending.into_entry(vector))
            .collect();

        self.store.delete_where(&Predicate::IdIn(ids)).await?;
        self.store.upsert_batch(entries).await?;
        Ok(())
    }

    fn report(&self, processed: u64, total: u64, started: Instant) {
        let elapsed = started.elapsed();
        let per_second = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let eta = if per_second > 0.0 && total > processed {
            Some(Duration::from_secs_f64(
                (total - processed) as f64 / per_second,
            ))
        } else {
            None
        };
        self.observer.on_progress(&ImportProgress {
            processed,
            total,
            elapsed,
            eta,
            per_second,
        });
    }
}

/// Reader half: stream lines, parse, forward. Parse failures are logged
/// and counted, never fatal.
async fn read_lines(
    path: PathBuf,
    tx: mpsc::Sender<PendingEntry>,
    skipped: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let reader = tokio::io::BufReader::new(file);
    let mut lines = reader.lines();
    let mut line_number: u64 = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<PendingEntry>(&line) {
            Ok(entry) => {
                if tx.send(entry).await.is_err() {
                    // Consumer gone (import failed or cancelled).
                    return Ok(());
                }
            }
            Err(e) => {
                skipped.fetch_add(1, Ordering::SeqCst);
                warn!(
                    path = %path.display(),
                    line = line_number,
                    error = %e,
                    "skipping malformed JSONL line"
                );
            }
        }
    }
}

/// Write pending entries to a fresh JSONL temp file, for callers that
/// assemble imports programmatically instead of through an ingestor.
pub fn write_jsonl(path: &Path, entries: &[PendingEntry]) -> Result<()> {
    use std::io::Write as _;
    let mut file = std::fs::File::create(path)?;
    for entry in entries {
        serde_json::to_writer(&mut file, entry)?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedder;
    use crate::storage::memory::MemoryStore;

    fn pending(unit_id: &str, language: &str, text: &str) -> PendingEntry {
        PendingEntry {
            file_id: "f1".into(),
            original: "demo.xlf".into(),
            unit_id: unit_id.into(),
            segment_index: 1,
            segment_count: 1,
            language: language.into(),
            pure_text: text.into(),
            element: format!("<source>{text}</source>"),
            metadata: None,
        }
    }

    async fn importer(batch_size: usize) -> (BatchImporter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(HashedEmbedder::new(16));
        store.ensure_schema(16).await.unwrap();
        let importer = BatchImporter::new(
            store.clone(),
            embedder,
            ImportConfig {
                batch_size,
                max_retries: 1,
            },
            Arc::new(NullProgress),
        );
        (importer, store)
    }

    fn summary_for(entries: &[PendingEntry]) -> IngestSummary {
        let file = tempfile::Builder::new()
            .prefix("htm-import-test-")
            .suffix(".jsonl")
            .tempfile()
            .unwrap();
        let path = file.into_temp_path().keep().unwrap();
        write_jsonl(&path, entries).unwrap();
        IngestSummary {
            jsonl_path: path,
            entries: entries.len() as u64,
            src_lang: None,
            trg_lang: None,
        }
    }

    #[tokio::test]
    async fn imports_across_batches_and_removes_temp_file() {
        let (importer, store) = importer(2).await;
        let entries: Vec<PendingEntry> = (0..5)
            .map(|i| pending(&format!("u{i}"), "en", &format!("text {i}")))
            .collect();
        let summary = summary_for(&entries);
        let jsonl_path = summary.jsonl_path.clone();

        let stats = importer
            .run(summary, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.skipped_lines, 0);
        assert_eq!(store.count(None).await.unwrap(), 5);
        assert!(!jsonl_path.exists());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (importer, store) = importer(10).await;
        let entries = vec![pending("u1", "en", "good")];
        let summary = summary_for(&entries);

        // Corrupt the file with a bad line in the middle.
        let mut raw = std::fs::read_to_string(&summary.jsonl_path).unwrap();
        raw.push_str("{not json}\n");
        std::fs::write(&summary.jsonl_path, raw).unwrap();
        let summary = IngestSummary {
            entries: 2,
            ..summary
        };

        let stats = importer
            .run(summary, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped_lines, 1);
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let (importer, store) = importer(10).await;
        let entries = vec![pending("u1", "en", "same"), pending("u1", "es", "mismo")];

        importer
            .run(summary_for(&entries), CancellationToken::new())
            .await
            .unwrap();
        importer
            .run(summary_for(&entries), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_import_and_cleans_up() {
        let (importer, _store) = importer(2).await;
        let entries: Vec<PendingEntry> = (0..100)
            .map(|i| pending(&format!("u{i}"), "en", &format!("text {i}")))
            .collect();
        let summary = summary_for(&entries);
        let jsonl_path = summary.jsonl_path.clone();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = importer.run(summary, cancel).await;
        assert!(matches!(result, Err(TmError::Cancelled)));
        assert!(!jsonl_path.exists());
    }
}
