//! Embedding generation.
//!
//! The engine reaches its embedding model through the [`Embedder`]
//! contract: probe the output dimension once, then map text to
//! L2-normalized vectors. [`FastEmbedder`] is the production
//! implementation over the fastembed ONNX runtime; [`HashedEmbedder`] is
//! a deterministic, model-free implementation that satisfies the same
//! contract for hermetic tests and offline smoke setups.
//!
//! All embeddings stored in one memory and all query embeddings against
//! it must come from the same model configured at open time.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Fixed probe input used to discover the model's output dimension.
const PROBE_TEXT: &str = "dimension probe";

/// Errors from embedding initialization or inference.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("model initialization failed: {message}")]
    Initialization { message: String },

    #[error("embedding generation failed: {message}")]
    Generation { message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

/// Contract mapping text to a normalized fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a fixed short probe string and return the vector length.
    async fn probe_dimension(&self) -> Result<usize, EmbeddingError>;

    /// Return an L2-normalized vector for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Scale a vector to unit L2 length. Zero vectors are returned unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Configuration for [`FastEmbedder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastEmbedConfig {
    /// Directory for downloaded model files. Default: fastembed's own
    /// cache directory.
    #[serde(default)]
    pub model_cache_dir: Option<PathBuf>,
    /// ONNX intra-op threads per session.
    #[serde(default)]
    pub num_threads: Option<usize>,
    #[serde(default)]
    pub show_download_progress: bool,
}

impl Default for FastEmbedConfig {
    fn default() -> Self {
        Self {
            model_cache_dir: None,
            num_threads: Some(2),
            show_download_progress: false,
        }
    }
}

/// Embedder over fastembed's `all-MiniLM-L6-v2`.
///
/// The model is initialized lazily on first use; initialization failure
/// surfaces as [`EmbeddingError::Initialization`] (the engine maps it to
/// its `ModelUnavailable` error kind). The session is guarded by a mutex:
/// inference is not concurrent within one engine instance.
pub struct FastEmbedder {
    config: FastEmbedConfig,
    model: Arc<Mutex<Option<TextEmbedding>>>,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("config", &self.config)
            .finish()
    }
}

impl FastEmbedder {
    pub fn new(config: FastEmbedConfig) -> Self {
        Self {
            config,
            model: Arc::new(Mutex::new(None)),
        }
    }

    async fn with_model<T>(
        &self,
        op: impl FnOnce(&mut TextEmbedding) -> Result<T, EmbeddingError>,
    ) -> Result<T, EmbeddingError> {
        let mut guard = self.model.lock().await;
        if guard.is_none() {
            let mut options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(self.config.show_download_progress);
            if let Some(threads) = self.config.num_threads {
                options = options.with_num_threads(threads);
            }
            if let Some(cache_dir) = &self.config.model_cache_dir {
                options = options.with_cache_dir(cache_dir.clone());
            }

            info!("initializing fastembed model (all-MiniLM-L6-v2)");
            let model = TextEmbedding::try_new(options).map_err(|e| {
                EmbeddingError::Initialization {
                    message: e.to_string(),
                }
            })?;
            *guard = Some(model);
        }

        let model = guard.as_mut().expect("model initialized above");
        op(model)
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn probe_dimension(&self) -> Result<usize, EmbeddingError> {
        let vector = self.embed(PROBE_TEXT).await?;
        Ok(vector.len())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let batch = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Generation {
                message: "model returned no embedding".into(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<String> = texts.to_vec();
        let mut vectors = self
            .with_model(move |model| {
                model
                    .embed(inputs, None)
                    .map_err(|e| EmbeddingError::Generation {
                        message: e.to_string(),
                    })
            })
            .await?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Generation {
                message: format!(
                    "model returned {} embeddings for {} inputs",
                    vectors.len(),
                    texts.len()
                ),
            });
        }
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

/// Deterministic bag-of-words embedder.
///
/// Tokens are lowercased, hashed into a fixed number of buckets, and the
/// bucket counts are L2-normalized. Overlapping texts therefore land close
/// in vector space, which is all the engine contracts require. No model
/// download, no I/O.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "dimension must be non-zero");
        Self { dimension }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.dimension as u64) as usize
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    async fn probe_dimension(&self) -> Result<usize, EmbeddingError> {
        Ok(self.dimension)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(&token.to_lowercase())] += 1.0;
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embedder_is_deterministic_and_normalized() {
        let embedder = HashedEmbedder::new(32);
        let a = embedder.embed("Hello world").await.unwrap();
        let b = embedder.embed("Hello world").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_are_closer_than_dissimilar() {
        let embedder = HashedEmbedder::new(64);
        let query = embedder.embed("save the settings").await.unwrap();
        let close = embedder.embed("save settings").await.unwrap();
        let far = embedder.embed("unrelated quarterly report").await.unwrap();

        let dist = |a: &[f32], b: &[f32]| -> f32 {
            a.iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt()
        };
        assert!(dist(&query, &close) < dist(&query, &far));
    }

    #[tokio::test]
    async fn probe_matches_embedding_length() {
        let embedder = HashedEmbedder::new(48);
        let dim = embedder.probe_dimension().await.unwrap();
        let vector = embedder.embed("probe").await.unwrap();
        assert_eq!(dim, vector.len());
        assert_eq!(dim, 48);
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let embedder = HashedEmbedder::new(16);
        let vector = embedder.embed("").await.unwrap();
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn normalize_handles_zero_vector() {
        let mut vector = vec![0.0f32; 4];
        l2_normalize(&mut vector);
        assert!(vector.iter().all(|v| *v == 0.0));
    }
}
