//! Error types for the hybrid translation memory engine.
//!
//! Each subsystem defines its own `thiserror` enum (see `storage`,
//! `embedding`); this module provides the crate-level [`TmError`] they
//! converge into, plus the [`Result`] alias used across the public API.

use std::path::PathBuf;

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::storage::StoreError;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, TmError>;

/// Crate-level error type.
///
/// Variants carry the canonical entry id and/or file path where one is
/// known, so callers can report failures without re-deriving context.
#[derive(Error, Debug)]
pub enum TmError {
    /// Malformed or unsupported XLIFF/TMX header.
    #[error("unsupported format: {message} (file: {path})")]
    UnsupportedFormat { message: String, path: PathBuf },

    /// A required XML attribute is absent.
    #[error("missing attribute `{attribute}` on <{element}> (file: {path})")]
    MissingAttribute {
        element: String,
        attribute: String,
        path: PathBuf,
    },

    /// Embedder initialization or inference failed.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(#[from] EmbeddingError),

    /// Vector-store I/O or predicate-compilation failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An insert carried a vector of the wrong length.
    #[error("dimension mismatch for `{id}`: expected {expected}, got {got}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        got: usize,
    },

    /// Delete/get addressed an absent id.
    #[error("entry not found: `{id}`")]
    NotFound { id: String },

    /// A JSONL line could not be decoded. Recovered by skipping the line.
    #[error("parse error at {path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: u64,
        message: String,
    },

    /// A stored `element` string no longer parses as XML. Recovered by
    /// dropping the affected result row.
    #[error("hydration failed for `{id}`: {message}")]
    Hydration { id: String, message: String },

    /// The caller-supplied cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine was used after `close()`.
    #[error("engine `{name}` is closed")]
    Closed { name: String },

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TmError {
    /// Unsupported-format error for an input file.
    pub fn unsupported_format(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::UnsupportedFormat {
            message: message.into(),
            path: path.into(),
        }
    }

    /// Missing-attribute error for an XML element.
    pub fn missing_attribute(
        element: impl Into<String>,
        attribute: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self::MissingAttribute {
            element: element.into(),
            attribute: attribute.into(),
            path: path.into(),
        }
    }

    /// Per-row hydration failure carrying the canonical id.
    pub fn hydration(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hydration {
            id: id.into(),
            message: message.into(),
        }
    }

    /// True for errors that are recovered by skipping a row or line rather
    /// than aborting the surrounding operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Hydration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = TmError::missing_attribute("unit", "id", "/tmp/demo.xlf");
        let text = err.to_string();
        assert!(text.contains("unit"));
        assert!(text.contains("id"));
        assert!(text.contains("demo.xlf"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(TmError::hydration("f:u:1:en", "bad fragment").is_recoverable());
        assert!(!TmError::Cancelled.is_recoverable());
        assert!(!TmError::NotFound { id: "x".into() }.is_recoverable());
    }
}
