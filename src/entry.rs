//! Segmented bilingual entry model.
//!
//! An [`Entry`] is one language-side of a translated segment, identified by
//! the tuple `(fileId, unitId, segmentIndex, language)` and stored with its
//! plain text, the round-trippable XML fragment it came from, an embedding
//! vector, and optional workflow metadata.
//!
//! The storage layer is columnar: [`Entry::to_columns`] flattens an entry
//! into scalar payload fields, with the nested `notes`/`properties`/
//! `segment` records serialized as JSON strings. The JSONL import
//! intermediate keeps metadata as a nested object instead; see
//! [`PendingEntry`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized XLIFF workflow state, ranked `initial < translated <
/// reviewed < final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Initial,
    Translated,
    Reviewed,
    Final,
}

impl WorkflowState {
    /// Rank 0..=3 used by `minState` comparisons.
    pub fn rank(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::Translated => 1,
            Self::Reviewed => 2,
            Self::Final => 3,
        }
    }

    /// Parse an XLIFF `state` attribute. Out-of-vocabulary values map to
    /// `None` (the entry simply carries no state).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "initial" => Some(Self::Initial),
            "translated" => Some(Self::Translated),
            "reviewed" => Some(Self::Reviewed),
            "final" => Some(Self::Final),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Translated => "translated",
            Self::Reviewed => "reviewed",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a segment within its source document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentProvenance {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_key: Option<String>,
}

/// Optional per-entry metadata. Absent fields are truly missing, not null:
/// every field is an `Option` and serialization omits `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<WorkflowState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_state: Option<String>,
    /// Quality score 0–100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_tool_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_usage_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<SegmentProvenance>,
}

impl EntryMetadata {
    /// True when no field carries a value; such records are stored as
    /// absent metadata rather than an empty object.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Change date falling back to creation date, parsed. Used by the
    /// ranking recency bonus.
    pub fn effective_timestamp(&self) -> Option<DateTime<Utc>> {
        self.change_date
            .as_deref()
            .or(self.creation_date.as_deref())
            .and_then(parse_timestamp)
    }
}

/// Parse a lifecycle timestamp: RFC 3339 or the TMX compact form
/// (`20190314T023401Z`).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Canonical identity of one language-side of a segment.
///
/// Rendered as `"fileId:unitId:segmentIndex:language"`. Colons inside
/// `file_id`/`unit_id` are preserved literally; components are never
/// escaped, which is why prefix filtering is expressed structurally
/// (see [`crate::storage::Predicate`]) rather than by string parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryId {
    pub file_id: String,
    pub unit_id: String,
    /// `0` marks a merged-unit entry (or a TMX entry); `1..=N` an
    /// individual XLIFF segment.
    pub segment_index: u32,
    /// BCP-47 tag taken from the source file.
    pub language: String,
}

impl EntryId {
    pub fn new(
        file_id: impl Into<String>,
        unit_id: impl Into<String>,
        segment_index: u32,
        language: impl Into<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            unit_id: unit_id.into(),
            segment_index,
            language: language.into(),
        }
    }

    /// `"fileId:unitId:"` — the prefix shared by every entry of a unit.
    pub fn unit_prefix(&self) -> String {
        format!("{}:{}:", self.file_id, self.unit_id)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.file_id, self.unit_id, self.segment_index, self.language
        )
    }
}

/// One language-side of a segment, as stored and as surfaced by searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(flatten)]
    pub id: EntryId,
    /// Plain text with inline placeholders unwrapped; the canonical text
    /// for both embedding and lexical scoring.
    pub pure_text: String,
    /// The original XML fragment (round-trippable string).
    pub element: String,
    /// `original` attribute of the enclosing `<file>`.
    pub original: String,
    /// Total segments produced for the unit; identical across siblings.
    pub segment_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

impl Entry {
    /// Canonical id string.
    pub fn canonical_id(&self) -> String {
        self.id.to_string()
    }

    /// Flatten into columnar payload fields. Nested `notes`, `properties`
    /// and `segment` records serialize as JSON strings; absent optionals
    /// are omitted entirely.
    pub fn to_columns(&self) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::{json, Value};

        let mut columns = serde_json::Map::new();
        columns.insert("id".into(), json!(self.canonical_id()));
        columns.insert("language".into(), json!(self.id.language));
        columns.insert("pureText".into(), json!(self.pure_text));
        columns.insert("element".into(), json!(self.element));
        columns.insert("fileId".into(), json!(self.id.file_id));
        columns.insert("original".into(), json!(self.original));
        columns.insert("unitId".into(), json!(self.id.unit_id));
        columns.insert("segmentIndex".into(), json!(self.id.segment_index));
        columns.insert("segmentCount".into(), json!(self.segment_count));

        if let Some(meta) = &self.metadata {
            let mut put = |key: &str, value: Option<Value>| {
                if let Some(value) = value {
                    columns.insert(key.to_string(), value);
                }
            };
            put("state", meta.state.map(|s| json!(s.as_str())));
            put("subState", meta.sub_state.as_ref().map(|v| json!(v)));
            put("quality", meta.quality.map(|v| json!(v)));
            put("creationDate", meta.creation_date.as_ref().map(|v| json!(v)));
            put("creationId", meta.creation_id.as_ref().map(|v| json!(v)));
            put("changeDate", meta.change_date.as_ref().map(|v| json!(v)));
            put("changeId", meta.change_id.as_ref().map(|v| json!(v)));
            put("creationTool", meta.creation_tool.as_ref().map(|v| json!(v)));
            put(
                "creationToolVersion",
                meta.creation_tool_version.as_ref().map(|v| json!(v)),
            );
            put("context", meta.context.as_ref().map(|v| json!(v)));
            put(
                "lastUsageDate",
                meta.last_usage_date.as_ref().map(|v| json!(v)),
            );
            put("usageCount", meta.usage_count.map(|v| json!(v)));
            if !meta.notes.is_empty() {
                columns.insert(
                    "notes".into(),
                    json!(serde_json::to_string(&meta.notes).expect("notes serialize")),
                );
            }
            if !meta.properties.is_empty() {
                columns.insert(
                    "properties".into(),
                    json!(serde_json::to_string(&meta.properties).expect("properties serialize")),
                );
            }
            if let Some(segment) = &meta.segment {
                columns.insert(
                    "segment".into(),
                    json!(serde_json::to_string(segment).expect("segment serialize")),
                );
            }
        }

        columns
    }

    /// Rebuild an entry from columnar payload fields plus its vector.
    pub fn from_columns(
        columns: &serde_json::Map<String, serde_json::Value>,
        vector: Option<Vec<f32>>,
    ) -> Result<Self, serde_json::Error> {
        fn text(
            columns: &serde_json::Map<String, serde_json::Value>,
            key: &str,
        ) -> Option<String> {
            columns.get(key).and_then(|v| v.as_str()).map(str::to_owned)
        }
        fn integer(
            columns: &serde_json::Map<String, serde_json::Value>,
            key: &str,
        ) -> Option<u64> {
            columns.get(key).and_then(|v| v.as_u64())
        }

        let mut metadata = EntryMetadata {
            state: text(columns, "state")
                .as_deref()
                .and_then(WorkflowState::parse),
            sub_state: text(columns, "subState"),
            quality: integer(columns, "quality").map(|v| v as u32),
            creation_date: text(columns, "creationDate"),
            creation_id: text(columns, "creationId"),
            change_date: text(columns, "changeDate"),
            change_id: text(columns, "changeId"),
            creation_tool: text(columns, "creationTool"),
            creation_tool_version: text(columns, "creationToolVersion"),
            context: text(columns, "context"),
            last_usage_date: text(columns, "lastUsageDate"),
            usage_count: integer(columns, "usageCount"),
            notes: Vec::new(),
            properties: BTreeMap::new(),
            segment: None,
        };
        if let Some(raw) = text(columns, "notes") {
            metadata.notes = serde_json::from_str(&raw)?;
        }
        if let Some(raw) = text(columns, "properties") {
            metadata.properties = serde_json::from_str(&raw)?;
        }
        if let Some(raw) = text(columns, "segment") {
            metadata.segment = Some(serde_json::from_str(&raw)?);
        }

        Ok(Self {
            id: EntryId::new(
                text(columns, "fileId").unwrap_or_default(),
                text(columns, "unitId").unwrap_or_default(),
                integer(columns, "segmentIndex").unwrap_or(0) as u32,
                text(columns, "language").unwrap_or_default(),
            ),
            pure_text: text(columns, "pureText").unwrap_or_default(),
            element: text(columns, "element").unwrap_or_default(),
            original: text(columns, "original").unwrap_or_default(),
            segment_count: integer(columns, "segmentCount").unwrap_or(1) as u32,
            vector,
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
        })
    }
}

/// An entry candidate awaiting embedding, as written to the JSONL
/// intermediate by the ingestors (one object per line, nested metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub file_id: String,
    pub original: String,
    pub unit_id: String,
    pub segment_index: u32,
    pub segment_count: u32,
    pub language: String,
    pub pure_text: String,
    pub element: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

impl PendingEntry {
    pub fn entry_id(&self) -> EntryId {
        EntryId::new(
            self.file_id.clone(),
            self.unit_id.clone(),
            self.segment_index,
            self.language.clone(),
        )
    }

    /// Hydrate into a storable entry once its vector is known.
    pub fn into_entry(self, vector: Vec<f32>) -> Entry {
        Entry {
            id: EntryId::new(
                self.file_id,
                self.unit_id,
                self.segment_index,
                self.language,
            ),
            pure_text: self.pure_text,
            element: self.element,
            original: self.original,
            segment_count: self.segment_count,
            vector: Some(vector),
            metadata: self.metadata.filter(|m| !m.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        let mut properties = BTreeMap::new();
        properties.insert("domain:subject".to_string(), "ui".to_string());
        Entry {
            id: EntryId::new("f1", "u1", 2, "en"),
            pure_text: "Save settings".into(),
            element: "<source>Save settings</source>".into(),
            original: "demo.xlf".into(),
            segment_count: 3,
            vector: Some(vec![0.6, 0.8]),
            metadata: Some(EntryMetadata {
                state: Some(WorkflowState::Reviewed),
                quality: Some(80),
                notes: vec!["checked".into()],
                properties,
                segment: Some(SegmentProvenance {
                    provider: "xliff".into(),
                    file_id: Some("f1".into()),
                    unit_id: Some("u1".into()),
                    segment_index: Some(2),
                    segment_count: Some(3),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn canonical_id_is_deterministic() {
        let a = EntryId::new("file", "unit", 1, "en");
        let b = EntryId::new("file", "unit", 1, "en");
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "file:unit:1:en");
    }

    #[test]
    fn colons_in_components_are_preserved() {
        let id = EntryId::new("a:b", "c:d", 0, "de-DE");
        assert_eq!(id.to_string(), "a:b:c:d:0:de-DE");
        assert_eq!(id.unit_prefix(), "a:b:c:d:");
    }

    #[test]
    fn column_round_trip_is_exact() {
        let entry = sample_entry();
        let columns = entry.to_columns();

        // Nested records are JSON strings in the columnar form.
        assert!(columns.get("notes").unwrap().is_string());
        assert!(columns.get("properties").unwrap().is_string());
        assert!(columns.get("segment").unwrap().is_string());

        let restored = Entry::from_columns(&columns, entry.vector.clone()).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn absent_metadata_stays_absent() {
        let entry = Entry {
            metadata: None,
            ..sample_entry()
        };
        let columns = entry.to_columns();
        assert!(!columns.contains_key("state"));
        assert!(!columns.contains_key("notes"));
        let restored = Entry::from_columns(&columns, None).unwrap();
        assert!(restored.metadata.is_none());
    }

    #[test]
    fn workflow_state_parsing() {
        assert_eq!(WorkflowState::parse("final"), Some(WorkflowState::Final));
        assert_eq!(WorkflowState::parse(" translated "), Some(WorkflowState::Translated));
        assert_eq!(WorkflowState::parse("signed-off"), None);
        assert!(WorkflowState::Initial.rank() < WorkflowState::Final.rank());
    }

    #[test]
    fn timestamp_parsing_accepts_both_forms() {
        assert!(parse_timestamp("2024-03-14T02:34:01Z").is_some());
        assert!(parse_timestamp("20190314T023401Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn pending_entry_jsonl_round_trip() {
        let pending = PendingEntry {
            file_id: "f1".into(),
            original: "demo.xlf".into(),
            unit_id: "u1".into(),
            segment_index: 1,
            segment_count: 1,
            language: "en".into(),
            pure_text: "Hello".into(),
            element: "<source>Hello</source>".into(),
            metadata: Some(EntryMetadata {
                state: Some(WorkflowState::Final),
                ..Default::default()
            }),
        };
        let line = serde_json::to_string(&pending).unwrap();
        // Nested metadata stays a JSON object in the JSONL form.
        assert!(line.contains("\"metadata\":{"));
        let back: PendingEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, pending);
    }
}
