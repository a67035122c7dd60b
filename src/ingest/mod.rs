//! Streaming bilingual-file ingestion.
//!
//! Both ingestors ([`xliff`], [`tmx`]) walk their input with a SAX-style
//! `quick_xml` reader, normalize what they find into [`PendingEntry`]
//! candidates, and stream those as newline-delimited JSON into a temp
//! file for the batch importer. Nothing here touches the embedder or the
//! store; ingestion is pure extraction.
//!
//! This module holds the plumbing the two formats share: ingest options,
//! the JSONL sink, and the inline-content reader that turns a translation
//! element into its round-trippable XML fragment plus unwrapped plain
//! text.

pub mod tmx;
pub mod xliff;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::{PendingEntry, WorkflowState};
use crate::error::{Result, TmError};

pub use tmx::ingest_tmx;
pub use xliff::ingest_xliff;

/// Inline elements whose textual content (recursively) belongs to the
/// plain text. Everything else contributes markup to the fragment but no
/// text.
const TRANSPARENT_INLINE: [&str; 3] = ["pc", "mrk", "hi"];

/// Filtering and extraction options shared by both ingestors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestOptions {
    /// Skip entries whose target text is whitespace-only.
    pub skip_empty: bool,
    /// Skip XLIFF segments that carry no explicit workflow state.
    pub skip_unconfirmed: bool,
    /// Skip XLIFF segments whose explicit state ranks below this.
    pub min_state: Option<WorkflowState>,
    /// Populate entry metadata from the document.
    pub extract_metadata: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            skip_empty: true,
            skip_unconfirmed: false,
            min_state: None,
            extract_metadata: true,
        }
    }
}

impl IngestOptions {
    /// Apply the workflow-state inclusion rule to an explicit (or absent)
    /// segment state.
    pub(crate) fn admits_state(&self, state: Option<WorkflowState>) -> bool {
        match state {
            Some(state) => match self.min_state {
                Some(min_state) => state.rank() >= min_state.rank(),
                None => true,
            },
            None => !self.skip_unconfirmed,
        }
    }
}

/// What an ingestor hands to the batch importer: the JSONL temp file and
/// how much is in it.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    /// Newline-delimited JSON of entry candidates (no embeddings).
    pub jsonl_path: PathBuf,
    /// Number of entries written.
    pub entries: u64,
    pub src_lang: Option<String>,
    pub trg_lang: Option<String>,
}

/// Streaming JSONL writer over a temp file.
///
/// The file is created in the system temp directory and persists past the
/// sink; ownership of cleanup passes to the batch importer (or to the
/// ingestor's error path).
pub(crate) struct JsonlSink {
    writer: BufWriter<File>,
    path: PathBuf,
    entries: u64,
}

impl JsonlSink {
    pub(crate) fn create(prefix: &str) -> Result<Self> {
        let (file, path) = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".jsonl")
            .tempfile()?
            .keep()
            .map_err(|e| TmError::Io(e.error))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            entries: 0,
        })
    }

    pub(crate) fn write(&mut self, entry: &PendingEntry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.entries += 1;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<(PathBuf, u64)> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), entries = self.entries, "ingest sink flushed");
        Ok((self.path, self.entries))
    }

    /// Best-effort removal, for abort paths.
    pub(crate) fn discard(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A translation element captured from the document: the exact fragment
/// (round-trippable), the fragment's inner XML (for merged-entry
/// synthesis), and the unwrapped plain text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InlineContent {
    pub element: String,
    pub inner_xml: String,
    pub pure_text: String,
}

impl InlineContent {
    pub fn is_blank(&self) -> bool {
        self.pure_text.trim().is_empty()
    }

    /// Synthesize a wrapper element from concatenated inner fragments,
    /// as used for merged-unit entries.
    pub fn merged(wrapper: &str, parts: &[&InlineContent]) -> Self {
        let inner_xml: String = parts.iter().map(|p| p.inner_xml.as_str()).collect();
        let pure_text: String = parts.iter().map(|p| p.pure_text.as_str()).collect();
        let element = if inner_xml.is_empty() {
            format!("<{wrapper}/>")
        } else {
            format!("<{wrapper}>{inner_xml}</{wrapper}>")
        };
        Self {
            element,
            inner_xml,
            pure_text,
        }
    }
}

pub(crate) fn local_name(name: QName<'_>) -> String {
    String::from_utf8_lossy(name.local_name().as_ref()).into_owned()
}

/// Decoded value of an attribute, matched by local name.
pub(crate) fn attr_value(start: &BytesStart<'_>, name: &str) -> Option<String> {
    for attr in start.attributes().with_checks(false).flatten() {
        if String::from_utf8_lossy(attr.key.local_name().as_ref()) == name {
            return attr.unescape_value().ok().map(|v| v.into_owned());
        }
    }
    None
}

/// Read the subtree of an already-consumed start tag into an
/// [`InlineContent`].
///
/// Markup is re-emitted verbatim into the fragment. Text contributes to
/// `pure_text` only while every open inline element is transparent
/// (`pc`/`mrk`/`hi`); `<cp>` and any other element suppress the text
/// beneath them.
pub(crate) fn read_inline_content<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    start: &BytesStart<'_>,
) -> Result<InlineContent> {
    let wrapper = local_name(start.name());
    let mut full = Writer::new(Vec::new());
    let mut inner = Writer::new(Vec::new());
    let mut pure_text = String::new();

    full.write_event(Event::Start(start.to_owned()))?;

    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut opaque_depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Start(e) => {
                let name = local_name(e.name());
                full.write_event(Event::Start(e.to_owned()))?;
                inner.write_event(Event::Start(e.to_owned()))?;
                depth += 1;
                if !TRANSPARENT_INLINE.contains(&name.as_str()) {
                    opaque_depth += 1;
                }
            }
            Event::Empty(e) => {
                // Self-closing inline codes (<cp/>, <ph/>, ...) keep
                // their markup and contribute no text.
                full.write_event(Event::Empty(e.to_owned()))?;
                inner.write_event(Event::Empty(e.to_owned()))?;
            }
            Event::End(e) => {
                if depth == 0 {
                    full.write_event(Event::End(e.to_owned()))?;
                    break;
                }
                let name = local_name(e.name());
                full.write_event(Event::End(e.to_owned()))?;
                inner.write_event(Event::End(e.to_owned()))?;
                depth -= 1;
                if !TRANSPARENT_INLINE.contains(&name.as_str()) {
                    opaque_depth = opaque_depth.saturating_sub(1);
                }
            }
            Event::Text(t) => {
                if opaque_depth == 0 {
                    pure_text.push_str(&t.unescape()?);
                }
                full.write_event(Event::Text(t.to_owned()))?;
                inner.write_event(Event::Text(t.to_owned()))?;
            }
            Event::CData(t) => {
                if opaque_depth == 0 {
                    pure_text.push_str(&String::from_utf8_lossy(t.as_ref()));
                }
                full.write_event(Event::CData(t.to_owned()))?;
                inner.write_event(Event::CData(t.to_owned()))?;
            }
            Event::Comment(c) => {
                full.write_event(Event::Comment(c.to_owned()))?;
                inner.write_event(Event::Comment(c.to_owned()))?;
            }
            Event::Eof => {
                return Err(TmError::unsupported_format(
                    format!("unexpected end of file inside <{wrapper}>"),
                    "",
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    let element = String::from_utf8_lossy(&full.into_inner()).into_owned();
    let inner_xml = String::from_utf8_lossy(&inner.into_inner()).into_owned();
    Ok(InlineContent {
        element,
        inner_xml,
        pure_text,
    })
}

/// Inline content for a self-closing translation element (`<source/>`).
pub(crate) fn empty_inline_content(start: &BytesStart<'_>) -> Result<InlineContent> {
    let mut full = Writer::new(Vec::new());
    full.write_event(Event::Empty(start.to_owned()))?;
    Ok(InlineContent {
        element: String::from_utf8_lossy(&full.into_inner()).into_owned(),
        inner_xml: String::new(),
        pure_text: String::new(),
    })
}

/// Collect the unescaped text content of the current element's subtree,
/// markup stripped.
pub(crate) fn read_text_content<R: std::io::BufRead>(reader: &mut Reader<R>) -> Result<String> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(t) => text.push_str(&String::from_utf8_lossy(t.as_ref())),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

/// Skip the remainder of the current element's subtree.
pub(crate) fn skip_subtree<R: std::io::BufRead>(reader: &mut Reader<R>) -> Result<()> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Open an XML file as a buffered streaming reader.
pub(crate) fn open_reader(path: &Path) -> Result<Reader<std::io::BufReader<File>>> {
    let file = File::open(path)?;
    let mut reader = Reader::from_reader(std::io::BufReader::new(file));
    reader.config_mut().trim_text(false);
    Ok(reader)
}
