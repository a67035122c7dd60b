//! TMX 1.4b ingestion.
//!
//! Every `<tu>` behaves like a single segment: one entry per `<tuv>`
//! language variant, `segmentIndex = 0`, `segmentCount = 1`. TMX carries
//! no workflow state; lifecycle attributes, notes and `<prop>` elements
//! map onto the shared metadata record.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::entry::{EntryMetadata, PendingEntry, SegmentProvenance};
use crate::error::{Result, TmError};
use crate::ingest::{
    attr_value, empty_inline_content, local_name, open_reader, read_inline_content,
    read_text_content, skip_subtree, IngestOptions, IngestSummary, InlineContent, JsonlSink,
};

#[derive(Debug, Clone, Default)]
struct TmxLifecycle {
    creation_date: Option<String>,
    creation_id: Option<String>,
    change_date: Option<String>,
    change_id: Option<String>,
    creation_tool: Option<String>,
    creation_tool_version: Option<String>,
}

impl TmxLifecycle {
    fn read(start: &BytesStart<'_>) -> Self {
        Self {
            creation_date: attr_value(start, "creationdate"),
            creation_id: attr_value(start, "creationid"),
            change_date: attr_value(start, "changedate"),
            change_id: attr_value(start, "changeid"),
            creation_tool: attr_value(start, "creationtool"),
            creation_tool_version: attr_value(start, "creationtoolversion"),
        }
    }

    /// Per-field preference: TUV value over TU value.
    fn preferred(tuv: &Self, tu: &Self) -> Self {
        fn pick(a: &Option<String>, b: &Option<String>) -> Option<String> {
            a.clone().or_else(|| b.clone())
        }
        Self {
            creation_date: pick(&tuv.creation_date, &tu.creation_date),
            creation_id: pick(&tuv.creation_id, &tu.creation_id),
            change_date: pick(&tuv.change_date, &tu.change_date),
            change_id: pick(&tuv.change_id, &tu.change_id),
            creation_tool: pick(&tuv.creation_tool, &tu.creation_tool),
            creation_tool_version: pick(&tuv.creation_tool_version, &tu.creation_tool_version),
        }
    }
}

#[derive(Debug)]
struct TuData {
    unit_id: String,
    attrs: TmxLifecycle,
    usage_count: Option<u64>,
    last_usage_date: Option<String>,
    notes: Vec<String>,
    properties: BTreeMap<String, String>,
    variants: Vec<TuvData>,
}

#[derive(Debug)]
struct TuvData {
    language: String,
    attrs: TmxLifecycle,
    notes: Vec<String>,
    properties: BTreeMap<String, String>,
    seg: Option<InlineContent>,
}

/// Ingest a TMX 1.4b file into a JSONL temp file of entry candidates.
pub fn ingest_tmx(path: &Path, options: &IngestOptions) -> Result<IngestSummary> {
    let mut reader = open_reader(path)?;
    let src_lang = read_header(&mut reader, path)?;
    debug!(path = %path.display(), "ingesting tmx document");

    let file_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmx".to_string());
    let original = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut sink = JsonlSink::create("htm-tmx-")?;
    match walk_body(&mut reader, &file_id, &original, options, &mut sink) {
        Ok(()) => {
            let (jsonl_path, entries) = sink.finish()?;
            Ok(IngestSummary {
                jsonl_path,
                entries,
                src_lang,
                trg_lang: None,
            })
        }
        Err(e) => {
            sink.discard();
            Err(e)
        }
    }
}

/// Validate the `<tmx version="1.4*">` root; returns the header's
/// `srclang` when one is declared.
fn read_header<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    path: &Path,
) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let mut src_lang = None;
    let mut root_seen = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => match local_name(e.name()).as_str() {
                "tmx" if !root_seen => {
                    match attr_value(&e, "version") {
                        Some(version) if version.starts_with("1.4") => {}
                        Some(version) => {
                            return Err(TmError::unsupported_format(
                                format!("tmx version {version} is not supported"),
                                path,
                            ))
                        }
                        None => return Err(TmError::missing_attribute("tmx", "version", path)),
                    }
                    root_seen = true;
                }
                "header" if root_seen => {
                    src_lang = attr_value(&e, "srclang");
                    return Ok(src_lang);
                }
                "body" if root_seen => return Ok(src_lang),
                _ if root_seen => {}
                other => {
                    return Err(TmError::unsupported_format(
                        format!("root element is <{other}>, expected <tmx>"),
                        path,
                    ))
                }
            },
            Event::End(_) => {}
            Event::Eof => {
                if root_seen {
                    return Ok(src_lang);
                }
                return Err(TmError::unsupported_format("no <tmx> root element", path));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn walk_body<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    file_id: &str,
    original: &str,
    options: &IngestOptions,
    sink: &mut JsonlSink,
) -> Result<()> {
    let mut buf = Vec::new();
    // Base for synthetic ids of <tu> elements without a tuid.
    let synthetic_base = Utc::now().timestamp_millis();
    let mut synthetic_counter = 0u64;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if local_name(e.name()) == "tu" {
                    let unit_id = match attr_value(&e, "tuid") {
                        Some(tuid) => tuid,
                        None => {
                            synthetic_counter += 1;
                            format!("tu-{synthetic_base}-{synthetic_counter}")
                        }
                    };
                    let start = e.to_owned();
                    let tu = read_tu(reader, unit_id, &start)?;
                    emit_tu(&tu, file_id, original, options, sink)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn read_tu<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    unit_id: String,
    start: &BytesStart<'_>,
) -> Result<TuData> {
    let mut tu = TuData {
        unit_id,
        attrs: TmxLifecycle::read(start),
        usage_count: attr_value(start, "usagecount").and_then(|v| v.trim().parse().ok()),
        last_usage_date: attr_value(start, "lastusagedate"),
        notes: Vec::new(),
        properties: BTreeMap::new(),
        variants: Vec::new(),
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name()).as_str() {
                "tuv" => {
                    let start = e.to_owned();
                    if let Some(tuv) = read_tuv(reader, &start)? {
                        tu.variants.push(tuv);
                    }
                }
                "note" => {
                    let text = read_text_content(reader)?.trim().to_owned();
                    if !text.is_empty() {
                        tu.notes.push(text);
                    }
                }
                "prop" => {
                    let key = attr_value(&e, "type").unwrap_or_default();
                    let value = read_text_content(reader)?.trim().to_owned();
                    tu.properties.insert(key, value);
                }
                _ => skip_subtree(reader)?,
            },
            Event::End(_) => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(tu)
}

/// Read one `<tuv>`. Variants without a language attribute are dropped.
fn read_tuv<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    start: &BytesStart<'_>,
) -> Result<Option<TuvData>> {
    // `xml:lang` and plain `lang` share the local name.
    let language = attr_value(start, "lang");
    let mut tuv = TuvData {
        language: language.unwrap_or_default(),
        attrs: TmxLifecycle::read(start),
        notes: Vec::new(),
        properties: BTreeMap::new(),
        seg: None,
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name()).as_str() {
                "seg" => {
                    let start = e.to_owned();
                    tuv.seg = Some(read_inline_content(reader, &start)?);
                }
                "note" => {
                    let text = read_text_content(reader)?.trim().to_owned();
                    if !text.is_empty() {
                        tuv.notes.push(text);
                    }
                }
                "prop" => {
                    let key = attr_value(&e, "type").unwrap_or_default();
                    let value = read_text_content(reader)?.trim().to_owned();
                    tuv.properties.insert(key, value);
                }
                _ => skip_subtree(reader)?,
            },
            Event::Empty(e) => {
                if local_name(e.name()) == "seg" {
                    tuv.seg = Some(empty_inline_content(&e)?);
                }
            }
            Event::End(_) => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if tuv.language.is_empty() {
        Ok(None)
    } else {
        Ok(Some(tuv))
    }
}

fn emit_tu(
    tu: &TuData,
    file_id: &str,
    original: &str,
    options: &IngestOptions,
    sink: &mut JsonlSink,
) -> Result<()> {
    for tuv in &tu.variants {
        let Some(seg) = &tuv.seg else {
            continue;
        };
        if options.skip_empty && seg.is_blank() {
            continue;
        }

        let metadata = if options.extract_metadata {
            Some(build_metadata(tu, tuv))
        } else {
            None
        };

        sink.write(&PendingEntry {
            file_id: file_id.to_string(),
            original: original.to_string(),
            unit_id: tu.unit_id.clone(),
            segment_index: 0,
            segment_count: 1,
            language: tuv.language.clone(),
            pure_text: seg.pure_text.clone(),
            element: seg.element.clone(),
            metadata,
        })?;
    }
    Ok(())
}

fn build_metadata(tu: &TuData, tuv: &TuvData) -> EntryMetadata {
    let attrs = TmxLifecycle::preferred(&tuv.attrs, &tu.attrs);

    let mut notes = tu.notes.clone();
    notes.extend(tuv.notes.iter().cloned());

    let mut properties = tu.properties.clone();
    for (key, value) in &tuv.properties {
        properties.insert(key.clone(), value.clone());
    }

    let mut context = ["x-context", "context", "domain"]
        .iter()
        .find_map(|key| properties.get(*key).cloned());

    // prev-* / next-* properties describe the surrounding segments; fold
    // them into the context phrase.
    let mut neighbors = Vec::new();
    for prefix in ["prev", "next"] {
        if let Some((_, value)) = properties
            .iter()
            .find(|(key, _)| key.to_lowercase().starts_with(&format!("{prefix}-")))
        {
            neighbors.push(format!("{prefix}={value}"));
        }
    }
    if !neighbors.is_empty() {
        let phrase = neighbors.join("; ");
        context = Some(match context {
            Some(existing) => format!("{existing}; {phrase}"),
            None => phrase,
        });
    }

    let segment = properties
        .get("xliff-segment")
        .and_then(|value| parse_xliff_segment_key(value));

    EntryMetadata {
        state: None,
        sub_state: None,
        quality: None,
        creation_date: attrs.creation_date,
        creation_id: attrs.creation_id,
        change_date: attrs.change_date,
        change_id: attrs.change_id,
        creation_tool: attrs.creation_tool,
        creation_tool_version: attrs.creation_tool_version,
        context,
        last_usage_date: tu.last_usage_date.clone(),
        notes,
        usage_count: tu.usage_count,
        properties,
        segment,
    }
}

/// Parse an `xliff-segment` identifier of the form `…-FILE-UNIT-SEGMENT`
/// (three trailing numeric groups).
fn parse_xliff_segment_key(value: &str) -> Option<SegmentProvenance> {
    let mut parts = value.rsplitn(4, '-');
    let segment_id = parts.next()?;
    let unit_id = parts.next()?;
    let file_id = parts.next()?;
    let file_hash = parts.next()?;

    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !numeric(segment_id) || !numeric(unit_id) || !numeric(file_id) || file_hash.is_empty() {
        return None;
    }

    Some(SegmentProvenance {
        provider: "xliff-segment".to_string(),
        file_hash: Some(file_hash.to_string()),
        file_id: Some(file_id.to_string()),
        unit_id: Some(unit_id.to_string()),
        segment_id: Some(segment_id.to_string()),
        segment_index: None,
        segment_count: None,
        segment_key: Some(value.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn ingest_str(xml: &str, options: &IngestOptions) -> Result<Vec<PendingEntry>> {
        let mut file = tempfile::Builder::new().suffix(".tmx").tempfile().unwrap();
        file.write_all(xml.as_bytes()).unwrap();
        let summary = ingest_tmx(file.path(), options)?;
        let raw = std::fs::read_to_string(&summary.jsonl_path).unwrap();
        std::fs::remove_file(&summary.jsonl_path).unwrap();
        Ok(raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect())
    }

    const SIMPLE: &str = r#"<?xml version="1.0"?>
<tmx version="1.4">
 <header srclang="en"/>
 <body>
  <tu tuid="greeting" usagecount="3" lastusagedate="20240102T120000Z">
   <note>informal</note>
   <prop type="domain">ui</prop>
   <tuv xml:lang="en"><seg>Hello world</seg></tuv>
   <tuv xml:lang="es" creationid="ana"><seg>Hola mundo</seg></tuv>
  </tu>
 </body>
</tmx>"#;

    #[test]
    fn one_entry_per_variant() {
        let entries = ingest_str(SIMPLE, &IngestOptions::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.segment_index == 0));
        assert!(entries.iter().all(|e| e.segment_count == 1));
        assert!(entries.iter().all(|e| e.unit_id == "greeting"));
        assert_eq!(entries[0].language, "en");
        assert_eq!(entries[1].language, "es");
        assert_eq!(entries[1].pure_text, "Hola mundo");
    }

    #[test]
    fn metadata_prefers_tuv_and_promotes_context() {
        let entries = ingest_str(SIMPLE, &IngestOptions::default()).unwrap();
        let meta = entries[1].metadata.as_ref().unwrap();
        assert_eq!(meta.creation_id.as_deref(), Some("ana"));
        assert_eq!(meta.usage_count, Some(3));
        assert_eq!(meta.last_usage_date.as_deref(), Some("20240102T120000Z"));
        assert_eq!(meta.notes, vec!["informal".to_string()]);
        assert_eq!(meta.context.as_deref(), Some("ui"));
        assert!(meta.state.is_none());
    }

    #[test]
    fn rejects_wrong_version() {
        let xml = r#"<tmx version="2.0"><body/></tmx>"#;
        assert!(matches!(
            ingest_str(xml, &IngestOptions::default()),
            Err(TmError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn rejects_non_tmx_root() {
        let xml = r#"<memories/>"#;
        assert!(matches!(
            ingest_str(xml, &IngestOptions::default()),
            Err(TmError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn synthesizes_unit_ids_for_missing_tuid() {
        let xml = r#"<tmx version="1.4"><body>
  <tu><tuv xml:lang="en"><seg>a</seg></tuv></tu>
  <tu><tuv xml:lang="en"><seg>b</seg></tuv></tu>
 </body></tmx>"#;
        let entries = ingest_str(xml, &IngestOptions::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].unit_id.starts_with("tu-"));
        assert_ne!(entries[0].unit_id, entries[1].unit_id);
    }

    #[test]
    fn skip_empty_respects_option() {
        let xml = r#"<tmx version="1.4"><body>
  <tu tuid="t1">
   <tuv xml:lang="en"><seg>text</seg></tuv>
   <tuv xml:lang="es"><seg>   </seg></tuv>
  </tu>
 </body></tmx>"#;
        let entries = ingest_str(xml, &IngestOptions::default()).unwrap();
        assert_eq!(entries.len(), 1);

        let keep_all = IngestOptions {
            skip_empty: false,
            ..Default::default()
        };
        let entries = ingest_str(xml, &keep_all).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn neighbor_props_extend_context() {
        let xml = r#"<tmx version="1.4"><body>
  <tu tuid="t1">
   <prop type="x-context">dialog</prop>
   <prop type="prev-segment">Before text</prop>
   <prop type="Next-Segment">After text</prop>
   <tuv xml:lang="en"><seg>middle</seg></tuv>
  </tu>
 </body></tmx>"#;
        let entries = ingest_str(xml, &IngestOptions::default()).unwrap();
        let meta = entries[0].metadata.as_ref().unwrap();
        assert_eq!(
            meta.context.as_deref(),
            Some("dialog; prev=Before text; next=After text")
        );
    }

    #[test]
    fn xliff_segment_key_parsing() {
        let provenance = parse_xliff_segment_key("a1b2c3-12-7-3").unwrap();
        assert_eq!(provenance.provider, "xliff-segment");
        assert_eq!(provenance.file_hash.as_deref(), Some("a1b2c3"));
        assert_eq!(provenance.file_id.as_deref(), Some("12"));
        assert_eq!(provenance.unit_id.as_deref(), Some("7"));
        assert_eq!(provenance.segment_id.as_deref(), Some("3"));
        assert_eq!(provenance.segment_key.as_deref(), Some("a1b2c3-12-7-3"));

        assert!(parse_xliff_segment_key("not-numeric-x-y").is_none());
        assert!(parse_xliff_segment_key("1-2-3").is_none());
    }

    #[test]
    fn xliff_segment_prop_attaches_provenance() {
        let xml = r#"<tmx version="1.4"><body>
  <tu tuid="t1">
   <prop type="xliff-segment">deadbeef-4-2-1</prop>
   <tuv xml:lang="en"><seg>linked</seg></tuv>
  </tu>
 </body></tmx>"#;
        let entries = ingest_str(xml, &IngestOptions::default()).unwrap();
        let segment = entries[0]
            .metadata
            .as_ref()
            .unwrap()
            .segment
            .as_ref()
            .unwrap();
        assert_eq!(segment.provider, "xliff-segment");
        assert_eq!(segment.file_hash.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn inline_codes_are_opaque() {
        let xml = r#"<tmx version="1.4"><body>
  <tu tuid="t1">
   <tuv xml:lang="en"><seg>Press <bpt i="1">&lt;b&gt;</bpt>Save<ept i="1">&lt;/b&gt;</ept> now</seg></tuv>
  </tu>
 </body></tmx>"#;
        let entries = ingest_str(xml, &IngestOptions::default()).unwrap();
        assert_eq!(entries[0].pure_text, "Press Save now");
        assert!(entries[0].element.contains("<bpt"));
    }
}
