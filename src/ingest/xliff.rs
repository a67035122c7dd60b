//! XLIFF 2.x ingestion.
//!
//! A SAX-driven walk over `<xliff>` → `<file>` → `<unit>` → `<segment>`,
//! producing per-segment entry pairs plus a merged per-unit pair when a
//! unit holds more than one retained segment. Units without `<segment>`
//! children get a single virtual segment synthesized from their parts.

use std::collections::BTreeMap;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::entry::{EntryMetadata, PendingEntry, SegmentProvenance, WorkflowState};
use crate::error::{Result, TmError};
use crate::ingest::{
    attr_value, empty_inline_content, local_name, open_reader, read_inline_content,
    read_text_content, skip_subtree, IngestOptions, IngestSummary, InlineContent, JsonlSink,
};

/// Lifecycle attributes readable from both `<unit>` and `<segment>`.
#[derive(Debug, Clone, Default)]
struct LifecycleAttrs {
    creation_date: Option<String>,
    creation_id: Option<String>,
    change_date: Option<String>,
    change_id: Option<String>,
    creation_tool: Option<String>,
    creation_tool_version: Option<String>,
    context: Option<String>,
}

impl LifecycleAttrs {
    fn read(start: &BytesStart<'_>) -> Self {
        Self {
            creation_date: attr_value(start, "creationDate"),
            creation_id: attr_value(start, "creationId"),
            change_date: attr_value(start, "changeDate"),
            change_id: attr_value(start, "changeId"),
            creation_tool: attr_value(start, "creationTool"),
            creation_tool_version: attr_value(start, "creationToolVersion"),
            context: attr_value(start, "context"),
        }
    }

    /// Per-field preference: segment value over unit value.
    fn preferred<'a>(segment: &'a Self, unit: &'a Self) -> Self {
        fn pick(a: &Option<String>, b: &Option<String>) -> Option<String> {
            a.clone().or_else(|| b.clone())
        }
        Self {
            creation_date: pick(&segment.creation_date, &unit.creation_date),
            creation_id: pick(&segment.creation_id, &unit.creation_id),
            change_date: pick(&segment.change_date, &unit.change_date),
            change_id: pick(&segment.change_id, &unit.change_id),
            creation_tool: pick(&segment.creation_tool, &unit.creation_tool),
            creation_tool_version: pick(
                &segment.creation_tool_version,
                &unit.creation_tool_version,
            ),
            context: pick(&segment.context, &unit.context),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Segment,
    Ignorable,
}

/// One `<segment>` or `<ignorable>` child of a unit, in document order.
#[derive(Debug)]
struct UnitPart {
    kind: PartKind,
    id: Option<String>,
    state: Option<WorkflowState>,
    sub_state: Option<String>,
    attrs: LifecycleAttrs,
    notes: Vec<String>,
    source: Option<InlineContent>,
    target: Option<InlineContent>,
}

#[derive(Debug)]
struct UnitData {
    id: String,
    state: Option<WorkflowState>,
    sub_state: Option<String>,
    attrs: LifecycleAttrs,
    notes: Vec<String>,
    properties: BTreeMap<String, String>,
    parts: Vec<UnitPart>,
}

/// Document-level context carried through the walk.
struct FileContext {
    file_id: String,
    original: String,
    src_lang: String,
    trg_lang: String,
}

/// Ingest an XLIFF 2.x file into a JSONL temp file of entry candidates.
///
/// Fails with `UnsupportedFormat` for non-2.x versions and with
/// `MissingAttribute` when `srcLang`/`trgLang` or required ids are
/// absent. On failure the temp file is removed.
pub fn ingest_xliff(path: &Path, options: &IngestOptions) -> Result<IngestSummary> {
    let mut reader = open_reader(path)?;
    let (src_lang, trg_lang) = read_header(&mut reader, path)?;
    debug!(
        path = %path.display(),
        src_lang = %src_lang,
        trg_lang = %trg_lang,
        "ingesting xliff document"
    );

    let mut sink = JsonlSink::create("htm-xliff-")?;
    match walk_document(&mut reader, path, options, &src_lang, &trg_lang, &mut sink) {
        Ok(()) => {
            let (jsonl_path, entries) = sink.finish()?;
            Ok(IngestSummary {
                jsonl_path,
                entries,
                src_lang: Some(src_lang),
                trg_lang: Some(trg_lang),
            })
        }
        Err(e) => {
            sink.discard();
            Err(e)
        }
    }
}

/// Locate the `<xliff>` root and validate version and language attributes.
fn read_header<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    path: &Path,
) -> Result<(String, String)> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => {
                if local_name(e.name()) != "xliff" {
                    return Err(TmError::unsupported_format(
                        format!("root element is <{}>, expected <xliff>", local_name(e.name())),
                        path,
                    ));
                }
                match attr_value(&e, "version") {
                    Some(version) if version.starts_with("2.") => {}
                    Some(version) => {
                        return Err(TmError::unsupported_format(
                            format!("xliff version {version} is not supported"),
                            path,
                        ))
                    }
                    None => {
                        return Err(TmError::missing_attribute("xliff", "version", path));
                    }
                }
                let src_lang = attr_value(&e, "srcLang")
                    .ok_or_else(|| TmError::missing_attribute("xliff", "srcLang", path))?;
                let trg_lang = attr_value(&e, "trgLang")
                    .ok_or_else(|| TmError::missing_attribute("xliff", "trgLang", path))?;
                return Ok((src_lang, trg_lang));
            }
            Event::Eof => {
                return Err(TmError::unsupported_format("no root element", path));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn walk_document<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    path: &Path,
    options: &IngestOptions,
    src_lang: &str,
    trg_lang: &str,
    sink: &mut JsonlSink,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut context: Option<FileContext> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name()).as_str() {
                "file" => {
                    let file_id = attr_value(&e, "id")
                        .ok_or_else(|| TmError::missing_attribute("file", "id", path))?;
                    context = Some(FileContext {
                        file_id,
                        original: attr_value(&e, "original").unwrap_or_default(),
                        src_lang: src_lang.to_string(),
                        trg_lang: trg_lang.to_string(),
                    });
                }
                "unit" => {
                    let Some(ctx) = context.as_ref() else {
                        // Unit outside a <file>: nothing to attribute it to.
                        warn!(path = %path.display(), "skipping <unit> outside <file>");
                        skip_subtree(reader)?;
                        buf.clear();
                        continue;
                    };
                    let unit_id = attr_value(&e, "id")
                        .ok_or_else(|| TmError::missing_attribute("unit", "id", path))?;
                    let state = attr_value(&e, "state")
                        .as_deref()
                        .and_then(WorkflowState::parse);
                    let sub_state = attr_value(&e, "subState");
                    let attrs = LifecycleAttrs::read(&e);
                    let unit = read_unit(reader, unit_id, state, sub_state, attrs)?;
                    emit_unit(&unit, ctx, options, sink)?;
                }
                _ => {}
            },
            Event::End(e) => {
                if local_name(e.name()) == "file" {
                    context = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Read a `<unit>` subtree after its start tag has been consumed.
fn read_unit<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    id: String,
    state: Option<WorkflowState>,
    sub_state: Option<String>,
    attrs: LifecycleAttrs,
) -> Result<UnitData> {
    let mut unit = UnitData {
        id,
        state,
        sub_state,
        attrs,
        notes: Vec::new(),
        properties: BTreeMap::new(),
        parts: Vec::new(),
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name()).as_str() {
                "segment" => {
                    let start = e.to_owned();
                    unit.parts
                        .push(read_part(reader, PartKind::Segment, &start)?);
                }
                "ignorable" => {
                    let start = e.to_owned();
                    unit.parts
                        .push(read_part(reader, PartKind::Ignorable, &start)?);
                }
                "notes" => read_notes(reader, &mut unit.notes)?,
                "note" => unit.notes.push(read_text_content(reader)?.trim().to_owned()),
                "metadata" => read_metadata(reader, &mut unit.properties)?,
                _ => skip_subtree(reader)?,
            },
            Event::Empty(e) => {
                let kind = match local_name(e.name()).as_str() {
                    "segment" => Some(PartKind::Segment),
                    "ignorable" => Some(PartKind::Ignorable),
                    _ => None,
                };
                if let Some(kind) = kind {
                    unit.parts.push(UnitPart {
                        kind,
                        id: attr_value(&e, "id"),
                        state: attr_value(&e, "state").as_deref().and_then(WorkflowState::parse),
                        sub_state: attr_value(&e, "subState"),
                        attrs: LifecycleAttrs::read(&e),
                        notes: Vec::new(),
                        source: None,
                        target: None,
                    });
                }
            }
            Event::End(_) => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(unit)
}

/// Read a `<segment>` or `<ignorable>` subtree.
fn read_part<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    kind: PartKind,
    start: &BytesStart<'_>,
) -> Result<UnitPart> {
    let mut part = UnitPart {
        kind,
        id: attr_value(start, "id"),
        state: attr_value(start, "state").as_deref().and_then(WorkflowState::parse),
        sub_state: attr_value(start, "subState"),
        attrs: LifecycleAttrs::read(start),
        notes: Vec::new(),
        source: None,
        target: None,
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name()).as_str() {
                "source" => {
                    let start = e.to_owned();
                    part.source = Some(read_inline_content(reader, &start)?);
                }
                "target" => {
                    let start = e.to_owned();
                    part.target = Some(read_inline_content(reader, &start)?);
                }
                "notes" => read_notes(reader, &mut part.notes)?,
                "note" => part.notes.push(read_text_content(reader)?.trim().to_owned()),
                _ => skip_subtree(reader)?,
            },
            Event::Empty(e) => match local_name(e.name()).as_str() {
                "source" => part.source = Some(empty_inline_content(&e)?),
                "target" => part.target = Some(empty_inline_content(&e)?),
                _ => {}
            },
            Event::End(_) => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(part)
}

fn read_notes<R: std::io::BufRead>(reader: &mut Reader<R>, notes: &mut Vec<String>) -> Result<()> {
    let mut buf = Vec::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if depth == 0 && local_name(e.name()) == "note" {
                    let text = read_text_content(reader)?.trim().to_owned();
                    if !text.is_empty() {
                        notes.push(text);
                    }
                } else {
                    depth += 1;
                }
            }
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

/// Walk `<metadata>/<metaGroup>/<meta>` into `"category:type"` keyed
/// properties. Nested groups use the innermost category.
fn read_metadata<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    properties: &mut BTreeMap<String, String>,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut categories: Vec<String> = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match local_name(e.name()).as_str() {
                "metaGroup" => {
                    categories.push(attr_value(&e, "category").unwrap_or_default());
                }
                "meta" => {
                    let meta_type = attr_value(&e, "type").unwrap_or_default();
                    let value = read_text_content(reader)?.trim().to_owned();
                    let category = categories.last().cloned().unwrap_or_default();
                    properties.insert(format!("{category}:{meta_type}"), value);
                }
                _ => skip_subtree(reader)?,
            },
            Event::End(e) => {
                if local_name(e.name()) == "metaGroup" {
                    categories.pop();
                } else {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Apply inclusion rules and emit all entries for one unit.
fn emit_unit(
    unit: &UnitData,
    ctx: &FileContext,
    options: &IngestOptions,
    sink: &mut JsonlSink,
) -> Result<()> {
    let has_segments = unit.parts.iter().any(|p| p.kind == PartKind::Segment);

    if has_segments {
        let retained: Vec<&UnitPart> = unit
            .parts
            .iter()
            .filter(|part| part.kind == PartKind::Segment)
            .filter(|part| retains(part, options))
            .collect();
        let count = retained.len() as u32;

        for (position, part) in retained.iter().enumerate() {
            let index = position as u32 + 1;
            let source = part.source.as_ref().expect("retained implies source");
            let target = part
                .target
                .clone()
                .unwrap_or_else(|| InlineContent::merged("target", &[]));
            let metadata = build_metadata(unit, Some(part), index, count, options);
            emit_pair(sink, ctx, unit, index, count, source, &target, metadata)?;
        }

        if count > 1 {
            let sources: Vec<&InlineContent> = retained
                .iter()
                .filter_map(|part| part.source.as_ref())
                .collect();
            let targets: Vec<&InlineContent> = retained
                .iter()
                .filter_map(|part| part.target.as_ref())
                .collect();
            let merged_source = InlineContent::merged("source", &sources);
            let merged_target = InlineContent::merged("target", &targets);

            // The merged pair runs through the emptiness rules against its
            // own concatenated text, even though every component segment
            // was retained.
            if !merged_source.is_blank()
                && !(options.skip_empty && merged_target.is_blank())
            {
                let metadata = build_metadata(unit, None, 0, count, options);
                emit_pair(
                    sink,
                    ctx,
                    unit,
                    0,
                    count,
                    &merged_source,
                    &merged_target,
                    metadata,
                )?;
            }
        }
    } else {
        // No <segment> children: synthesize one virtual segment from the
        // unit's parts.
        let sources: Vec<&InlineContent> =
            unit.parts.iter().filter_map(|p| p.source.as_ref()).collect();
        let targets: Vec<&InlineContent> =
            unit.parts.iter().filter_map(|p| p.target.as_ref()).collect();
        let source = InlineContent::merged("source", &sources);
        let target = InlineContent::merged("target", &targets);

        if source.is_blank()
            || (options.skip_empty && target.is_blank())
            || !options.admits_state(unit.state)
        {
            return Ok(());
        }
        let metadata = build_metadata(unit, None, 1, 1, options);
        emit_pair(sink, ctx, unit, 1, 1, &source, &target, metadata)?;
    }
    Ok(())
}

/// Per-segment inclusion rules.
fn retains(part: &UnitPart, options: &IngestOptions) -> bool {
    let Some(source) = &part.source else {
        return false;
    };
    if source.is_blank() {
        return false;
    }
    if options.skip_empty && part.target.as_ref().map_or(true, InlineContent::is_blank) {
        return false;
    }
    options.admits_state(part.state)
}

fn build_metadata(
    unit: &UnitData,
    part: Option<&UnitPart>,
    segment_index: u32,
    segment_count: u32,
    options: &IngestOptions,
) -> Option<EntryMetadata> {
    if !options.extract_metadata {
        return None;
    }

    let attrs = match part {
        Some(part) => LifecycleAttrs::preferred(&part.attrs, &unit.attrs),
        None => unit.attrs.clone(),
    };

    let mut notes = unit.notes.clone();
    if let Some(part) = part {
        notes.extend(part.notes.iter().cloned());
    }

    let mut context = attrs.context.clone();
    if context.is_none() {
        // Promote a context-ish property when the document carried one.
        context = unit
            .properties
            .iter()
            .find(|(key, _)| key.to_lowercase().contains("context"))
            .map(|(_, value)| value.clone());
    }

    let metadata = EntryMetadata {
        state: part.map_or(unit.state, |p| p.state.or(unit.state)),
        sub_state: part
            .and_then(|p| p.sub_state.clone())
            .or_else(|| unit.sub_state.clone()),
        quality: None,
        creation_date: attrs.creation_date,
        creation_id: attrs.creation_id,
        change_date: attrs.change_date,
        change_id: attrs.change_id,
        creation_tool: attrs.creation_tool,
        creation_tool_version: attrs.creation_tool_version,
        context,
        last_usage_date: None,
        notes,
        usage_count: None,
        properties: unit.properties.clone(),
        segment: Some(SegmentProvenance {
            provider: "xliff".to_string(),
            file_hash: None,
            file_id: None,
            unit_id: Some(unit.id.clone()),
            segment_id: part.and_then(|p| p.id.clone()),
            segment_index: Some(segment_index),
            segment_count: Some(segment_count),
            segment_key: None,
        }),
    };
    Some(metadata)
}

#[allow(clippy::too_many_arguments)]
fn emit_pair(
    sink: &mut JsonlSink,
    ctx: &FileContext,
    unit: &UnitData,
    segment_index: u32,
    segment_count: u32,
    source: &InlineContent,
    target: &InlineContent,
    metadata: Option<EntryMetadata>,
) -> Result<()> {
    let mut metadata = metadata;
    if let Some(meta) = metadata.as_mut() {
        if let Some(provenance) = meta.segment.as_mut() {
            provenance.file_id = Some(ctx.file_id.clone());
        }
    }

    for (language, content) in [(&ctx.src_lang, source), (&ctx.trg_lang, target)] {
        sink.write(&PendingEntry {
            file_id: ctx.file_id.clone(),
            original: ctx.original.clone(),
            unit_id: unit.id.clone(),
            segment_index,
            segment_count,
            language: language.clone(),
            pure_text: content.pure_text.clone(),
            element: content.element.clone(),
            metadata: metadata.clone(),
        })?;
    }
    Ok(())
}
