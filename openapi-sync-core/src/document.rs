//! # document: the schema document model
//!
//! A [`SchemaDocument`] keeps two views of the bundled OpenAPI description:
//! the raw text, which is authoritative and written back byte-for-byte, and
//! a parsed `serde_yaml::Value` used to classify schemas and read metadata.
//! The value is re-derived after every edit.
//!
//! Edits never go through a YAML emitter. Instead the text is scanned for
//! the line span of the block being changed (a key line plus everything
//! indented under it) and only those lines are replaced. Scanning needs
//! block-style YAML, which is what the bundler emits; the parsed value is
//! always the source of truth for *what* a schema is.

use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::backup::write_atomic;
use crate::error::DocumentError;

pub const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

/// What a single entry under `components.schemas` is.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDefinition {
    /// Any definition that is not a pure reference. Opaque to the pipeline.
    Concrete(Value),
    /// A definition consisting of exactly one `$ref` to another schema.
    Alias { target: String, reference: String },
}

impl SchemaDefinition {
    pub fn classify(value: &Value) -> Self {
        if let Value::Mapping(map) = value {
            if map.len() == 1 {
                if let Some(Value::String(reference)) = map.get("$ref") {
                    if let Some(target) = reference.strip_prefix(SCHEMA_REF_PREFIX) {
                        if !target.is_empty() && !target.contains('/') {
                            return SchemaDefinition::Alias {
                                target: target.to_string(),
                                reference: reference.clone(),
                            };
                        }
                    }
                }
            }
        }
        SchemaDefinition::Concrete(value.clone())
    }

    pub fn alias_target(&self) -> Option<&str> {
        match self {
            SchemaDefinition::Alias { target, .. } => Some(target),
            SchemaDefinition::Concrete(_) => None,
        }
    }

    pub fn is_alias(&self) -> bool {
        self.alias_target().is_some()
    }
}

/// Line span of one mapping entry in the document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub key: String,
    pub indent: usize,
    /// Index of the key line.
    pub start: usize,
    /// One past the last significant line belonging to the entry.
    pub end: usize,
    /// Byte offset within the key line just past the key's colon.
    pub value_offset: usize,
}

impl Block {
    pub fn lines(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Lines after the key line.
    pub fn body(&self) -> Range<usize> {
        self.start + 1..self.end
    }
}

/// Result of forcing `additionalProperties: true` on a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOutcome {
    Applied,
    AlreadySet,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct SchemaDocument {
    text: String,
    value: Value,
}

impl SchemaDocument {
    pub fn parse(text: impl Into<String>) -> Result<Self, DocumentError> {
        let text = text.into();
        let value: Value = serde_yaml::from_str(&text)?;
        Ok(Self { text, value })
    }

    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc = Self::parse(text)?;
        debug!(
            path = %path.display(),
            schemas = doc.schemas().len(),
            bytes = doc.text.len(),
            "Loaded schema document"
        );
        Ok(doc)
    }

    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        write_atomic(path, self.text.as_bytes()).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), bytes = self.text.len(), "Saved schema document");
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_text(self) -> String {
        self.text
    }

    fn schema_map(&self) -> Option<&Mapping> {
        self.value.get("components")?.get("schemas")?.as_mapping()
    }

    /// Every schema in document order.
    pub fn schemas(&self) -> Vec<(String, SchemaDefinition)> {
        self.schema_map()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| {
                        Some((k.as_str()?.to_string(), SchemaDefinition::classify(v)))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn schema(&self, name: &str) -> Option<SchemaDefinition> {
        self.schema_map()?.get(name).map(SchemaDefinition::classify)
    }

    pub(crate) fn schema_value(&self, name: &str) -> Option<&Value> {
        self.schema_map()?.get(name)
    }

    pub fn info_extension(&self, key: &str) -> Option<&Value> {
        self.value.get("info")?.get(key)
    }

    pub(crate) fn lines(&self) -> Vec<&str> {
        self.text.split_inclusive('\n').collect()
    }

    /// Line spans of the entries under `components.schemas`.
    pub fn schema_blocks(&self) -> Result<Vec<Block>, DocumentError> {
        let lines = self.lines();
        let root = child_blocks(&lines, 0..lines.len(), None);
        let components = find_block(&lines, &root, "components")?;
        let sections = child_blocks(&lines, components.body(), Some(components.indent));
        let schemas = find_block(&lines, &sections, "schemas")?;
        Ok(child_blocks(&lines, schemas.body(), Some(schemas.indent)))
    }

    /// Replace whole-line ranges with new text and re-parse.
    ///
    /// Ranges must not overlap. If the result is not valid YAML the document
    /// is left unchanged.
    pub fn replace_lines(
        &mut self,
        mut edits: Vec<(Range<usize>, String)>,
    ) -> Result<(), DocumentError> {
        let lines = self.lines();
        let total = lines.len();
        let ends_with_newline = self.text.ends_with('\n');
        let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
        for (range, mut replacement) in edits {
            if range.start > range.end || range.end > total {
                return Err(DocumentError::Layout(format!(
                    "edit range {}..{} outside document of {} lines",
                    range.start, range.end, total
                )));
            }
            if range.end == total && !ends_with_newline && range.end > range.start {
                while replacement.ends_with('\n') {
                    replacement.pop();
                }
            }
            out.splice(range, std::iter::once(replacement));
        }
        let text: String = out.concat();
        let value: Value = serde_yaml::from_str(&text)?;
        self.text = text;
        self.value = value;
        Ok(())
    }

    /// Write `value` under `info.<key>`, replacing an existing entry.
    ///
    /// Only the extension's own lines change; `info` is created right after
    /// the `openapi` version line when missing.
    pub fn set_info_extension<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), DocumentError> {
        let rendered = serde_yaml::to_string(value)?;
        let lines = self.lines();
        let root = child_blocks(&lines, 0..lines.len(), None);
        let edit = match root.iter().find(|b| b.key == "info") {
            Some(info) => {
                if inline_value(&lines, info).is_some() {
                    return Err(DocumentError::Layout("info is written in flow style".into()));
                }
                let children = child_blocks(&lines, info.body(), Some(info.indent));
                let child_indent = children.first().map(|c| c.indent).unwrap_or(info.indent + 2);
                let step = child_indent.saturating_sub(info.indent).max(1);
                let text = render_entry(key, &rendered, child_indent, step);
                match children.iter().find(|c| c.key == key) {
                    Some(existing) => (existing.lines(), text),
                    None => (info.end..info.end, text),
                }
            }
            None => {
                let at = root.iter().find(|b| b.key == "openapi").map(|b| b.end).unwrap_or(0);
                let text = format!("info:\n{}", render_entry(key, &rendered, 2, 2));
                (at..at, text)
            }
        };
        self.replace_lines(vec![edit])?;
        debug!(key, "Wrote info extension");
        Ok(())
    }

    /// Force `additionalProperties: true` on one schema.
    pub fn allow_additional_properties(
        &mut self,
        schema: &str,
    ) -> Result<OverrideOutcome, DocumentError> {
        if self.schema(schema).is_none() {
            return Ok(OverrideOutcome::NotFound);
        }
        let blocks = self.schema_blocks()?;
        let lines = self.lines();
        let block = blocks
            .iter()
            .find(|b| b.key == schema)
            .ok_or_else(|| DocumentError::Layout(format!("schema {schema} not found in text")))?;
        if inline_value(&lines, block).is_some() {
            return Err(DocumentError::Layout(format!("schema {schema} is written in flow style")));
        }
        let children = child_blocks(&lines, block.body(), Some(block.indent));
        let child_indent = children.first().map(|c| c.indent).unwrap_or(block.indent + 2);
        let setting = format!("{}additionalProperties: true\n", " ".repeat(child_indent));
        let edit = match children.iter().find(|c| c.key == "additionalProperties") {
            Some(existing) if inline_value(&lines, existing) == Some("true") => {
                return Ok(OverrideOutcome::AlreadySet);
            }
            Some(existing) => (existing.lines(), setting),
            None => {
                let at = children
                    .iter()
                    .find(|c| c.key == "type")
                    .map(|c| c.end)
                    .unwrap_or(block.start + 1);
                (at..at, setting)
            }
        };
        self.replace_lines(vec![edit])?;
        info!(schema, "Allowed additional properties on schema");
        Ok(OverrideOutcome::Applied)
    }
}

fn find_block<'a>(
    lines: &[&str],
    blocks: &'a [Block],
    key: &str,
) -> Result<&'a Block, DocumentError> {
    let block = blocks
        .iter()
        .find(|b| b.key == key)
        .ok_or_else(|| DocumentError::Layout(format!("no {key} block")))?;
    if inline_value(lines, block).is_some() {
        return Err(DocumentError::Layout(format!("{key} is written in flow style")));
    }
    Ok(block)
}

fn render_entry(key: &str, rendered: &str, indent: usize, step: usize) -> String {
    let pad = " ".repeat(indent);
    let inner = " ".repeat(indent + step);
    let mut out = format!("{pad}{key}:\n");
    for line in rendered.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str(&inner);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub(crate) fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_insignificant(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Whether the value on this line is a `|` or `>` block scalar header, so
/// every more-indented line after it is scalar content.
fn opens_block_scalar(line: &str) -> bool {
    let mut content = line.trim_end_matches(['\n', '\r']).trim_start_matches(' ');
    while let Some(item) = content.strip_prefix("- ") {
        content = item.trim_start_matches(' ');
    }
    let value = match parse_key(content) {
        Some((_, offset)) => &content[offset..],
        None => content,
    };
    let value = value.trim_start();
    let header = value
        .find(" #")
        .map_or(value, |comment| &value[..comment])
        .trim_end();
    let mut chars = header.chars();
    matches!(chars.next(), Some('|' | '>'))
        && chars.all(|c| c == '-' || c == '+' || c.is_ascii_digit())
}

/// Value written on the key line itself, without a trailing comment.
pub(crate) fn inline_value<'a>(lines: &[&'a str], block: &Block) -> Option<&'a str> {
    let rest = lines[block.start][block.value_offset..].trim();
    if rest.is_empty() || rest.starts_with('#') {
        None
    } else {
        Some(rest)
    }
}

/// Entries directly under a parent block (or the root when `parent_indent`
/// is `None`) within `range`.
///
/// Non-key lines at the entries' own indent (block sequences written
/// without extra indentation) belong to the preceding entry. Trailing blank
/// and comment lines are not part of any entry; block scalar content always
/// is, whatever it starts with.
pub(crate) fn child_blocks(
    lines: &[&str],
    range: Range<usize>,
    parent_indent: Option<usize>,
) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut child_indent: Option<usize> = None;
    let mut scalar_indent: Option<usize> = None;
    for idx in range {
        let line = lines[idx];
        if line.trim().is_empty() {
            continue;
        }
        let indent = indent_of(line);
        if scalar_indent.is_some_and(|s| indent > s) {
            if let Some(last) = blocks.last_mut() {
                last.end = idx + 1;
            }
            continue;
        }
        scalar_indent = None;
        if is_insignificant(line) {
            continue;
        }
        if opens_block_scalar(line) {
            scalar_indent = Some(indent);
        }
        if parent_indent.is_some_and(|p| indent <= p) {
            break;
        }
        let expected = *child_indent.get_or_insert(indent);
        if indent < expected {
            break;
        }
        if indent == expected {
            if let Some((key, offset)) = parse_key(&line[indent..]) {
                blocks.push(Block {
                    key,
                    indent,
                    start: idx,
                    end: idx + 1,
                    value_offset: indent + offset,
                });
                continue;
            }
        }
        if let Some(last) = blocks.last_mut() {
            last.end = idx + 1;
        }
    }
    blocks
}

/// Split a mapping key off the start of a line. Returns the key and the byte
/// offset just past its colon.
fn parse_key(content: &str) -> Option<(String, usize)> {
    let content = content.trim_end_matches(['\n', '\r']);
    let first = content.chars().next()?;
    if matches!(first, '-' | '#' | '{' | '[' | '|' | '>') && !content.starts_with("-:") {
        if first != '-' || content.len() == 1 || content[1..].starts_with(' ') {
            return None;
        }
    }
    let (key, key_end) = match first {
        '\'' | '"' => parse_quoted(content, first)?,
        _ => {
            let colon = find_plain_colon(content)?;
            (content[..colon].trim_end().to_string(), colon)
        }
    };
    let after = &content[key_end..];
    let spaced = after.trim_start_matches(' ');
    if !spaced.starts_with(':') {
        return None;
    }
    let colon = key_end + (after.len() - spaced.len());
    match content[colon + 1..].chars().next() {
        None | Some(' ') | Some('\t') => Some((key, colon + 1)),
        _ => None,
    }
}

fn parse_quoted(content: &str, quote: char) -> Option<(String, usize)> {
    let body = &content[1..];
    let mut key = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            if quote == '\'' && chars.peek().map(|(_, n)| *n) == Some('\'') {
                key.push('\'');
                chars.next();
                continue;
            }
            return Some((key, 1 + i + c.len_utf8()));
        }
        if quote == '"' && c == '\\' {
            if let Some((_, escaped)) = chars.next() {
                key.push(escaped);
            }
            continue;
        }
        key.push(c);
    }
    None
}

fn find_plain_colon(content: &str) -> Option<usize> {
    let bytes = content.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b':' if i + 1 == bytes.len() || matches!(bytes[i + 1], b' ' | b'\t') => return Some(i),
            b'#' if i > 0 && matches!(bytes[i - 1], b' ' | b'\t') => return None,
            _ => {}
        }
    }
    None
}
