//! # inject: post-process generated Go models
//!
//! The generator is a black box; this module only touches its output:
//! - hand-curated fields are added to a model's struct, its `ToMap`
//!   serializer and its additional-properties bookkeeping;
//! - `decoder.DisallowUnknownFields()` is removed from every model so live
//!   responses carrying fields the pinned schema lacks still decode;
//! - the placeholder module path the generator emits is replaced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::write_atomic;
use crate::config::ModulePathRewrite;
use crate::error::InjectError;

/// One extra field for a generated model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedField {
    /// Go field name, e.g. `Shared`.
    pub name: String,
    /// JSON property name, e.g. `shared`.
    pub json: String,
    /// Go type, e.g. `[]SharedWorkflow`.
    #[serde(rename = "type")]
    pub go_type: String,
}

impl InjectedField {
    fn nillable(&self) -> bool {
        let t = self.go_type.as_str();
        t.starts_with('*')
            || t.starts_with("[]")
            || t.starts_with("map[")
            || t == "interface{}"
            || t == "any"
    }
}

/// Fields injected together into one model. The first field doubles as the
/// marker that the injection already ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInjection {
    pub model: String,
    /// Generated file name; derived from the model name when absent.
    #[serde(default)]
    pub file: Option<String>,
    pub fields: Vec<InjectedField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    Injected(usize),
    AlreadyInjected,
}

/// Add `injection.fields` to the model defined in `source`.
pub fn inject_fields(
    source: &str,
    injection: &ModelInjection,
) -> Result<(String, InjectionOutcome), InjectError> {
    let model = injection.model.as_str();
    let anchor = |anchor: &'static str| InjectError::Anchor {
        model: model.to_string(),
        anchor,
    };
    let Some(sentinel) = injection.fields.first() else {
        return Ok((source.to_string(), InjectionOutcome::Injected(0)));
    };

    let mut lines: Vec<String> = source.split_inclusive('\n').map(String::from).collect();
    let struct_open = format!("type {model} struct {{");
    let start = lines
        .iter()
        .position(|l| l.trim_end() == struct_open)
        .ok_or_else(|| anchor("struct definition"))?;
    let close = closing_brace(&lines, start).ok_or_else(|| anchor("end of struct definition"))?;

    let sentinel_prefix = format!("{} ", sentinel.name);
    if lines[start + 1..close]
        .iter()
        .any(|l| l.trim_start().starts_with(&sentinel_prefix))
    {
        debug!(model, sentinel = %sentinel.name, "Fields already injected");
        return Ok((source.to_string(), InjectionOutcome::AlreadyInjected));
    }

    let to_map_open = format!("func (o {model}) ToMap() (map[string]interface{{}}, error) {{");
    let to_map = lines
        .iter()
        .position(|l| l.trim_end() == to_map_open)
        .ok_or_else(|| anchor("ToMap function"))?;
    let to_map_close =
        closing_brace(&lines, to_map).ok_or_else(|| anchor("end of ToMap function"))?;
    let serialize_at = (to_map + 1..to_map_close)
        .find(|&i| {
            lines[i]
                .trim_start()
                .starts_with("for key, value := range o.AdditionalProperties")
        })
        .or_else(|| {
            (to_map + 1..to_map_close).find(|&i| lines[i].trim() == "return toSerialize, nil")
        })
        .ok_or_else(|| anchor("ToMap return statement"))?;
    let field_at = (start + 1..close)
        .find(|&i| lines[i].trim_start().starts_with("AdditionalProperties "))
        .unwrap_or(close);

    let mut edits: Vec<(usize, Vec<String>)> = Vec::new();
    edits.push((
        field_at,
        injection
            .fields
            .iter()
            .map(|f| format!("\t{} {} `json:\"{},omitempty\"`\n", f.name, f.go_type, f.json))
            .collect(),
    ));
    edits.push((
        serialize_at,
        injection
            .fields
            .iter()
            .flat_map(|f| {
                if f.nillable() {
                    vec![
                        format!("\tif !IsNil(o.{}) {{\n", f.name),
                        format!("\t\ttoSerialize[\"{}\"] = o.{}\n", f.json, f.name),
                        "\t}\n".to_string(),
                    ]
                } else {
                    vec![format!("\ttoSerialize[\"{}\"] = o.{}\n", f.json, f.name)]
                }
            })
            .collect(),
    ));
    // Models without additional properties have no bookkeeping to extend.
    if let Some(last) = lines
        .iter()
        .rposition(|l| l.trim_start().starts_with("delete(additionalProperties, \""))
    {
        let indent = leading_whitespace(&lines[last]).to_string();
        edits.push((
            last + 1,
            injection
                .fields
                .iter()
                .map(|f| format!("{indent}delete(additionalProperties, \"{}\")\n", f.json))
                .collect(),
        ));
    }

    // Bottom-up so earlier indices stay valid.
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (at, inserted) in edits {
        lines.splice(at..at, inserted);
    }

    info!(model, fields = injection.fields.len(), "Injected model fields");
    Ok((lines.concat(), InjectionOutcome::Injected(injection.fields.len())))
}

/// Index of the first line after `open` that is a lone `}` at column 0.
fn closing_brace(lines: &[String], open: usize) -> Option<usize> {
    (open + 1..lines.len()).find(|&i| lines[i].trim_end() == "}")
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Remove every `DisallowUnknownFields()` call. Returns the new source and
/// the number of calls removed.
pub fn relax_unknown_fields(source: &str) -> (String, usize) {
    let mut removed = 0;
    let relaxed: String = source
        .split_inclusive('\n')
        .filter(|line| {
            let strict = line.trim().ends_with(".DisallowUnknownFields()");
            if strict {
                removed += 1;
            }
            !strict
        })
        .collect();
    (relaxed, removed)
}

pub fn rewrite_module_path(source: &str, from: &str, to: &str) -> (String, usize) {
    if from.is_empty() {
        return (source.to_string(), 0);
    }
    let count = source.matches(from).count();
    if count == 0 {
        return (source.to_string(), 0);
    }
    (source.replace(from, to), count)
}

/// File the generator writes for `model`: `{prefix}{snake_case}.go`.
pub fn model_file_name(prefix: &str, model: &str) -> String {
    let chars: Vec<char> = model.chars().collect();
    let mut snake = String::with_capacity(model.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower)
            {
                snake.push('_');
            }
        }
        snake.push(c.to_ascii_lowercase());
    }
    format!("{prefix}{snake}.go")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostProcessReport {
    pub module_paths_rewritten: usize,
    pub models_relaxed: usize,
    pub injections: Vec<(String, InjectionOutcome)>,
}

impl PostProcessReport {
    /// True when nothing was written.
    pub fn is_noop(&self) -> bool {
        self.module_paths_rewritten == 0
            && self.models_relaxed == 0
            && self
                .injections
                .iter()
                .all(|(_, o)| *o == InjectionOutcome::AlreadyInjected)
    }
}

/// Applies every post-generation fix to an SDK directory.
#[derive(Debug, Clone)]
pub struct ModelPostProcessor<'a> {
    pub model_prefix: &'a str,
    pub module_path: Option<&'a ModulePathRewrite>,
    pub injections: &'a [ModelInjection],
}

impl ModelPostProcessor<'_> {
    pub fn run(&self, sdk_dir: &Path) -> Result<PostProcessReport, InjectError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| InjectError::Io { path, source }
        };
        let mut report = PostProcessReport::default();

        let mut files = Vec::new();
        collect_sources(sdk_dir, &mut files).map_err(io_err(sdk_dir))?;
        for path in &files {
            let original = fs::read_to_string(path).map_err(io_err(path))?;
            let mut text = original.clone();
            if let Some(rewrite) = self.module_path {
                let (rewritten, n) = rewrite_module_path(&text, &rewrite.from, &rewrite.to);
                report.module_paths_rewritten += n;
                text = rewritten;
            }
            if self.is_model(path) {
                let (relaxed, n) = relax_unknown_fields(&text);
                if n > 0 {
                    report.models_relaxed += 1;
                }
                text = relaxed;
            }
            if text != original {
                write_atomic(path, text.as_bytes()).map_err(io_err(path))?;
                debug!(path = %path.display(), "Rewrote generated file");
            }
        }

        for injection in self.injections {
            let file = injection
                .file
                .clone()
                .unwrap_or_else(|| model_file_name(self.model_prefix, &injection.model));
            let path = sdk_dir.join(file);
            if !path.is_file() {
                warn!(
                    model = %injection.model,
                    path = %path.display(),
                    "Generated model file missing"
                );
                return Err(InjectError::MissingModel {
                    model: injection.model.clone(),
                    path,
                });
            }
            let source = fs::read_to_string(&path).map_err(io_err(&path))?;
            let (updated, outcome) = inject_fields(&source, injection)?;
            if let InjectionOutcome::Injected(_) = outcome {
                write_atomic(&path, updated.as_bytes()).map_err(io_err(&path))?;
            }
            report.injections.push((injection.model.clone(), outcome));
        }

        info!(
            sdk_dir = %sdk_dir.display(),
            files = files.len(),
            module_paths = report.module_paths_rewritten,
            relaxed = report.models_relaxed,
            injections = report.injections.len(),
            "Post-processed generated SDK"
        );
        Ok(report)
    }

    fn is_model(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(self.model_prefix) && n.ends_with(".go"))
    }
}

/// Go sources and `go.mod` files under `dir`, sorted for stable logs.
fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_sources(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "go")
            || path.file_name().is_some_and(|n| n == "go.mod")
        {
            out.push(path);
        }
    }
    Ok(())
}
