//! # alias: inline schemas that are nothing but a `$ref`
//!
//! An alias `A: {$ref: '#/components/schemas/B'}` is replaced by a copy of
//! the body of the first concrete schema reached by following the chain
//! `A -> B -> ...`. Only the alias's own lines change. Aliases whose chain
//! ends at a missing schema or loops back on itself are left alone and
//! reported.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::document::{indent_of, inline_value, Block, SchemaDefinition, SchemaDocument};
use crate::error::DocumentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAlias {
    pub alias: String,
    /// Schema the alias pointed at directly.
    pub target: String,
    /// Concrete schema whose body was inlined.
    pub concrete: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    MissingTarget,
    Cycle,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::MissingTarget => write!(f, "target schema not defined in document"),
            UnresolvedReason::Cycle => write!(f, "alias chain loops back on itself"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedAlias {
    pub alias: String,
    pub target: String,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasReport {
    pub resolved: Vec<ResolvedAlias>,
    pub unresolved: Vec<UnresolvedAlias>,
}

impl AliasReport {
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_noop(&self) -> bool {
        self.resolved.is_empty()
    }
}

enum Chain<'a> {
    Concrete(&'a str),
    Unresolved(UnresolvedReason),
}

fn follow<'a>(
    alias: &'a str,
    target: &'a str,
    defs: &HashMap<&'a str, &'a SchemaDefinition>,
) -> Chain<'a> {
    let mut seen = vec![alias];
    let mut current = target;
    loop {
        if seen.contains(&current) {
            return Chain::Unresolved(UnresolvedReason::Cycle);
        }
        match defs.get(current).copied().map(SchemaDefinition::alias_target) {
            None => return Chain::Unresolved(UnresolvedReason::MissingTarget),
            Some(None) => return Chain::Concrete(current),
            Some(Some(next)) => {
                seen.push(current);
                current = next;
            }
        }
    }
}

/// Resolve every alias in `doc` in one pass.
///
/// Running it again on the result changes nothing.
pub fn resolve_aliases(doc: &mut SchemaDocument) -> Result<AliasReport, DocumentError> {
    let schemas = doc.schemas();
    let defs: HashMap<&str, &SchemaDefinition> =
        schemas.iter().map(|(n, d)| (n.as_str(), d)).collect();
    let aliases: Vec<(&str, &str)> = schemas
        .iter()
        .filter_map(|(name, def)| def.alias_target().map(|t| (name.as_str(), t)))
        .collect();

    let mut report = AliasReport::default();
    if aliases.is_empty() {
        debug!("No alias schemas in document");
        return Ok(report);
    }

    let blocks = doc.schema_blocks()?;
    let lines = doc.lines();
    let find = |name: &str| -> Result<&Block, DocumentError> {
        blocks
            .iter()
            .find(|b| b.key == name)
            .ok_or_else(|| {
                DocumentError::Layout(format!("schema {name} could not be located in the text"))
            })
    };

    let mut edits = Vec::new();
    for (alias, target) in aliases {
        let concrete = match follow(alias, target, &defs) {
            Chain::Concrete(name) => name,
            Chain::Unresolved(reason) => {
                warn!(alias, target, %reason, "Alias left unresolved");
                report.unresolved.push(UnresolvedAlias {
                    alias: alias.to_string(),
                    target: target.to_string(),
                    reason,
                });
                continue;
            }
        };
        let alias_block = find(alias)?;
        let concrete_block = find(concrete)?;
        edits.push((alias_block.lines(), render_inlined(&lines, alias_block, concrete_block)));
        debug!(alias, target, concrete, "Inlining alias");
        report.resolved.push(ResolvedAlias {
            alias: alias.to_string(),
            target: target.to_string(),
            concrete: concrete.to_string(),
        });
    }
    drop(lines);

    if !edits.is_empty() {
        let mut next = doc.clone();
        next.replace_lines(edits)?;
        for resolved in &report.resolved {
            let inlined = next.schema_value(&resolved.alias);
            if inlined.is_none() || inlined != next.schema_value(&resolved.concrete) {
                return Err(DocumentError::Layout(format!(
                    "inlined schema {} does not match {}",
                    resolved.alias, resolved.concrete
                )));
            }
        }
        *doc = next;
    }
    info!(
        resolved = report.resolved_count(),
        unresolved = report.unresolved.len(),
        "Resolved schema aliases"
    );
    Ok(report)
}

/// The alias's key line followed by the concrete body shifted to the alias's
/// indentation.
fn render_inlined(lines: &[&str], alias: &Block, concrete: &Block) -> String {
    let head = &lines[alias.start][..alias.value_offset];
    if let Some(value) = inline_value(lines, concrete) {
        return format!("{head} {value}\n");
    }
    let shift = alias.indent as isize - concrete.indent as isize;
    let mut out = format!("{head}\n");
    for line in &lines[concrete.body()] {
        let content = line.trim_end_matches(['\n', '\r']);
        if content.trim().is_empty() {
            out.push('\n');
            continue;
        }
        let indent = indent_of(content);
        let shifted = (indent as isize + shift).max(0) as usize;
        out.push_str(&" ".repeat(shifted));
        out.push_str(&content[indent..]);
        out.push('\n');
    }
    out
}
