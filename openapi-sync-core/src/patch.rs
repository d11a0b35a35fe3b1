//! # patch: capture and replay hand edits as a unified diff
//!
//! Patches are zero-prefix unified diffs (`--- path` / `+++ path`, no `a/`
//! or `b/`). Replaying tolerates upstream drift: each hunk is searched for at
//! its expected line and then at increasing offsets up to the fuzz factor.
//! A replay either applies every hunk to every file or changes nothing.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use similar::{ChangeTag, TextDiff};
use tracing::{debug, info, warn};

use crate::backup::{write_atomic, FileBackup};
use crate::error::{HunkNotFound, NearestMatch, PatchError};

pub const CONTEXT_LINES: usize = 3;

/// One line of a hunk body. The text keeps its trailing newline, except
/// for a final line marked "\ No newline at end of file".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

impl HunkLine {
    fn text(&self) -> &str {
        match self {
            HunkLine::Context(t) | HunkLine::Remove(t) | HunkLine::Add(t) => t,
        }
    }

    fn text_mut(&mut self) -> &mut String {
        match self {
            HunkLine::Context(t) | HunkLine::Remove(t) | HunkLine::Add(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub path: String,
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines the hunk expects to find.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(t) | HunkLine::Remove(t) => Some(t.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk leaves behind.
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(t) | HunkLine::Add(t) => Some(t.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    /// 0-based index of the first old line.
    fn old_index(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchDocument {
    pub hunks: Vec<Hunk>,
}

impl PatchDocument {
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        let mut hunks = Vec::new();
        let mut old_path: Option<String> = None;
        let mut path: Option<String> = None;
        let mut lines = text.split_inclusive('\n').enumerate().peekable();

        while let Some((idx, raw)) = lines.next() {
            let line = raw.trim_end_matches(['\n', '\r']);
            if let Some(rest) = line.strip_prefix("--- ") {
                old_path = Some(header_path(rest));
                continue;
            }
            if let Some(rest) = line.strip_prefix("+++ ") {
                let new_path = header_path(rest);
                path = Some(match (&old_path, new_path.as_str()) {
                    (Some(old), "/dev/null") => old.clone(),
                    _ => new_path,
                });
                continue;
            }
            if !line.starts_with("@@") {
                continue;
            }

            let malformed = |line: usize, reason: &str| PatchError::Malformed {
                line,
                reason: reason.to_string(),
            };
            let target = path.clone().ok_or_else(|| malformed(idx + 1, "hunk before file header"))?;
            let (old_start, old_len, new_start, new_len) = parse_range_header(line)
                .ok_or_else(|| malformed(idx + 1, "unreadable hunk header"))?;

            let mut body: Vec<HunkLine> = Vec::new();
            let (mut old_seen, mut new_seen) = (0, 0);
            while old_seen < old_len || new_seen < new_len {
                let (body_idx, body_raw) = lines.next().ok_or_else(|| {
                    malformed(idx + 1, "hunk body ends before its declared length")
                })?;
                match body_raw.chars().next() {
                    Some(' ') => {
                        body.push(HunkLine::Context(body_raw[1..].to_string()));
                        old_seen += 1;
                        new_seen += 1;
                    }
                    Some('\n') | Some('\r') => {
                        body.push(HunkLine::Context("\n".to_string()));
                        old_seen += 1;
                        new_seen += 1;
                    }
                    Some('-') => {
                        body.push(HunkLine::Remove(body_raw[1..].to_string()));
                        old_seen += 1;
                    }
                    Some('+') => {
                        body.push(HunkLine::Add(body_raw[1..].to_string()));
                        new_seen += 1;
                    }
                    Some('\\') => strip_final_newline(&mut body),
                    _ => return Err(malformed(body_idx + 1, "unexpected line in hunk body")),
                }
            }
            if lines.peek().is_some_and(|(_, next)| next.starts_with('\\')) {
                strip_final_newline(&mut body);
                lines.next();
            }
            hunks.push(Hunk {
                path: target,
                old_start,
                old_len,
                new_start,
                new_len,
                lines: body,
            });
        }
        Ok(Self { hunks })
    }

    pub fn load(path: &Path) -> Result<Self, PatchError> {
        let text = fs::read_to_string(path).map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        write_atomic(path, self.render().as_bytes()).map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn additions(&self) -> usize {
        self.count(|l| matches!(l, HunkLine::Add(_)))
    }

    pub fn deletions(&self) -> usize {
        self.count(|l| matches!(l, HunkLine::Remove(_)))
    }

    fn count(&self, pred: impl Fn(&HunkLine) -> bool) -> usize {
        self.hunks.iter().flat_map(|h| &h.lines).filter(|l| pred(l)).count()
    }

    /// Hunks grouped by target path in first-seen order, each tagged with its
    /// position in the patch.
    fn by_file(&self) -> Vec<(&str, Vec<(usize, &Hunk)>)> {
        let mut files: Vec<(&str, Vec<(usize, &Hunk)>)> = Vec::new();
        for (i, hunk) in self.hunks.iter().enumerate() {
            match files.iter_mut().find(|(p, _)| *p == hunk.path) {
                Some((_, hunks)) => hunks.push((i, hunk)),
                None => files.push((hunk.path.as_str(), vec![(i, hunk)])),
            }
        }
        files
    }
}

impl fmt::Display for PatchDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<&str> = None;
        for hunk in &self.hunks {
            if current != Some(hunk.path.as_str()) {
                writeln!(f, "--- {}", hunk.path)?;
                writeln!(f, "+++ {}", hunk.path)?;
                current = Some(&hunk.path);
            }
            writeln!(
                f,
                "@@ -{} +{} @@",
                render_range(hunk.old_start, hunk.old_len),
                render_range(hunk.new_start, hunk.new_len)
            )?;
            for line in &hunk.lines {
                let sign = match line {
                    HunkLine::Context(_) => ' ',
                    HunkLine::Remove(_) => '-',
                    HunkLine::Add(_) => '+',
                };
                write!(f, "{sign}{}", line.text())?;
                if !line.text().ends_with('\n') {
                    write!(f, "\n\\ No newline at end of file\n")?;
                }
            }
        }
        Ok(())
    }
}

fn render_range(start: usize, len: usize) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{start},{len}")
    }
}

fn header_path(rest: &str) -> String {
    rest.split('\t').next().unwrap_or(rest).trim_end().to_string()
}

fn parse_range_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let end = rest.find(" @@")?;
    let (old, new) = rest[..end].split_once(" +")?;
    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;
    Some((old_start, old_len, new_start, new_len))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

fn strip_final_newline(body: &mut [HunkLine]) {
    if let Some(last) = body.last_mut() {
        let text = last.text_mut();
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
    }
}

/// Rewrite raw `git diff` output into the zero-prefix form the applier
/// reads: everything before the first file header is dropped and `a/` / `b/`
/// path prefixes are removed.
pub fn normalize_prefixes(text: &str) -> String {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let opens_file = |i: usize| {
        lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "))
    };
    let Some(first) = (0..lines.len()).find(|&i| opens_file(i)) else {
        return String::new();
    };
    let mut out = String::with_capacity(text.len());
    for (i, line) in lines.iter().enumerate().skip(first) {
        let is_header = opens_file(i)
            || (line.starts_with("+++ ") && i > 0 && lines[i - 1].starts_with("--- "));
        match (is_header, line.get(..6)) {
            (true, Some("--- a/")) => {
                out.push_str("--- ");
                out.push_str(&line[6..]);
            }
            (true, Some("+++ b/")) => {
                out.push_str("+++ ");
                out.push_str(&line[6..]);
            }
            _ => out.push_str(line),
        }
    }
    out
}

/// Diff `before` against `after` as a single-file patch for `path`.
///
/// Returns `None` when the texts are identical.
pub fn capture(path: &str, before: &str, after: &str) -> Option<PatchDocument> {
    if before == after {
        return None;
    }
    let diff = TextDiff::from_lines(before, after);
    let mut hunks = Vec::new();
    for group in diff.grouped_ops(CONTEXT_LINES) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old = first.old_range().start..last.old_range().end;
        let new = first.new_range().start..last.new_range().end;
        let mut lines = Vec::new();
        for op in &group {
            for change in diff.iter_changes(op) {
                let text = change.value().to_string();
                lines.push(match change.tag() {
                    ChangeTag::Equal => HunkLine::Context(text),
                    ChangeTag::Delete => HunkLine::Remove(text),
                    ChangeTag::Insert => HunkLine::Add(text),
                });
            }
        }
        let start = |range: &std::ops::Range<usize>| {
            if range.is_empty() {
                range.start
            } else {
                range.start + 1
            }
        };
        hunks.push(Hunk {
            path: path.to_string(),
            old_start: start(&old),
            old_len: old.len(),
            new_start: start(&new),
            new_len: new.len(),
            lines,
        });
    }
    debug!(path, hunks = hunks.len(), "Captured patch");
    Some(PatchDocument { hunks })
}

/// In-memory result of replaying hunks against one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextApplication {
    pub text: String,
    pub applied: usize,
    pub already_applied: usize,
}

enum Found {
    Old(usize),
    New(usize),
}

fn same_line(a: &str, b: &str) -> bool {
    a.trim_end_matches(['\n', '\r']) == b.trim_end_matches(['\n', '\r'])
}

fn matches_at(lines: &[String], block: &[&str], at: usize) -> bool {
    at + block.len() <= lines.len() && block.iter().zip(&lines[at..]).all(|(b, l)| same_line(b, l))
}

/// Candidate positions nearest first: expected, expected-1, expected+1, ...
fn candidates(expected: usize, fuzz: usize) -> impl Iterator<Item = usize> {
    (0..=fuzz).flat_map(move |offset| {
        let below = expected.checked_sub(offset);
        let above = (offset > 0).then(|| expected + offset);
        below.into_iter().chain(above)
    })
}

fn locate(
    lines: &[String],
    old: &[&str],
    new: &[&str],
    expected: usize,
    fuzz: usize,
) -> Option<Found> {
    let old_at = candidates(expected, fuzz).find(|&at| matches_at(lines, old, at));
    if let Some(at) = old_at {
        // After an insertion the old block can still match as a prefix of
        // the new one; the longer match wins.
        let applied_here =
            !new.is_empty() && new.len() >= old.len() && matches_at(lines, new, at);
        return Some(if applied_here {
            Found::New(at)
        } else {
            Found::Old(at)
        });
    }
    if new.is_empty() {
        return None;
    }
    candidates(expected, fuzz)
        .find(|&at| matches_at(lines, new, at))
        .map(Found::New)
}

fn nearest(lines: &[String], old: &[&str], expected: usize) -> Option<NearestMatch> {
    if old.is_empty() || old.len() > lines.len() {
        return None;
    }
    (0..=lines.len() - old.len())
        .map(|at| {
            let score = old.iter().zip(&lines[at..]).filter(|(b, l)| same_line(b, l)).count();
            (at, score)
        })
        .filter(|(_, score)| *score > 0)
        .max_by(|(a_at, a), (b_at, b)| {
            a.cmp(b)
                .then(b_at.abs_diff(expected).cmp(&a_at.abs_diff(expected)))
        })
        .map(|(at, score)| NearestMatch {
            line: at + 1,
            matching_lines: score,
            total_lines: old.len(),
        })
}

/// Replay `hunks`, in order, against `text`.
///
/// Each hunk is looked for at its header line shifted by the drift and
/// length changes of the hunks before it, then up to `fuzz` lines either
/// side. Hunks whose result is already present are counted, not reapplied.
pub fn apply_to_text<'a>(
    text: &str,
    hunks: impl IntoIterator<Item = &'a Hunk>,
    fuzz: usize,
) -> Result<TextApplication, HunkNotFound> {
    let mut lines: Vec<String> = text.split_inclusive('\n').map(String::from).collect();
    let mut shift: isize = 0;
    let mut applied = 0;
    let mut already_applied = 0;

    for (i, hunk) in hunks.into_iter().enumerate() {
        let old = hunk.old_lines();
        let new = hunk.new_lines();
        let header = hunk.old_index();
        let expected = (header as isize + shift).max(0) as usize;

        match locate(&lines, &old, &new, expected, fuzz) {
            Some(Found::Old(at)) => {
                let mut cursor = at;
                let mut replacement = Vec::with_capacity(new.len());
                for line in &hunk.lines {
                    match line {
                        HunkLine::Context(_) => {
                            replacement.push(lines[cursor].clone());
                            cursor += 1;
                        }
                        HunkLine::Remove(_) => cursor += 1,
                        HunkLine::Add(t) => replacement.push(t.clone()),
                    }
                }
                let inserted = replacement.len();
                lines.splice(at..at + old.len(), replacement);
                terminate_lines(&mut lines, at.saturating_sub(1)..at + inserted);
                debug!(
                    path = %hunk.path,
                    hunk = i + 1,
                    line = at + 1,
                    offset = at as isize - expected as isize,
                    "Applied hunk"
                );
                shift = at as isize - header as isize + new.len() as isize - old.len() as isize;
                applied += 1;
            }
            Some(Found::New(at)) => {
                debug!(path = %hunk.path, hunk = i + 1, line = at + 1, "Hunk already applied");
                shift = at as isize - header as isize + new.len() as isize - old.len() as isize;
                already_applied += 1;
            }
            None => {
                return Err(HunkNotFound {
                    path: hunk.path.clone(),
                    hunk: i + 1,
                    expected_line: expected + 1,
                    fuzz,
                    nearest: nearest(&lines, &old, expected),
                });
            }
        }
    }

    Ok(TextApplication {
        text: lines.concat(),
        applied,
        already_applied,
    })
}

/// Every line but the file's last must end with a newline.
fn terminate_lines(lines: &mut [String], range: std::ops::Range<usize>) {
    let last = lines.len().saturating_sub(1);
    for idx in range {
        if idx < last {
            if let Some(line) = lines.get_mut(idx) {
                if !line.ends_with('\n') {
                    line.push('\n');
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Files whose content changed.
    pub files: Vec<PathBuf>,
    pub applied: usize,
    pub already_applied: usize,
}

impl PatchReport {
    pub fn is_noop(&self) -> bool {
        self.applied == 0
    }
}

/// Applies patches to files under `root`, all or nothing.
#[derive(Debug, Clone)]
pub struct PatchApplier {
    pub root: PathBuf,
    pub fuzz: usize,
}

impl PatchApplier {
    pub fn new(root: impl Into<PathBuf>, fuzz: usize) -> Self {
        Self {
            root: root.into(),
            fuzz,
        }
    }

    pub fn apply(&self, patch: &PatchDocument) -> Result<PatchReport, PatchError> {
        let mut report = PatchReport::default();
        if patch.is_empty() {
            info!("Patch has no hunks");
            return Ok(report);
        }

        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PatchError::Io { path, source }
        };

        // Compute every result before touching any file.
        let mut pending = Vec::new();
        for (rel, hunks) in patch.by_file() {
            let target = self.root.join(rel);
            if !target.is_file() {
                return Err(PatchError::MissingTarget(target));
            }
            let original = fs::read_to_string(&target).map_err(io(target.as_path()))?;
            let result = apply_to_text(&original, hunks.iter().map(|(_, h)| *h), self.fuzz)
                .map_err(|mut e| {
                    e.hunk = hunks
                        .get(e.hunk - 1)
                        .map(|(global, _)| global + 1)
                        .unwrap_or(e.hunk);
                    warn!(
                        path = %e.path,
                        hunk = e.hunk,
                        nearest = ?e.nearest,
                        "Hunk could not be located"
                    );
                    PatchError::HunkNotFound(e)
                })?;
            if is_yaml(&target) {
                serde_yaml::from_str::<serde_yaml::Value>(&result.text).map_err(|source| {
                    PatchError::InvalidResult {
                        path: target.clone(),
                        source,
                    }
                })?;
            }
            report.applied += result.applied;
            report.already_applied += result.already_applied;
            pending.push((target, original, result.text));
        }

        // An early return drops the guards, which restores every file written so far.
        let mut backups = Vec::new();
        for (target, original, text) in &pending {
            if text == original {
                continue;
            }
            let backup = FileBackup::create(target).map_err(io(target.as_path()))?;
            write_atomic(target, text.as_bytes()).map_err(io(target.as_path()))?;
            backups.push(backup);
            report.files.push(target.clone());
        }
        for backup in backups {
            let path = backup.path().to_path_buf();
            if let Err(e) = backup.discard() {
                warn!(error = ?e, path = %path.display(), "Failed to remove backup");
            }
        }

        info!(
            files = report.files.len(),
            applied = report.applied,
            already_applied = report.already_applied,
            fuzz = self.fuzz,
            "Applied patch"
        );
        Ok(report)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
}
