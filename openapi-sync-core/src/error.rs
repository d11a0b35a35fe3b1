//! Error types for every pipeline component.
//!
//! Components return these instead of aborting; only the orchestrator in
//! [`crate::synchronise`] decides whether a failure ends the run.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("document is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unexpected document layout: {0}")]
    Layout(String),
}

/// Where a hunk came closest to matching, for re-deriving a patch by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearestMatch {
    /// 1-based line in the target file.
    pub line: usize,
    pub matching_lines: usize,
    pub total_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkNotFound {
    pub path: String,
    /// 1-based position of the hunk in the patch.
    pub hunk: usize,
    /// 1-based line the hunk header expected, after earlier hunks' shift.
    pub expected_line: usize,
    pub fuzz: usize,
    pub nearest: Option<NearestMatch>,
}

impl std::fmt::Display for HunkNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hunk #{} of {} not found within {} lines of line {}",
            self.hunk, self.path, self.fuzz, self.expected_line
        )?;
        match &self.nearest {
            Some(n) => write!(
                f,
                " (nearest candidate at line {}: {}/{} lines match)",
                n.line, n.matching_lines, n.total_lines
            ),
            None => write!(f, " (no candidate location)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed patch at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("patch target does not exist: {0}")]
    MissingTarget(PathBuf),
    #[error("{0}")]
    HunkNotFound(HunkNotFound),
    #[error("patched {path} is no longer valid YAML: {source}")]
    InvalidResult {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("generated model file not found for {model}: {path}")]
    MissingModel { model: String, path: PathBuf },
    #[error("could not locate {anchor} for model {model}")]
    Anchor { model: String, anchor: &'static str },
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release lookup failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("release response did not contain {0}")]
    Missing(&'static str),
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error("latest upstream version is unknown")]
    LatestUnknown,
    #[error("no pin line found in {0}")]
    PinNotFound(PathBuf),
    #[error("{count} pin lines found in {path}, refusing to rewrite")]
    AmbiguousPin { path: PathBuf, count: usize },
    #[error("invalid pin {0:?}, expected <commit>@<version>")]
    InvalidPin(String),
    #[error("invalid pin pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("version metadata {0} not found in document")]
    MissingRecord(String),
    #[error("version metadata is malformed: {0}")]
    MalformedRecord(#[source] serde_yaml::Error),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool template is empty")]
    EmptyTemplate,
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("git commit failed: {0}")]
    Commit(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("expected upstream input is missing: {0}")]
    MissingSources(PathBuf),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required input is missing: {0}")]
    MissingInput(PathBuf),
    #[error("{0} does not change the document")]
    NoChanges(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
