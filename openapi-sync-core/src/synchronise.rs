//! High-level pipeline: orchestrates fetch → bundle → reshape → snapshot → patch → generate.
//!
//! This module drives the document through the stages of a run as a small
//! state machine. Each stage reads the files left by the stage before it, so
//! stages run strictly one after another and a later stage never starts
//! before an earlier one has written its result.
//!
//! # Major Types
//! - [`Stage`]: the states of a run, including the terminal `Done` and `Failed`
//! - [`RunMode`]: which stages a given CLI command visits
//! - [`SynchroniseReport`]: per-stage outcomes of a successful run
//! - [`PipelineFailure`]: the failing stage, its error, and everything that completed before it
//!
//! # Responsibilities
//! - Fail-fast: the first stage error ends the run in `Failed`
//! - The unpatched document is committed before any patch or injection touches it
//! - The document handed to the generator is restored afterwards, on success and on failure
//! - Advisory lookups (latest release) degrade instead of failing the run
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]
//! - Patch authoring helpers: [`create_patch`], [`patch_from_commit`]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::alias::resolve_aliases;
use crate::backup::FileBackup;
use crate::config::PipelineConfig;
use crate::contract::{run_checked, CommandRunner, ReleaseSource};
use crate::document::{OverrideOutcome, SchemaDocument};
use crate::download::{bundle, fetch_upstream};
use crate::error::PipelineError;
use crate::git::{commit_document, show_file, SnapshotOutcome};
use crate::inject::ModelPostProcessor;
use crate::patch::{capture, PatchApplier, PatchDocument, PatchReport};
use crate::version::{annotate, fetch_latest, SyncStatus, VersionRecord, UNKNOWN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetching,
    Bundling,
    ResolvingAliases,
    Snapshotting,
    Patching,
    GeneratorHandoff,
    Injecting,
    Restoring,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetching => "fetching",
            Stage::Bundling => "bundling",
            Stage::ResolvingAliases => "resolving-aliases",
            Stage::Snapshotting => "snapshotting",
            Stage::Patching => "patching",
            Stage::GeneratorHandoff => "generator-handoff",
            Stage::Injecting => "injecting",
            Stage::Restoring => "restoring",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Every stage.
    Full,
    /// Fetch and reshape the document; optionally snapshot it and apply the patch.
    /// Patching is only reachable through a snapshot.
    Download { snapshot: bool, patch: bool },
    Patch,
    /// Generator handoff, post-processing and restore.
    Generate,
    Inject,
}

impl RunMode {
    pub const DOWNLOAD_ONLY: RunMode = RunMode::Download {
        snapshot: false,
        patch: false,
    };

    pub fn stages(&self) -> Vec<Stage> {
        use Stage::*;
        match *self {
            RunMode::Full => vec![
                Fetching,
                Bundling,
                ResolvingAliases,
                Snapshotting,
                Patching,
                GeneratorHandoff,
                Injecting,
                Restoring,
            ],
            RunMode::Download { snapshot, patch } => {
                let mut stages = vec![Fetching, Bundling, ResolvingAliases];
                if snapshot {
                    stages.push(Snapshotting);
                    if patch {
                        stages.push(Patching);
                    }
                }
                stages
            }
            RunMode::Patch => vec![Patching],
            RunMode::Generate => vec![GeneratorHandoff, Injecting, Restoring],
            RunMode::Inject => vec![Injecting],
        }
    }
}

/// How a stage ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed(String),
    /// Nothing to do; the inputs were already in the target state.
    NoOp(String),
    /// Completed, but an advisory input was unavailable.
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

#[derive(Debug)]
pub struct SynchroniseReport {
    pub mode: RunMode,
    pub stages: Vec<StageRecord>,
    pub state: Stage,
}

#[derive(Debug)]
pub struct PipelineFailure {
    pub stage: Stage,
    pub error: PipelineError,
    pub completed: Vec<StageRecord>,
}

impl PipelineFailure {
    pub fn state(&self) -> Stage {
        Stage::Failed
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed: {}", self.stage, self.error)?;
        if !self.completed.is_empty() {
            let done: Vec<String> = self.completed.iter().map(|r| r.stage.to_string()).collect();
            write!(f, " (completed: {})", done.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError {
    let path = path.to_path_buf();
    move |source| PipelineError::Io { path, source }
}

fn require(path: PathBuf) -> Result<PathBuf, PipelineError> {
    if path.exists() {
        Ok(path)
    } else {
        Err(PipelineError::MissingInput(path))
    }
}

/// State carried between stages of one run.
struct Run<'a, R: ?Sized> {
    config: &'a PipelineConfig,
    runner: &'a R,
    releases: Option<&'a dyn ReleaseSource>,
    /// Document as it was before the generator saw it. Restores on drop.
    pristine: Option<FileBackup>,
}

impl<R> Run<'_, R>
where
    R: CommandRunner + ?Sized,
{
    async fn execute(&mut self, stage: Stage) -> Result<StageOutcome, PipelineError> {
        match stage {
            Stage::Fetching => self.fetch(),
            Stage::Bundling => self.bundle(),
            Stage::ResolvingAliases => self.resolve().await,
            Stage::Snapshotting => self.snapshot(),
            Stage::Patching => self.patch(),
            Stage::GeneratorHandoff => self.generate(),
            Stage::Injecting => self.inject(),
            Stage::Restoring => self.restore(),
            Stage::Done | Stage::Failed => Ok(StageOutcome::NoOp(format!("{stage} is terminal"))),
        }
    }

    fn fetch(&mut self) -> Result<StageOutcome, PipelineError> {
        let upstream = &self.config.upstream;
        let dest = self.config.resolve(&self.config.paths.source_dir);
        let fetched = fetch_upstream(self.runner, upstream, &dest)?;
        match &fetched.upstream_version {
            Some(found) if *found != upstream.pin.version => {
                warn!(
                    pinned = %upstream.pin.version,
                    manifest = %found,
                    "[SYNC] Upstream manifest version differs from pinned version"
                );
            }
            Some(_) => debug!("[SYNC] Upstream manifest matches pinned version"),
            None => debug!("[SYNC] Upstream manifest version unavailable"),
        }
        Ok(StageOutcome::Completed(format!(
            "fetched {} files at {}",
            fetched.files,
            upstream.pin.short_commit()
        )))
    }

    fn bundle(&mut self) -> Result<StageOutcome, PipelineError> {
        let input = self
            .config
            .resolve(&self.config.paths.source_dir)
            .join(&self.config.upstream.entrypoint);
        let output = self.config.document_path();
        bundle(self.runner, &self.config.tools, &input, &output)?;
        Ok(StageOutcome::Completed(format!("bundled into {}", output.display())))
    }

    async fn resolve(&mut self) -> Result<StageOutcome, PipelineError> {
        let path = require(self.config.document_path())?;
        let mut doc = SchemaDocument::load(&path)?;
        let aliases = resolve_aliases(&mut doc)?;

        let latest = match self.releases {
            Some(source) => fetch_latest(source).await,
            None => {
                warn!("[SYNC] No release feed configured; latest version recorded as unknown");
                UNKNOWN.to_string()
            }
        };
        let record = VersionRecord::new(&self.config.upstream.pin, &latest);
        annotate(&mut doc, &self.config.extension_key, &record)?;
        doc.save(&path)?;

        let summary = format!(
            "{} aliases resolved, {} unresolved; pinned {} is {} (latest {})",
            aliases.resolved_count(),
            aliases.unresolved.len(),
            record.pinned_version,
            record.status(),
            record.latest_version
        );
        Ok(match record.status() {
            SyncStatus::Unknown => StageOutcome::Degraded(summary),
            _ => StageOutcome::Completed(summary),
        })
    }

    fn snapshot(&mut self) -> Result<StageOutcome, PipelineError> {
        let pin = &self.config.upstream.pin;
        let message = format!(
            "openapi: snapshot upstream {} ({})",
            pin.version,
            pin.short_commit()
        );
        let outcome = commit_document(
            self.runner,
            &self.config.root,
            &self.config.document_repo_path(),
            &message,
        )?;
        Ok(match outcome {
            SnapshotOutcome::Committed => StageOutcome::Completed(message),
            SnapshotOutcome::NothingToCommit => {
                StageOutcome::NoOp("document unchanged since last snapshot".into())
            }
        })
    }

    fn patch(&mut self) -> Result<StageOutcome, PipelineError> {
        let doc_path = require(self.config.document_path())?;
        let patch_path = self.config.patch_path();
        let mut changed = false;
        let mut parts = Vec::new();

        if patch_path.is_file() {
            let patch = PatchDocument::load(&patch_path)?;
            let report =
                PatchApplier::new(&self.config.root, self.config.patch.fuzz).apply(&patch)?;
            changed |= !report.is_noop();
            parts.push(format!(
                "{} hunks applied, {} already applied",
                report.applied, report.already_applied
            ));
        } else {
            warn!(
                path = %patch_path.display(),
                "[SYNC] No patch artifact; skipping patch application"
            );
            parts.push("no patch artifact".to_string());
        }

        let overrides = &self.config.schema_overrides.allow_additional_properties;
        if !overrides.is_empty() {
            let mut doc = SchemaDocument::load(&doc_path)?;
            let mut applied = 0;
            for schema in overrides {
                match doc.allow_additional_properties(schema)? {
                    OverrideOutcome::Applied => applied += 1,
                    OverrideOutcome::AlreadySet => {
                        debug!(schema = %schema, "[SYNC] Override already present")
                    }
                    OverrideOutcome::NotFound => {
                        warn!(schema = %schema, "[SYNC] Override target schema not found")
                    }
                }
            }
            if applied > 0 {
                doc.save(&doc_path)?;
                changed = true;
            }
            parts.push(format!("{applied} schema overrides applied"));
        }

        let summary = parts.join("; ");
        Ok(if changed {
            StageOutcome::Completed(summary)
        } else {
            StageOutcome::NoOp(summary)
        })
    }

    fn generate(&mut self) -> Result<StageOutcome, PipelineError> {
        let config = self.config;
        let doc_path = require(config.document_path())?;
        self.pristine = Some(FileBackup::create(&doc_path).map_err(io_error(&doc_path))?);

        let input = config.resolve(&config.paths.generator_input);
        if let Some(parent) = input.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::copy(&doc_path, &input).map_err(io_error(&input))?;

        let sdk_dir = config.resolve(&config.paths.sdk_dir);
        let removed = clean_dir(&sdk_dir, &config.generated.keep).map_err(io_error(&sdk_dir))?;
        debug!(sdk_dir = %sdk_dir.display(), removed, "[SYNC] Cleaned SDK directory");

        let vars = BTreeMap::from([
            ("input", input.to_string_lossy().into_owned()),
            ("output", sdk_dir.to_string_lossy().into_owned()),
            ("document", doc_path.to_string_lossy().into_owned()),
        ]);
        let mut ran = vec![];
        let generate = config.tools.generate.render(&vars)?;
        let generate = match generate.cwd {
            Some(_) => generate,
            None => generate.current_dir(&config.root),
        };
        info!(command = %generate.display(), "[SYNC] Running code generator");
        run_checked(self.runner, &generate)?;
        ran.push(generate.program);

        if let Some(tidy) = &config.tools.tidy {
            let tidy = tidy.render(&vars)?.current_dir(&sdk_dir);
            run_checked(self.runner, &tidy)?;
            ran.push(tidy.program);
        }
        if let Some(build_files) = &config.tools.build_files {
            let build_files = build_files.render(&vars)?.current_dir(&config.root);
            run_checked(self.runner, &build_files)?;
            ran.push(build_files.program);
        }
        Ok(StageOutcome::Completed(format!("ran {}", ran.join(", "))))
    }

    fn inject(&mut self) -> Result<StageOutcome, PipelineError> {
        let generated = &self.config.generated;
        let sdk_dir = require(self.config.resolve(&self.config.paths.sdk_dir))?;
        let processor = ModelPostProcessor {
            model_prefix: &generated.model_prefix,
            module_path: generated.module_path.as_ref(),
            injections: &generated.inject,
        };
        let report = processor.run(&sdk_dir)?;
        let summary = format!(
            "{} module paths rewritten, {} models relaxed, {} injections checked",
            report.module_paths_rewritten,
            report.models_relaxed,
            report.injections.len()
        );
        Ok(if report.is_noop() {
            StageOutcome::NoOp(summary)
        } else {
            StageOutcome::Completed(summary)
        })
    }

    fn restore(&mut self) -> Result<StageOutcome, PipelineError> {
        let Some(pristine) = self.pristine.take() else {
            return Ok(StageOutcome::NoOp("no document was handed to the generator".into()));
        };
        let path = pristine.path().to_path_buf();
        if pristine.is_modified().map_err(io_error(&path))? {
            pristine.restore().map_err(io_error(&path))?;
            info!(path = %path.display(), "[SYNC] Restored pristine document after generation");
            Ok(StageOutcome::Completed("restored pristine document".into()))
        } else {
            pristine.discard().map_err(io_error(&path))?;
            Ok(StageOutcome::NoOp("generator left the document untouched".into()))
        }
    }
}

/// Remove everything in `dir` except the entries named in `keep`, creating
/// `dir` if needed. Returns the number of entries removed.
fn clean_dir(dir: &Path, keep: &[String]) -> std::io::Result<usize> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if keep.iter().any(|k| entry.file_name() == k.as_str()) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Run the stages of `mode` in order, stopping at the first failure.
pub async fn synchronise<R>(
    config: &PipelineConfig,
    mode: RunMode,
    runner: &R,
    releases: Option<&dyn ReleaseSource>,
) -> Result<SynchroniseReport, PipelineFailure>
where
    R: CommandRunner + ?Sized,
{
    let stages = mode.stages();
    info!(mode = ?mode, stages = stages.len(), "[SYNC] Starting pipeline run");

    let mut run = Run {
        config,
        runner,
        releases,
        pristine: None,
    };
    let mut completed: Vec<StageRecord> = Vec::new();

    for stage in stages {
        info!(stage = %stage, "[SYNC] Entering stage");
        match run.execute(stage).await {
            Ok(outcome) => {
                match &outcome {
                    StageOutcome::Completed(msg) => {
                        info!(stage = %stage, detail = %msg, "[SYNC] Stage completed")
                    }
                    StageOutcome::NoOp(msg) => {
                        info!(stage = %stage, detail = %msg, "[SYNC] Stage had nothing to do")
                    }
                    StageOutcome::Degraded(msg) => {
                        warn!(stage = %stage, detail = %msg, "[SYNC] Stage completed degraded")
                    }
                }
                completed.push(StageRecord { stage, outcome });
            }
            Err(error) => {
                error!(stage = %stage, error = %error, "[SYNC][ERROR] Stage failed; halting run");
                // Dropping `run` restores the pristine document if generation had started.
                drop(run);
                return Err(PipelineFailure {
                    stage,
                    error,
                    completed,
                });
            }
        }
    }

    info!(stages = completed.len(), "[SYNC] Pipeline run complete");
    Ok(SynchroniseReport {
        mode,
        stages: completed,
        state: Stage::Done,
    })
}

/// Summary of a persisted patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCapture {
    pub path: PathBuf,
    pub hunks: usize,
    pub additions: usize,
    pub deletions: usize,
}

fn persist(config: &PipelineConfig, patch: &PatchDocument) -> Result<PatchCapture, PipelineError> {
    let path = config.patch_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    patch.save(&path)?;
    let summary = PatchCapture {
        path,
        hunks: patch.hunks.len(),
        additions: patch.additions(),
        deletions: patch.deletions(),
    };
    info!(
        path = %summary.path.display(),
        hunks = summary.hunks,
        additions = summary.additions,
        deletions = summary.deletions,
        "[PATCH] Saved patch"
    );
    Ok(summary)
}

/// Capture the working copy's edits to the document, relative to `HEAD`,
/// as the patch artifact. Returns `None` when there are no edits.
pub fn create_patch<R>(
    config: &PipelineConfig,
    runner: &R,
) -> Result<Option<PatchCapture>, PipelineError>
where
    R: CommandRunner + ?Sized,
{
    let rel = config.document_repo_path();
    let doc_path = require(config.document_path())?;
    let committed = show_file(runner, &config.root, "HEAD", &rel)?;
    let current = fs::read_to_string(&doc_path).map_err(io_error(&doc_path))?;
    match capture(&rel, &committed, &current) {
        Some(patch) => persist(config, &patch).map(Some),
        None => {
            info!(path = %rel, "[PATCH] No changes to document since HEAD; patch not written");
            Ok(None)
        }
    }
}

/// Capture the change commit `rev` made to the document, save it as the
/// patch artifact and replay it onto the current document.
pub fn patch_from_commit<R>(
    config: &PipelineConfig,
    runner: &R,
    rev: &str,
) -> Result<(PatchCapture, PatchReport), PipelineError>
where
    R: CommandRunner + ?Sized,
{
    let rel = config.document_repo_path();
    require(config.document_path())?;
    let before = show_file(runner, &config.root, &format!("{rev}^"), &rel)?;
    let after = show_file(runner, &config.root, rev, &rel)?;
    let patch = capture(&rel, &before, &after)
        .ok_or_else(|| PipelineError::NoChanges(format!("commit {rev}")))?;
    let saved = persist(config, &patch)?;
    let report = PatchApplier::new(&config.root, config.patch.fuzz).apply(&patch)?;
    Ok((saved, report))
}
