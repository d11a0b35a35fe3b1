//! # download: fetch the pinned upstream API sources and bundle them
//!
//! The upstream repository is checked out sparsely into a scratch directory
//! that is removed on every exit path, and only the API description
//! directory is copied into the working tree. Bundling turns that multi-file
//! description into the single document the rest of the pipeline maintains.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::config::{ToolsConfig, UpstreamConfig};
use crate::contract::{run_checked, CommandRunner, CommandSpec};
use crate::error::DownloadError;

/// File in the upstream repository root carrying the release version.
const VERSION_MANIFEST: &str = "package.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedUpstream {
    pub source_dir: PathBuf,
    pub files: usize,
    /// Version declared by the upstream manifest at the pinned commit.
    pub upstream_version: Option<String>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DownloadError {
    let path = path.to_path_buf();
    move |source| DownloadError::Io { path, source }
}

/// Sparse-checkout `upstream.pin.commit` and copy `upstream.sparse_path`
/// into `dest`, replacing whatever was there.
pub fn fetch_upstream<R>(
    runner: &R,
    upstream: &UpstreamConfig,
    dest: &Path,
) -> Result<DownloadedUpstream, DownloadError>
where
    R: CommandRunner + ?Sized,
{
    let scratch = tempfile::Builder::new()
        .prefix("openapi-sync-")
        .tempdir()
        .map_err(io_error(&std::env::temp_dir()))?;
    let checkout = scratch.path().join("upstream");
    let commit = upstream.pin.commit.as_str();
    info!(
        repo_url = %upstream.repo_url,
        commit = %upstream.pin.short_commit(),
        sparse_path = %upstream.sparse_path,
        "Checking out pinned upstream"
    );

    let clone = CommandSpec::new("git")
        .args(["clone", "--depth", "1", "--filter=blob:none", "--sparse"])
        .arg(upstream.repo_url.as_str())
        .arg(checkout.to_string_lossy());
    run_checked(runner, &clone)?;

    let git = || CommandSpec::new("git").current_dir(&checkout);
    run_checked(runner, &git().args(["sparse-checkout", "set", upstream.sparse_path.as_str()]))?;
    run_checked(runner, &git().args(["fetch", "--depth", "1", "origin", commit]))?;
    run_checked(runner, &git().args(["checkout", commit]))?;

    let upstream_version = read_manifest_version(runner, &checkout, commit);

    let source = checkout.join(&upstream.sparse_path);
    if !source.is_dir() {
        error!(path = %source.display(), "Sparse checkout does not contain the API sources");
        return Err(DownloadError::MissingSources(PathBuf::from(&upstream.sparse_path)));
    }
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(io_error(dest))?;
        debug!(path = %dest.display(), "Removed previous API sources");
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let files = copy_tree(&source, dest).map_err(io_error(dest))?;
    info!(dest = %dest.display(), files, "Copied upstream API sources");

    // `scratch` drops here and removes the checkout.
    Ok(DownloadedUpstream {
        source_dir: dest.to_path_buf(),
        files,
        upstream_version,
    })
}

fn read_manifest_version<R>(runner: &R, checkout: &Path, commit: &str) -> Option<String>
where
    R: CommandRunner + ?Sized,
{
    let show = CommandSpec::new("git")
        .current_dir(checkout)
        .arg("show")
        .arg(format!("{commit}:{VERSION_MANIFEST}"));
    let output = match run_checked(runner, &show) {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "Could not read upstream version manifest");
            return None;
        }
    };
    let manifest: serde_json::Value = match serde_json::from_str(&output.stdout) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Upstream version manifest is not valid JSON");
            return None;
        }
    };
    manifest.get("version").and_then(|v| v.as_str()).map(str::to_string)
}

/// Recursively copy `from` into `to`. Returns the number of files copied.
fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Run the bundler template with `{input}` and `{output}` substituted.
pub fn bundle<R>(
    runner: &R,
    tools: &ToolsConfig,
    input: &Path,
    output: &Path,
) -> Result<(), DownloadError>
where
    R: CommandRunner + ?Sized,
{
    if !input.is_file() {
        error!(path = %input.display(), "Bundler entrypoint missing");
        return Err(DownloadError::MissingSources(input.to_path_buf()));
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let vars = BTreeMap::from([
        ("input", input.to_string_lossy().into_owned()),
        ("output", output.to_string_lossy().into_owned()),
    ]);
    let cmd = tools.bundle.render(&vars)?;
    info!(command = %cmd.display(), "Bundling API description");
    run_checked(runner, &cmd)?;
    if !output.is_file() {
        error!(path = %output.display(), "Bundler reported success but wrote no document");
        return Err(DownloadError::MissingSources(output.to_path_buf()));
    }
    Ok(())
}
