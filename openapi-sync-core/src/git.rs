//! Git operations used by the pipeline: snapshot commits of the document and
//! reading historical versions of it.

use std::path::Path;

use tracing::{info, warn};

use crate::contract::{run_checked, CommandRunner, CommandSpec};
use crate::error::{GitError, ToolError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Committed,
    NothingToCommit,
}

fn git(root: &Path) -> CommandSpec {
    CommandSpec::new("git").current_dir(root)
}

fn nothing_to_commit(text: &str) -> bool {
    text.contains("nothing to commit")
        || text.contains("no changes added to commit")
        || text.contains("nothing added to commit")
}

/// Commit `path` (and only `path`) so the unpatched document is in history
/// before anything mutates it.
pub fn commit_document<R>(
    runner: &R,
    root: &Path,
    path: &str,
    message: &str,
) -> Result<SnapshotOutcome, GitError>
where
    R: CommandRunner + ?Sized,
{
    run_checked(runner, &git(root).args(["add", "--", path]))?;

    let commit = git(root).args(["commit", "--no-verify", "--only", "-m", message, "--", path]);
    let output = runner.run(&commit).map_err(|source| {
        GitError::Tool(ToolError::Launch {
            program: "git".to_string(),
            source,
        })
    })?;
    if output.success() {
        info!(path, message, "Committed document snapshot");
        return Ok(SnapshotOutcome::Committed);
    }
    if nothing_to_commit(&output.stdout) || nothing_to_commit(&output.stderr) {
        info!(path, "Document unchanged since last snapshot; nothing to commit");
        return Ok(SnapshotOutcome::NothingToCommit);
    }
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    };
    warn!(path, status = output.status, detail = %detail, "Snapshot commit failed");
    Err(GitError::Commit(detail))
}

/// Content of `path` at `rev`.
pub fn show_file<R>(runner: &R, root: &Path, rev: &str, path: &str) -> Result<String, GitError>
where
    R: CommandRunner + ?Sized,
{
    let output = run_checked(runner, &git(root).arg("show").arg(format!("{rev}:{path}")))?;
    Ok(output.stdout)
}
