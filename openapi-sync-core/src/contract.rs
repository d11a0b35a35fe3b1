//! # contract: seams to the outside world
//!
//! The pipeline talks to two kinds of external collaborators:
//! - command-line tools (git, the schema bundler, the code generator, the
//!   build-file regenerator), reached through [`CommandRunner`];
//! - the upstream release feed, reached through [`ReleaseSource`].
//!
//! Both traits are annotated for `mockall` so tests can drive the whole
//! pipeline without network or installed tools. Mocks are exported when the
//! `test-export-mocks` feature is enabled (it is by default).

use std::path::PathBuf;
use std::process::Command;

use async_trait::async_trait;
use mockall::automock;

use crate::error::{ReleaseError, ToolError};

/// A fully rendered command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program and arguments joined for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs external tools. Implemented by [`SystemRunner`] and by test mocks.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing its output.
    ///
    /// A non-zero exit is not an error at this level; see [`run_checked`].
    fn run(&self, cmd: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands as child processes of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        tracing::debug!(command = %cmd.display(), cwd = ?cmd.cwd, "Launching external command");
        let output = command.output()?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and turn launch failures and non-zero exits into [`ToolError`].
pub fn run_checked<R>(runner: &R, cmd: &CommandSpec) -> Result<CommandOutput, ToolError>
where
    R: CommandRunner + ?Sized,
{
    let output = runner.run(cmd).map_err(|e| {
        tracing::error!(error = ?e, command = %cmd.display(), "Failed to launch external command");
        ToolError::Launch {
            program: cmd.program.clone(),
            source: e,
        }
    })?;
    if !output.success() {
        tracing::error!(
            command = %cmd.display(),
            status = output.status,
            stderr = %output.stderr.trim(),
            "External command exited with non-zero status"
        );
        return Err(ToolError::Failed {
            program: cmd.program.clone(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    tracing::debug!(command = %cmd.display(), "External command succeeded");
    Ok(output)
}

/// The upstream release feed.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Latest released version, without any tag prefix (e.g. `1.120.0`).
    async fn latest_version(&self) -> Result<String, ReleaseError>;

    /// Commit hash the release tag for `version` points at.
    async fn commit_for_version(&self, version: &str) -> Result<String, ReleaseError>;
}
