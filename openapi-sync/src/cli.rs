//! # openapi-sync CLI interface
//!
//! Command parsing and dispatch. Every subcommand maps onto a
//! [`RunMode`] of the core pipeline or one of its helpers; all document
//! logic lives in `openapi-sync-core`.
//!
//! ## How To Use
//! - From the shell: `openapi-sync --help`.
//! - From tests: build a [`Cli`] and call [`run`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use openapi_sync_core::config::PipelineConfig;
use openapi_sync_core::contract::{ReleaseSource, SystemRunner};
use openapi_sync_core::document::SchemaDocument;
use openapi_sync_core::synchronise::{
    create_patch, patch_from_commit, synchronise, RunMode, StageOutcome, SynchroniseReport,
};
use openapi_sync_core::version::{read_record, update_to_latest, GithubReleases, PinUpdate};
use tracing::{info, warn};

use crate::load_config::{config_path, load_config, DEFAULT_CONFIG_PATH};

/// Keep a generated SDK in step with a pinned upstream OpenAPI document.
#[derive(Parser, Debug)]
#[clap(
    name = "openapi-sync",
    version,
    about = "Download, reshape, patch and generate an SDK from a pinned upstream OpenAPI document"
)]
pub struct Cli {
    /// Pipeline config file, relative to --root unless absolute
    #[clap(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Working tree the configured paths are relative to
    #[clap(long, global = true, default_value = ".")]
    pub root: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Every stage: download, snapshot, patch, generate, inject, restore
    Run,
    /// Fetch, bundle and reshape the upstream document, then snapshot and patch it
    Download {
        /// Skip the snapshot commit (implies --no-patch)
        #[clap(long)]
        no_commit: bool,
        /// Skip applying the patch artifact
        #[clap(long)]
        no_patch: bool,
    },
    /// Apply the patch artifact, or author it
    Patch {
        /// Capture the document's uncommitted edits as the patch artifact
        #[clap(long, conflicts_with = "from_commit")]
        create: bool,
        /// Capture the document change made by commit REV and apply it
        #[clap(long, value_name = "REV")]
        from_commit: Option<String>,
    },
    /// Hand the document to the generator, post-process the SDK, restore the document
    Generate,
    /// Post-process an already generated SDK
    Inject,
    /// Inspect or move the upstream pin
    Version {
        /// Print the version metadata embedded in the document
        #[clap(long, conflicts_with = "update", required_unless_present = "update")]
        check: bool,
        /// Move the pin to the latest upstream release
        #[clap(long)]
        update: bool,
    },
}

/// Async CLI entrypoint shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    info!(command = ?cli.command, "CLI run started");
    let path = config_path(&cli.root, &cli.config);
    let config = load_config(&path, &cli.root)?;

    match cli.command {
        Commands::Run => run_pipeline(&config, RunMode::Full).await,
        Commands::Download { no_commit, no_patch } => {
            if no_commit && !no_patch {
                info!("--no-commit skips patching as well");
            }
            let mode = RunMode::Download {
                snapshot: !no_commit,
                patch: !no_commit && !no_patch,
            };
            run_pipeline(&config, mode).await
        }
        Commands::Patch { create: true, .. } => {
            match create_patch(&config, &SystemRunner)? {
                Some(capture) => println!(
                    "Wrote {} ({} hunks, +{} -{})",
                    capture.path.display(),
                    capture.hunks,
                    capture.additions,
                    capture.deletions
                ),
                None => println!(
                    "No uncommitted edits to {}; patch unchanged",
                    config.paths.document.display()
                ),
            }
            Ok(())
        }
        Commands::Patch {
            from_commit: Some(rev),
            ..
        } => {
            let (capture, report) = patch_from_commit(&config, &SystemRunner, &rev)?;
            println!(
                "Wrote {} from {rev} ({} hunks); {} applied, {} already applied",
                capture.path.display(),
                capture.hunks,
                report.applied,
                report.already_applied
            );
            Ok(())
        }
        Commands::Patch { .. } => run_pipeline(&config, RunMode::Patch).await,
        Commands::Generate => run_pipeline(&config, RunMode::Generate).await,
        Commands::Inject => run_pipeline(&config, RunMode::Inject).await,
        Commands::Version { check: true, .. } => check_version(&config),
        Commands::Version { .. } => update_version(&config, &path).await,
    }
}

/// The release feed, when configured. Construction failures only cost the
/// advisory latest-version lookup.
fn release_source(config: &PipelineConfig) -> Option<GithubReleases> {
    let releases = config.releases.as_ref()?;
    match GithubReleases::new(releases) {
        Ok(source) => Some(source),
        Err(e) => {
            warn!(error = %e, "Release feed unavailable; latest version will be unknown");
            None
        }
    }
}

async fn run_pipeline(config: &PipelineConfig, mode: RunMode) -> Result<()> {
    let releases = release_source(config);
    let report = synchronise(
        config,
        mode,
        &SystemRunner,
        releases.as_ref().map(|r| r as &dyn ReleaseSource),
    )
    .await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SynchroniseReport) {
    for record in &report.stages {
        let (tag, detail) = match &record.outcome {
            StageOutcome::Completed(d) => ("ok", d),
            StageOutcome::NoOp(d) => ("no-op", d),
            StageOutcome::Degraded(d) => ("degraded", d),
        };
        println!("{:<18} {:<8} {}", record.stage, tag, detail);
    }
    println!("{}", report.state);
}

fn check_version(config: &PipelineConfig) -> Result<()> {
    let doc_path = config.document_path();
    let doc = SchemaDocument::load(&doc_path)
        .with_context(|| format!("Failed to load {}", doc_path.display()))?;
    let record = read_record(&doc, &config.extension_key).with_context(|| {
        format!(
            "{} carries no version metadata; run `openapi-sync download`",
            doc_path.display()
        )
    })?;

    println!("pinned:     {}", record.pinned_version);
    println!("identifier: {}", record.pinned_identifier);
    println!("latest:     {}", record.latest_version);
    println!("status:     {}", record.status());
    println!("{}", record.note);
    Ok(())
}

async fn update_version(config: &PipelineConfig, config_file: &Path) -> Result<()> {
    let releases = config
        .releases
        .as_ref()
        .context("`releases` is not configured; cannot look up the latest version")?;
    let source = GithubReleases::new(releases)?;
    match update_to_latest(&source, config_file, &config.upstream.pin).await? {
        PinUpdate::Updated { from, to } => {
            println!("Pin moved from {from} to {to}");
            println!("Run `openapi-sync download` to rebuild the document at the new pin.");
        }
        PinUpdate::AlreadyCurrent(pin) => println!("Pin {pin} already targets the latest release"),
    }
    Ok(())
}
