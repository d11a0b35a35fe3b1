//! `load_config` module: reads the pipeline YAML file into the core
//! [`PipelineConfig`] and anchors it to a working tree.
//!
//! This is the only place user-supplied YAML is parsed. Relative paths in the
//! file are later resolved by the core against [`PipelineConfig::root`].
//!
//! # Errors
//! Failures are `anyhow::Error`s with the file path in the message so the
//! CLI can print them as-is.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use openapi_sync_core::config::PipelineConfig;
use tracing::{error, info};

pub const DEFAULT_CONFIG_PATH: &str = "codegen/openapi-sync.yaml";

/// Resolve `config` against `root` unless it is already absolute.
pub fn config_path(root: &Path, config: &Path) -> PathBuf {
    if config.is_absolute() {
        config.to_path_buf()
    } else {
        root.join(config)
    }
}

/// Load the pipeline config at `path` and set its working tree to `root`.
pub fn load_config<P: AsRef<Path>>(path: P, root: &Path) -> Result<PipelineConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {}: {e}", path_ref.display()));
        }
    };

    let mut config: PipelineConfig = match serde_yaml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML {}: {e}", path_ref.display()));
        }
    };

    config.root = fs::canonicalize(root)
        .with_context(|| format!("Working tree {} is not accessible", root.display()))?;
    config.trace_loaded();
    Ok(config)
}
