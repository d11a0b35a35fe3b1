//! Typed pipeline configuration.
//!
//! The CLI crate reads this from a YAML file; everything here is plain data
//! with serde defaults for the optional sections.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::CommandSpec;
use crate::error::{ToolError, VersionError};
use crate::inject::ModelInjection;

pub const DEFAULT_EXTENSION_KEY: &str = "x-upstream-version-info";
pub const DEFAULT_FUZZ: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Working tree every relative path below is resolved against.
    #[serde(skip)]
    pub root: PathBuf,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub releases: Option<ReleasesConfig>,
    pub paths: PathsConfig,
    pub tools: ToolsConfig,
    #[serde(default)]
    pub patch: PatchConfig,
    #[serde(default = "default_extension_key")]
    pub extension_key: String,
    #[serde(default)]
    pub schema_overrides: SchemaOverrides,
    #[serde(default)]
    pub generated: GeneratedConfig,
}

impl PipelineConfig {
    pub fn trace_loaded(&self) {
        info!(
            root = %self.root.display(),
            repo_url = %self.upstream.repo_url,
            pin = %self.upstream.pin,
            document = %self.paths.document.display(),
            injections = self.generated.inject.len(),
            "Loaded pipeline config"
        );
        debug!(?self, "Pipeline config loaded (full debug)");
    }

    /// Resolve a configured path against the working tree.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn document_path(&self) -> PathBuf {
        self.resolve(&self.paths.document)
    }

    pub fn patch_path(&self) -> PathBuf {
        self.resolve(&self.paths.patch)
    }

    /// Document path as git sees it: relative to the root, `/`-separated.
    pub fn document_repo_path(&self) -> String {
        repo_relative(&self.paths.document)
    }
}

fn default_extension_key() -> String {
    DEFAULT_EXTENSION_KEY.to_string()
}

pub(crate) fn repo_relative(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Where the upstream document lives and which commit it is pinned to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub repo_url: String,
    /// Directory inside the upstream repository holding the API description.
    pub sparse_path: String,
    /// Bundler entrypoint relative to `sparse_path`.
    pub entrypoint: String,
    pub pin: Pin,
}

/// The pinned upstream commit and the release version it corresponds to.
///
/// Written in configuration as a single line: `pin: "<commit>@<version>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pin {
    pub commit: String,
    pub version: String,
}

impl Pin {
    pub fn short_commit(&self) -> &str {
        self.commit.get(..8).unwrap_or(&self.commit)
    }
}

impl FromStr for Pin {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (commit, version) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| VersionError::InvalidPin(s.to_string()))?;
        let hex = !commit.is_empty() && commit.chars().all(|c| c.is_ascii_hexdigit());
        if !hex || version.is_empty() {
            return Err(VersionError::InvalidPin(s.to_string()));
        }
        Ok(Pin {
            commit: commit.to_ascii_lowercase(),
            version: version.to_string(),
        })
    }
}

impl TryFrom<String> for Pin {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Pin> for String {
    fn from(pin: Pin) -> Self {
        pin.to_string()
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.commit, self.version)
    }
}

/// GitHub repository publishing the upstream releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasesConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// `owner/name`.
    pub repo: String,
    /// Prefix stripped from release tags, e.g. `n8n@`.
    #[serde(default)]
    pub tag_prefix: String,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// The maintained, bundled document.
    pub document: PathBuf,
    /// Where the upstream API sources are copied.
    pub source_dir: PathBuf,
    /// The persisted patch artifact.
    pub patch: PathBuf,
    /// Copy of the document handed to the generator.
    pub generator_input: PathBuf,
    /// Generator output directory.
    pub sdk_dir: PathBuf,
}

/// External tool templates. `{input}` and `{output}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub bundle: ToolCommand,
    pub generate: ToolCommand,
    #[serde(default)]
    pub tidy: Option<ToolCommand>,
    #[serde(default)]
    pub build_files: Option<ToolCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCommand(pub Vec<String>);

impl ToolCommand {
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Result<CommandSpec, ToolError> {
        let mut parts = self.0.iter().map(|part| {
            vars.iter().fold(part.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        });
        let program = parts.next().ok_or(ToolError::EmptyTemplate)?;
        Ok(CommandSpec::new(program).args(parts))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    #[serde(default = "default_fuzz")]
    pub fuzz: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self { fuzz: DEFAULT_FUZZ }
    }
}

fn default_fuzz() -> usize {
    DEFAULT_FUZZ
}

/// Document-level tolerance overrides applied after the patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaOverrides {
    #[serde(default)]
    pub allow_additional_properties: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedConfig {
    /// File name prefix identifying generated model files.
    #[serde(default = "default_model_prefix")]
    pub model_prefix: String,
    /// Entries of the SDK directory preserved when cleaning before generation.
    #[serde(default = "default_keep")]
    pub keep: Vec<String>,
    #[serde(default)]
    pub module_path: Option<ModulePathRewrite>,
    #[serde(default)]
    pub inject: Vec<ModelInjection>,
}

impl Default for GeneratedConfig {
    fn default() -> Self {
        Self {
            model_prefix: default_model_prefix(),
            keep: default_keep(),
            module_path: None,
            inject: Vec::new(),
        }
    }
}

fn default_model_prefix() -> String {
    "model_".to_string()
}

fn default_keep() -> Vec<String> {
    vec!["api".to_string()]
}

/// Placeholder module path emitted by the generator and its replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePathRewrite {
    pub from: String,
    pub to: String,
}
