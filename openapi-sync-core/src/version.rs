//! # version: pinned vs. latest upstream release
//!
//! The record of which upstream commit and release the document was built
//! from is embedded in the document itself under `info.<extension_key>`.
//! The latest release is looked up on every run but that lookup is advisory:
//! failures are recorded as [`UNKNOWN`] and never abort the run. Moving the
//! pin (`version --update`) is explicit and rewrites exactly one line of the
//! pipeline configuration.

use std::fmt;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::write_atomic;
use crate::config::{Pin, ReleasesConfig};
use crate::contract::ReleaseSource;
use crate::document::SchemaDocument;
use crate::error::{DocumentError, ReleaseError, VersionError};

/// Sentinel for a version that could not be determined.
pub const UNKNOWN: &str = "unknown";

const PIN_PATTERN: &str = concat!(
    r#"(?m)^(?P<lead>[ \t]*pin:[ \t]*)"#,
    r#"["']?[0-9a-fA-F]+@[^"'\s#]+["']?"#,
    r#"(?P<comment>[ \t]+#[^\n]*)?[ \t]*$"#,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    InSync,
    Drifted,
    /// At least one side is unknown; neither in sync nor drifted.
    Unknown,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::InSync => "in sync",
            SyncStatus::Drifted => "drifted",
            SyncStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

fn is_known(version: &str) -> bool {
    let v = version.trim();
    !v.is_empty() && v != UNKNOWN
}

pub fn sync_status(pinned: &str, latest: &str) -> SyncStatus {
    if !is_known(pinned) || !is_known(latest) {
        SyncStatus::Unknown
    } else if pinned.trim() == latest.trim() {
        SyncStatus::InSync
    } else {
        SyncStatus::Drifted
    }
}

/// Provenance metadata embedded in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub pinned_version: String,
    pub pinned_identifier: String,
    pub latest_version: String,
    /// `None` while the latest version is unknown.
    pub in_sync: Option<bool>,
    pub note: String,
}

impl VersionRecord {
    pub fn new(pin: &Pin, latest: &str) -> Self {
        let status = sync_status(&pin.version, latest);
        let note = match status {
            SyncStatus::InSync => format!("Pinned to the latest upstream release {}.", pin.version),
            SyncStatus::Drifted => format!(
                "Pinned to {} but upstream has released {}. \
                 Run `openapi-sync version --update` to move the pin.",
                pin.version, latest
            ),
            SyncStatus::Unknown => "Latest upstream release could not be determined; \
                                    sync status is unresolved."
                .to_string(),
        };
        Self {
            pinned_version: pin.version.clone(),
            pinned_identifier: pin.commit.clone(),
            latest_version: if is_known(latest) {
                latest.trim().to_string()
            } else {
                UNKNOWN.to_string()
            },
            in_sync: match status {
                SyncStatus::InSync => Some(true),
                SyncStatus::Drifted => Some(false),
                SyncStatus::Unknown => None,
            },
            note,
        }
    }

    pub fn status(&self) -> SyncStatus {
        match self.in_sync {
            Some(true) => SyncStatus::InSync,
            Some(false) => SyncStatus::Drifted,
            None => SyncStatus::Unknown,
        }
    }
}

/// Latest release, or [`UNKNOWN`] if it cannot be fetched.
pub async fn fetch_latest<S>(source: &S) -> String
where
    S: ReleaseSource + ?Sized,
{
    match source.latest_version().await {
        Ok(version) if is_known(&version) => {
            debug!(version = %version, "Fetched latest upstream release");
            version.trim().to_string()
        }
        Ok(version) => {
            warn!(
                version = %version,
                "Release feed returned no usable version; recording as unknown"
            );
            UNKNOWN.to_string()
        }
        Err(e) => {
            warn!(error = %e, "Failed to fetch latest upstream release; recording as unknown");
            UNKNOWN.to_string()
        }
    }
}

pub fn annotate(
    doc: &mut SchemaDocument,
    key: &str,
    record: &VersionRecord,
) -> Result<(), DocumentError> {
    doc.set_info_extension(key, record)?;
    info!(
        key,
        pinned = %record.pinned_version,
        latest = %record.latest_version,
        status = %record.status(),
        "Recorded version metadata"
    );
    Ok(())
}

pub fn read_record(doc: &SchemaDocument, key: &str) -> Result<VersionRecord, VersionError> {
    let value = doc
        .info_extension(key)
        .ok_or_else(|| VersionError::MissingRecord(key.to_string()))?;
    serde_yaml::from_value(value.clone()).map_err(VersionError::MalformedRecord)
}

/// Replace the single `pin:` line in `text`, keeping its indentation and
/// trailing comment.
pub fn rewrite_pin(text: &str, pin: &Pin, path: &Path) -> Result<String, VersionError> {
    let re = Regex::new(PIN_PATTERN)?;
    let found: Vec<_> = re.captures_iter(text).collect();
    let caps = match found.as_slice() {
        [] => return Err(VersionError::PinNotFound(path.to_path_buf())),
        [only] => only,
        many => {
            return Err(VersionError::AmbiguousPin {
                path: path.to_path_buf(),
                count: many.len(),
            })
        }
    };
    let Some(whole) = caps.get(0) else {
        return Err(VersionError::PinNotFound(path.to_path_buf()));
    };
    let lead = caps.name("lead").map_or("", |m| m.as_str());
    let comment = caps.name("comment").map_or("", |m| m.as_str());
    Ok(format!(
        "{}{lead}\"{pin}\"{comment}{}",
        &text[..whole.start()],
        &text[whole.end()..]
    ))
}

pub fn update_pin_file(path: &Path, pin: &Pin) -> Result<(), VersionError> {
    let io = |source| VersionError::Io {
        path: path.to_path_buf(),
        source,
    };
    let text = fs::read_to_string(path).map_err(io)?;
    let updated = rewrite_pin(&text, pin, path)?;
    write_atomic(path, updated.as_bytes()).map_err(io)?;
    info!(path = %path.display(), pin = %pin, "Updated pin");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinUpdate {
    Updated { from: Pin, to: Pin },
    AlreadyCurrent(Pin),
}

/// Move the pin in `config_path` to the latest release.
///
/// Unlike [`fetch_latest`], failing to reach the release feed is an error.
pub async fn update_to_latest<S>(
    source: &S,
    config_path: &Path,
    current: &Pin,
) -> Result<PinUpdate, VersionError>
where
    S: ReleaseSource + ?Sized,
{
    let latest = source.latest_version().await?;
    if !is_known(&latest) {
        return Err(VersionError::LatestUnknown);
    }
    let latest = latest.trim().to_string();
    if latest == current.version {
        info!(version = %latest, "Pin already targets the latest release");
        return Ok(PinUpdate::AlreadyCurrent(current.clone()));
    }
    let commit = source.commit_for_version(&latest).await?;
    let next: Pin = format!("{}@{}", commit.trim(), latest).parse()?;
    update_pin_file(config_path, &next)?;
    Ok(PinUpdate::Updated {
        from: current.clone(),
        to: next,
    })
}

/// Release feed backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: reqwest::Client,
    api_base: String,
    repo: String,
    tag_prefix: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct LatestRelease {
    tag_name: String,
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitTag {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

impl GithubReleases {
    /// Uses `GITHUB_TOKEN` from the environment when set.
    pub fn new(config: &ReleasesConfig) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder().user_agent("openapi-sync").build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo: config.repo.clone(),
            tag_prefix: config.tag_prefix.clone(),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.trim().is_empty()),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ReleaseError> {
        let url = format!("{}/repos/{}/{}", self.api_base, self.repo, path);
        debug!(url = %url, authenticated = self.token.is_some(), "Querying release feed");
        let mut request = self.client.get(&url).header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?.error_for_status()?.json::<T>().await?)
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_version(&self) -> Result<String, ReleaseError> {
        let release: LatestRelease = self.get("releases/latest").await?;
        let version = release
            .tag_name
            .strip_prefix(self.tag_prefix.as_str())
            .unwrap_or(&release.tag_name)
            .trim()
            .to_string();
        if version.is_empty() {
            return Err(ReleaseError::Missing("tag_name"));
        }
        Ok(version)
    }

    async fn commit_for_version(&self, version: &str) -> Result<String, ReleaseError> {
        let tag = format!("{}{}", self.tag_prefix, version);
        let reference: GitRef = self.get(&format!("git/refs/tags/{tag}")).await?;
        let mut object = reference.object;
        // Annotated tags point at a tag object first.
        if object.kind == "tag" {
            let annotated: GitTag = self.get(&format!("git/tags/{}", object.sha)).await?;
            object = annotated.object;
        }
        if object.sha.is_empty() {
            return Err(ReleaseError::Missing("object.sha"));
        }
        Ok(object.sha)
    }
}
