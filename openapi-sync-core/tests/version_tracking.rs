// Integration tests for version metadata and pin updates.

use std::fs;

use openapi_sync_core::config::{Pin, ReleasesConfig};
use openapi_sync_core::contract::MockReleaseSource;
use openapi_sync_core::document::SchemaDocument;
use openapi_sync_core::error::{ReleaseError, VersionError};
use openapi_sync_core::version::{
    annotate, fetch_latest, read_record, sync_status, update_to_latest, GithubReleases, PinUpdate,
    SyncStatus, VersionRecord, UNKNOWN,
};
use serial_test::serial;
use tempfile::tempdir;

const KEY: &str = "x-upstream-version-info";

const CONFIG: &str = "\
upstream:
  repo_url: https://github.com/n8n-io/n8n.git
  sparse_path: packages/cli/src/public-api
  entrypoint: packages/cli/src/public-api/v1/openapi.yml
  pin: \"0123456789abcdef0123456789abcdef01234567@1.2.0\"  # moved by version --update
paths:
  document: api/openapi.yaml
";

fn pin(text: &str) -> Pin {
    text.parse().unwrap()
}

#[test]
fn sync_status_compares_known_versions_only() {
    struct TestCase {
        pinned: &'static str,
        latest: &'static str,
        expected: SyncStatus,
    }
    let cases = vec![
        TestCase {
            pinned: "1.2.0",
            latest: "1.2.0",
            expected: SyncStatus::InSync,
        },
        TestCase {
            pinned: "1.2.0",
            latest: " 1.2.0\n",
            expected: SyncStatus::InSync,
        },
        TestCase {
            pinned: "1.2.0",
            latest: "1.3.0",
            expected: SyncStatus::Drifted,
        },
        TestCase {
            pinned: "1.2.0",
            latest: UNKNOWN,
            expected: SyncStatus::Unknown,
        },
        TestCase {
            pinned: "1.2.0",
            latest: "",
            expected: SyncStatus::Unknown,
        },
        TestCase {
            pinned: UNKNOWN,
            latest: UNKNOWN,
            expected: SyncStatus::Unknown,
        },
    ];
    for case in cases {
        assert_eq!(
            sync_status(case.pinned, case.latest),
            case.expected,
            "pinned {:?} latest {:?}",
            case.pinned,
            case.latest
        );
    }
}

#[test]
fn record_notes_describe_the_status() {
    let pinned = pin("abc123@1.2.0");

    let current = VersionRecord::new(&pinned, "1.2.0");
    assert_eq!(current.in_sync, Some(true));
    assert!(current.note.contains("latest upstream release 1.2.0"));

    let drifted = VersionRecord::new(&pinned, "1.3.0");
    assert_eq!(drifted.in_sync, Some(false));
    assert_eq!(drifted.latest_version, "1.3.0");
    assert!(drifted.note.contains("1.3.0"));
    assert!(drifted.note.contains("version --update"));

    let unknown = VersionRecord::new(&pinned, UNKNOWN);
    assert_eq!(unknown.in_sync, None);
    assert_eq!(unknown.latest_version, UNKNOWN);
    assert_eq!(unknown.status(), SyncStatus::Unknown);
    assert_eq!(unknown.pinned_identifier, "abc123");
}

#[test]
fn annotate_embeds_record_under_info() {
    let mut doc =
        SchemaDocument::parse("openapi: 3.0.0\ninfo:\n  title: Demo\n  version: 1.0.0\npaths: {}\n")
            .unwrap();
    let record = VersionRecord::new(&pin("abc123@1.2.0"), UNKNOWN);
    annotate(&mut doc, KEY, &record).unwrap();

    assert_eq!(read_record(&doc, KEY).unwrap(), record);
    let info = &doc.value()["info"][KEY];
    assert_eq!(info["pinnedVersion"].as_str(), Some("1.2.0"));
    assert!(info["inSync"].is_null());
    assert!(doc.text().starts_with("openapi: 3.0.0\ninfo:\n  title: Demo\n  version: 1.0.0\n"));
    assert!(doc.text().ends_with("paths: {}\n"));

    // Re-annotating replaces the block instead of adding a second one.
    let newer = VersionRecord::new(&pin("abc123@1.2.0"), "1.2.0");
    annotate(&mut doc, KEY, &newer).unwrap();
    assert_eq!(read_record(&doc, KEY).unwrap(), newer);
    assert_eq!(doc.text().matches(KEY).count(), 1);
}

#[test]
fn missing_record_is_reported() {
    let doc = SchemaDocument::parse("info:\n  title: Demo\n").unwrap();
    assert!(matches!(read_record(&doc, KEY), Err(VersionError::MissingRecord(_))));
}

#[tokio::test]
async fn fetch_latest_degrades_to_unknown() {
    let mut failing = MockReleaseSource::new();
    failing
        .expect_latest_version()
        .returning(|| Err(ReleaseError::Missing("tag_name")));
    assert_eq!(fetch_latest(&failing).await, UNKNOWN);

    let mut blank = MockReleaseSource::new();
    blank.expect_latest_version().returning(|| Ok("  ".to_string()));
    assert_eq!(fetch_latest(&blank).await, UNKNOWN);

    let mut working = MockReleaseSource::new();
    working.expect_latest_version().returning(|| Ok("1.3.0\n".to_string()));
    assert_eq!(fetch_latest(&working).await, "1.3.0");
}

#[tokio::test]
async fn update_rewrites_only_the_pin_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("openapi-sync.yaml");
    fs::write(&path, CONFIG).unwrap();

    let mut releases = MockReleaseSource::new();
    releases.expect_latest_version().returning(|| Ok("1.3.0".to_string()));
    releases.expect_commit_for_version().times(1).returning(|version| {
        assert_eq!(version, "1.3.0");
        Ok("FEDCBA9876543210FEDCBA9876543210FEDCBA98".to_string())
    });

    let current = pin("0123456789abcdef0123456789abcdef01234567@1.2.0");
    let update = update_to_latest(&releases, &path, &current).await.unwrap();
    let next = pin("fedcba9876543210fedcba9876543210fedcba98@1.3.0");
    assert_eq!(
        update,
        PinUpdate::Updated {
            from: current,
            to: next
        }
    );

    let expected = CONFIG.replace(
        "0123456789abcdef0123456789abcdef01234567@1.2.0",
        "fedcba9876543210fedcba9876543210fedcba98@1.3.0",
    );
    assert_eq!(fs::read_to_string(&path).unwrap(), expected);
}

#[tokio::test]
async fn update_is_a_noop_when_already_current() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("openapi-sync.yaml");
    fs::write(&path, CONFIG).unwrap();

    let mut releases = MockReleaseSource::new();
    releases.expect_latest_version().returning(|| Ok("1.2.0".to_string()));
    releases.expect_commit_for_version().never();

    let current = pin("0123456789abcdef0123456789abcdef01234567@1.2.0");
    let update = update_to_latest(&releases, &path, &current).await.unwrap();
    assert_eq!(update, PinUpdate::AlreadyCurrent(current));
    assert_eq!(fs::read_to_string(&path).unwrap(), CONFIG);
}

#[tokio::test]
async fn update_failures_leave_the_config_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("openapi-sync.yaml");
    fs::write(&path, CONFIG).unwrap();
    let current = pin("0123456789abcdef0123456789abcdef01234567@1.2.0");

    let mut unreachable = MockReleaseSource::new();
    unreachable
        .expect_latest_version()
        .returning(|| Err(ReleaseError::Missing("tag_name")));
    let err = update_to_latest(&unreachable, &path, &current).await.unwrap_err();
    assert!(matches!(err, VersionError::Release(_)));

    let mut bad_commit = MockReleaseSource::new();
    bad_commit.expect_latest_version().returning(|| Ok("1.3.0".to_string()));
    bad_commit
        .expect_commit_for_version()
        .returning(|_| Ok("not-a-commit".to_string()));
    let err = update_to_latest(&bad_commit, &path, &current).await.unwrap_err();
    assert!(matches!(err, VersionError::InvalidPin(_)));

    assert_eq!(fs::read_to_string(&path).unwrap(), CONFIG);
}

#[tokio::test]
#[serial]
async fn unreachable_github_feed_is_unknown_for_checks_and_fatal_for_updates() {
    std::env::set_var("GITHUB_TOKEN", "test-token");
    let feed = GithubReleases::new(&ReleasesConfig {
        // Nothing listens on the discard port.
        api_base: "http://127.0.0.1:9/".to_string(),
        repo: "example/platform".to_string(),
        tag_prefix: "platform@".to_string(),
    })
    .unwrap();
    std::env::remove_var("GITHUB_TOKEN");

    assert_eq!(fetch_latest(&feed).await, UNKNOWN);

    let dir = tempdir().unwrap();
    let path = dir.path().join("openapi-sync.yaml");
    fs::write(&path, CONFIG).unwrap();
    let current = pin("0123456789abcdef0123456789abcdef01234567@1.2.0");
    let err = update_to_latest(&feed, &path, &current).await.unwrap_err();
    assert!(matches!(err, VersionError::Release(ReleaseError::Http(_))));
    assert_eq!(fs::read_to_string(&path).unwrap(), CONFIG);
}
