use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

const CONFIG: &str = r#"
upstream:
  repo_url: https://github.com/example/platform.git
  sparse_path: packages/api
  entrypoint: openapi.yml
  pin: "0123456789abcdef0123456789abcdef01234567@1.2.0"
paths:
  document: api/openapi.yaml
  source_dir: build/upstream-api
  patch: api/openapi.patch
  generator_input: api/openapi-generated.yaml
  sdk_dir: sdk
tools:
  bundle: ["bundle-tool", "{input}", "{output}"]
  generate: ["generator", "-i", "{input}", "-o", "{output}"]
"#;

const ANNOTATED_DOC: &str = "\
openapi: 3.0.0
info:
  title: Platform Public API
  version: 1.1.1
  x-upstream-version-info:
    pinnedVersion: 1.2.0
    pinnedIdentifier: 0123456789abcdef0123456789abcdef01234567
    latestVersion: 1.3.0
    inSync: false
    note: Pinned to 1.2.0 but upstream has released 1.3.0.
paths: {}
";

/// A working tree with the config at its default location and `doc` as the document.
fn working_tree(doc: &str) -> TempDir {
    let dir = tempdir().expect("temp working tree");
    let root = dir.path();
    fs::create_dir_all(root.join("codegen")).unwrap();
    fs::create_dir_all(root.join("api")).unwrap();
    fs::write(root.join("codegen/openapi-sync.yaml"), CONFIG).unwrap();
    fs::write(root.join("api/openapi.yaml"), doc).unwrap();
    dir
}

fn cli(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("openapi-sync").expect("Binary exists");
    cmd.arg("--root").arg(root).env("RUST_LOG", "warn");
    cmd
}

#[test]
fn version_check_prints_embedded_metadata() {
    let tree = working_tree(ANNOTATED_DOC);
    cli(tree.path())
        .args(["version", "--check"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("pinned:     1.2.0")
                .and(predicate::str::contains("latest:     1.3.0"))
                .and(predicate::str::contains("status:     drifted")),
        );
}

#[test]
fn version_check_fails_without_metadata() {
    let tree = working_tree("openapi: 3.0.0\ninfo:\n  title: Bare\n  version: 1.0.0\npaths: {}\n");
    cli(tree.path())
        .args(["version", "--check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("carries no version metadata"));
}

#[test]
fn version_requires_an_action() {
    let tree = working_tree(ANNOTATED_DOC);
    cli(tree.path()).arg("version").assert().failure();
    cli(tree.path())
        .args(["version", "--check", "--update"])
        .assert()
        .failure();
}

#[test]
fn version_update_needs_a_release_feed() {
    let tree = working_tree(ANNOTATED_DOC);
    cli(tree.path())
        .args(["version", "--update"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("`releases` is not configured"));
    let config = fs::read_to_string(tree.path().join("codegen/openapi-sync.yaml")).unwrap();
    assert_eq!(config, CONFIG);
}

#[test]
fn patch_authoring_flags_conflict() {
    let tree = working_tree(ANNOTATED_DOC);
    cli(tree.path())
        .args(["patch", "--create", "--from-commit", "HEAD"])
        .assert()
        .failure();
}

#[test]
fn inject_with_nothing_configured_is_a_noop() {
    let tree = working_tree(ANNOTATED_DOC);
    fs::create_dir_all(tree.path().join("sdk")).unwrap();
    cli(tree.path())
        .arg("inject")
        .assert()
        .success()
        .stdout(predicate::str::contains("no-op").and(predicate::str::contains("done")));
}

#[test]
fn missing_config_is_reported() {
    let dir = tempdir().unwrap();
    cli(dir.path())
        .args(["--config", "nowhere.yaml", "inject"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

/// Collects the formatted fields of every emitted event.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}

#[tokio::test]
async fn run_logs_config_load_failures() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use openapi_sync::cli::{run, Cli, Commands};

    let dir = tempdir().unwrap();
    let cli = Cli {
        config: "missing.yaml".into(),
        root: dir.path().to_path_buf(),
        command: Commands::Inject,
    };
    assert!(run(cli).await.is_err());

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("Failed to read config file")),
        "Expected a config read failure event, got: {:?}",
        event_msgs
    );
}
