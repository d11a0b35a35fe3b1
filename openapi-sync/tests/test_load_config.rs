use std::fs::{self, write};
use std::path::{Path, PathBuf};
use tempfile::{tempdir, NamedTempFile};

use openapi_sync::load_config::{config_path, load_config, DEFAULT_CONFIG_PATH};

/// Minimal config: only the required sections, every optional one defaulted.
#[test]
fn test_load_config_applies_defaults() {
    let config_yaml = r#"
upstream:
  repo_url: https://github.com/n8n-io/n8n.git
  sparse_path: packages/cli/src/public-api
  entrypoint: v1/openapi.yml
  pin: "ABCDEF0123456789abcdef0123456789abcdef01@1.120.0"
paths:
  document: api/openapi.yaml
  source_dir: build/n8n-public-api
  patch: api/openapi.patch
  generator_input: api/openapi-generated.yaml
  sdk_dir: src
tools:
  bundle: ["npx", "@redocly/cli", "bundle", "{input}", "-o", "{output}"]
  generate: ["openapi-generator-cli", "generate", "-i", "{input}", "-g", "go", "-o", "{output}"]
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();
    let root = tempdir().unwrap();

    let config = load_config(config_file.path(), root.path()).expect("Config should load");

    assert_eq!(config.root, fs::canonicalize(root.path()).unwrap());
    assert_eq!(config.upstream.pin.commit, "abcdef0123456789abcdef0123456789abcdef01");
    assert_eq!(config.upstream.pin.version, "1.120.0");
    assert_eq!(config.paths.sdk_dir, PathBuf::from("src"));
    assert_eq!(config.document_path(), config.root.join("api/openapi.yaml"));
    assert_eq!(config.patch.fuzz, 3);
    assert_eq!(config.extension_key, "x-upstream-version-info");
    assert!(config.releases.is_none());
    assert!(config.tools.tidy.is_none());
    assert_eq!(config.generated.model_prefix, "model_");
    assert_eq!(config.generated.keep, vec!["api".to_string()]);
    assert!(config.generated.inject.is_empty());
    assert!(config.schema_overrides.allow_additional_properties.is_empty());
}

/// Every optional section spelled out.
#[test]
fn test_load_config_reads_optional_sections() {
    let config_yaml = r#"
upstream:
  repo_url: https://github.com/n8n-io/n8n.git
  sparse_path: packages/cli/src/public-api
  entrypoint: v1/openapi.yml
  pin: "0123456789abcdef0123456789abcdef01234567@1.2.0"  # bumped by version --update
releases:
  repo: n8n-io/n8n
  tag_prefix: "n8n@"
paths:
  document: api/openapi.yaml
  source_dir: build/n8n-public-api
  patch: api/openapi.patch
  generator_input: api/openapi-generated.yaml
  sdk_dir: src
tools:
  bundle: ["bundle", "{input}", "{output}"]
  generate: ["generate", "{input}", "{output}"]
  tidy: ["go", "mod", "tidy"]
  build_files: ["bazel", "run", "//:gazelle"]
patch:
  fuzz: 5
extension_key: x-pinned-upstream
schema_overrides:
  allow_additional_properties: [credential, sharedWorkflow]
generated:
  keep: [api, README.md]
  module_path:
    from: github.com/GIT_USER_ID/GIT_REPO_ID/src
    to: github.com/acme/n8n-go/src
  inject:
    - model: Workflow
      fields:
        - { name: Shared, json: shared, type: "[]SharedWorkflow" }
    - model: Execution
      file: model_execution_custom.go
      fields:
        - { name: CustomData, json: customData, type: "map[string]string" }
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();
    let root = tempdir().unwrap();

    let config = load_config(config_file.path(), root.path()).expect("Config should load");

    let releases = config.releases.as_ref().expect("releases section");
    assert_eq!(releases.api_base, "https://api.github.com");
    assert_eq!(releases.tag_prefix, "n8n@");
    assert_eq!(config.patch.fuzz, 5);
    assert_eq!(config.extension_key, "x-pinned-upstream");
    assert_eq!(config.schema_overrides.allow_additional_properties.len(), 2);
    assert_eq!(config.generated.keep, vec!["api".to_string(), "README.md".to_string()]);
    assert_eq!(config.generated.inject.len(), 2);
    assert_eq!(config.generated.inject[0].fields[0].go_type, "[]SharedWorkflow");
    assert_eq!(config.generated.inject[1].file.as_deref(), Some("model_execution_custom.go"));
    assert_eq!(
        config.tools.build_files.as_ref().map(|t| t.0.clone()),
        Some(vec!["bazel".to_string(), "run".to_string(), "//:gazelle".to_string()])
    );
}

#[test]
fn test_load_config_rejects_malformed_pin() {
    let config_yaml = r#"
upstream:
  repo_url: https://github.com/n8n-io/n8n.git
  sparse_path: packages/cli/src/public-api
  entrypoint: v1/openapi.yml
  pin: "main@1.2.0"
paths:
  document: api/openapi.yaml
  source_dir: build
  patch: api/openapi.patch
  generator_input: api/gen.yaml
  sdk_dir: src
tools:
  bundle: ["bundle"]
  generate: ["generate"]
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();
    let root = tempdir().unwrap();

    let err = load_config(config_file.path(), root.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config YAML"), "{err}");
    assert!(err.to_string().contains("main@1.2.0"), "{err}");
}

#[test]
fn test_load_config_missing_file() {
    let root = tempdir().unwrap();
    let err = load_config(root.path().join("absent.yaml"), root.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_config_path_is_relative_to_root() {
    let root = Path::new("/work/tree");
    assert_eq!(
        config_path(root, Path::new(DEFAULT_CONFIG_PATH)),
        PathBuf::from("/work/tree/codegen/openapi-sync.yaml")
    );
    assert_eq!(
        config_path(root, Path::new("/etc/openapi-sync.yaml")),
        PathBuf::from("/etc/openapi-sync.yaml")
    );
}
