#![forbid(unsafe_code)]

use std::io::Write;

use fleethelm_config::{Config, LoadError};

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("temp file");
    f.write_all(yaml.as_bytes()).expect("write config");
    f
}

const FLEET: &str = r#"
global:
  cluster:
    username: default-admin
    insecure_skip_tls_verify: true
  artifact:
    domain: https://repo.example.com/artifactory
    username: svc
    password: hunter2
    repos:
      - name: charts
        decideByVersion: true
        paths: [stable]
clusters:
  - name: prod
    server: https://k8s.prod.example.com:6443
    token: prod-token
    namespaces:
      - name: apps
        sync_interval: 30
        artifact:
          domain: ""
          repos:
            - name: charts
              paths: [incubator]
      - name: broken
        sync_interval: 1
        artifact:
          domain: ""
  - name: ""
    server: not a url at all
    namespaces: []
"#;

#[test]
fn load_merges_defaults_and_prunes_invalid_entities() {
    let file = write_config(FLEET);
    let (config, report) = Config::load(file.path()).expect("load");

    // The nameless cluster and the short-interval namespace are pruned.
    assert_eq!(config.clusters.len(), 1);
    let prod = &config.clusters[0];
    assert_eq!(prod.name, "prod");
    assert_eq!(prod.username, "default-admin", "cascaded from global cluster template");
    assert!(prod.insecure_skip_tls_verify);
    assert_eq!(prod.namespaces.len(), 1);

    let apps = &prod.namespaces[0];
    assert_eq!(apps.name, "apps");
    // Artifact view inherited domain/credentials and unioned repo paths.
    assert_eq!(apps.artifact.domain, "https://repo.example.com/artifactory");
    assert_eq!(apps.artifact.username, "svc");
    let charts = apps.artifact.repo_by_name("charts").expect("charts repo");
    assert!(charts.decide_by_version, "escalated from global repo entry");
    assert_eq!(charts.paths, vec!["incubator", "stable"]);

    // Accumulated failures cover both pruned entities.
    assert!(report.iter().any(|e| e.entity.contains("namespace broken")));
    assert!(report.iter().any(|e| e.entity.contains("cluster ")));
}

#[test]
fn load_fails_when_nothing_survives() {
    let file = write_config(
        r#"
clusters:
  - name: ""
    server: ""
    namespaces: []
"#,
    );
    match Config::load(file.path()) {
        Err(LoadError::NothingValid { errors }) => {
            assert!(!errors.is_empty(), "accumulated failures must be carried out");
        }
        other => panic!("expected NothingValid, got {other:?}"),
    }
}

#[test]
fn load_fails_on_missing_file() {
    let err = Config::load(std::path::Path::new("/nonexistent/fleet.yaml")).unwrap_err();
    assert!(matches!(err, LoadError::Read { .. }));
}

#[test]
fn load_fails_on_unparseable_yaml() {
    let file = write_config("clusters: [ this is : : not yaml");
    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, LoadError::Parse(_)));
}
