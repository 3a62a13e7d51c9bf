//! Fleethelm chart control plane: the `ChartClient` seam and a driver for
//! the `helm` binary running against a generated kubeconfig.

#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleethelm_config::Artifact;
use fleethelm_core::VersionedPackage;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Go-style layout helm uses to render RFC 3339 timestamps in list output.
const HELM_LIST_TIME_FORMAT: &str = "2006-01-02T15:04:05Z07:00";

pub fn default_install_timeout() -> Duration {
    let secs = std::env::var("FLEETHELM_HELM_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

fn helm_binary() -> PathBuf {
    std::env::var("FLEETHELM_HELM_BIN").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("helm"))
}

#[derive(Debug, Error)]
pub enum HelmError {
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("helm {subcommand} exited with {status}: {stderr}")]
    Failed {
        subcommand: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("decoding helm list output: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A release currently deployed in the namespace. The diff matches on the
/// chart name, so that is what [`VersionedPackage::name`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedRelease {
    pub release: String,
    pub chart_name: String,
    pub chart_version: String,
    pub last_deployed: DateTime<Utc>,
}

impl VersionedPackage for DeployedRelease {
    fn name(&self) -> &str {
        &self.chart_name
    }
    fn version(&self) -> &str {
        &self.chart_version
    }
    fn modified(&self) -> DateTime<Utc> {
        self.last_deployed
    }
}

/// A chart repository entry to register with the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoEntry {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub insecure_skip_tls_verify: bool,
}

/// Repo entries for every repo of an artifact, rooted at its domain.
pub fn repo_entries(artifact: &Artifact) -> Vec<RepoEntry> {
    artifact
        .repos
        .iter()
        .map(|repo| RepoEntry {
            name: repo.name.clone(),
            url: format!("{}/{}", artifact.domain.trim_end_matches('/'), repo.name),
            username: artifact.username.clone(),
            password: artifact.password.clone(),
            insecure_skip_tls_verify: true,
        })
        .collect()
}

/// One install-or-upgrade request. Idempotent on the control-plane side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSpec {
    pub release_name: String,
    pub chart_ref: String,
    pub upgrade_crds: bool,
    pub wait: bool,
    pub timeout: Duration,
}

/// Operations consumed from the chart control plane. One client per
/// namespace; implementations are namespace-scoped.
#[async_trait]
pub trait ChartClient: Send + Sync {
    async fn list_deployed(&self) -> Result<Vec<DeployedRelease>, HelmError>;
    async fn add_or_update_repo(&self, entry: &RepoEntry) -> Result<(), HelmError>;
    async fn install_or_upgrade(&self, spec: &ChartSpec) -> Result<(), HelmError>;
}

#[derive(Debug, Deserialize)]
struct HelmListEntry {
    name: String,
    chart: String,
    updated: String,
}

/// Decode `helm list -o json` output (RFC 3339 time format). Entries whose
/// chart field or timestamp do not parse are rejected with a warning, not a
/// list abort.
pub fn parse_list_output(json: &str) -> Result<Vec<DeployedRelease>, HelmError> {
    let entries: Vec<HelmListEntry> = serde_json::from_str(json)?;
    let releases = entries
        .into_iter()
        .filter_map(|entry| {
            let Some((chart_name, chart_version)) = fleethelm_core::split_name_version(&entry.chart)
            else {
                warn!(release = %entry.name, chart = %entry.chart, "rejecting release with unparseable chart field");
                return None;
            };
            let Ok(last_deployed) = DateTime::parse_from_rfc3339(&entry.updated) else {
                warn!(release = %entry.name, updated = %entry.updated, "rejecting release with unparseable deploy time");
                return None;
            };
            Some(DeployedRelease {
                chart_name: chart_name.to_string(),
                chart_version: chart_version.to_string(),
                release: entry.name,
                last_deployed: last_deployed.with_timezone(&Utc),
            })
        })
        .collect();
    Ok(releases)
}

/// Drives the `helm` binary (`FLEETHELM_HELM_BIN` overrides the path) with
/// an explicit kubeconfig, context and namespace.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
    kubeconfig: PathBuf,
    kube_context: String,
    namespace: String,
}

impl HelmCli {
    pub fn new(kubeconfig: PathBuf, kube_context: String, namespace: String) -> Self {
        Self { binary: helm_binary(), kubeconfig, kube_context, namespace }
    }

    fn global_args(&self) -> Vec<String> {
        vec![
            "--kubeconfig".into(),
            self.kubeconfig.display().to_string(),
            "--kube-context".into(),
            self.kube_context.clone(),
            "--namespace".into(),
            self.namespace.clone(),
        ]
    }

    fn list_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "list".into(),
            "--deployed".into(),
            "--output".into(),
            "json".into(),
            "--time-format".into(),
            HELM_LIST_TIME_FORMAT.into(),
        ];
        args.extend(self.global_args());
        args
    }

    fn repo_add_args(&self, entry: &RepoEntry) -> Vec<String> {
        let mut args: Vec<String> =
            vec!["repo".into(), "add".into(), entry.name.clone(), entry.url.clone(), "--force-update".into()];
        if !entry.username.is_empty() {
            args.extend(["--username".into(), entry.username.clone()]);
            args.extend(["--password".into(), entry.password.clone()]);
        }
        if entry.insecure_skip_tls_verify {
            args.push("--insecure-skip-tls-verify".into());
        }
        args
    }

    fn upgrade_args(&self, spec: &ChartSpec, auth: Option<(&str, &str)>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "upgrade".into(),
            "--install".into(),
            spec.release_name.clone(),
            spec.chart_ref.clone(),
        ];
        if spec.wait {
            args.push("--wait".into());
        }
        args.extend(["--timeout".into(), format!("{}s", spec.timeout.as_secs())]);
        // CRD manifests ship with the chart; skipping them is the exception.
        if !spec.upgrade_crds {
            args.push("--skip-crds".into());
        }
        if let Some((username, password)) = auth {
            args.extend(["--username".into(), username.to_string()]);
            args.extend(["--password".into(), password.to_string()]);
        }
        args.extend(self.global_args());
        args
    }

    async fn run(&self, subcommand: &str, args: Vec<String>) -> Result<String, HelmError> {
        debug!(binary = %self.binary.display(), subcommand, "running helm");
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HelmError::Spawn {
                program: self.binary.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(HelmError::Failed {
                subcommand: subcommand.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Namespace-scoped helm session carrying the registry credentials used to
/// pull chart packages.
#[derive(Debug, Clone)]
pub struct HelmSession {
    cli: HelmCli,
    registry_username: String,
    registry_password: String,
}

impl HelmSession {
    pub fn new(cli: HelmCli, registry_username: String, registry_password: String) -> Self {
        Self { cli, registry_username, registry_password }
    }
}

#[async_trait]
impl ChartClient for HelmSession {
    async fn list_deployed(&self) -> Result<Vec<DeployedRelease>, HelmError> {
        let stdout = self.cli.run("list", self.cli.list_args()).await?;
        parse_list_output(&stdout)
    }

    async fn add_or_update_repo(&self, entry: &RepoEntry) -> Result<(), HelmError> {
        info!(repo = %entry.name, url = %entry.url, "registering chart repository");
        let args = self.cli.repo_add_args(entry);
        self.cli.run("repo add", args).await.map(|_| ())
    }

    async fn install_or_upgrade(&self, spec: &ChartSpec) -> Result<(), HelmError> {
        info!(release = %spec.release_name, chart = %spec.chart_ref, "install-or-upgrade");
        let auth = (!self.registry_username.is_empty())
            .then_some((self.registry_username.as_str(), self.registry_password.as_str()));
        let args = self.cli.upgrade_args(spec, auth);
        self.cli.run("upgrade", args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> HelmCli {
        HelmCli {
            binary: PathBuf::from("helm"),
            kubeconfig: PathBuf::from("/run/fleethelm/prod.kubeconfig"),
            kube_context: "prod-apps".into(),
            namespace: "apps".into(),
        }
    }

    #[test]
    fn list_args_request_deployed_json_with_rfc3339_times() {
        let args = cli().list_args();
        assert_eq!(args[0], "list");
        assert!(args.contains(&"--deployed".to_string()));
        assert!(args.contains(&"json".to_string()));
        assert!(args.contains(&HELM_LIST_TIME_FORMAT.to_string()));
        assert!(args.contains(&"--kube-context".to_string()));
        assert!(args.contains(&"prod-apps".to_string()));
    }

    #[test]
    fn repo_add_is_idempotent_and_authenticated() {
        let entry = RepoEntry {
            name: "charts".into(),
            url: "https://repo.example.com/artifactory/charts".into(),
            username: "svc".into(),
            password: "hunter2".into(),
            insecure_skip_tls_verify: true,
        };
        let args = cli().repo_add_args(&entry);
        assert_eq!(&args[..4], &["repo", "add", "charts", "https://repo.example.com/artifactory/charts"]);
        assert!(args.contains(&"--force-update".to_string()));
        assert!(args.contains(&"--username".to_string()));
        assert!(args.contains(&"--insecure-skip-tls-verify".to_string()));
    }

    #[test]
    fn upgrade_args_install_wait_and_timeout() {
        let spec = ChartSpec {
            release_name: "app".into(),
            chart_ref: "https://repo.example.com/artifactory/charts/stable/app-1.1.0.tgz".into(),
            upgrade_crds: true,
            wait: true,
            timeout: Duration::from_secs(30),
        };
        let args = cli().upgrade_args(&spec, Some(("svc", "hunter2")));
        assert_eq!(&args[..2], &["upgrade", "--install"]);
        assert!(args.contains(&"--wait".to_string()));
        assert!(args.contains(&"30s".to_string()));
        assert!(!args.contains(&"--skip-crds".to_string()));
        assert!(args.contains(&"--password".to_string()));
    }

    #[test]
    fn upgrade_args_skip_crds_when_not_upgrading_them() {
        let spec = ChartSpec {
            release_name: "app".into(),
            chart_ref: "ref".into(),
            upgrade_crds: false,
            wait: false,
            timeout: Duration::from_secs(10),
        };
        let args = cli().upgrade_args(&spec, None);
        assert!(args.contains(&"--skip-crds".to_string()));
        assert!(!args.contains(&"--wait".to_string()));
        assert!(!args.contains(&"--username".to_string()));
    }

    #[test]
    fn parse_list_output_decodes_releases() {
        let json = r#"[
            {"name":"app","namespace":"apps","revision":"3","updated":"2024-03-01T10:00:00+02:00","status":"deployed","chart":"app-1.0.0","app_version":"1.0"},
            {"name":"db","namespace":"apps","revision":"1","updated":"2024-01-15T00:00:00Z","status":"deployed","chart":"postgres-ha-15.2.1","app_version":"15"}
        ]"#;
        let releases = parse_list_output(json).expect("parse");
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].chart_name, "app");
        assert_eq!(releases[0].chart_version, "1.0.0");
        assert_eq!(releases[1].chart_name, "postgres-ha");
        assert_eq!(releases[1].chart_version, "15.2.1");
        assert_eq!(releases[1].release, "db");
    }

    #[test]
    fn parse_list_output_rejects_bad_entries_without_aborting() {
        let json = r#"[
            {"name":"ok","updated":"2024-01-01T00:00:00Z","chart":"app-1.0.0"},
            {"name":"bad-chart","updated":"2024-01-01T00:00:00Z","chart":"nodash"},
            {"name":"bad-time","updated":"yesterday","chart":"app-1.0.0"}
        ]"#;
        let releases = parse_list_output(json).expect("parse");
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].release, "ok");
    }

    #[test]
    fn parse_list_output_propagates_malformed_json() {
        assert!(parse_list_output("not json").is_err());
    }

    #[test]
    fn repo_entries_root_at_the_artifact_domain() {
        let artifact = Artifact {
            domain: "https://repo.example.com/artifactory".into(),
            username: "svc".into(),
            password: "hunter2".into(),
            repos: vec![fleethelm_config::Repo {
                name: "charts".into(),
                decide_by_version: true,
                paths: vec!["stable".into()],
            }],
        };
        let entries = repo_entries(&artifact);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://repo.example.com/artifactory/charts");
        assert_eq!(entries[0].username, "svc");
    }
}
