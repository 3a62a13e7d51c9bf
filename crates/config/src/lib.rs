//! Fleethelm configuration: the cluster/namespace/artifact hierarchy, the
//! GlobalDefaults cascade, bottom-up validation with pruning, and YAML load.

#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use fleethelm_core::{retain_valid, Validatable, ValidationError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Floor for `sync_interval`; a namespace must declare a strictly larger
/// value to survive validation.
pub const MIN_SYNC_INTERVAL_SECS: u16 = 4;

static K8S_API_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?://)?[a-zA-Z0-9.-]+(:\d+)?$").expect("static regex"));
static ARTIFACT_DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://)?([a-zA-Z0-9-]+\.)*[a-zA-Z0-9-]+/artifactory$").expect("static regex")
});

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no cluster survived validation ({} accumulated failures)", .errors.len())]
    NothingValid { errors: Vec<ValidationError> },
}

/// Merge-direction failure; the offending merge step is skipped, never fatal.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot merge repo {dest} from {src}: names do not match")]
    RepoNameMismatch { dest: String, src: String },
}

// ---- Repo ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    #[serde(default)]
    pub name: String,
    /// Newest-package ties break on semver when set, on modified time otherwise.
    #[serde(default, rename = "decideByVersion")]
    pub decide_by_version: bool,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Repo {
    /// First-non-empty-wins merge from a same-named peer; the skip-style
    /// boolean only escalates false -> true; paths take the set union.
    pub fn merge_from(&mut self, src: &Repo) -> Result<(), SyncError> {
        if self.name != src.name {
            return Err(SyncError::RepoNameMismatch {
                dest: self.name.clone(),
                src: src.name.clone(),
            });
        }
        if src.decide_by_version {
            self.decide_by_version = true;
        }
        union_paths(&mut self.paths, &src.paths);
        Ok(())
    }
}

impl Validatable for Repo {
    fn describe(&self) -> String {
        format!("repo {}", self.name)
    }

    fn validate(&mut self, _report: &mut Vec<ValidationError>) -> Vec<ValidationError> {
        let mut errs = Vec::new();
        if self.name.is_empty() {
            errs.push(ValidationError::new(self.describe(), "name cannot be empty"));
        }
        if self.paths.is_empty() {
            errs.push(ValidationError::new(self.describe(), "paths list cannot be empty"));
        }
        errs
    }
}

/// Deduplicating union, first-seen order; never drops an existing path.
fn union_paths(dest: &mut Vec<String>, src: &[String]) {
    for p in src {
        if !dest.iter().any(|existing| existing == p) {
            dest.push(p.clone());
        }
    }
}

/// Name-keyed union: a same-named incoming repo merges recursively into the
/// existing entry, anything else is appended. Entries are never deleted.
fn merge_repo_lists(dest: &mut Vec<Repo>, src: &[Repo]) {
    for s in src {
        match dest.iter_mut().find(|d| d.name == s.name) {
            Some(existing) => {
                if let Err(e) = existing.merge_from(s) {
                    warn!(error = %e, "skipping repo merge step");
                }
            }
            None => dest.push(s.clone()),
        }
    }
}

// ---- Artifact ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub domain: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub repos: Vec<Repo>,
}

impl Artifact {
    pub fn merge_defaults(&mut self, src: &Artifact) {
        if self.domain.is_empty() && !src.domain.is_empty() {
            self.domain = src.domain.clone();
        }
        if self.username.is_empty() && !src.username.is_empty() {
            self.username = src.username.clone();
        }
        if self.password.is_empty() && !src.password.is_empty() {
            self.password = src.password.clone();
        }
        merge_repo_lists(&mut self.repos, &src.repos);
    }

    pub fn repo_by_name(&self, name: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.name == name)
    }
}

impl Validatable for Artifact {
    fn describe(&self) -> String {
        format!("artifact {}", self.domain)
    }

    fn validate(&mut self, report: &mut Vec<ValidationError>) -> Vec<ValidationError> {
        info!(artifact = %self.domain, "validating artifact");
        let mut errs = Vec::new();
        if !ARTIFACT_DOMAIN_RE.is_match(&self.domain) {
            errs.push(ValidationError::new(
                self.describe(),
                format!("domain {:?} does not match {}", self.domain, ARTIFACT_DOMAIN_RE.as_str()),
            ));
        }
        if self.username.is_empty() {
            errs.push(ValidationError::new(self.describe(), "username cannot be empty"));
        }
        if self.password.is_empty() {
            errs.push(ValidationError::new(self.describe(), "password cannot be empty"));
        }
        retain_valid(&mut self.repos, report);
        if self.repos.is_empty() {
            errs.push(ValidationError::new(self.describe(), "repos list cannot be empty"));
        }
        errs
    }
}

// ---- Namespace ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(default)]
    pub name: String,
    /// Seconds between reconciliation passes.
    #[serde(default)]
    pub sync_interval: u16,
    #[serde(default)]
    pub artifact: Artifact,
}

impl Validatable for Namespace {
    fn describe(&self) -> String {
        format!("namespace {}", self.name)
    }

    fn validate(&mut self, report: &mut Vec<ValidationError>) -> Vec<ValidationError> {
        info!(namespace = %self.name, "validating namespace");
        let mut errs = Vec::new();
        if self.name.is_empty() {
            errs.push(ValidationError::new(self.describe(), "name cannot be empty"));
        }
        if self.sync_interval <= MIN_SYNC_INTERVAL_SECS {
            errs.push(ValidationError::new(
                self.describe(),
                format!(
                    "sync_interval must be greater than {MIN_SYNC_INTERVAL_SECS}s, got {}s",
                    self.sync_interval
                ),
            ));
        }
        // An invalid artifact view invalidates the namespace that owns it.
        errs.extend(self.artifact.validate(report));
        errs
    }
}

// ---- Cluster ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub username: String,
    /// Basic authentication; mutually exclusive with `token`.
    #[serde(default)]
    pub password: String,
    /// Bearer-token authentication; mutually exclusive with `password`.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default)]
    pub ca_cert_file_path: String,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

impl Cluster {
    pub fn merge_defaults(&mut self, src: &Cluster) {
        if self.name.is_empty() && !src.name.is_empty() {
            self.name = src.name.clone();
        }
        if self.server.is_empty() && !src.server.is_empty() {
            self.server = src.server.clone();
        }
        if self.username.is_empty() && !src.username.is_empty() {
            self.username = src.username.clone();
        }
        if self.password.is_empty() && !src.password.is_empty() {
            self.password = src.password.clone();
        }
        if self.token.is_empty() && !src.token.is_empty() {
            self.token = src.token.clone();
        }
        if src.insecure_skip_tls_verify {
            self.insecure_skip_tls_verify = true;
        }
        if self.ca_cert_file_path.is_empty() && !src.ca_cert_file_path.is_empty() {
            self.ca_cert_file_path = src.ca_cert_file_path.clone();
        }
    }
}

impl Validatable for Cluster {
    fn describe(&self) -> String {
        format!("cluster {}", self.name)
    }

    fn validate(&mut self, report: &mut Vec<ValidationError>) -> Vec<ValidationError> {
        info!(cluster = %self.name, "validating cluster");
        let mut errs = Vec::new();
        if self.name.is_empty() {
            errs.push(ValidationError::new(self.describe(), "name cannot be empty"));
        }
        if !K8S_API_URL_RE.is_match(&self.server) {
            errs.push(ValidationError::new(
                self.describe(),
                format!("server {:?} does not match {}", self.server, K8S_API_URL_RE.as_str()),
            ));
        }
        if self.username.is_empty() {
            errs.push(ValidationError::new(self.describe(), "username cannot be empty"));
        }
        match (self.password.is_empty(), self.token.is_empty()) {
            (true, true) => errs.push(ValidationError::new(
                self.describe(),
                "exactly one of password or token is required, got neither",
            )),
            (false, false) => errs.push(ValidationError::new(
                self.describe(),
                "exactly one of password or token is required, got both",
            )),
            _ => {}
        }
        if !self.insecure_skip_tls_verify && self.ca_cert_file_path.is_empty() {
            errs.push(ValidationError::new(
                self.describe(),
                "ca_cert_file_path is required when TLS verification is enabled",
            ));
        }
        retain_valid(&mut self.namespaces, report);
        if self.namespaces.is_empty() {
            errs.push(ValidationError::new(self.describe(), "namespaces list cannot be empty"));
        }
        errs
    }
}

// ---- GlobalDefaults / Config ----

/// Cluster-shaped and artifact-shaped templates whose fields cascade into
/// every cluster/namespace that leaves them unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalDefaults {
    #[serde(default)]
    pub cluster: Option<Cluster>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
}

impl GlobalDefaults {
    /// Templates are legitimately partial, so only set fields are checked.
    /// Issues are reported, never fatal on their own.
    fn validate(&mut self, report: &mut Vec<ValidationError>) {
        if let Some(artifact) = &mut self.artifact {
            if !artifact.domain.is_empty() && !ARTIFACT_DOMAIN_RE.is_match(&artifact.domain) {
                report.push(ValidationError::new(
                    "global artifact",
                    format!(
                        "domain {:?} does not match {}",
                        artifact.domain,
                        ARTIFACT_DOMAIN_RE.as_str()
                    ),
                ));
            }
            if !artifact.repos.is_empty() {
                retain_valid(&mut artifact.repos, report);
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalDefaults,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
}

impl Config {
    /// Load, merge and validate the fleet description.
    ///
    /// A missing/unparseable file is fatal, as is a config where no cluster
    /// survives validation. Otherwise the surviving tree is returned together
    /// with the accumulated (non-fatal) validation failures.
    pub fn load(path: &Path) -> Result<(Config, Vec<ValidationError>), LoadError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| LoadError::Read { path: path.to_path_buf(), source })?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.apply_global();
        let report = config.validate_tree();
        if config.clusters.is_empty() {
            return Err(LoadError::NothingValid { errors: report });
        }
        Ok((config, report))
    }

    /// Cascade GlobalDefaults into every cluster and namespace artifact.
    /// Direction is always defaults -> entity; merging twice is a no-op.
    pub fn apply_global(&mut self) {
        for cluster in &mut self.clusters {
            if let Some(defaults) = &self.global.cluster {
                cluster.merge_defaults(defaults);
            }
            if let Some(artifact_defaults) = &self.global.artifact {
                for namespace in &mut cluster.namespaces {
                    namespace.artifact.merge_defaults(artifact_defaults);
                }
            }
        }
    }

    /// Bottom-up validation of the merged tree, pruning invalid leaves.
    /// Returns every accumulated failure for post-mortem logging.
    pub fn validate_tree(&mut self) -> Vec<ValidationError> {
        let mut report = Vec::new();
        self.global.validate(&mut report);
        retain_valid(&mut self.clusters, &mut report);
        report
    }
}
