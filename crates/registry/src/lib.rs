//! Fleethelm package discovery: AQL queries per (repo, path) pair, filename
//! parsing, and tie-break folding into a name-keyed catalog.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleethelm_config::Artifact;
use fleethelm_core::{resolve_newer, Newer, VersionedPackage};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Search endpoint below the artifact domain (which already ends in
/// `/artifactory`).
pub const AQL_SEARCH_PATH: &str = "api/search/aql";

fn http_timeout() -> Duration {
    let secs = std::env::var("FLEETHELM_REGISTRY_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("building registry HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("registry query for repo {repo} path {path} failed: {source}")]
    Transport {
        repo: String,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("registry query for repo {repo} path {path} returned status {status}")]
    Status {
        repo: String,
        path: String,
        status: StatusCode,
    },
    #[error("decoding registry response for repo {repo} path {path}: {source}")]
    Decode {
        repo: String,
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, Error)]
#[error("file name {file_name:?} does not parse as {{name}}-{{version}}.tgz")]
pub struct BadPackageName {
    pub file_name: String,
}

#[derive(Debug, Deserialize)]
struct AqlResponse {
    #[serde(default)]
    results: Vec<AqlEntry>,
}

/// One row of an AQL `items.find` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AqlEntry {
    pub repo: String,
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

/// A discovered chart package. Name and version are parsed once from the
/// `{name}-{version}.tgz` file name; entries that do not parse are rejected
/// at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub repo: String,
    pub path: String,
    pub file_name: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    name: String,
    version: String,
}

impl TryFrom<AqlEntry> for PackageRecord {
    type Error = BadPackageName;

    fn try_from(entry: AqlEntry) -> Result<Self, Self::Error> {
        let stem = entry
            .name
            .strip_suffix(".tgz")
            .ok_or_else(|| BadPackageName { file_name: entry.name.clone() })?;
        let (name, version) = fleethelm_core::split_name_version(stem)
            .ok_or_else(|| BadPackageName { file_name: entry.name.clone() })?;
        Ok(PackageRecord {
            name: name.to_string(),
            version: version.to_string(),
            repo: entry.repo,
            path: entry.path,
            file_name: entry.name,
            created: entry.created,
            modified: entry.modified,
        })
    }
}

impl PackageRecord {
    /// Full chart reference below the artifact domain.
    pub fn chart_ref(&self, domain: &str) -> String {
        format!("{}/{}/{}/{}", domain.trim_end_matches('/'), self.repo, self.path, self.file_name)
    }
}

impl VersionedPackage for PackageRecord {
    fn name(&self) -> &str {
        &self.name
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }
}

/// AQL body selecting `*.tgz` items under one repo/path pair.
pub fn aql_query(repo: &str, path: &str) -> String {
    format!(
        r#"items.find({{"repo": {{"eq": "{repo}"}}, "path": {{"eq": "{path}"}}, "name": {{"match": "*.tgz"}}}}).include("repo","path","name","created","modified")"#
    )
}

/// Queries the artifact registry and resolves each package name to its
/// newest candidate.
#[derive(Debug, Clone)]
pub struct PackageCatalog {
    http: reqwest::Client,
}

impl PackageCatalog {
    pub fn new() -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout())
            .build()
            .map_err(RegistryError::Client)?;
        Ok(Self { http })
    }

    /// Discover deployable packages for every (repo, path) pair of the
    /// artifact. A failing pair is logged and skipped; it never aborts the
    /// remaining pairs. Duplicate package names fold via the tie-break using
    /// the queried repo's `decideByVersion` flag.
    pub async fn discover(&self, artifact: &Artifact) -> HashMap<String, PackageRecord> {
        let mut catalog = HashMap::new();
        for repo in &artifact.repos {
            for path in &repo.paths {
                info!(repo = %repo.name, path = %path, "querying registry for chart packages");
                match self.query_pair(artifact, &repo.name, path).await {
                    Ok(records) => fold_records(&mut catalog, records, repo.decide_by_version),
                    Err(e) => warn!(error = %e, "skipping registry query pair"),
                }
            }
        }
        catalog
    }

    async fn query_pair(
        &self,
        artifact: &Artifact,
        repo: &str,
        path: &str,
    ) -> Result<Vec<PackageRecord>, RegistryError> {
        let url = format!("{}/{}", artifact.domain.trim_end_matches('/'), AQL_SEARCH_PATH);
        let response = self
            .http
            .post(&url)
            .basic_auth(&artifact.username, Some(&artifact.password))
            .header(CONTENT_TYPE, "text/plain")
            .body(aql_query(repo, path))
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                repo: repo.to_string(),
                path: path.to_string(),
                source,
            })?;

        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status {
                repo: repo.to_string(),
                path: path.to_string(),
                status: response.status(),
            });
        }

        let decoded: AqlResponse =
            response.json().await.map_err(|source| RegistryError::Decode {
                repo: repo.to_string(),
                path: path.to_string(),
                source,
            })?;

        let records = decoded
            .results
            .into_iter()
            .filter_map(|entry| match PackageRecord::try_from(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, repo = %repo, path = %path, "rejecting unparseable package record");
                    None
                }
            })
            .collect();
        Ok(records)
    }
}

/// Fold records into the name-keyed catalog; a later record with an existing
/// name replaces the candidate only when the tie-break says it is newer.
pub fn fold_records(
    catalog: &mut HashMap<String, PackageRecord>,
    records: Vec<PackageRecord>,
    decide_by_version: bool,
) {
    for record in records {
        match catalog.entry(record.name().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                match resolve_newer(slot.get(), &record, decide_by_version) {
                    Ok(Newer::Right) => {
                        slot.insert(record);
                    }
                    Ok(Newer::Left) => {}
                    // Unreachable through name keying, but never fatal.
                    Err(e) => warn!(error = %e, "dropping record that failed tie-break"),
                }
            }
        }
    }
}
