//! Generated kubeconfig documents: API version `v1`, one cluster and user,
//! one context per namespace.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfigDoc {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(rename = "current-context")]
    pub current_context: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDetails {
    pub server: String,
    #[serde(rename = "insecure-skip-tls-verify")]
    pub insecure_skip_tls_verify: bool,
    #[serde(rename = "certificate-authority", skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDetails {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDetails {
    pub cluster: String,
    pub user: String,
    pub namespace: String,
}

/// Context name for one namespace of a cluster.
pub fn context_name(cluster: &str, namespace: &str) -> String {
    format!("{cluster}-{namespace}")
}

/// Render the kubeconfig document for a cluster. The CA file is only carried
/// when TLS verification is enabled; current-context points at the first
/// namespace context.
pub fn generate(cluster: &fleethelm_config::Cluster) -> KubeConfigDoc {
    let certificate_authority = if cluster.insecure_skip_tls_verify {
        None
    } else {
        Some(cluster.ca_cert_file_path.clone())
    };

    let contexts: Vec<NamedContext> = cluster
        .namespaces
        .iter()
        .map(|ns| NamedContext {
            name: context_name(&cluster.name, &ns.name),
            context: ContextDetails {
                cluster: cluster.name.clone(),
                user: cluster.username.clone(),
                namespace: ns.name.clone(),
            },
        })
        .collect();

    KubeConfigDoc {
        api_version: "v1".into(),
        kind: "Config".into(),
        current_context: contexts.first().map(|c| c.name.clone()).unwrap_or_default(),
        clusters: vec![NamedCluster {
            name: cluster.name.clone(),
            cluster: ClusterDetails {
                server: cluster.server.clone(),
                insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
                certificate_authority,
            },
        }],
        users: vec![NamedUser {
            name: cluster.username.clone(),
            user: UserDetails {
                username: cluster.username.clone(),
                password: (!cluster.password.is_empty()).then(|| cluster.password.clone()),
                token: (!cluster.token.is_empty()).then(|| cluster.token.clone()),
            },
        }],
        contexts,
    }
}

/// Write the rendered document under `dir`, owner-readable only on unix.
/// The file is created 0600 and an existing file is clamped to 0600 before
/// any credential lands in it.
pub fn write(doc: &KubeConfigDoc, dir: &Path, cluster_name: &str) -> Result<PathBuf, WriteError> {
    use std::io::Write;

    let yaml = serde_yaml::to_string(doc)
        .map_err(|source| WriteError::Render { cluster: cluster_name.to_string(), source })?;
    let path = dir.join(format!("fleethelm-{cluster_name}.kubeconfig"));

    let io_err = |source| WriteError::Io { path: path.clone(), source };
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path).map_err(io_err)?;
    #[cfg(unix)]
    {
        // The creation mode does not apply to a file left by an earlier run.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    file.write_all(yaml.as_bytes()).map_err(io_err)?;
    Ok(path)
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("rendering kubeconfig for cluster {cluster}: {source}")]
    Render {
        cluster: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("writing kubeconfig {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleethelm_config::{Cluster, Namespace};

    fn cluster() -> Cluster {
        Cluster {
            name: "prod".into(),
            server: "https://k8s.prod.example.com:6443".into(),
            username: "admin".into(),
            token: "tok".into(),
            insecure_skip_tls_verify: true,
            namespaces: vec![
                Namespace { name: "apps".into(), sync_interval: 30, ..Default::default() },
                Namespace { name: "batch".into(), sync_interval: 60, ..Default::default() },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn one_context_per_namespace_current_is_first() {
        let doc = generate(&cluster());
        assert_eq!(doc.api_version, "v1");
        assert_eq!(doc.kind, "Config");
        assert_eq!(doc.contexts.len(), 2);
        assert_eq!(doc.contexts[0].name, "prod-apps");
        assert_eq!(doc.contexts[1].name, "prod-batch");
        assert_eq!(doc.current_context, "prod-apps");
        assert_eq!(doc.contexts[0].context.namespace, "apps");
        assert_eq!(doc.clusters.len(), 1);
        assert_eq!(doc.users.len(), 1);
    }

    #[test]
    fn ca_file_only_present_when_verifying_tls() {
        let mut c = cluster();
        let insecure = generate(&c);
        assert!(insecure.clusters[0].cluster.certificate_authority.is_none());

        c.insecure_skip_tls_verify = false;
        c.ca_cert_file_path = "/etc/ssl/ca.pem".into();
        let verified = generate(&c);
        assert_eq!(
            verified.clusters[0].cluster.certificate_authority.as_deref(),
            Some("/etc/ssl/ca.pem")
        );
    }

    #[test]
    fn token_and_password_are_mutually_omitted() {
        let doc = generate(&cluster());
        assert_eq!(doc.users[0].user.token.as_deref(), Some("tok"));
        assert!(doc.users[0].user.password.is_none());
    }

    #[test]
    fn written_file_round_trips_and_is_owner_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let doc = generate(&cluster());
        let path = write(&doc, dir.path(), "prod").expect("write");
        let raw = std::fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("apiVersion: v1"));
        assert!(raw.contains("current-context: prod-apps"));
        assert!(raw.contains("insecure-skip-tls-verify: true"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_clamps_permissions_of_a_leftover_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("fleethelm-prod.kubeconfig");
        std::fs::write(&stale, "stale").expect("seed stale file");
        std::fs::set_permissions(&stale, std::fs::Permissions::from_mode(0o644))
            .expect("loosen stale file");

        let path = write(&generate(&cluster()), dir.path(), "prod").expect("write");
        assert_eq!(path, stale);
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let raw = std::fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("apiVersion: v1"), "stale content must be replaced");
    }
}
