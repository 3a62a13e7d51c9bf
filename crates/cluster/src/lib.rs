//! Fleethelm cluster sessions: per-namespace chart-client setup behind a
//! generated kubeconfig, with a join barrier over concurrent cluster init.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleethelm_chart::{repo_entries, ChartClient, HelmCli, HelmSession};
use fleethelm_config::{Cluster, Config, Namespace};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace as K8sNamespace;
use kube::api::Api;
use kube::config::{Kubeconfig, KubeConfigOptions};
use thiserror::Error;
use tracing::{error, info, warn};

pub mod kubeconfig;

#[derive(Debug, Error)]
pub enum ClusterInitError {
    #[error(transparent)]
    Kubeconfig(#[from] kubeconfig::WriteError),
    #[error("loading generated kubeconfig: {0}")]
    Load(#[from] kube::config::KubeconfigError),
    #[error("building cluster client: {0}")]
    Client(#[from] kube::Error),
    #[error("probing namespace {namespace}: {source}")]
    Probe {
        namespace: String,
        #[source]
        source: kube::Error,
    },
}

/// Where generated kubeconfig files live (`FLEETHELM_KUBECONFIG_DIR`
/// overrides; defaults to the system temp dir).
pub fn kubeconfig_dir() -> PathBuf {
    std::env::var("FLEETHELM_KUBECONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

/// A namespace ready to reconcile: its (possibly repo-pruned) artifact view
/// and an exclusive chart-client handle. Held by exactly one loop for the
/// process lifetime.
pub struct NamespaceSession {
    pub cluster: String,
    pub namespace: Namespace,
    pub client: Arc<dyn ChartClient>,
}

/// Verify the namespace is reachable through the generated kubeconfig before
/// handing it a reconciliation loop.
async fn probe_namespace(
    kubeconfig_path: &Path,
    context: &str,
    namespace: &str,
) -> Result<(), ClusterInitError> {
    let kc = Kubeconfig::read_from(kubeconfig_path)?;
    let options = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
    let config = kube::Config::from_custom_kubeconfig(kc, &options).await?;
    let client = kube::Client::try_from(config)?;
    let api: Api<K8sNamespace> = Api::all(client);
    api.get(namespace)
        .await
        .map_err(|source| ClusterInitError::Probe { namespace: namespace.to_string(), source })?;
    Ok(())
}

/// Initialize every namespace of one cluster. A namespace whose session
/// cannot be set up is dropped from the active set; the rest of the fleet is
/// unaffected.
pub async fn init_cluster(cluster: Cluster, dir: &Path) -> Vec<NamespaceSession> {
    info!(cluster = %cluster.name, "initializing cluster sessions");

    let doc = kubeconfig::generate(&cluster);
    let path = match kubeconfig::write(&doc, dir, &cluster.name) {
        Ok(path) => path,
        Err(e) => {
            error!(cluster = %cluster.name, error = %e, "dropping cluster: kubeconfig could not be written");
            return Vec::new();
        }
    };

    let mut sessions = Vec::new();
    for mut namespace in cluster.namespaces {
        let context = kubeconfig::context_name(&cluster.name, &namespace.name);
        if let Err(e) = probe_namespace(&path, &context, &namespace.name).await {
            warn!(
                cluster = %cluster.name,
                namespace = %namespace.name,
                error = %e,
                "dropping namespace from targets: session setup failed"
            );
            continue;
        }

        let cli = HelmCli::new(path.clone(), context, namespace.name.clone());
        let session = HelmSession::new(
            cli,
            namespace.artifact.username.clone(),
            namespace.artifact.password.clone(),
        );

        // Register chart repositories; a failing entry loses its repo from
        // this namespace's artifact view, the namespace itself stays.
        for entry in repo_entries(&namespace.artifact) {
            if let Err(e) = session.add_or_update_repo(&entry).await {
                warn!(
                    namespace = %namespace.name,
                    repo = %entry.name,
                    error = %e,
                    "dropping chart repository from targets"
                );
                namespace.artifact.repos.retain(|r| r.name != entry.name);
            }
        }

        sessions.push(NamespaceSession {
            cluster: cluster.name.clone(),
            namespace,
            client: Arc::new(session),
        });
    }
    sessions
}

/// Initialize all clusters concurrently and join them before any loop
/// starts. Client setup may hit the network, so clusters proceed in
/// parallel, one task each.
pub async fn init_fleet(config: Config) -> Vec<NamespaceSession> {
    let dir = kubeconfig_dir();
    let tasks: Vec<_> = config
        .clusters
        .into_iter()
        .map(|cluster| {
            let dir = dir.clone();
            tokio::spawn(async move { init_cluster(cluster, &dir).await })
        })
        .collect();

    let mut sessions = Vec::new();
    for joined in join_all(tasks).await {
        match joined {
            Ok(cluster_sessions) => sessions.extend(cluster_sessions),
            Err(e) => error!(error = %e, "cluster initialization task failed"),
        }
    }
    sessions
}
