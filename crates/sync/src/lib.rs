//! Fleethelm reconciliation: the deployed-vs-desired diff, plan execution,
//! and the per-namespace continuous loop.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fleethelm_chart::{ChartClient, ChartSpec, DeployedRelease, HelmError};
use fleethelm_config::{Artifact, Namespace};
use fleethelm_core::{resolve_newer, Newer, VersionedPackage};
use fleethelm_registry::{PackageCatalog, PackageRecord};
use thiserror::Error;
use tracing::{error, info, trace, warn};

#[derive(Debug, Error)]
pub enum PassError {
    #[error("listing deployed releases: {0}")]
    ListReleases(#[source] HelmError),
    /// An empty desired map is a registry/connectivity problem, never
    /// "nothing to deploy".
    #[error("registry returned no packages for namespace {namespace}")]
    EmptyCatalog { namespace: String },
}

/// Outcome of one diff: packages to install-or-upgrade, and deployed
/// releases with no desired counterpart. Orphans are reported only; deletion
/// is deliberately not executed.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub deploy: Vec<PackageRecord>,
    pub orphaned: Vec<DeployedRelease>,
}

/// Diff deployed releases against the desired catalog.
///
/// Matching is by chart name. A matched pair goes through the tie-break with
/// the owning repo's `decideByVersion` flag; the desired side winning marks
/// it for install-or-upgrade. Desired packages with no deployed counterpart
/// are install candidates through their own explicit branch.
pub fn plan(
    deployed: &[DeployedRelease],
    desired: &HashMap<String, PackageRecord>,
    artifact: &Artifact,
) -> ReconcilePlan {
    let mut out = ReconcilePlan::default();
    let mut matched: HashSet<&str> = HashSet::new();
    // Several deployed releases can share one chart name; each candidate is
    // queued at most once per pass.
    let mut queued: HashSet<&str> = HashSet::new();

    for release in deployed {
        match desired.get(release.name()) {
            Some(candidate) => {
                matched.insert(release.name());
                let decide_by_version = match artifact.repo_by_name(&candidate.repo) {
                    Some(repo) => repo.decide_by_version,
                    None => {
                        warn!(repo = %candidate.repo, "candidate repo missing from artifact view, deciding by time");
                        false
                    }
                };
                match resolve_newer(release, candidate, decide_by_version) {
                    Ok(Newer::Right) => {
                        if queued.insert(candidate.name()) {
                            out.deploy.push(candidate.clone());
                        }
                    }
                    Ok(Newer::Left) => {
                        trace!(release = %release.release, "deployed release already newest")
                    }
                    Err(e) => warn!(error = %e, release = %release.release, "skipping release that failed tie-break"),
                }
            }
            None => out.orphaned.push(release.clone()),
        }
    }

    // Desired-only packages: not yet deployed, install them.
    for (name, candidate) in desired {
        if !matched.contains(name.as_str()) {
            out.deploy.push(candidate.clone());
        }
    }
    out.deploy.sort_by(|a, b| a.name().cmp(b.name()));
    out
}

/// Counters reported after each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub installed: usize,
    pub failed: usize,
    pub orphaned: usize,
}

/// Issue one install-or-upgrade per deploy candidate. A single chart's
/// failure is logged and the remaining candidates proceed.
pub async fn execute_plan(
    client: &dyn ChartClient,
    domain: &str,
    plan: &ReconcilePlan,
) -> PassSummary {
    let mut summary = PassSummary { orphaned: plan.orphaned.len(), ..Default::default() };

    for release in &plan.orphaned {
        info!(release = %release.release, chart = %release.chart_name, "orphaned release, deletion deferred");
    }

    for candidate in &plan.deploy {
        let spec = ChartSpec {
            release_name: candidate.name().to_string(),
            chart_ref: candidate.chart_ref(domain),
            upgrade_crds: true,
            wait: true,
            timeout: fleethelm_chart::default_install_timeout(),
        };
        match client.install_or_upgrade(&spec).await {
            Ok(()) => {
                info!(release = %spec.release_name, version = %candidate.version(), "install-or-upgrade issued");
                summary.installed += 1;
            }
            Err(e) => {
                warn!(release = %spec.release_name, error = %e, "install-or-upgrade failed, continuing pass");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Loop states; each pass walks Idle -> Reconciling -> Sleeping -> Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Reconciling,
    Sleeping,
}

/// One namespace's reconciliation worker. Owns its chart-client handle and
/// artifact view exclusively; nothing is shared across namespace loops.
pub struct NamespaceWorker {
    cluster: String,
    namespace: Namespace,
    client: Arc<dyn ChartClient>,
    catalog: PackageCatalog,
}

impl NamespaceWorker {
    pub fn new(
        cluster: String,
        namespace: Namespace,
        client: Arc<dyn ChartClient>,
        catalog: PackageCatalog,
    ) -> Self {
        Self { cluster, namespace, client, catalog }
    }

    /// One reconciliation pass: list deployed, discover desired, diff,
    /// execute.
    pub async fn reconcile_once(&self) -> Result<PassSummary, PassError> {
        let deployed = self.client.list_deployed().await.map_err(PassError::ListReleases)?;
        let desired = self.catalog.discover(&self.namespace.artifact).await;
        if desired.is_empty() {
            return Err(PassError::EmptyCatalog { namespace: self.namespace.name.clone() });
        }
        let plan = plan(&deployed, &desired, &self.namespace.artifact);
        Ok(execute_plan(self.client.as_ref(), &self.namespace.artifact.domain, &plan).await)
    }

    /// The unbounded loop. No terminal state: any pass failure, including a
    /// panic-equivalent fault, is contained at the join point and the loop
    /// proceeds to its sleep-then-retry step. Process termination is the
    /// only way out.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(u64::from(self.namespace.sync_interval));
        info!(
            cluster = %self.cluster,
            namespace = %self.namespace.name,
            interval_secs = interval.as_secs(),
            "reconciliation loop started"
        );

        let mut state = LoopState::Idle;
        loop {
            state = match state {
                LoopState::Idle => LoopState::Reconciling,
                LoopState::Reconciling => {
                    // Fault containment boundary: the pass runs in its own
                    // task, so a panic surfaces here as a JoinError instead
                    // of taking the loop down.
                    let me = Arc::clone(&self);
                    let outcome = tokio::spawn(async move { me.reconcile_once().await }).await;
                    match outcome {
                        Ok(Ok(summary)) => info!(
                            namespace = %self.namespace.name,
                            installed = summary.installed,
                            failed = summary.failed,
                            orphaned = summary.orphaned,
                            "reconciliation pass complete"
                        ),
                        Ok(Err(e)) => warn!(
                            namespace = %self.namespace.name,
                            error = %e,
                            "reconciliation pass failed"
                        ),
                        Err(e) => error!(
                            namespace = %self.namespace.name,
                            error = %e,
                            "reconciliation pass aborted unexpectedly"
                        ),
                    }
                    LoopState::Sleeping
                }
                LoopState::Sleeping => {
                    trace!(namespace = %self.namespace.name, "sleeping until next pass");
                    tokio::time::sleep(interval).await;
                    LoopState::Idle
                }
            };
        }
    }
}
