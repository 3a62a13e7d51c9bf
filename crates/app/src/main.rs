//! fleethelm entrypoint: load and validate the fleet config, initialize
//! cluster sessions behind a join barrier, then detach one reconciliation
//! loop per namespace and run until the process is terminated.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fleethelm_config::{Config, LoadError};
use fleethelm_registry::PackageCatalog;
use fleethelm_sync::NamespaceWorker;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "fleethelm", version, about = "Converges Helm releases across a Kubernetes fleet")]
struct Cli {
    /// Path to the fleet config file
    #[arg(long = "config", env = "FLEETHELM_CONFIG", default_value = "fleethelm.yaml")]
    config: PathBuf,

    /// Also write JSON log lines to this file
    #[arg(long = "log-file", env = "FLEETHELM_LOG_FILE")]
    log_file: Option<PathBuf>,
}

/// Human-readable stdout sink, plus a JSON file sink when a log file is
/// configured. `FLEETHELM_LOG` sets the filter for both.
fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let env = std::env::var("FLEETHELM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_ref())?;

    let (config, report) = match Config::load(&cli.config) {
        Ok(loaded) => loaded,
        Err(LoadError::NothingValid { errors }) => {
            for e in &errors {
                error!(error = %e, "config validation failure");
            }
            bail!("no cluster survived validation of {}", cli.config.display());
        }
        Err(e) => return Err(e).with_context(|| format!("loading {}", cli.config.display())),
    };
    for e in &report {
        warn!(error = %e, "pruned invalid config entity");
    }
    info!(
        config = %cli.config.display(),
        clusters = config.clusters.len(),
        "fleet config loaded"
    );

    let sessions = fleethelm_cluster::init_fleet(config).await;
    if sessions.is_empty() {
        bail!("no namespace session survived cluster initialization");
    }
    info!(namespaces = sessions.len(), "fleet initialized, starting reconciliation loops");

    let catalog = PackageCatalog::new().context("building registry client")?;
    for session in sessions {
        let worker = Arc::new(NamespaceWorker::new(
            session.cluster,
            session.namespace,
            session.client,
            catalog.clone(),
        ));
        tokio::spawn(worker.run());
    }

    // Loops never return; only process termination stops the fleet.
    signal::ctrl_c().await.context("waiting for termination signal")?;
    info!("termination signal received, exiting");
    Ok(())
}
