//! depflowd - dependency-flow update orchestrator
//!
//! Runs the worker pool against the durable work queue, fires the
//! per-frequency and longest-build-path timers, and serves the trigger and
//! build-ingest API.

mod api;
mod service;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use depflow_core::{AzureDevOpsRunSource, HistoricalBuildTimes, OrchestratorConfig};
use flow_state::connection;
use flow_state::fakes::{CatalogSnapshot, MemoryCatalog, MemoryWorkQueue};
use flow_state::{SurrealWorkQueue, WorkQueue};
use tokio::net::TcpListener;
use tracing::{info, Level};

use crate::service::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum QueueBackend {
    /// Process-local queue; pending items are lost on exit.
    Memory,
    /// SurrealDB `work_items` table (see `SURREALDB_*` variables).
    Surreal,
}

#[derive(Parser)]
#[command(name = "depflowd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-flow update orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "DEPFLOW_JSON_LOGS")]
    json: bool,

    /// JSON configuration file; `DEPFLOW_*` variables are used when omitted
    #[arg(long, env = "DEPFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Catalog snapshot (JSON) to load at startup
    #[arg(long, env = "DEPFLOW_CATALOG")]
    catalog: Option<PathBuf>,

    /// Write the catalog back to `--catalog` on shutdown
    #[arg(long, requires = "catalog")]
    save_catalog: bool,

    /// Work queue backend
    #[arg(long, value_enum, default_value = "memory", env = "DEPFLOW_QUEUE")]
    queue: QueueBackend,

    /// How long a dequeued item stays invisible before redelivery
    #[arg(long, default_value = "300", env = "DEPFLOW_QUEUE_LEASE_SECS")]
    lease_secs: u64,
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let Some(path) = path else {
        return OrchestratorConfig::from_env().context("invalid DEPFLOW_* configuration");
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: OrchestratorConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_catalog(path: Option<&Path>) -> Result<MemoryCatalog> {
    let Some(path) = path else {
        info!("no catalog snapshot given, starting empty");
        return Ok(MemoryCatalog::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog {}", path.display()))?;
    let snapshot: CatalogSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
    info!(
        channels = snapshot.channels.len(),
        subscriptions = snapshot.subscriptions.len(),
        builds = snapshot.builds.len(),
        "catalog loaded"
    );
    Ok(MemoryCatalog::from_snapshot(snapshot))
}

fn save_catalog(catalog: &MemoryCatalog, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&catalog.snapshot())?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write catalog {}", path.display()))?;
    info!(path = %path.display(), "catalog saved");
    Ok(())
}

async fn open_queue(backend: QueueBackend, lease: Duration) -> Result<Arc<dyn WorkQueue>> {
    Ok(match backend {
        QueueBackend::Memory => Arc::new(MemoryWorkQueue::new()),
        QueueBackend::Surreal => {
            let db = connection::connect_from_env()
                .await
                .context("Failed to connect to the work queue database")?;
            Arc::new(SurrealWorkQueue::new(db, lease))
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    depflow_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    let catalog = Arc::new(load_catalog(cli.catalog.as_deref())?);
    let queue = open_queue(cli.queue, Duration::from_secs(cli.lease_secs)).await?;
    let runs = AzureDevOpsRunSource::from_env().context("Failed to build Azure DevOps client")?;
    let build_times = Arc::new(HistoricalBuildTimes::new(Arc::new(runs)));

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    let service = Service::new(config, catalog.clone(), queue, build_times);
    service
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if cli.save_catalog {
        if let Some(path) = cli.catalog.as_deref() {
            save_catalog(&catalog, path)?;
        }
    }
    Ok(())
}
