//! depflow - offline operator tool
//!
//! Works on a JSON catalog snapshot (the same format `depflowd --catalog`
//! loads) without touching the live queue.
//!
//! ## Commands
//!
//! - `graph`: build the flow graph and print the longest build path
//! - `check`: dry-run a frequency check and list the work it would enqueue
//! - `coherency`: report incoherent dependencies of a repository@commit

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use depflow_core::orchestrator::longest_build_path;
use depflow_core::{
    AzureDevOpsRunSource, CoherencyAnalyzer, CoherencyReport, Dispatcher, FlowGraphBuilder,
    FlowNode, GraphOptions, HistoricalBuildTimes, StaticManifests, UpdateScheduler,
};
use flow_state::fakes::{CatalogSnapshot, MemoryCatalog, MemoryWorkQueue, StaticBuildTimes};
use flow_state::{BuildTimeProvider, ChannelId, LongestBuildPath, UpdateFrequency, UpdateWorkItem};
use serde::{Deserialize, Serialize};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "depflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect dependency flow from a catalog snapshot", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the flow graph and mark the longest build path
    Graph {
        /// Catalog snapshot (JSON)
        #[arg(short, long)]
        catalog: PathBuf,

        /// Prune to the repositories feeding this channel id
        #[arg(long)]
        channel: Option<u32>,

        /// Build-duration look-back window
        #[arg(long, default_value = "30")]
        days: u32,

        /// Keep only edges of these frequencies (repeatable; default all)
        #[arg(long = "frequency")]
        frequencies: Vec<UpdateFrequency>,

        /// Keep edges of disabled subscriptions
        #[arg(long)]
        include_disabled: bool,

        /// Fixed build durations (JSON list of repository/branch/minutes)
        #[arg(long, conflicts_with = "azdo")]
        build_times: Option<PathBuf>,

        /// Estimate durations from Azure DevOps build history
        #[arg(long)]
        azdo: bool,
    },

    /// Dry-run a frequency check
    Check {
        /// Catalog snapshot (JSON)
        #[arg(short, long)]
        catalog: PathBuf,

        /// Frequency tier to check
        #[arg(short, long, default_value = "everyDay")]
        frequency: UpdateFrequency,
    },

    /// Report incoherent transitive dependencies
    Coherency {
        /// Manifest set (JSON, `{"manifests": [...]}`)
        #[arg(short, long)]
        manifests: PathBuf,

        /// Root repository
        #[arg(short, long)]
        repository: String,

        /// Root commit
        #[arg(long)]
        commit: String,
    },
}

/// One row of a `--build-times` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildTimeEntry {
    repository: String,
    branch: String,
    official_minutes: f64,
    #[serde(default)]
    pr_minutes: f64,
}

#[derive(Debug, Serialize)]
struct EdgeView {
    from: String,
    to: String,
    channel: String,
    frequency: UpdateFrequency,
    enabled: bool,
    tooling_only: bool,
    on_longest_build_path: bool,
}

#[derive(Debug, Serialize)]
struct GraphReport {
    nodes: Vec<FlowNode>,
    edges: Vec<EdgeView>,
    /// Marked nodes in path order.
    longest_path: Vec<String>,
    /// Set when the graph was pruned to a channel.
    summary: Option<LongestBuildPath>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    frequency: UpdateFrequency,
    candidates: usize,
    failed: usize,
    items: Vec<UpdateWorkItem>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what} {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {what} {}", path.display()))
}

fn load_catalog(path: &Path) -> Result<Arc<MemoryCatalog>> {
    let snapshot: CatalogSnapshot = read_json(path, "catalog")?;
    Ok(Arc::new(MemoryCatalog::from_snapshot(snapshot)))
}

fn load_build_times(path: Option<&Path>, azdo: bool) -> Result<Arc<dyn BuildTimeProvider>> {
    if azdo {
        let source = AzureDevOpsRunSource::from_env().context("Failed to build Azure DevOps client")?;
        return Ok(Arc::new(HistoricalBuildTimes::new(Arc::new(source))));
    }
    let mut times = StaticBuildTimes::new();
    if let Some(path) = path {
        let entries: Vec<BuildTimeEntry> = read_json(path, "build times")?;
        for e in entries {
            times = times.with(&e.repository, &e.branch, e.official_minutes, e.pr_minutes);
        }
    }
    Ok(Arc::new(times))
}

async fn cmd_graph(
    catalog: &Path,
    channel: Option<u32>,
    days: u32,
    frequencies: Vec<UpdateFrequency>,
    include_disabled: bool,
    build_times: Option<&Path>,
    azdo: bool,
) -> Result<GraphReport> {
    let catalog = load_catalog(catalog)?;
    let times = load_build_times(build_times, azdo)?;
    let options = GraphOptions {
        channel_id: channel.map(ChannelId),
        days,
        frequencies,
        include_disabled,
        ..GraphOptions::default()
    };
    let graph = FlowGraphBuilder::new(catalog.as_ref(), times.as_ref())
        .build(&options)
        .await
        .context("Failed to build flow graph")?;
    debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "flow graph built"
    );

    let mut marked: Vec<&FlowNode> = graph
        .nodes()
        .map(|(_, n)| n)
        .filter(|n| n.on_longest_build_path)
        .collect();
    // Worst-case time never grows along the path.
    marked.sort_by(|a, b| b.worst_case_path_time.total_cmp(&a.worst_case_path_time));

    let edges = graph
        .edges()
        .filter_map(|(_, e)| {
            let from = graph.node(e.from)?;
            let to = graph.node(e.to)?;
            Some(EdgeView {
                from: from.key(),
                to: to.key(),
                channel: e.channel.clone(),
                frequency: e.subscription.frequency(),
                enabled: e.subscription.enabled,
                tooling_only: e.is_tooling_only,
                on_longest_build_path: e.on_longest_build_path,
            })
        })
        .collect();

    Ok(GraphReport {
        longest_path: marked.iter().map(|n| n.key()).collect(),
        summary: options
            .channel_id
            .and_then(|c| longest_build_path(&graph, c, Utc::now())),
        nodes: graph.nodes().map(|(_, n)| n.clone()).collect(),
        edges,
    })
}

async fn cmd_check(catalog: &Path, frequency: UpdateFrequency) -> Result<CheckReport> {
    let catalog = load_catalog(catalog)?;
    // Nothing is enqueued by a plan; the queue only satisfies the constructor.
    let dispatcher = Dispatcher::new(Arc::new(MemoryWorkQueue::new()));
    let scheduler = UpdateScheduler::new(catalog, dispatcher, GraphOptions::default().max_parallelism);
    let plan = scheduler
        .plan_frequency_check(frequency)
        .await
        .context("Failed to plan frequency check")?;
    Ok(CheckReport {
        frequency,
        candidates: plan.candidates,
        failed: plan.failed,
        items: plan.items,
    })
}

async fn cmd_coherency(manifests: &Path, repository: &str, commit: &str) -> Result<CoherencyReport> {
    let manifests: StaticManifests = read_json(manifests, "manifests")?;
    CoherencyAnalyzer::new(&manifests, GraphOptions::default().max_parallelism)
        .analyze(repository, commit)
        .await
        .context("Coherency analysis failed")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_graph(report: &GraphReport) {
    println!("{} nodes, {} edges", report.nodes.len(), report.edges.len());
    for node in &report.nodes {
        let mark = if node.on_longest_build_path { "*" } else { " " };
        println!(
            "{mark} {:<60} best {:>7.1}  worst {:>7.1}",
            node.key(),
            node.best_case_path_time,
            node.worst_case_path_time
        );
    }
    if report.longest_path.is_empty() {
        println!("no longest build path");
        return;
    }
    println!("longest build path: {}", report.longest_path.join(" -> "));
    if let Some(summary) = &report.summary {
        println!(
            "best case {:.1} min, worst case {:.1} min",
            summary.best_case_minutes, summary.worst_case_minutes
        );
    }
}

fn print_check(report: &CheckReport) {
    println!(
        "{}: {} candidate(s), {} update(s) due, {} failed lookup(s)",
        report.frequency,
        report.candidates,
        report.items.len(),
        report.failed
    );
    for item in &report.items {
        if let UpdateWorkItem::SubscriptionUpdate {
            subscription_id,
            build_id,
        } = item
        {
            println!("  {subscription_id} <- build {build_id}");
        }
    }
}

fn print_coherency(report: &CoherencyReport) {
    if report.is_coherent() {
        println!("coherent ({} repository/commit pairs visited)", report.visited);
        return;
    }
    println!("{} incoherent dependencies:", report.incoherencies.len());
    for i in &report.incoherencies {
        println!("  {} {} from {}@{}", i.name, i.version, i.repository, i.commit);
    }
    for (repo, commits) in &report.incoherent_repositories {
        let commits: Vec<&str> = commits.iter().map(String::as_str).collect();
        println!("  {repo} seen at {}", commits.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    depflow_core::init_tracing(false, level);

    match cli.command {
        Commands::Graph {
            catalog,
            channel,
            days,
            frequencies,
            include_disabled,
            build_times,
            azdo,
        } => {
            let report = cmd_graph(
                &catalog,
                channel,
                days,
                frequencies,
                include_disabled,
                build_times.as_deref(),
                azdo,
            )
            .await?;
            if cli.json {
                print_json(&report)
            } else {
                print_graph(&report);
                Ok(())
            }
        }
        Commands::Check { catalog, frequency } => {
            let report = cmd_check(&catalog, frequency).await?;
            if cli.json {
                print_json(&report)
            } else {
                print_check(&report);
                Ok(())
            }
        }
        Commands::Coherency {
            manifests,
            repository,
            commit,
        } => {
            let report = cmd_coherency(&manifests, &repository, &commit).await?;
            if cli.json {
                print_json(&report)
            } else {
                print_coherency(&report);
                Ok(())
            }
        }
    }
}
