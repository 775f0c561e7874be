//! leasevisor CLI
//!
//! ```text
//! leasevisor run    --config leasevisor.json --work items.json
//! leasevisor golden --config leasevisor.json --image jammy --vm golden-jammy --snapshot base
//! leasevisor vms    --config leasevisor.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::stream::{self, StreamExt};
use tracing::{error, info, warn};

use leasevisor::telemetry::{init_tracing, shutdown_tracing};
use leasevisor::{metrics, Engine, EngineConfig, EngineError, Lease, WorkItem};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "leasevisor", version, about = "Lease snapshot-backed VMs to work items")]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, short, global = true, default_value = "leasevisor.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run work items to completion and print their leases as JSON
    Run {
        /// JSON array of work items
        #[arg(long, short)]
        work: PathBuf,
        /// Print Prometheus metrics to stderr when done
        #[arg(long)]
        metrics: bool,
    },
    /// Prepare a golden VM and save a snapshot of it
    Golden {
        #[arg(long)]
        image: String,
        #[arg(long)]
        vm: String,
        #[arg(long, default_value = "golden")]
        snapshot: String,
        /// Setup command, repeatable; run in order
        #[arg(long = "setup")]
        setup: Vec<String>,
    },
    /// List VMs known to the configured backend
    Vms,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)?;
    init_tracing("leasevisor", &config.telemetry)?;

    let result = match cli.command {
        Command::Run { work, metrics } => run(config, &work, metrics).await,
        Command::Golden {
            image,
            vm,
            snapshot,
            setup,
        } => {
            let engine = Engine::from_config(config)?;
            engine
                .prepare_golden(&image, &vm, &setup, &snapshot)
                .await
                .map_err(BoxError::from)
        }
        Command::Vms => vms(config).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "leasevisor failed");
    }
    shutdown_tracing();
    result
}

fn load_work(path: &Path) -> Result<Vec<WorkItem>, BoxError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let items: Vec<WorkItem> = serde_json::from_str(&raw)
        .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
    Ok(items)
}

async fn run(config: EngineConfig, work: &Path, print_metrics: bool) -> Result<(), BoxError> {
    let items = load_work(work)?;
    let engine = Arc::new(Engine::from_config(config)?);
    let warmed = engine.start().await;
    info!(items = items.len(), warmed, "running work items");

    // at most max_concurrent items in flight, so only unavailable slots
    // (held, quarantined) can still turn an item away as busy
    let in_flight = engine.config().admission.max_concurrent.max(1);
    let leases = {
        let engine = Arc::clone(&engine);
        async move {
            let finished: Vec<(String, Result<Lease, EngineError>)> = stream::iter(items)
                .map(|item| {
                    let engine = Arc::clone(&engine);
                    async move { (item.id.clone(), engine.run(item).await) }
                })
                .buffered(in_flight)
                .collect()
                .await;

            let mut leases: Vec<Lease> = Vec::new();
            for (work_item, result) in finished {
                match result {
                    Ok(lease) => leases.push(lease),
                    Err(e) => warn!(work_item = %work_item, error = %e, "work item rejected"),
                }
            }
            leases
        }
    };

    let leases = tokio::select! {
        leases = leases => leases,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling leases");
            engine.shutdown().await;
            return Err("interrupted".into());
        }
    };

    engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&leases)?);
    if print_metrics {
        eprintln!("{}", metrics::render());
    }
    Ok(())
}

async fn vms(config: EngineConfig) -> Result<(), BoxError> {
    let engine = Engine::from_config(config)?;
    for vm in engine.vms().await? {
        println!(
            "{:<24} {:<10} {:<16} {}",
            vm.name,
            vm.state.to_string(),
            vm.ipv4.as_deref().unwrap_or("-"),
            vm.image.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
