//! ksstorage - Main entry point
//!
//! Loads storage specs and inventories, runs them through the in-memory
//! engine and prints the resulting plan.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ksstorage::cli::{Cli, Commands};
use ksstorage::engine::{ActionLog, DeviceInfo, Inventory, MemoryEngine};
use ksstorage::run_state::{RunStage, RunTracker, StageRecord};
use ksstorage::{execute_storage_tracked, RunContext, StorageSpec};

/// Initialize tracing; `RUST_LOG` overrides the default `info` level
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Plan output for `--json`
#[derive(Serialize)]
struct PlanReport<'a> {
    stages: &'a [StageRecord],
    actions: &'a ActionLog,
    devices: Vec<DeviceInfo>,
    stage1_target: Option<String>,
}

fn main() {
    init_logger();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    let result = match cli.command {
        Commands::Validate { spec } => run_validate(&spec),
        Commands::Plan { spec, inventory, json, offline } => run_plan(&spec, &inventory, json, offline),
        Commands::Stages => {
            for (i, stage) in RunStage::working_stages().iter().enumerate() {
                let note = if stage.is_mandatory() { " (always runs)" } else { "" };
                println!("{:>2}. {}{}", i + 1, stage, note);
            }
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn run_validate(path: &Path) -> Result<()> {
    info!("Validating storage spec: {:?}", path);
    let spec = StorageSpec::load_from_file(path)?;
    spec.validate()?;
    info!("Storage spec validation successful");
    println!("✓ Storage spec is valid: {:?}", path);
    Ok(())
}

fn run_plan(spec_path: &Path, inventory_path: &Path, json: bool, offline: bool) -> Result<()> {
    let spec = StorageSpec::load_from_file(spec_path)?;
    spec.validate()?;
    let inventory = Inventory::load_from_file(inventory_path)?;
    let mut engine = MemoryEngine::from_inventory(inventory).context("Inventory describes an invalid device tree")?;
    let mut ctx = if offline { RunContext::offline() } else { RunContext::default() };
    let mut tracker = RunTracker::new();

    info!("Planning {:?} against {:?}", spec_path, inventory_path);
    if let Err(e) = execute_storage_tracked(&spec, &mut engine, &mut ctx, &mut tracker) {
        let stage = tracker.failed_at().unwrap_or(RunStage::NotStarted);
        return Err(anyhow::Error::new(e).context(format!("Storage run failed during stage: {}", stage)));
    }

    if json {
        let report = PlanReport {
            stages: tracker.history(),
            actions: engine.actions(),
            devices: engine.snapshot(),
            stage1_target: engine
                .stage1_target()
                .and_then(|id| engine.snapshot().into_iter().find(|d| d.id == id))
                .map(|d| d.name),
        };
        let out = serde_json::to_string_pretty(&report).context("Failed to serialize plan to JSON")?;
        println!("{}", out);
        return Ok(());
    }

    for record in tracker.history() {
        println!("{:<32} {:?}", record.stage.to_string(), record.outcome);
    }
    println!();
    println!("{}", engine.actions().summary());
    println!();
    println!("{}", engine.tree_summary());
    Ok(())
}
