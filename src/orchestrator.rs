//! Fixed-order storage run
//!
//! Runs the commands of a `StorageSpec` against an engine in the one order
//! every installation uses:
//!
//! 1. disk filter and clearpart
//! 2. eligible disk check (always runs)
//! 3. bootloader placement intent
//! 4. autopart
//! 5. part, raid, volgroup, logvol, btrfs
//! 6. bootloader setup against the final tree
//!
//! Steps nobody asked for are skipped. The first error stops the run; actions
//! already registered with the engine stay registered.

use tracing::{error, info};

use crate::commands::Command;
use crate::config_file::StorageSpec;
use crate::context::RunContext;
use crate::engine::StorageEngine;
use crate::error::{AtLine, KickstartError, Result};
use crate::run_state::{RunStage, RunTracker, StageOutcome};

/// Commands that make up a stage, in execution order.
pub fn stage_commands(spec: &StorageSpec, stage: RunStage) -> Vec<Command> {
    fn list<T: Clone>(items: &[T], wrap: fn(Vec<T>) -> Command) -> Vec<Command> {
        if items.is_empty() {
            Vec::new()
        } else {
            vec![wrap(items.to_vec())]
        }
    }

    match stage {
        RunStage::ClearingDevices => spec
            .ignoredisk
            .clone()
            .map(Command::IgnoreDisk)
            .into_iter()
            .chain(spec.clearpart.clone().map(Command::ClearPart))
            .collect(),
        RunStage::PlacingBootloader => spec.bootloader.clone().map(Command::Bootloader).into_iter().collect(),
        RunStage::AutoPartitioning => spec.autopart.clone().map(Command::AutoPart).into_iter().collect(),
        RunStage::Partitioning => list(&spec.partitions, Command::Partition),
        RunStage::CreatingRaid => list(&spec.raids, Command::Raid),
        RunStage::CreatingVolumeGroups => list(&spec.volgroups, Command::VolGroup),
        RunStage::CreatingLogicalVolumes => list(&spec.logvols, Command::LogVol),
        RunStage::CreatingBtrfs => list(&spec.btrfs, Command::Btrfs),
        RunStage::NotStarted
        | RunStage::CheckingDisks
        | RunStage::SettingUpBootloader
        | RunStage::Completed
        | RunStage::Failed => Vec::new(),
    }
}

/// Run every stage of `spec` and return the finished tracker.
pub fn execute_storage(
    spec: &StorageSpec,
    engine: &mut dyn StorageEngine,
    ctx: &mut RunContext,
) -> Result<RunTracker> {
    let mut tracker = RunTracker::new();
    execute_storage_tracked(spec, engine, ctx, &mut tracker)?;
    Ok(tracker)
}

/// Same as `execute_storage`, recording progress into a caller-owned tracker
/// so a failed run still tells which stage it stopped at.
pub fn execute_storage_tracked(
    spec: &StorageSpec,
    engine: &mut dyn StorageEngine,
    ctx: &mut RunContext,
    tracker: &mut RunTracker,
) -> Result<()> {
    let result = run_stages(spec, engine, ctx, tracker);
    match result {
        Ok(()) => {
            tracker.complete()?;
            info!(
                "storage run complete: {} stage(s) executed, {} skipped",
                tracker.executed().len(),
                tracker.skipped().len()
            );
            Ok(())
        }
        Err(err) => {
            if !tracker.current_stage().is_terminal() {
                tracker.fail()?;
            }
            error!("storage run failed during {}: {}", tracker.failed_at().unwrap_or(RunStage::NotStarted), err);
            Err(err)
        }
    }
}

fn run_stages(
    spec: &StorageSpec,
    engine: &mut dyn StorageEngine,
    ctx: &mut RunContext,
    tracker: &mut RunTracker,
) -> Result<()> {
    engine.refresh().at_line(0)?;

    for stage in RunStage::working_stages() {
        let stage = *stage;
        match stage {
            RunStage::CheckingDisks => {
                tracker.enter(stage, StageOutcome::Executed)?;
                check_eligible_disks(spec, engine)?;
            }
            RunStage::SettingUpBootloader => match &spec.bootloader {
                Some(request) => {
                    tracker.enter(stage, StageOutcome::Executed)?;
                    engine.set_up_bootloader().at_line(request.line)?;
                }
                None => {
                    tracker.enter(stage, StageOutcome::Skipped)?;
                }
            },
            _ => {
                let commands = stage_commands(spec, stage);
                if commands.is_empty() {
                    tracker.enter(stage, StageOutcome::Skipped)?;
                    continue;
                }
                tracker.enter(stage, StageOutcome::Executed)?;
                for command in &commands {
                    command.execute(engine, ctx)?;
                }
            }
        }
    }
    Ok(())
}

/// Abort unless some disk is visible, unprotected and can carry partitions.
fn check_eligible_disks(spec: &StorageSpec, engine: &dyn StorageEngine) -> Result<()> {
    let eligible = engine
        .disks()
        .into_iter()
        .filter(|id| {
            engine.device(*id).is_some_and(|info| {
                !info.hidden && !info.protected && info.partitionable && (info.partitioned || engine.should_clear(*id))
            })
        })
        .count();
    if eligible == 0 {
        let line = spec.clearpart.as_ref().map(|c| c.line).unwrap_or(0);
        return Err(KickstartError::state(
            line,
            "No usable disks selected for installation. Check ignoredisk and clearpart, \
             and that the disks are writable and labeled.",
        ));
    }
    info!("{} usable disk(s)", eligible);
    Ok(())
}
