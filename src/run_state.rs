//! Run State Machine
//!
//! Tracks which of the fixed storage stages a run has gone through. The
//! orchestrator is the only writer; callers read the finished tracker to see
//! what executed, what was skipped and where a failed run stopped.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! ClearingDevices          (ignoredisk, clearpart)
//!     ↓
//! CheckingDisks            (always executed)
//!     ↓
//! PlacingBootloader
//!     ↓
//! AutoPartitioning
//!     ↓
//! Partitioning → CreatingRaid → CreatingVolumeGroups → CreatingLogicalVolumes → CreatingBtrfs
//!     ↓
//! SettingUpBootloader
//!     ↓
//! Completed
//!
//! (Any non-terminal stage can transition to Failed)
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Run stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunStage {
    NotStarted = 0,

    /// Step 1: disk filter and clearpart policy
    ClearingDevices = 1,

    /// Step 2: at least one eligible disk must remain
    CheckingDisks = 2,

    /// Step 3: bootloader placement intent
    PlacingBootloader = 3,

    /// Step 4: automatic partitioning
    AutoPartitioning = 4,

    /// Step 5: manual requests, one stage per command kind
    Partitioning = 5,
    CreatingRaid = 6,
    CreatingVolumeGroups = 7,
    CreatingLogicalVolumes = 8,
    CreatingBtrfs = 9,

    /// Step 6: bootloader placement against the final tree
    SettingUpBootloader = 10,

    /// Terminal: every stage executed or was skipped
    Completed = 11,

    /// Terminal: a stage failed; see `RunTracker::failed_at`
    Failed = 255,
}

impl RunStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stages that run even when nothing requested them
    #[inline]
    pub const fn is_mandatory(self) -> bool {
        matches!(self, Self::CheckingDisks)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::ClearingDevices),
            Self::ClearingDevices => Some(Self::CheckingDisks),
            Self::CheckingDisks => Some(Self::PlacingBootloader),
            Self::PlacingBootloader => Some(Self::AutoPartitioning),
            Self::AutoPartitioning => Some(Self::Partitioning),
            Self::Partitioning => Some(Self::CreatingRaid),
            Self::CreatingRaid => Some(Self::CreatingVolumeGroups),
            Self::CreatingVolumeGroups => Some(Self::CreatingLogicalVolumes),
            Self::CreatingLogicalVolumes => Some(Self::CreatingBtrfs),
            Self::CreatingBtrfs => Some(Self::SettingUpBootloader),
            Self::SettingUpBootloader => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::ClearingDevices => "Clearing devices",
            Self::CheckingDisks => "Checking for usable disks",
            Self::PlacingBootloader => "Recording bootloader placement",
            Self::AutoPartitioning => "Automatic partitioning",
            Self::Partitioning => "Creating partitions",
            Self::CreatingRaid => "Creating RAID arrays",
            Self::CreatingVolumeGroups => "Creating volume groups",
            Self::CreatingLogicalVolumes => "Creating logical volumes",
            Self::CreatingBtrfs => "Creating BTRFS volumes",
            Self::SettingUpBootloader => "Setting up bootloader",
            Self::Completed => "Storage run complete",
            Self::Failed => "Storage run failed",
        }
    }

    /// All working stages in order (excluding the terminal ones and NotStarted)
    pub const fn working_stages() -> &'static [Self] {
        &[
            Self::ClearingDevices,
            Self::CheckingDisks,
            Self::PlacingBootloader,
            Self::AutoPartitioning,
            Self::Partitioning,
            Self::CreatingRaid,
            Self::CreatingVolumeGroups,
            Self::CreatingLogicalVolumes,
            Self::CreatingBtrfs,
            Self::SettingUpBootloader,
        ]
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// What happened to a stage once it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Executed,
    Skipped,
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("Cannot skip from {from} to {to} (every stage must be entered in order)")]
    SkippedStage { from: RunStage, to: RunStage },

    #[error("Cannot go backwards from {from} to {to} (runs are forward-only)")]
    BackwardTransition { from: RunStage, to: RunStage },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: RunStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: RunStage },

    #[error("Stage {stage} cannot be skipped")]
    MandatoryStage { stage: RunStage },
}

// A transition error means the orchestrator itself is broken; there is no
// script line to blame.
impl From<RunTransitionError> for crate::error::KickstartError {
    fn from(err: RunTransitionError) -> Self {
        crate::error::KickstartError::state(0, err.to_string())
    }
}

/// One entered stage and how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: RunStage,
    pub outcome: StageOutcome,
}

/// Forward-only record of a storage run.
///
/// ```
/// use ksstorage::run_state::{RunStage, RunTracker, StageOutcome};
///
/// let mut tracker = RunTracker::new();
/// tracker.enter(RunStage::ClearingDevices, StageOutcome::Skipped).unwrap();
/// assert_eq!(tracker.current_stage(), RunStage::ClearingDevices);
///
/// // Stages cannot be skipped over
/// assert!(tracker.enter(RunStage::AutoPartitioning, StageOutcome::Executed).is_err());
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct RunTracker {
    current: RunStage,
    failed_at: Option<RunStage>,
    history: Vec<StageRecord>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            current: RunStage::NotStarted,
            failed_at: None,
            history: Vec::with_capacity(RunStage::working_stages().len()),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> RunStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<RunStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == RunStage::Completed
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == RunStage::Failed
    }

    /// Every entered stage in order
    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Outcome of `stage`, or None if the run never reached it
    pub fn outcome(&self, stage: RunStage) -> Option<StageOutcome> {
        self.history.iter().find(|r| r.stage == stage).map(|r| r.outcome)
    }

    pub fn executed(&self) -> Vec<RunStage> {
        self.with_outcome(StageOutcome::Executed)
    }

    pub fn skipped(&self) -> Vec<RunStage> {
        self.with_outcome(StageOutcome::Skipped)
    }

    fn with_outcome(&self, outcome: StageOutcome) -> Vec<RunStage> {
        self.history
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.stage)
            .collect()
    }

    /// Enter `target`, which must be the stage right after the current one.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if the run already completed or failed
    /// - `AlreadyAtStage`, `BackwardTransition`, `SkippedStage` for out-of-order targets
    /// - `MandatoryStage` when skipping a stage that always runs
    pub fn enter(&mut self, target: RunStage, outcome: StageOutcome) -> Result<RunStage, RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(RunTransitionError::AlreadyAtStage { stage: target });
        }
        if target == RunStage::Failed || target == RunStage::Completed {
            return Err(RunTransitionError::SkippedStage { from: self.current, to: target });
        }
        if target.order() < self.current.order() {
            return Err(RunTransitionError::BackwardTransition { from: self.current, to: target });
        }
        if self.current.next() != Some(target) {
            return Err(RunTransitionError::SkippedStage { from: self.current, to: target });
        }
        if outcome == StageOutcome::Skipped && target.is_mandatory() {
            return Err(RunTransitionError::MandatoryStage { stage: target });
        }

        match outcome {
            StageOutcome::Executed => info!("stage: {}", target),
            StageOutcome::Skipped => debug!("stage skipped: {}", target),
        }
        self.history.push(StageRecord { stage: target, outcome });
        self.current = target;
        Ok(target)
    }

    /// Mark the run complete; only valid once the last working stage was entered.
    pub fn complete(&mut self) -> Result<(), RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }
        if self.current.next() != Some(RunStage::Completed) {
            return Err(RunTransitionError::SkippedStage {
                from: self.current,
                to: RunStage::Completed,
            });
        }
        self.current = RunStage::Completed;
        Ok(())
    }

    /// Mark the run as failed at the current stage.
    pub fn fail(&mut self) -> Result<(), RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.current = RunStage::Failed;
        Ok(())
    }
}
