//! Storage command handlers
//!
//! One module per command kind. Every handler validates its request against
//! the current tree, then registers actions through the engine. List commands
//! (`part`, `raid`, `volgroup`, `logvol`, `btrfs`) run their items in
//! declaration order and finish with one global step.

pub mod autopart;
pub mod bootloader;
pub mod btrfs;
pub mod clearpart;
pub mod common;
pub mod logvol;
pub mod partition;
pub mod raid;
pub mod volgroup;

pub use autopart::AutoPartRequest;
pub use bootloader::BootloaderRequest;
pub use btrfs::BtrfsRequest;
pub use clearpart::{ClearPartRequest, IgnoreDiskRequest};
pub use logvol::LogVolRequest;
pub use partition::PartitionRequest;
pub use raid::RaidRequest;
pub use volgroup::VolGroupRequest;

use tracing::debug;

use crate::context::RunContext;
use crate::engine::StorageEngine;
use crate::error::Result;

/// A validated storage command, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    IgnoreDisk(IgnoreDiskRequest),
    ClearPart(ClearPartRequest),
    Bootloader(BootloaderRequest),
    AutoPart(AutoPartRequest),
    Partition(Vec<PartitionRequest>),
    Raid(Vec<RaidRequest>),
    VolGroup(Vec<VolGroupRequest>),
    LogVol(Vec<LogVolRequest>),
    Btrfs(Vec<BtrfsRequest>),
}

impl Command {
    /// Kickstart keyword of the command
    pub fn name(&self) -> &'static str {
        match self {
            Self::IgnoreDisk(_) => "ignoredisk",
            Self::ClearPart(_) => "clearpart",
            Self::Bootloader(_) => "bootloader",
            Self::AutoPart(_) => "autopart",
            Self::Partition(_) => "part",
            Self::Raid(_) => "raid",
            Self::VolGroup(_) => "volgroup",
            Self::LogVol(_) => "logvol",
            Self::Btrfs(_) => "btrfs",
        }
    }

    /// Script line of the command (its last item for list commands)
    pub fn line(&self) -> usize {
        fn last<T>(items: &[T], line: impl Fn(&T) -> usize) -> usize {
            items.last().map(line).unwrap_or(0)
        }
        match self {
            Self::IgnoreDisk(r) => r.line,
            Self::ClearPart(r) => r.line,
            Self::Bootloader(r) => r.line,
            Self::AutoPart(r) => r.line,
            Self::Partition(items) => last(items, |r| r.line),
            Self::Raid(items) => last(items, |r| r.line),
            Self::VolGroup(items) => last(items, |r| r.line),
            Self::LogVol(items) => last(items, |r| r.line),
            Self::Btrfs(items) => last(items, |r| r.line),
        }
    }

    /// Run the command: every item in order, then the finishing step.
    pub fn execute(&self, engine: &mut dyn StorageEngine, ctx: &mut RunContext) -> Result<()> {
        debug!("executing {} (line {})", self.name(), self.line());
        match self {
            Self::IgnoreDisk(req) => clearpart::execute_ignoredisk(engine, req),
            Self::ClearPart(req) => clearpart::execute(engine, req),
            Self::Bootloader(req) => bootloader::execute(engine, req),
            Self::AutoPart(req) => autopart::execute(engine, ctx, req),
            Self::Partition(items) => {
                for req in items {
                    partition::execute(engine, ctx, req)?;
                }
                partition::finalize(engine, self.line())
            }
            Self::Raid(items) => {
                for req in items {
                    raid::execute(engine, ctx, req)?;
                }
                Ok(())
            }
            Self::VolGroup(items) => {
                for req in items {
                    volgroup::execute(engine, ctx, req)?;
                }
                Ok(())
            }
            Self::LogVol(items) => {
                for req in items {
                    logvol::execute(engine, ctx, req)?;
                }
                logvol::finalize(engine, self.line())
            }
            Self::Btrfs(items) => {
                for req in items {
                    btrfs::execute(engine, ctx, req)?;
                }
                Ok(())
            }
        }
    }
}
