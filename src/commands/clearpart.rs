//! `ignoredisk` and `clearpart`: which disks take part in the run and what
//! is wiped from them before anything new is created.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{ClearPartPolicy, DeviceId, DeviceKind, DiskFilter, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::resolve::device_matches;
use crate::types::ClearPartType;

/// One `ignoredisk` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreDiskRequest {
    pub line: usize,
    /// `--drives`: disks to hide
    pub ignore: Vec<String>,
    /// `--only-use`: hide every other disk
    pub only_use: Vec<String>,
}

/// One `clearpart` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearPartRequest {
    pub line: usize,
    #[serde(rename = "type")]
    pub kind: ClearPartType,
    /// `--drives`
    pub drives: Vec<String>,
    /// `--list`
    pub devices: Vec<String>,
    /// `--initlabel`
    pub init_all: bool,
}

fn matching_disks(engine: &dyn StorageEngine, spec: &str) -> Vec<DeviceId> {
    device_matches(engine, spec)
        .into_iter()
        .filter(|id| engine.device(*id).is_some_and(|i| i.kind == DeviceKind::Disk))
        .collect()
}

pub fn execute_ignoredisk(engine: &mut dyn StorageEngine, req: &IgnoreDiskRequest) -> Result<()> {
    let line = req.line;
    if !req.ignore.is_empty() && !req.only_use.is_empty() {
        return Err(KickstartError::validation(
            line,
            "ignoredisk --drives and --only-use cannot be combined",
        ));
    }

    let mut filter = DiskFilter::default();
    for spec in &req.ignore {
        let found = matching_disks(engine, spec);
        if found.is_empty() {
            warn!("line {}: disk {} given to ignoredisk does not exist", line, spec);
        }
        filter.ignored.extend(found);
    }
    for spec in &req.only_use {
        let found = matching_disks(engine, spec);
        if found.is_empty() {
            return Err(KickstartError::reference(
                line,
                format!("Specified nonexistent disk {} in ignoredisk command", spec),
            ));
        }
        filter.only_use.extend(found);
    }
    engine.apply_disk_filter(&filter).at_line(line)
}

pub fn execute(engine: &mut dyn StorageEngine, req: &ClearPartRequest) -> Result<()> {
    let line = req.line;
    let mut policy = ClearPartPolicy {
        kind: req.kind,
        initialize_disks: req.init_all,
        ..ClearPartPolicy::default()
    };

    for spec in &req.drives {
        let found = matching_disks(engine, spec);
        if found.is_empty() {
            return Err(KickstartError::reference(
                line,
                format!("Disk \"{}\" given in clearpart command does not exist.", spec),
            ));
        }
        policy.disks.extend(found);
    }

    for spec in &req.devices {
        let found = device_matches(engine, spec);
        if found.is_empty() {
            return Err(KickstartError::reference(
                line,
                format!("Specified nonexistent device {} in clearpart device list", spec),
            ));
        }
        policy.devices.extend(found);
    }
    if !policy.devices.is_empty() {
        policy.kind = ClearPartType::List;
    }

    info!(
        "line {}: clearing {} (disks: {}, devices: {})",
        line,
        policy.kind,
        policy.disks.len(),
        policy.devices.len()
    );
    engine.clear_partitions(&policy).at_line(line)
}
