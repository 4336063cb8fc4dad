//! `bootloader`: records where the first stage should go. Placement itself
//! happens once the final tree exists.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{BootPassword, BootloaderPlacement, DeviceId, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::resolve::device_matches;
use crate::types::Stage1Location;

/// One `bootloader` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootloaderRequest {
    pub line: usize,
    pub location: Stage1Location,
    /// `--append`: kernel arguments, whitespace separated
    pub append: Option<String>,
    pub password: Option<String>,
    /// `--iscrypted`
    pub is_crypted: bool,
    pub timeout: Option<u32>,
    pub drive_order: Vec<String>,
    pub boot_drive: Option<String>,
    pub leave_boot_order: bool,
}

/// Disks the bootloader may be installed to.
fn usable_disks(engine: &dyn StorageEngine) -> Vec<DeviceId> {
    engine
        .disks()
        .into_iter()
        .filter(|id| engine.device(*id).is_some_and(|i| !i.hidden && !i.protected))
        .collect()
}

pub fn execute(engine: &mut dyn StorageEngine, req: &BootloaderRequest) -> Result<()> {
    let line = req.line;

    if req.location == Stage1Location::None {
        info!("line {}: bootloader installation disabled", line);
        let placement = BootloaderPlacement { skip: true, ..BootloaderPlacement::default() };
        return engine.configure_bootloader(placement).at_line(line);
    }

    let usable = usable_disks(engine);
    let usable_set: BTreeSet<DeviceId> = usable.iter().copied().collect();

    let mut disk_order = Vec::new();
    for drive in &req.drive_order {
        let matches = device_matches(engine, drive);
        let mut hits = matches.intersection(&usable_set).copied().peekable();
        if hits.peek().is_none() {
            warn!(
                "line {}: requested drive {} in boot drive order doesn't exist or cannot be used",
                line, drive
            );
            continue;
        }
        for hit in hits {
            if !disk_order.contains(&hit) {
                disk_order.push(hit);
            }
        }
    }

    let stage1_disk = match &req.boot_drive {
        Some(spec) => {
            let matches = device_matches(engine, spec);
            if matches.len() > 1 {
                return Err(KickstartError::reference(
                    line,
                    format!("Too many values provided for boot drive: {}", spec),
                ));
            }
            let disk = matches.into_iter().find(|id| usable_set.contains(id)).ok_or_else(|| {
                KickstartError::reference(
                    line,
                    format!("Requested boot drive {} doesn't exist or cannot be used", spec),
                )
            })?;
            Some(disk)
        }
        None => disk_order.first().copied().or_else(|| usable.first().copied()),
    };

    let password = req.password.clone().map(|p| {
        if req.is_crypted {
            BootPassword::Crypted(p)
        } else {
            BootPassword::Plain(p)
        }
    });

    let placement = BootloaderPlacement {
        skip: false,
        stage1_location: Some(req.location),
        boot_args: req
            .append
            .as_deref()
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        password,
        timeout: req.timeout,
        disk_order,
        stage1_disk,
        leave_boot_order: req.leave_boot_order,
    };
    info!("line {}: bootloader placement recorded ({})", line, req.location);
    engine.configure_bootloader(placement).at_line(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Inventory, InventoryDisk, MemoryEngine};
    use crate::error::ErrorKind;

    fn engine() -> MemoryEngine {
        let disk = |name: &str, protected: bool| InventoryDisk {
            name: name.to_string(),
            size_mib: 20_000,
            partitioned: true,
            read_only: false,
            protected,
            partitions: Vec::new(),
        };
        let inventory = Inventory {
            disks: vec![disk("sda", false), disk("sdb", false), disk("sdc", true)],
            ..Inventory::default()
        };
        let mut engine = MemoryEngine::from_inventory(inventory).expect("inventory"); // test: known-good input
        engine.refresh().expect("refresh"); // test: known-good input
        engine
    }

    #[test]
    fn test_drive_order_drops_unusable_entries() {
        let mut engine = engine();
        let req = BootloaderRequest {
            line: 1,
            drive_order: vec!["sdz".to_string(), "sdb".to_string(), "sdc".to_string(), "sda".to_string()],
            append: Some("quiet  rhgb".to_string()),
            ..BootloaderRequest::default()
        };
        execute(&mut engine, &req).expect("bootloader");
        let placement = engine.bootloader().expect("placement");
        let sda = engine.device_by_name("sda").expect("sda");
        let sdb = engine.device_by_name("sdb").expect("sdb");
        assert_eq!(placement.disk_order, vec![sdb, sda]);
        assert_eq!(placement.stage1_disk, Some(sdb));
        assert_eq!(placement.boot_args, vec!["quiet".to_string(), "rhgb".to_string()]);
    }

    #[test]
    fn test_boot_drive_checks() {
        let mut engine = engine();
        let req = BootloaderRequest { line: 2, boot_drive: Some("sd?".to_string()), ..BootloaderRequest::default() };
        let err = execute(&mut engine, &req).expect_err("glob matches three disks");
        assert_eq!(err.kind(), ErrorKind::Reference);

        let req = BootloaderRequest { line: 3, boot_drive: Some("sdc".to_string()), ..BootloaderRequest::default() };
        let err = execute(&mut engine, &req).expect_err("protected disk");
        assert_eq!(err.kind(), ErrorKind::Reference);
        assert_eq!(err.line(), 3);
    }

    #[test]
    fn test_default_boot_drive_is_first_usable() {
        let mut engine = engine();
        let req = BootloaderRequest {
            line: 4,
            password: Some("$6$hash".to_string()),
            is_crypted: true,
            timeout: Some(5),
            ..BootloaderRequest::default()
        };
        execute(&mut engine, &req).expect("bootloader");
        let placement = engine.bootloader().expect("placement");
        assert_eq!(placement.stage1_disk, engine.device_by_name("sda"));
        assert_eq!(placement.password, Some(BootPassword::Crypted("$6$hash".to_string())));
        assert_eq!(placement.timeout, Some(5));
    }

    #[test]
    fn test_location_none_skips() {
        let mut engine = engine();
        let req = BootloaderRequest { line: 5, location: Stage1Location::None, ..BootloaderRequest::default() };
        execute(&mut engine, &req).expect("skip");
        assert!(engine.bootloader().expect("placement").skip);
    }
}
