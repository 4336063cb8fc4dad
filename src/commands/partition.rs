//! `part` / `partition`: partition requests, reuse of existing partitions
//! and tmpfs mounts.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::common::{
    claim_mountpoint, classify_mountpoint, ensure_unregistered, existing_device, filesystem_type,
    remove_existing_format, resize_container, resize_existing, MountTarget,
};
use crate::context::RunContext;
use crate::encryption::{wrap, EncryptionRequest};
use crate::engine::{DeviceId, DeviceKind, DeviceRequest, Format, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::resolve::normalize_spec;
use crate::sizing::swap_suggestion;
use crate::types::{FormatType, Placeholder};

/// One `part` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionRequest {
    pub line: usize,
    pub mountpoint: Option<String>,
    pub fstype: Option<String>,
    /// MiB
    pub size: Option<u64>,
    pub grow: bool,
    pub max_size: Option<u64>,
    /// Swap only: size from the memory-based suggestion
    pub recommended: bool,
    pub hibernation: bool,
    /// `--ondisk`
    pub disk: Option<String>,
    /// `--onbiosdisk`, hex BIOS disk number
    pub onbiosdisk: Option<String>,
    /// `--onpart`: reuse an existing partition
    pub onpart: Option<String>,
    /// false: `--noformat`, mount the existing contents
    pub format: bool,
    pub primary: bool,
    pub label: Option<String>,
    pub mount_options: Option<String>,
    pub fs_profile: Option<String>,
    pub resize: bool,
    pub encryption: Option<EncryptionRequest>,
}

impl Default for PartitionRequest {
    fn default() -> Self {
        Self {
            line: 0,
            mountpoint: None,
            fstype: None,
            size: None,
            grow: false,
            max_size: None,
            recommended: false,
            hibernation: false,
            disk: None,
            onbiosdisk: None,
            onpart: None,
            format: true,
            primary: false,
            label: None,
            mount_options: None,
            fs_profile: None,
            resize: false,
            encryption: None,
        }
    }
}

/// Format and naming decided from the mount point field.
struct Plan {
    kind: FormatType,
    mountpoint: Option<String>,
    mount_options: Option<String>,
    placeholder: Option<Placeholder>,
    size: Option<u64>,
    grow: bool,
}

fn plan(engine: &dyn StorageEngine, ctx: &RunContext, req: &PartitionRequest) -> Result<Plan> {
    let line = req.line;
    let mut size = req.size;
    let mut grow = req.grow;
    let mut placeholder = None;
    let mut mountpoint = None;

    let kind = match classify_mountpoint(line, req.mountpoint.as_deref())? {
        MountTarget::Swap => {
            if req.recommended || req.hibernation {
                let space = Some(engine.usable_disk_space_mib());
                size = Some(swap_suggestion(engine.total_memory_mib(), space, req.hibernation));
                grow = false;
                debug!("line {}: suggested swap size {:?} MiB", line, size);
            }
            FormatType::Swap
        }
        MountTarget::Unmounted => filesystem_type(engine, line, req.fstype.as_deref(), None)?,
        MountTarget::Boot(kind) => kind,
        MountTarget::Placeholder(p) => {
            ensure_unregistered(ctx, line, &p)?;
            let kind = p.kind.member_format();
            placeholder = Some(p);
            kind
        }
        MountTarget::Path(path) => {
            let kind = if path == "/boot/efi" {
                FormatType::Efi
            } else {
                filesystem_type(engine, line, req.fstype.as_deref(), Some(&path))?
            };
            mountpoint = Some(path);
            kind
        }
    };

    let mount_options = kind
        .default_mount_options()
        .map(str::to_string)
        .or_else(|| req.mount_options.clone());

    Ok(Plan { kind, mountpoint, mount_options, placeholder, size, grow })
}

/// Target disk from `--ondisk` / `--onbiosdisk`, checked for usability.
fn target_disk(engine: &dyn StorageEngine, req: &PartitionRequest) -> Result<Option<DeviceId>> {
    let line = req.line;
    let disk = if let Some(bios) = &req.onbiosdisk {
        Some(engine.bios_disk(bios).ok_or_else(|| {
            KickstartError::reference(line, format!("Specified BIOS disk {} cannot be determined", bios))
        })?)
    } else if let Some(spec) = &req.disk {
        let id = engine
            .resolve_device(&normalize_spec(spec))
            .filter(|id| engine.device(*id).is_some_and(|i| i.kind == DeviceKind::Disk))
            .ok_or_else(|| {
                KickstartError::reference(
                    line,
                    format!("Specified nonexistent disk {} in partition command", spec),
                )
            })?;
        Some(id)
    } else {
        None
    };

    if let Some(id) = disk {
        let info = engine
            .device(id)
            .ok_or_else(|| KickstartError::state(line, format!("disk {} vanished", id)))?;
        if !info.partitionable {
            return Err(KickstartError::state(
                line,
                format!("Cannot install to read-only media {}.", info.name),
            ));
        }
        if !info.partitioned && !engine.should_clear(id) {
            return Err(KickstartError::state(
                line,
                format!("Specified unpartitioned disk {} in partition command", info.name),
            ));
        }
    }
    Ok(disk)
}

fn register_placeholder(
    engine: &dyn StorageEngine,
    ctx: &mut RunContext,
    line: usize,
    placeholder: Option<&Placeholder>,
    device: DeviceId,
) -> Result<()> {
    if let Some(p) = placeholder {
        let name = engine.device(device).map(|i| i.name).unwrap_or_default();
        ctx.aliases.register(line, &p.name(), &name)?;
    }
    Ok(())
}

/// Execute one partition request.
pub fn execute(engine: &mut dyn StorageEngine, ctx: &mut RunContext, req: &PartitionRequest) -> Result<()> {
    let line = req.line;
    let plan = plan(engine, ctx, req)?;

    if !req.format {
        let spec = req
            .onpart
            .as_deref()
            .ok_or_else(|| KickstartError::validation(line, "--noformat used without --onpart"))?;
        let device = existing_device(engine, spec).ok_or_else(|| {
            KickstartError::reference(
                line,
                format!("No preexisting partition with the name \"{}\" was found.", spec),
            )
        })?;
        if req.resize {
            resize_existing(engine, line, device, plan.size)?;
        }
        register_placeholder(engine, ctx, line, plan.placeholder.as_ref(), device)?;
        claim_mountpoint(engine, line, plan.mountpoint.as_deref(), Some(device))?;
        engine.set_mount(device, plan.mountpoint, plan.mount_options).at_line(line)?;
        return Ok(());
    }

    let disk = target_disk(engine, req)?;
    let format = Format {
        kind: Some(plan.kind),
        mountpoint: plan.mountpoint.clone(),
        mount_options: plan.mount_options.clone(),
        label: req.label.clone(),
        fs_profile: req.fs_profile.clone(),
        luks: None,
    };

    let device = if let Some(spec) = &req.onpart {
        let device = existing_device(engine, spec).ok_or_else(|| {
            KickstartError::reference(
                line,
                format!("Specified nonexistent partition {} in partition command", spec),
            )
        })?;
        remove_existing_format(engine, line, device)?;
        if req.resize {
            resize_container(engine, line, device, plan.size)?;
        }
        claim_mountpoint(engine, line, plan.mountpoint.as_deref(), Some(device))?;
        if req.encryption.is_none() {
            engine.create_format(device, format.clone()).at_line(line)?;
        }
        info!("line {}: reusing {} as {}", line, spec, plan.kind);
        device
    } else if plan.kind == FormatType::Tmpfs {
        claim_mountpoint(engine, line, plan.mountpoint.as_deref(), None)?;
        engine
            .create_device(DeviceRequest::Tmpfs { format: format.clone(), size_mib: plan.size })
            .at_line(line)?
    } else {
        claim_mountpoint(engine, line, plan.mountpoint.as_deref(), None)?;
        engine
            .create_device(DeviceRequest::Partition {
                req_name: plan.placeholder.as_ref().map(Placeholder::name),
                format: format.clone(),
                size_mib: plan.size,
                grow: plan.grow,
                max_size_mib: req.max_size,
                primary: req.primary,
                disks: disk.into_iter().collect(),
            })
            .at_line(line)?
    };

    register_placeholder(engine, ctx, line, plan.placeholder.as_ref(), device)?;

    if let Some(encryption) = &req.encryption {
        wrap(engine, ctx, device, format, encryption, line)?;
    }
    Ok(())
}

/// Layout solve and sanity check after the last partition request.
pub fn finalize(engine: &mut dyn StorageEngine, line: usize) -> Result<()> {
    engine.do_partitioning().at_line(line)?;
    let warnings = engine.sanity_check().at_line(line)?;
    for warning in warnings {
        tracing::warn!("{}", warning);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Inventory, InventoryDisk, InventoryPartition, MemoryEngine, StorageAction};
    use crate::error::ErrorKind;
    use crate::types::EFI_MOUNT_OPTIONS;

    fn engine() -> MemoryEngine {
        let inventory = Inventory {
            disks: vec![
                InventoryDisk {
                    name: "sda".to_string(),
                    size_mib: 40_000,
                    partitioned: true,
                    read_only: false,
                    protected: false,
                    partitions: vec![InventoryPartition {
                        name: "sda1".to_string(),
                        size_mib: 4000,
                        format: Some(FormatType::Ext4),
                        label: None,
                        uuid: None,
                        partuuid: None,
                        partlabel: None,
                    }],
                },
                InventoryDisk {
                    name: "sdb".to_string(),
                    size_mib: 8000,
                    partitioned: true,
                    read_only: true,
                    protected: false,
                    partitions: Vec::new(),
                },
                InventoryDisk {
                    name: "sdc".to_string(),
                    size_mib: 8000,
                    partitioned: false,
                    read_only: false,
                    protected: false,
                    partitions: Vec::new(),
                },
            ],
            memory_mib: 4096,
            ..Inventory::default()
        };
        let mut engine = MemoryEngine::from_inventory(inventory).expect("inventory"); // test: known-good input
        engine.refresh().expect("refresh"); // test: known-good input
        engine
    }

    fn part(line: usize, mountpoint: &str) -> PartitionRequest {
        PartitionRequest {
            line,
            mountpoint: Some(mountpoint.to_string()),
            size: Some(1000),
            ..PartitionRequest::default()
        }
    }

    #[test]
    fn test_new_partition_takes_mountpoint() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        execute(&mut engine, &mut ctx, &part(1, "/home")).expect("partition");
        let owner = engine.mountpoint_owner("/home").expect("owner");
        let info = engine.device(owner).expect("info");
        assert_eq!(info.kind, DeviceKind::Partition);
        assert!(info.format.is(FormatType::Xfs));
    }

    #[test]
    fn test_relative_mountpoint_rejected() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let err = execute(&mut engine, &mut ctx, &part(2, "home")).expect_err("relative");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn test_efi_gets_fixed_mount_options() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest {
            mount_options: Some("ro".to_string()),
            ..part(3, "/boot/efi")
        };
        execute(&mut engine, &mut ctx, &req).expect("esp");
        let esp = engine.mountpoint_owner("/boot/efi").expect("esp");
        let format = engine.device(esp).expect("info").format;
        assert!(format.is(FormatType::Efi));
        assert_eq!(format.mount_options.as_deref(), Some(EFI_MOUNT_OPTIONS));
    }

    #[test]
    fn test_recommended_swap_size() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest {
            recommended: true,
            grow: true,
            size: None,
            ..part(4, "swap")
        };
        execute(&mut engine, &mut ctx, &req).expect("swap");
        let swap = engine
            .devices()
            .into_iter()
            .filter_map(|id| engine.device(id))
            .find(|i| i.format.is(FormatType::Swap))
            .expect("swap device");
        assert_eq!(swap.size_mib, 4096);
        assert_eq!(swap.format.mountpoint, None);
    }

    #[test]
    fn test_placeholder_registers_alias_once() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        execute(&mut engine, &mut ctx, &part(5, "pv.01")).expect("first");
        let concrete = ctx.aliases.get("pv.01").expect("alias").to_string();
        let id = engine.device_by_name(&concrete).expect("registered device");
        assert!(engine.device(id).expect("info").format.is(FormatType::LvmPv));

        let err = execute(&mut engine, &mut ctx, &part(6, "pv.01")).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.line(), 6);
    }

    #[test]
    fn test_noformat_requires_onpart() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest { format: false, ..part(7, "/srv") };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("no onpart");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let req = PartitionRequest {
            format: false,
            onpart: Some("sdz9".to_string()),
            ..part(8, "/srv")
        };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("missing device");
        assert_eq!(err.kind(), ErrorKind::Reference);
    }

    #[test]
    fn test_noformat_shrink_orders_format_first() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest {
            format: false,
            onpart: Some("sda1".to_string()),
            resize: true,
            size: Some(3000),
            ..part(9, "/srv")
        };
        execute(&mut engine, &mut ctx, &req).expect("noformat");
        let sda1 = engine.device_by_name("sda1").expect("sda1");
        let kinds: Vec<bool> = engine
            .actions()
            .for_device(sda1)
            .into_iter()
            .map(|a| matches!(a, StorageAction::ResizeFormat { .. }))
            .collect();
        assert_eq!(kinds, vec![true, false]);
        assert_eq!(engine.mountpoint_owner("/srv"), Some(sda1));
    }

    #[test]
    fn test_onpart_reformats_existing() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest {
            onpart: Some("/dev/sda1".to_string()),
            fstype: Some("ext4".to_string()),
            ..part(10, "/var")
        };
        execute(&mut engine, &mut ctx, &req).expect("onpart");
        let sda1 = engine.device_by_name("sda1").expect("sda1");
        let actions = engine.actions().for_device(sda1);
        assert!(matches!(actions.first(), Some(StorageAction::DestroyFormat { .. })));
        assert!(matches!(actions.last(), Some(StorageAction::CreateFormat { .. })));
        assert_eq!(engine.mountpoint_owner("/var"), Some(sda1));
    }

    #[test]
    fn test_disk_checks() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest { disk: Some("sdb".to_string()), ..part(11, "/a") };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("read-only");
        assert_eq!(err.kind(), ErrorKind::State);

        let req = PartitionRequest { disk: Some("sdc".to_string()), ..part(12, "/b") };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("unpartitioned");
        assert_eq!(err.kind(), ErrorKind::State);

        let req = PartitionRequest { disk: Some("sdq".to_string()), ..part(13, "/c") };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Reference);

        let req = PartitionRequest { onbiosdisk: Some("80".to_string()), ..part(14, "/d") };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("no edd data");
        assert_eq!(err.kind(), ErrorKind::Reference);
    }

    #[test]
    fn test_unsupported_fstype() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest { fstype: Some("reiser4".to_string()), ..part(15, "/opt") };
        let err = execute(&mut engine, &mut ctx, &req).expect_err("fstype");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_tmpfs_is_not_a_partition() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        let req = PartitionRequest { fstype: Some("tmpfs".to_string()), ..part(16, "/tmp") };
        execute(&mut engine, &mut ctx, &req).expect("tmpfs");
        let owner = engine.mountpoint_owner("/tmp").expect("owner");
        assert_eq!(engine.device(owner).expect("info").kind, DeviceKind::Tmpfs);
    }

    #[test]
    fn test_finalize_allocates() {
        let mut engine = engine();
        let mut ctx = RunContext::offline();
        execute(&mut engine, &mut ctx, &part(1, "/")).expect("root");
        finalize(&mut engine, 1).expect("finalize");
        let root = engine.mountpoint_owner("/").expect("root");
        assert_eq!(engine.device(root).expect("info").name, "sda2");
    }
}
