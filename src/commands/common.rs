//! Helpers shared by the command handlers: mount point classification,
//! claiming, reuse of existing devices and member resolution.

use tracing::{debug, info};

use crate::context::RunContext;
use crate::engine::{DeviceId, DeviceKind, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::resolve::{normalize_spec, resolve_member};
use crate::types::{FormatType, Placeholder};

/// What a request's mount point field asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountTarget {
    /// Empty, `None` or `none`: formatted but not mounted
    Unmounted,
    Swap,
    /// `biosboot`, `prepboot`, `appleboot`
    Boot(FormatType),
    Placeholder(Placeholder),
    Path(String),
}

impl MountTarget {
    pub fn mountpoint(&self) -> Option<&str> {
        match self {
            Self::Path(path) => Some(path),
            _ => None,
        }
    }
}

/// Classify a mount point; anything that is neither a pseudo mount point
/// nor an absolute path is rejected.
pub fn classify_mountpoint(line: usize, raw: Option<&str>) -> Result<MountTarget> {
    let raw = raw.unwrap_or("").trim();
    let target = match raw {
        "" | "None" | "none" => MountTarget::Unmounted,
        "swap" => MountTarget::Swap,
        "biosboot" => MountTarget::Boot(FormatType::BiosBoot),
        "prepboot" => MountTarget::Boot(FormatType::PrepBoot),
        "appleboot" => MountTarget::Boot(FormatType::AppleBoot),
        path if path.starts_with('/') => MountTarget::Path(path.to_string()),
        other => match Placeholder::parse(other) {
            Some(placeholder) => MountTarget::Placeholder(placeholder),
            None => return Err(invalid_mountpoint(line, other)),
        },
    };
    Ok(target)
}

pub fn invalid_mountpoint(line: usize, mountpoint: &str) -> KickstartError {
    KickstartError::validation(line, format!("The mount point \"{}\" is not valid.", mountpoint))
}

/// Parse a `--fstype` value.
pub fn parse_format_type(line: usize, fstype: &str) -> Result<FormatType> {
    fstype.parse().map_err(|_| {
        KickstartError::validation(line, format!("The \"{}\" filesystem type is not supported.", fstype))
    })
}

/// Format for a mounted or unmounted file system: explicit type, else the
/// boot default for `/boot`, else the engine default.
pub fn filesystem_type(
    engine: &dyn StorageEngine,
    line: usize,
    fstype: Option<&str>,
    mountpoint: Option<&str>,
) -> Result<FormatType> {
    match fstype.filter(|s| !s.is_empty()) {
        Some(fstype) => parse_format_type(line, fstype),
        None if mountpoint == Some("/boot") => Ok(engine.default_boot_fs_type()),
        None => Ok(engine.default_fs_type()),
    }
}

/// Make sure `symbolic` has not been used for a device yet in this run.
pub fn ensure_unregistered(ctx: &RunContext, line: usize, placeholder: &Placeholder) -> Result<()> {
    let name = placeholder.name();
    if ctx.aliases.contains(&name) {
        return Err(KickstartError::validation(
            line,
            format!("{} partition defined multiple times", name),
        ));
    }
    Ok(())
}

/// Give `mountpoint` to a new device by destroying whatever holds it now.
///
/// A holder with dependents is refused, except for an encryption layer over
/// a pending request, which goes away together with that request.
pub fn claim_mountpoint(
    engine: &mut dyn StorageEngine,
    line: usize,
    mountpoint: Option<&str>,
    keep: Option<DeviceId>,
) -> Result<()> {
    let Some(mountpoint) = mountpoint else {
        return Ok(());
    };
    let Some(owner) = engine.mountpoint_owner(mountpoint) else {
        return Ok(());
    };
    if Some(owner) == keep {
        return Ok(());
    }
    let info = engine
        .device(owner)
        .ok_or_else(|| KickstartError::state(line, format!("holder of {} vanished", mountpoint)))?;

    if !engine.children(owner).is_empty() {
        return Err(KickstartError::state(
            line,
            format!(
                "Mount point {} is held by {}, which has dependent devices",
                mountpoint, info.name
            ),
        ));
    }

    info!("mount point {} reclaimed from {}", mountpoint, info.name);
    engine.destroy_device(owner).at_line(line)?;

    // The encryption layer's backing request exists only to carry it
    if info.kind == DeviceKind::Luks {
        for parent in info.parents {
            let pending = engine.device(parent).is_some_and(|p| !p.exists);
            if pending && engine.children(parent).is_empty() {
                debug!("destroying backing request of {}", info.name);
                engine.destroy_device(parent).at_line(line)?;
            }
        }
    }
    Ok(())
}

/// Order of the two resize actions for an existing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStep {
    Format,
    Device,
}

/// Shrinking resizes the contents first; growing resizes the container first.
pub fn resize_order(current_mib: u64, target_mib: u64) -> [ResizeStep; 2] {
    if target_mib < current_mib {
        [ResizeStep::Format, ResizeStep::Device]
    } else {
        [ResizeStep::Device, ResizeStep::Format]
    }
}

fn target_size(line: usize, name: &str, size_mib: Option<u64>) -> Result<u64> {
    match size_mib {
        Some(size) if size > 0 => Ok(size),
        other => Err(KickstartError::validation(
            line,
            format!("Invalid target size ({}) for device {}", other.unwrap_or(0), name),
        )),
    }
}

/// Resize an existing device together with the format it carries.
pub fn resize_existing(
    engine: &mut dyn StorageEngine,
    line: usize,
    id: DeviceId,
    size_mib: Option<u64>,
) -> Result<()> {
    let info = engine
        .device(id)
        .ok_or_else(|| KickstartError::state(line, format!("device {} vanished", id)))?;
    let size = target_size(line, &info.name, size_mib)?;
    for step in resize_order(info.current_size_mib, size) {
        match step {
            ResizeStep::Format => engine.resize_format(id, size),
            ResizeStep::Device => engine.resize_device(id, size),
        }
        .at_line(line)?;
    }
    Ok(())
}

/// Resize only the device; used right before it is reformatted.
pub fn resize_container(
    engine: &mut dyn StorageEngine,
    line: usize,
    id: DeviceId,
    size_mib: Option<u64>,
) -> Result<()> {
    let name = engine.device(id).map(|i| i.name).unwrap_or_default();
    let size = target_size(line, &name, size_mib)?;
    engine.resize_device(id, size).at_line(line)
}

/// Destroy every device stacked on `id` (leaves first), then its format.
pub fn remove_existing_format(engine: &mut dyn StorageEngine, line: usize, id: DeviceId) -> Result<()> {
    let mut stack = engine.children(id);
    let mut order = Vec::new();
    while let Some(dep) = stack.pop() {
        order.push(dep);
        stack.extend(engine.children(dep));
    }
    // Children were pushed after their parents
    for dep in order.into_iter().rev() {
        if engine.device(dep).is_some() {
            debug!("removing dependent {}", dep);
            engine.destroy_device(dep).at_line(line)?;
        }
    }
    engine.destroy_format(id).at_line(line)
}

/// Resolve the member list of a new array, volume group or btrfs volume.
///
/// Members that carry a LUKS format stand for the encryption layer on top of
/// them. `what` names the container in error messages.
pub fn resolve_members(
    engine: &dyn StorageEngine,
    ctx: &RunContext,
    line: usize,
    specs: &[String],
    expected: FormatType,
    what: &str,
) -> Result<Vec<DeviceId>> {
    let mut members = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut found = resolve_member(engine, &ctx.aliases, spec);
        if let Some(id) = found {
            if engine.device(id).is_some_and(|i| i.format.is(FormatType::Luks)) {
                found = engine.children(id).first().copied();
            }
        }
        let Some(id) = found else {
            return Err(KickstartError::reference(
                line,
                format!("Tried to use undefined partition {} in {} specification", spec, what),
            ));
        };
        let format = engine.device(id).and_then(|i| i.format.kind);
        if format != Some(expected) {
            return Err(KickstartError::validation(
                line,
                format!(
                    "{} member {} has incorrect format ({})",
                    what,
                    spec,
                    format.map_or("none".to_string(), |f| f.to_string())
                ),
            ));
        }
        members.push(id);
    }
    Ok(members)
}

/// Existing device named by an `--onpart`-style spec.
pub fn existing_device(engine: &dyn StorageEngine, spec: &str) -> Option<DeviceId> {
    engine.resolve_device(&normalize_spec(spec))
}

/// Percent sizes must lie in (0, 100].
pub fn validate_percent(line: usize, percent: i64) -> Result<u8> {
    match u8::try_from(percent) {
        Ok(percent) if (1..=100).contains(&percent) => Ok(percent),
        _ => Err(KickstartError::validation(line, "Percentage must be between 0 and 100")),
    }
}

/// Fixed logical volume sizes must be given and, unless the volume grows,
/// cover at least one physical extent.
pub fn validate_lv_size(line: usize, size_mib: Option<u64>, grow: bool, pe_size_kib: u64) -> Result<u64> {
    let size = match size_mib {
        Some(size) if size > 0 => size,
        _ => return Err(KickstartError::validation(line, "Size required")),
    };
    if !grow && size < pe_size_kib.div_ceil(1024) {
        return Err(KickstartError::validation(
            line,
            "Logical volume size must be larger than the volume group physical extent size.",
        ));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DeviceRequest, Format, Inventory, InventoryDisk, InventoryPartition, MemoryEngine};
    use crate::error::ErrorKind;

    fn engine() -> MemoryEngine {
        let inventory = Inventory {
            disks: vec![InventoryDisk {
                name: "sda".to_string(),
                size_mib: 40_000,
                partitioned: true,
                read_only: false,
                protected: false,
                partitions: vec![InventoryPartition {
                    name: "sda1".to_string(),
                    size_mib: 2000,
                    format: Some(FormatType::Ext4),
                    label: None,
                    uuid: None,
                    partuuid: None,
                    partlabel: None,
                }],
            }],
            ..Inventory::default()
        };
        let mut engine = MemoryEngine::from_inventory(inventory).expect("inventory"); // test: known-good input
        engine.refresh().expect("refresh"); // test: known-good input
        engine
    }

    fn partition(format: Format) -> DeviceRequest {
        DeviceRequest::Partition {
            req_name: None,
            format,
            size_mib: Some(1000),
            grow: false,
            max_size_mib: None,
            primary: false,
            disks: Vec::new(),
        }
    }

    #[test]
    fn test_classify_mountpoint() {
        assert_eq!(classify_mountpoint(1, Some("swap")).expect("swap"), MountTarget::Swap);
        assert_eq!(classify_mountpoint(1, Some("None")).expect("none"), MountTarget::Unmounted);
        assert_eq!(classify_mountpoint(1, None).expect("absent"), MountTarget::Unmounted);
        assert_eq!(
            classify_mountpoint(1, Some("biosboot")).expect("biosboot"),
            MountTarget::Boot(FormatType::BiosBoot)
        );
        assert!(matches!(
            classify_mountpoint(1, Some("pv.01")).expect("pv"),
            MountTarget::Placeholder(_)
        ));
        assert_eq!(
            classify_mountpoint(1, Some("/home")).expect("path").mountpoint(),
            Some("/home")
        );
        let err = classify_mountpoint(3, Some("home")).expect_err("relative");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "line 3: The mount point \"home\" is not valid.");
    }

    #[test]
    fn test_unsupported_fstype() {
        let err = parse_format_type(2, "reiserfs").expect_err("unsupported");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(parse_format_type(2, "ext4").ok(), Some(FormatType::Ext4));
    }

    #[test]
    fn test_resize_order() {
        assert_eq!(resize_order(2000, 1000), [ResizeStep::Format, ResizeStep::Device]);
        assert_eq!(resize_order(1000, 2000), [ResizeStep::Device, ResizeStep::Format]);
        assert_eq!(resize_order(1000, 1000), [ResizeStep::Device, ResizeStep::Format]);
    }

    #[test]
    fn test_percent_bounds() {
        assert!(validate_percent(1, 0).is_err());
        assert!(validate_percent(1, 101).is_err());
        assert!(validate_percent(1, -5).is_err());
        assert!(validate_percent(1, 356).is_err());
        assert_eq!(validate_percent(1, 1).ok(), Some(1));
        assert_eq!(validate_percent(1, 100).ok(), Some(100));
    }

    #[test]
    fn test_lv_size_needs_one_extent() {
        assert_eq!(validate_lv_size(1, None, false, 4096).map_err(|e| e.kind()), Err(ErrorKind::Validation));
        assert!(validate_lv_size(1, Some(2), false, 4096).is_err());
        assert_eq!(validate_lv_size(1, Some(2), true, 4096).ok(), Some(2));
        assert_eq!(validate_lv_size(1, Some(4), false, 4096).ok(), Some(4));
        assert!(validate_lv_size(1, Some(4), false, 4097).is_err());
        assert_eq!(validate_lv_size(1, Some(5), false, 4097).ok(), Some(5));
    }

    #[test]
    fn test_lv_size_huge_value_does_not_overflow() {
        let huge = u64::MAX / 512;
        assert_eq!(validate_lv_size(1, Some(huge), false, 4096).ok(), Some(huge));
        assert_eq!(validate_lv_size(1, Some(u64::MAX), false, 16 * 1024 * 1024).ok(), Some(u64::MAX));
    }

    #[test]
    fn test_claim_destroys_prior_holder() {
        let mut engine = engine();
        let old = engine
            .create_device(partition(Format::new(FormatType::Xfs).with_mountpoint("/data")))
            .expect("old");
        claim_mountpoint(&mut engine, 4, Some("/data"), None).expect("claim");
        assert!(engine.device(old).is_none());
        claim_mountpoint(&mut engine, 5, Some("/data"), None).expect("unclaimed is fine");
    }

    #[test]
    fn test_claim_with_dependents_fails_closed() {
        let mut engine = engine();
        let sda1 = engine.device_by_name("sda1").expect("sda1");
        engine
            .set_mount(sda1, Some("/srv".to_string()), None)
            .expect("mount");
        engine
            .create_device(DeviceRequest::Luks { parent: sda1, format: Format::new(FormatType::Xfs) })
            .expect("layer");
        let err = claim_mountpoint(&mut engine, 6, Some("/srv"), None).expect_err("has dependents");
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(engine.device(sda1).is_some());
    }

    #[test]
    fn test_claim_removes_luks_with_pending_backing() {
        let mut engine = engine();
        let backing = engine
            .create_device(partition(Format::new(FormatType::Luks)))
            .expect("backing");
        let layer = engine
            .create_device(DeviceRequest::Luks {
                parent: backing,
                format: Format::new(FormatType::Xfs).with_mountpoint("/home"),
            })
            .expect("layer");
        claim_mountpoint(&mut engine, 7, Some("/home"), None).expect("claim");
        assert!(engine.device(layer).is_none());
        assert!(engine.device(backing).is_none());
    }

    #[test]
    fn test_remove_existing_format_destroys_dependents() {
        let mut engine = engine();
        let sda1 = engine.device_by_name("sda1").expect("sda1");
        let layer = engine
            .create_device(DeviceRequest::Luks { parent: sda1, format: Format::new(FormatType::Xfs) })
            .expect("layer");
        remove_existing_format(&mut engine, 3, sda1).expect("remove");
        assert!(engine.device(layer).is_none());
        assert_eq!(engine.device(sda1).expect("sda1").format.kind, None);
    }

    #[test]
    fn test_resolve_members_checks_format() {
        let engine = engine();
        let ctx = RunContext::offline();
        let err = resolve_members(&engine, &ctx, 9, &["sda1".to_string()], FormatType::LvmPv, "Volume Group")
            .expect_err("ext4 is not a PV");
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = resolve_members(&engine, &ctx, 9, &["pv.09".to_string()], FormatType::LvmPv, "Volume Group")
            .expect_err("undefined");
        assert_eq!(err.kind(), ErrorKind::Reference);
    }
}
