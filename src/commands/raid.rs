//! `raid`: software RAID arrays over member partitions.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::common::{
    claim_mountpoint, classify_mountpoint, ensure_unregistered, filesystem_type, invalid_mountpoint,
    remove_existing_format, resolve_members, MountTarget,
};
use crate::context::RunContext;
use crate::encryption::{wrap, EncryptionRequest};
use crate::engine::{DeviceKind, DeviceRequest, Format, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::types::{FormatType, Placeholder, PlaceholderKind, RaidLevel};

/// One `raid` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidRequest {
    pub line: usize,
    pub mountpoint: Option<String>,
    /// `--device`: array name
    pub device: Option<String>,
    pub level: Option<RaidLevel>,
    /// Member partitions, usually `raid.<label>` placeholders
    pub members: Vec<String>,
    pub spares: usize,
    pub fstype: Option<String>,
    pub format: bool,
    /// `--useexisting`
    pub preexist: bool,
    pub label: Option<String>,
    pub mount_options: Option<String>,
    pub fs_profile: Option<String>,
    pub encryption: Option<EncryptionRequest>,
}

impl Default for RaidRequest {
    fn default() -> Self {
        Self {
            line: 0,
            mountpoint: None,
            device: None,
            level: None,
            members: Vec::new(),
            spares: 0,
            fstype: None,
            format: true,
            preexist: false,
            label: None,
            mount_options: None,
            fs_profile: None,
            encryption: None,
        }
    }
}

pub fn execute(engine: &mut dyn StorageEngine, ctx: &mut RunContext, req: &RaidRequest) -> Result<()> {
    let line = req.line;
    let mut placeholder: Option<Placeholder> = None;
    let mut mountpoint = None;

    let kind = match classify_mountpoint(line, req.mountpoint.as_deref())? {
        MountTarget::Swap => FormatType::Swap,
        MountTarget::Placeholder(p) if p.kind != PlaceholderKind::Raid => {
            ensure_unregistered(ctx, line, &p)?;
            let kind = p.kind.member_format();
            placeholder = Some(p);
            kind
        }
        MountTarget::Placeholder(p) => return Err(invalid_mountpoint(line, &p.name())),
        MountTarget::Boot(kind) => return Err(invalid_mountpoint(line, &kind.to_string())),
        MountTarget::Unmounted => filesystem_type(engine, line, req.fstype.as_deref(), None)?,
        MountTarget::Path(path) => {
            let kind = filesystem_type(engine, line, req.fstype.as_deref(), Some(&path))?;
            mountpoint = Some(path);
            kind
        }
    };

    if !req.format {
        let name = req
            .device
            .as_deref()
            .ok_or_else(|| KickstartError::validation(line, "--noformat used without --device"))?;
        let device = engine.device_by_name(name).ok_or_else(|| {
            KickstartError::reference(
                line,
                format!("No preexisting RAID device with the name \"{}\" was found.", name),
            )
        })?;
        claim_mountpoint(engine, line, mountpoint.as_deref(), Some(device))?;
        engine.set_mount(device, mountpoint, req.mount_options.clone()).at_line(line)?;
        return Ok(());
    }

    let members = resolve_members(engine, ctx, line, &req.members, FormatType::MdMember, "RAID")?;

    let format = Format {
        kind: Some(kind),
        mountpoint: mountpoint.clone(),
        mount_options: req.mount_options.clone(),
        label: req.label.clone(),
        fs_profile: req.fs_profile.clone(),
        luks: None,
    };

    let device = if req.preexist {
        let name = req
            .device
            .as_deref()
            .ok_or_else(|| KickstartError::validation(line, "--useexisting used without --device"))?;
        let device = engine
            .device_by_name(name)
            .filter(|id| engine.device(*id).is_some_and(|i| i.kind == DeviceKind::MdArray))
            .ok_or_else(|| {
                KickstartError::reference(line, format!("Specified nonexistent RAID {} in raid command", name))
            })?;
        remove_existing_format(engine, line, device)?;
        claim_mountpoint(engine, line, mountpoint.as_deref(), Some(device))?;
        if req.encryption.is_none() {
            engine.create_format(device, format.clone()).at_line(line)?;
        }
        device
    } else {
        let level = req
            .level
            .ok_or_else(|| KickstartError::validation(line, "RAID level is required"))?;
        let member_devices = members.len().checked_sub(req.spares).ok_or_else(|| {
            KickstartError::validation(
                line,
                format!("RAID has {} spares but only {} members", req.spares, members.len()),
            )
        })?;
        if member_devices < level.min_members() {
            return Err(KickstartError::validation(
                line,
                format!(
                    "RAID level {} requires at least {} members, got {}",
                    level,
                    level.min_members(),
                    member_devices
                ),
            ));
        }
        if let Some(name) = req.device.as_deref() {
            let taken = engine
                .device_by_name(name)
                .is_some_and(|id| engine.device(id).is_some_and(|i| i.kind == DeviceKind::MdArray));
            if taken {
                return Err(KickstartError::validation(
                    line,
                    format!("The Software RAID array name \"{}\" is already in use.", name),
                ));
            }
        }
        claim_mountpoint(engine, line, mountpoint.as_deref(), None)?;
        let total_devices = members.len();
        let device = engine
            .create_device(DeviceRequest::MdArray {
                name: req.device.clone(),
                level,
                members,
                member_devices,
                total_devices,
                format: format.clone(),
            })
            .at_line(line)?;
        info!("line {}: new {} array", line, level);
        device
    };

    if let Some(p) = &placeholder {
        let name = engine.device(device).map(|i| i.name).unwrap_or_default();
        ctx.aliases.register(line, &p.name(), &name)?;
    }

    if let Some(encryption) = &req.encryption {
        wrap(engine, ctx, device, format, encryption, line)?;
    }
    Ok(())
}
