//! `btrfs`: multi-device btrfs volumes and their subvolumes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::common::{claim_mountpoint, classify_mountpoint, existing_device, invalid_mountpoint, resolve_members, MountTarget};
use crate::context::RunContext;
use crate::engine::{DeviceRequest, Format, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::types::{BtrfsLevel, FormatType};

/// One `btrfs` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrfsRequest {
    pub line: usize,
    pub mountpoint: Option<String>,
    /// Subvolume name, or the volume to reuse with `--useexisting`
    pub name: Option<String>,
    /// Volume label; doubles as the volume name
    pub label: Option<String>,
    pub subvol: bool,
    /// Member partitions (`btrfs.<label>`), or the parent volume of a subvolume
    pub members: Vec<String>,
    pub data_level: Option<BtrfsLevel>,
    pub metadata_level: Option<BtrfsLevel>,
    /// `--useexisting`
    pub preexist: bool,
}

pub fn execute(engine: &mut dyn StorageEngine, ctx: &mut RunContext, req: &BtrfsRequest) -> Result<()> {
    let line = req.line;
    let members = resolve_members(engine, ctx, line, &req.members, FormatType::Btrfs, "BTRFS volume")?;

    let name = if req.subvol { req.name.clone() } else { req.label.clone() };

    if members.is_empty() && !req.preexist {
        return Err(KickstartError::validation(
            line,
            "BTRFS volume defined without any member devices.  Either specify member devices or use --useexisting.",
        ));
    }

    let mountpoint = match classify_mountpoint(line, req.mountpoint.as_deref())? {
        MountTarget::Unmounted => None,
        MountTarget::Path(path) => Some(path),
        _ => return Err(invalid_mountpoint(line, req.mountpoint.as_deref().unwrap_or_default())),
    };

    if req.preexist {
        let spec = req.name.as_deref().unwrap_or_default();
        let device = existing_device(engine, spec).ok_or_else(|| {
            KickstartError::reference(line, format!("Specified nonexistent BTRFS volume {} in btrfs command", spec))
        })?;
        claim_mountpoint(engine, line, mountpoint.as_deref(), Some(device))?;
        engine.set_mount(device, mountpoint, None).at_line(line)?;
        return Ok(());
    }

    claim_mountpoint(engine, line, mountpoint.as_deref(), None)?;
    let format = Format {
        kind: Some(FormatType::Btrfs),
        mountpoint,
        label: req.label.clone(),
        ..Format::default()
    };
    let device = engine
        .create_device(DeviceRequest::Btrfs {
            name,
            subvol: req.subvol,
            members,
            format,
            data_level: req.data_level,
            metadata_level: req.metadata_level,
        })
        .at_line(line)?;
    debug!("line {}: btrfs {} created as {}", line, if req.subvol { "subvolume" } else { "volume" }, device);
    Ok(())
}
