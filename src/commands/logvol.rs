//! `logvol`: logical volumes, thin pools and thin volumes.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::common::{
    claim_mountpoint, classify_mountpoint, filesystem_type, invalid_mountpoint, remove_existing_format,
    resize_container, resize_existing, validate_lv_size, validate_percent, MountTarget,
};
use crate::context::RunContext;
use crate::encryption::{wrap, EncryptionRequest};
use crate::engine::{DeviceId, DeviceKind, DeviceRequest, Format, LvSize, StorageEngine, ThinRole};
use crate::error::{AtLine, KickstartError, Result};
use crate::sizing::{swap_suggestion, DEFAULT_PE_SIZE_KIB};
use crate::types::FormatType;

/// One `logvol` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogVolRequest {
    pub line: usize,
    pub mountpoint: Option<String>,
    /// `--vgname`, as written in the script
    pub vg_name: String,
    pub name: Option<String>,
    pub fstype: Option<String>,
    /// MiB
    pub size: Option<u64>,
    pub grow: bool,
    pub max_size: Option<u64>,
    pub percent: Option<i64>,
    pub recommended: bool,
    pub hibernation: bool,
    pub format: bool,
    /// `--useexisting`
    pub preexist: bool,
    pub resize: bool,
    pub label: Option<String>,
    pub mount_options: Option<String>,
    pub fs_profile: Option<String>,
    pub thin_pool: bool,
    pub thin_volume: bool,
    /// Pool a thin volume is allocated from
    pub pool_name: Option<String>,
    pub metadata_size: Option<u64>,
    pub chunk_size_kib: Option<u64>,
    pub encryption: Option<EncryptionRequest>,
}

impl Default for LogVolRequest {
    fn default() -> Self {
        Self {
            line: 0,
            mountpoint: None,
            vg_name: String::new(),
            name: None,
            fstype: None,
            size: None,
            grow: false,
            max_size: None,
            percent: None,
            recommended: false,
            hibernation: false,
            format: true,
            preexist: false,
            resize: false,
            label: None,
            mount_options: None,
            fs_profile: None,
            thin_pool: false,
            thin_volume: false,
            pool_name: None,
            metadata_size: None,
            chunk_size_kib: None,
            encryption: None,
        }
    }
}

fn lv_by_name(engine: &dyn StorageEngine, vg: &str, name: &str) -> Option<DeviceId> {
    engine.device_by_name(&format!("{}-{}", vg, name)).filter(|id| {
        engine.device(*id).is_some_and(|i| {
            matches!(i.kind, DeviceKind::LogicalVolume | DeviceKind::ThinPool | DeviceKind::ThinVolume)
        })
    })
}

pub fn execute(engine: &mut dyn StorageEngine, ctx: &mut RunContext, req: &LogVolRequest) -> Result<()> {
    let line = req.line;
    let vg_name = ctx.aliases.get(&req.vg_name).unwrap_or(&req.vg_name).to_string();
    let mut size = req.size;
    let mut grow = req.grow;
    let mut mountpoint = None;

    let mut kind = match classify_mountpoint(line, req.mountpoint.as_deref())? {
        MountTarget::Swap => {
            if req.recommended || req.hibernation {
                let space = Some(engine.usable_disk_space_mib());
                size = Some(swap_suggestion(engine.total_memory_mib(), space, req.hibernation));
                grow = false;
            }
            Some(FormatType::Swap)
        }
        MountTarget::Unmounted => Some(filesystem_type(engine, line, req.fstype.as_deref(), None)?),
        MountTarget::Path(path) => {
            let kind = filesystem_type(engine, line, req.fstype.as_deref(), Some(&path))?;
            mountpoint = Some(path);
            Some(kind)
        }
        MountTarget::Placeholder(p) => return Err(invalid_mountpoint(line, &p.name())),
        MountTarget::Boot(kind) => return Err(invalid_mountpoint(line, &kind.to_string())),
    };
    if req.thin_pool {
        kind = None;
        mountpoint = None;
        if req.encryption.is_some() {
            return Err(KickstartError::validation(line, "Thin pools cannot be encrypted"));
        }
    }

    let vg = engine
        .device_by_name(&vg_name)
        .and_then(|id| engine.device(id))
        .filter(|i| i.kind == DeviceKind::VolumeGroup)
        .ok_or_else(|| {
            KickstartError::state(
                line,
                format!(
                    "No volume group exists with the name \"{}\".  Specify volume groups before logical volumes.",
                    req.vg_name
                ),
            )
        })?;

    let pool = if req.thin_volume {
        let pool_name = req.pool_name.as_deref().unwrap_or_default();
        let pool = engine
            .device_by_name(&format!("{}-{}", vg.name, pool_name))
            .filter(|id| engine.device(*id).is_some_and(|i| i.kind == DeviceKind::ThinPool))
            .ok_or_else(|| {
                KickstartError::state(
                    line,
                    format!(
                        "No thin pool exists with the name \"{}\". Specify thin pools before thin volumes.",
                        pool_name
                    ),
                )
            })?;
        Some(pool)
    } else {
        None
    };

    if !req.format {
        let name = req
            .name
            .as_deref()
            .ok_or_else(|| KickstartError::validation(line, "--noformat used without --name"))?;
        let device = lv_by_name(engine, &vg.name, name).ok_or_else(|| {
            KickstartError::reference(
                line,
                format!("No preexisting logical volume with the name \"{}\" was found.", name),
            )
        })?;
        if req.resize {
            resize_existing(engine, line, device, size)?;
        }
        claim_mountpoint(engine, line, mountpoint.as_deref(), Some(device))?;
        engine
            .set_mount(device, mountpoint, req.mount_options.clone())
            .at_line(line)?;
        return Ok(());
    }

    let mut lv_size = None;
    if !req.preexist {
        if let Some(name) = req.name.as_deref() {
            if lv_by_name(engine, &vg.name, name).is_some() {
                return Err(KickstartError::validation(
                    line,
                    format!("Logical volume name already used in volume group {}", vg.name),
                ));
            }
        }
        lv_size = Some(match req.percent {
            Some(percent) => LvSize::Percent(validate_percent(line, percent)?),
            None => {
                let pe_size = vg.pe_size_kib.unwrap_or(DEFAULT_PE_SIZE_KIB);
                let size_mib = validate_lv_size(line, size, grow, pe_size)?;
                LvSize::Fixed { size_mib, grow, max_size_mib: req.max_size }
            }
        });
    }

    let format = Format {
        kind,
        mountpoint: mountpoint.clone(),
        mount_options: req.mount_options.clone(),
        label: req.label.clone(),
        fs_profile: req.fs_profile.clone(),
        luks: None,
    };

    let device = match lv_size {
        None => {
            let name = req.name.as_deref().unwrap_or_default();
            let device = lv_by_name(engine, &vg.name, name).ok_or_else(|| {
                KickstartError::reference(line, format!("Specified nonexistent LV {} in logvol command", name))
            })?;
            remove_existing_format(engine, line, device)?;
            if req.resize {
                resize_container(engine, line, device, size)?;
            }
            claim_mountpoint(engine, line, mountpoint.as_deref(), Some(device))?;
            if req.encryption.is_none() {
                engine.create_format(device, format.clone()).at_line(line)?;
            }
            device
        }
        Some(lv_size) => {
            claim_mountpoint(engine, line, mountpoint.as_deref(), None)?;
            let thin = if req.thin_pool {
                Some(ThinRole::Pool {
                    metadata_size_mib: req.metadata_size,
                    chunk_size_kib: req.chunk_size_kib,
                })
            } else if req.thin_volume {
                Some(ThinRole::Volume)
            } else {
                None
            };
            let device = engine
                .create_device(DeviceRequest::LogicalVolume {
                    name: req.name.clone(),
                    parent: pool.unwrap_or(vg.id),
                    format: format.clone(),
                    size: lv_size,
                    thin,
                })
                .at_line(line)?;
            debug!("line {}: logical volume {:?} in {}", line, req.name, vg.name);
            device
        }
    };

    if let Some(encryption) = &req.encryption {
        wrap(engine, ctx, device, format, encryption, line)?;
    }
    Ok(())
}

/// Volume growth solve after the last logical volume request.
pub fn finalize(engine: &mut dyn StorageEngine, line: usize) -> Result<()> {
    engine.grow_lvm().at_line(line)?;
    info!("logical volume sizes solved");
    Ok(())
}
