//! `volgroup`: LVM volume groups.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::common::{resolve_members, validate_percent};
use crate::context::RunContext;
use crate::engine::{DeviceKind, DeviceRequest, Reserved, StorageEngine};
use crate::error::{AtLine, KickstartError, Result};
use crate::sizing::{possible_physical_extents, DEFAULT_PE_SIZE_KIB, PE_SIZE_FLOOR_KIB};
use crate::types::FormatType;

/// One `volgroup` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolGroupRequest {
    pub line: usize,
    pub name: Option<String>,
    /// Physical volumes, usually `pv.<label>` placeholders
    pub pvs: Vec<String>,
    /// Physical extent size (KiB)
    pub pe_size_kib: u64,
    pub format: bool,
    /// `--useexisting`
    pub preexist: bool,
    /// MiB held back from logical volumes
    pub reserved_space: Option<u64>,
    pub reserved_percent: Option<i64>,
}

impl Default for VolGroupRequest {
    fn default() -> Self {
        Self {
            line: 0,
            name: None,
            pvs: Vec::new(),
            pe_size_kib: DEFAULT_PE_SIZE_KIB,
            format: true,
            preexist: false,
            reserved_space: None,
            reserved_percent: None,
        }
    }
}

impl VolGroupRequest {
    fn reserved(&self) -> Result<Option<Reserved>> {
        if let Some(space) = self.reserved_space.filter(|s| *s > 0) {
            return Ok(Some(Reserved::SpaceMib(space)));
        }
        match self.reserved_percent.filter(|p| *p != 0) {
            Some(percent) => Ok(Some(Reserved::Percent(validate_percent(self.line, percent)?))),
            None => Ok(None),
        }
    }
}

pub fn execute(engine: &mut dyn StorageEngine, ctx: &mut RunContext, req: &VolGroupRequest) -> Result<()> {
    let line = req.line;
    let pvs = resolve_members(engine, ctx, line, &req.pvs, FormatType::LvmPv, "Volume Group")?;

    if pvs.is_empty() && !req.preexist {
        return Err(KickstartError::validation(
            line,
            "Volume group defined without any physical volumes.  Either specify physical volumes or use --useexisting.",
        ));
    }

    if !possible_physical_extents(PE_SIZE_FLOOR_KIB).contains(&req.pe_size_kib) {
        return Err(KickstartError::validation(line, "Volume group specified invalid pesize"));
    }

    let existing_vg = |name: &str| {
        engine
            .device_by_name(name)
            .filter(|id| engine.device(*id).is_some_and(|i| i.kind == DeviceKind::VolumeGroup))
    };

    if !req.format || req.preexist {
        let name = req.name.as_deref().ok_or_else(|| {
            KickstartError::validation(line, "--noformat or --useexisting used without giving a name")
        })?;
        if existing_vg(name).is_none() {
            return Err(KickstartError::reference(
                line,
                format!("No preexisting VG with the name \"{}\" was found.", name),
            ));
        }
        return Ok(());
    }

    if let Some(name) = req.name.as_deref() {
        if existing_vg(name).is_some() {
            return Err(KickstartError::validation(
                line,
                format!("The volume group name \"{}\" is already in use.", name),
            ));
        }
    }

    let vg = engine
        .create_device(DeviceRequest::VolumeGroup {
            name: req.name.clone(),
            pvs,
            pe_size_kib: req.pe_size_kib,
            reserved: req.reserved()?,
        })
        .at_line(line)?;

    let concrete = engine.device(vg).map(|i| i.name).unwrap_or_default();
    info!("line {}: volume group {}", line, concrete);
    if let Some(name) = req.name.as_deref() {
        ctx.aliases.register(line, name, &concrete)?;
    }
    Ok(())
}
