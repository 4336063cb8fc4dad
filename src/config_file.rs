//! Storage spec file handling.
//!
//! A `StorageSpec` is the parsed storage section of a kickstart script: one
//! typed request per command kind, each carrying the script line it came
//! from. Specs are stored as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::commands::common::{classify_mountpoint, parse_format_type, validate_percent, MountTarget};
use crate::commands::{
    AutoPartRequest, BootloaderRequest, BtrfsRequest, ClearPartRequest, IgnoreDiskRequest, LogVolRequest,
    PartitionRequest, RaidRequest, VolGroupRequest,
};
use crate::sizing::{possible_physical_extents, PE_SIZE_FLOOR_KIB};

/// Storage commands of one kickstart script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSpec {
    pub ignoredisk: Option<IgnoreDiskRequest>,
    pub clearpart: Option<ClearPartRequest>,
    pub bootloader: Option<BootloaderRequest>,
    pub autopart: Option<AutoPartRequest>,
    pub partitions: Vec<PartitionRequest>,
    pub raids: Vec<RaidRequest>,
    pub volgroups: Vec<VolGroupRequest>,
    pub logvols: Vec<LogVolRequest>,
    pub btrfs: Vec<BtrfsRequest>,
}

impl StorageSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the spec to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize storage spec to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write storage spec to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load a spec from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read storage spec from {:?}", path.as_ref()))?;

        let spec: Self = serde_json::from_str(&content).context("Failed to parse storage spec JSON")?;

        Ok(spec)
    }

    /// True if the spec requests nothing at all
    pub fn is_empty(&self) -> bool {
        self.ignoredisk.is_none()
            && self.clearpart.is_none()
            && self.bootloader.is_none()
            && self.autopart.is_none()
            && self.partitions.is_empty()
            && self.raids.is_empty()
            && self.volgroups.is_empty()
            && self.logvols.is_empty()
            && self.btrfs.is_empty()
    }

    /// Checks that need no device tree: vocabularies, mount point syntax,
    /// sizes and placeholder uniqueness. Everything else is checked when the
    /// commands run.
    pub fn validate(&self) -> Result<()> {
        if let Some(ignoredisk) = &self.ignoredisk {
            if !ignoredisk.ignore.is_empty() && !ignoredisk.only_use.is_empty() {
                anyhow::bail!(
                    "line {}: ignoredisk --drives and --only-use cannot be combined",
                    ignoredisk.line
                );
            }
        }

        if self.autopart.is_some() && !self.partitions.is_empty() {
            anyhow::bail!(
                "line {}: autopart cannot be combined with part/partition requests",
                self.partitions[0].line
            );
        }

        // placeholder name -> line that declared it
        let mut placeholders: BTreeMap<String, usize> = BTreeMap::new();
        let mut claim_placeholder = |line: usize, target: &MountTarget| -> Result<()> {
            if let MountTarget::Placeholder(placeholder) = target {
                let name = placeholder.name();
                if let Some(first) = placeholders.insert(name.clone(), line) {
                    anyhow::bail!("line {}: {} partition defined multiple times (first on line {})", line, name, first);
                }
            }
            Ok(())
        };

        for part in &self.partitions {
            let target = classify_mountpoint(part.line, part.mountpoint.as_deref())?;
            claim_placeholder(part.line, &target)?;
            check_fstype(part.line, part.fstype.as_deref())?;
        }

        for raid in &self.raids {
            let target = classify_mountpoint(raid.line, raid.mountpoint.as_deref())?;
            claim_placeholder(raid.line, &target)?;
            check_fstype(raid.line, raid.fstype.as_deref())?;
            if raid.level.is_none() && raid.format && !raid.preexist {
                anyhow::bail!("line {}: RAID level is required for a new array", raid.line);
            }
        }

        let extents = possible_physical_extents(PE_SIZE_FLOOR_KIB);
        for vg in &self.volgroups {
            if !extents.contains(&vg.pe_size_kib) {
                anyhow::bail!(
                    "line {}: Volume group given physical extent size of \"{}\", but must be one of:\n{}.",
                    vg.line,
                    vg.pe_size_kib,
                    extents.iter().map(u64::to_string).collect::<Vec<_>>().join(", ")
                );
            }
        }

        for lv in &self.logvols {
            classify_mountpoint(lv.line, lv.mountpoint.as_deref())?;
            check_fstype(lv.line, lv.fstype.as_deref())?;
            if let Some(percent) = lv.percent {
                validate_percent(lv.line, percent)?;
            }
            if lv.vg_name.trim().is_empty() {
                anyhow::bail!("line {}: logvol requires a volume group name", lv.line);
            }
        }

        for volume in &self.btrfs {
            classify_mountpoint(volume.line, volume.mountpoint.as_deref())?;
        }

        Ok(())
    }
}

fn check_fstype(line: usize, fstype: Option<&str>) -> Result<()> {
    if let Some(fstype) = fstype.filter(|s| !s.is_empty()) {
        parse_format_type(line, fstype)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::types::{ClearPartType, RaidLevel};

    fn create_test_spec() -> StorageSpec {
        StorageSpec {
            clearpart: Some(ClearPartRequest {
                line: 1,
                kind: ClearPartType::All,
                init_all: true,
                ..ClearPartRequest::default()
            }),
            partitions: vec![
                PartitionRequest {
                    line: 2,
                    mountpoint: Some("/boot".to_string()),
                    size: Some(1024),
                    ..PartitionRequest::default()
                },
                PartitionRequest {
                    line: 3,
                    mountpoint: Some("pv.01".to_string()),
                    size: Some(8000),
                    grow: true,
                    ..PartitionRequest::default()
                },
            ],
            volgroups: vec![VolGroupRequest {
                line: 4,
                name: Some("sys".to_string()),
                pvs: vec!["pv.01".to_string()],
                ..VolGroupRequest::default()
            }],
            logvols: vec![LogVolRequest {
                line: 5,
                mountpoint: Some("/".to_string()),
                vg_name: "sys".to_string(),
                name: Some("root".to_string()),
                size: Some(4000),
                grow: true,
                ..LogVolRequest::default()
            }],
            ..StorageSpec::default()
        }
    }

    #[test]
    fn test_default_spec_is_empty() {
        let spec = StorageSpec::new();
        assert!(spec.is_empty());
        assert!(spec.validate().is_ok());
        assert!(!create_test_spec().is_empty());
    }

    #[test]
    fn test_save_and_load_json_spec() {
        let spec = create_test_spec();
        let temp_file = NamedTempFile::new().unwrap();

        spec.save_to_file(temp_file.path()).unwrap();
        let loaded = StorageSpec::load_from_file(temp_file.path()).unwrap();

        assert_eq!(loaded, spec);
    }

    #[test]
    fn test_load_sparse_json_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(br#"{"partitions": [{"line": 7, "mountpoint": "/", "size": 5000}]}"#)
            .unwrap();
        temp_file.flush().unwrap();

        let spec = StorageSpec::load_from_file(temp_file.path()).unwrap();
        assert_eq!(spec.partitions.len(), 1);
        assert!(spec.partitions[0].format);
        assert!(spec.clearpart.is_none());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = StorageSpec::load_from_file(Path::new("/nonexistent/path"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ invalid json }").unwrap();
        temp_file.flush().unwrap();

        let result = StorageSpec::load_from_file(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_load_json_wrong_type_fails() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{"clearpart": {"type": "everything"}}"#).unwrap();
        temp_file.flush().unwrap();

        assert!(StorageSpec::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_validation_valid_spec() {
        assert!(create_test_spec().validate().is_ok());
    }

    #[test]
    fn test_validation_relative_mountpoint() {
        let mut spec = create_test_spec();
        spec.partitions[0].mountpoint = Some("boot".to_string());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_validation_unknown_fstype() {
        let mut spec = create_test_spec();
        spec.logvols[0].fstype = Some("reiser4".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validation_duplicate_placeholder() {
        let mut spec = create_test_spec();
        spec.raids.push(RaidRequest {
            line: 9,
            mountpoint: Some("pv.01".to_string()),
            level: Some(RaidLevel::Raid1),
            ..RaidRequest::default()
        });
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("pv.01"));
    }

    #[test]
    fn test_validation_bad_extent_size() {
        let mut spec = create_test_spec();
        spec.volgroups[0].pe_size_kib = 3000;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validation_percent_out_of_range() {
        let mut spec = create_test_spec();
        spec.logvols[0].size = None;
        spec.logvols[0].percent = Some(0);
        assert!(spec.validate().is_err());
        spec.logvols[0].percent = Some(-25);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validation_ignoredisk_lists_exclusive() {
        let spec = StorageSpec {
            ignoredisk: Some(IgnoreDiskRequest {
                line: 1,
                ignore: vec!["sda".to_string()],
                only_use: vec!["sdb".to_string()],
            }),
            ..StorageSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validation_autopart_with_partitions() {
        let mut spec = create_test_spec();
        spec.autopart = Some(AutoPartRequest::default());
        assert!(spec.validate().is_err());
    }
}
