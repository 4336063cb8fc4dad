//! Automatic partitioning layouts
//!
//! Translates an `AutoPartType` into the set of partitions, containers and
//! volumes the engine should request. Pure logic: no device tree access, the
//! engine applies the layout.
//!
//! | Type   | Layout |
//! |--------|--------|
//! | plain  | [ESP or biosboot] + /boot + / + swap |
//! | lvm    | [ESP or biosboot] + /boot + PV → VG → LV(/, swap) |
//! | thinp  | [ESP or biosboot] + /boot + PV → VG → thin pool → thin / , LV swap |
//! | btrfs  | [ESP or biosboot] + /boot + btrfs member → volume → subvolumes(/, /home), swap |
//!
//! Encryption goes on the data-bearing partitions: root and swap for `plain`,
//! the container member otherwise.

use crate::types::{AutoPartType, FormatType};

pub const EFI_SIZE_MIB: u64 = 600;
pub const BIOSBOOT_SIZE_MIB: u64 = 1;
pub const BOOT_SIZE_MIB: u64 = 1024;
pub const ROOT_BASE_MIB: u64 = 1024;
pub const ROOT_MAX_MIB: u64 = 70 * 1024;
pub const THIN_ROOT_MIB: u64 = 10 * 1024;
pub const DEFAULT_VG_NAME: &str = "system";

/// One partition of an automatic layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoPartition {
    pub mountpoint: Option<&'static str>,
    pub format: FormatType,
    pub size_mib: u64,
    pub grow: bool,
    pub max_size_mib: Option<u64>,
    pub encrypted: bool,
    /// Backs the layout's container (PV or btrfs member)
    pub member: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoContainer {
    VolumeGroup { name: &'static str, thin_pool: bool },
    Btrfs,
}

/// A volume carved out of the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoVolume {
    pub name: &'static str,
    /// `None` for swap
    pub mountpoint: Option<&'static str>,
    pub format: FormatType,
    pub size_mib: u64,
    pub grow: bool,
    pub max_size_mib: Option<u64>,
    /// Allocated from the thin pool instead of the volume group
    pub thin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoLayout {
    pub kind: AutoPartType,
    pub partitions: Vec<AutoPartition>,
    pub container: Option<AutoContainer>,
    pub volumes: Vec<AutoVolume>,
}

impl AutoLayout {
    /// Mount points the layout will claim, in creation order.
    pub fn mountpoints(&self) -> Vec<&'static str> {
        self.partitions
            .iter()
            .filter_map(|p| p.mountpoint)
            .chain(self.volumes.iter().filter_map(|v| v.mountpoint))
            .collect()
    }
}

/// Inputs the engine resolves before asking for a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutInput {
    pub kind: AutoPartType,
    pub uefi: bool,
    pub encrypted: bool,
    pub default_fs: FormatType,
    pub boot_fs: FormatType,
    pub swap_mib: u64,
}

pub fn default_layout(input: &LayoutInput) -> AutoLayout {
    let mut partitions = vec![boot_stage_partition(input.uefi), fixed(Some("/boot"), input.boot_fs, BOOT_SIZE_MIB)];

    let (container, volumes) = match input.kind {
        AutoPartType::Plain => {
            partitions.push(AutoPartition {
                grow: true,
                max_size_mib: Some(ROOT_MAX_MIB),
                encrypted: input.encrypted,
                ..fixed(Some("/"), input.default_fs, ROOT_BASE_MIB)
            });
            if input.swap_mib > 0 {
                partitions.push(AutoPartition {
                    encrypted: input.encrypted,
                    ..fixed(None, FormatType::Swap, input.swap_mib)
                });
            }
            (None, Vec::new())
        }
        AutoPartType::Lvm | AutoPartType::ThinP => {
            let thin = input.kind == AutoPartType::ThinP;
            partitions.push(member(FormatType::LvmPv, input.encrypted));
            let mut volumes = vec![AutoVolume {
                name: "root",
                mountpoint: Some("/"),
                format: input.default_fs,
                size_mib: if thin { THIN_ROOT_MIB } else { ROOT_BASE_MIB },
                grow: !thin,
                max_size_mib: if thin { None } else { Some(ROOT_MAX_MIB) },
                thin,
            }];
            if input.swap_mib > 0 {
                volumes.push(swap_volume(input.swap_mib));
            }
            (
                Some(AutoContainer::VolumeGroup { name: DEFAULT_VG_NAME, thin_pool: thin }),
                volumes,
            )
        }
        AutoPartType::Btrfs => {
            partitions.push(member(FormatType::Btrfs, input.encrypted));
            if input.swap_mib > 0 {
                partitions.push(AutoPartition {
                    encrypted: input.encrypted,
                    ..fixed(None, FormatType::Swap, input.swap_mib)
                });
            }
            let volumes = vec![
                subvolume("root", "/"),
                subvolume("home", "/home"),
            ];
            (Some(AutoContainer::Btrfs), volumes)
        }
    };

    AutoLayout { kind: input.kind, partitions, container, volumes }
}

fn boot_stage_partition(uefi: bool) -> AutoPartition {
    if uefi {
        fixed(Some("/boot/efi"), FormatType::Efi, EFI_SIZE_MIB)
    } else {
        fixed(None, FormatType::BiosBoot, BIOSBOOT_SIZE_MIB)
    }
}

fn fixed(mountpoint: Option<&'static str>, format: FormatType, size_mib: u64) -> AutoPartition {
    AutoPartition {
        mountpoint,
        format,
        size_mib,
        grow: false,
        max_size_mib: None,
        encrypted: false,
        member: false,
    }
}

fn member(format: FormatType, encrypted: bool) -> AutoPartition {
    AutoPartition {
        grow: true,
        encrypted,
        member: true,
        ..fixed(None, format, ROOT_BASE_MIB)
    }
}

fn swap_volume(size_mib: u64) -> AutoVolume {
    AutoVolume {
        name: "swap",
        mountpoint: None,
        format: FormatType::Swap,
        size_mib,
        grow: false,
        max_size_mib: None,
        thin: false,
    }
}

fn subvolume(name: &'static str, mountpoint: &'static str) -> AutoVolume {
    AutoVolume {
        name,
        mountpoint: Some(mountpoint),
        format: FormatType::Btrfs,
        size_mib: 0,
        grow: false,
        max_size_mib: None,
        thin: false,
    }
}
