//! Storage engine contract.
//!
//! The device tree, the action graph and the allocation solvers belong to the
//! storage engine. Command handlers only hold `DeviceId`s and talk to the engine
//! through the `StorageEngine` trait: inventory queries, action registration and
//! the global solvers. `MemoryEngine` is an in-memory implementation used for
//! planning and tests.

pub mod action;
pub mod autopart;
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AutoPartType, BtrfsLevel, ClearPartType, FormatType, RaidLevel, Stage1Location};

pub use action::{ActionLog, StorageAction};
pub use memory::{
    Inventory, InventoryBtrfs, InventoryDisk, InventoryPartition, InventoryRaid, InventoryVolume,
    InventoryVolumeGroup, MemoryEngine,
};

/// Opaque handle to a device owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Disk,
    Partition,
    MdArray,
    VolumeGroup,
    LogicalVolume,
    ThinPool,
    ThinVolume,
    BtrfsVolume,
    BtrfsSubvolume,
    Luks,
    Tmpfs,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disk => "disk",
            Self::Partition => "partition",
            Self::MdArray => "mdarray",
            Self::VolumeGroup => "lvmvg",
            Self::LogicalVolume => "lvmlv",
            Self::ThinPool => "lvmthinpool",
            Self::ThinVolume => "lvmthinlv",
            Self::BtrfsVolume => "btrfs volume",
            Self::BtrfsSubvolume => "btrfs subvolume",
            Self::Luks => "luks/dm-crypt",
            Self::Tmpfs => "tmpfs",
        };
        f.write_str(s)
    }
}

/// LUKS parameters attached to a `luks` format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LuksSettings {
    /// `None` means the engine has to obtain one before writing the header
    pub passphrase: Option<String>,
    /// The passphrase field holds an already-crypted value
    pub crypted: bool,
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_cert: Option<Vec<u8>>,
    pub add_backup_passphrase: bool,
}

/// Format (filesystem or signature) requested for, or present on, a device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Format {
    /// `None` means unformatted
    pub kind: Option<FormatType>,
    pub mountpoint: Option<String>,
    pub mount_options: Option<String>,
    pub label: Option<String>,
    pub fs_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks: Option<LuksSettings>,
}

impl Format {
    pub fn new(kind: FormatType) -> Self {
        Self { kind: Some(kind), ..Self::default() }
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<String>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn luks(settings: LuksSettings) -> Self {
        Self {
            kind: Some(FormatType::Luks),
            luks: Some(settings),
            ..Self::default()
        }
    }

    pub fn is(&self, kind: FormatType) -> bool {
        self.kind == Some(kind)
    }
}

/// Read-only snapshot of a device as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub path: String,
    pub kind: DeviceKind,
    pub format: Format,
    pub uuid: Option<String>,
    /// Planned size (MiB)
    pub size_mib: u64,
    /// Size on disk right now (MiB); equals `size_mib` for new devices
    pub current_size_mib: u64,
    /// True if the device is present on the system, false for a pending request
    pub exists: bool,
    /// Symbolic name the device was requested under (`raid.01`, `pv.01`)
    pub req_name: Option<String>,
    pub parents: Vec<DeviceId>,
    pub protected: bool,
    pub hidden: bool,
    pub partitionable: bool,
    /// Disk carries a partition table
    pub partitioned: bool,
    /// Volume groups only: physical extent size (KiB)
    pub pe_size_kib: Option<u64>,
}

/// How to size a new logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LvSize {
    Fixed { size_mib: u64, grow: bool, max_size_mib: Option<u64> },
    /// Percentage (1..=100) of the volume group
    Percent(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThinRole {
    Pool { metadata_size_mib: Option<u64>, chunk_size_kib: Option<u64> },
    Volume,
}

/// Space held back in a volume group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reserved {
    SpaceMib(u64),
    Percent(u8),
}

/// A device the engine should schedule for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    Partition {
        req_name: Option<String>,
        format: Format,
        size_mib: Option<u64>,
        grow: bool,
        max_size_mib: Option<u64>,
        primary: bool,
        /// Candidate disks; empty means any eligible disk
        disks: Vec<DeviceId>,
    },
    Tmpfs {
        format: Format,
        size_mib: Option<u64>,
    },
    MdArray {
        name: Option<String>,
        level: RaidLevel,
        members: Vec<DeviceId>,
        member_devices: usize,
        total_devices: usize,
        format: Format,
    },
    VolumeGroup {
        name: Option<String>,
        pvs: Vec<DeviceId>,
        pe_size_kib: u64,
        reserved: Option<Reserved>,
    },
    LogicalVolume {
        name: Option<String>,
        /// Volume group, or thin pool for thin volumes
        parent: DeviceId,
        format: Format,
        size: LvSize,
        thin: Option<ThinRole>,
    },
    Btrfs {
        name: Option<String>,
        subvol: bool,
        members: Vec<DeviceId>,
        format: Format,
        data_level: Option<BtrfsLevel>,
        metadata_level: Option<BtrfsLevel>,
    },
    /// Encryption layer over exactly one parent
    Luks {
        parent: DeviceId,
        format: Format,
    },
}

/// Resolved `clearpart` policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClearPartPolicy {
    pub kind: ClearPartType,
    /// Restrict clearing to these disks; empty means every eligible disk
    pub disks: Vec<DeviceId>,
    /// Devices removed by `ClearPartType::List`
    pub devices: Vec<DeviceId>,
    pub initialize_disks: bool,
}

/// Resolved `ignoredisk` selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskFilter {
    pub ignored: Vec<DeviceId>,
    /// If non-empty, every other disk is hidden
    pub only_use: Vec<DeviceId>,
}

/// Resolved `autopart` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoPartPlan {
    pub kind: AutoPartType,
    pub encryption: Option<LuksSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootPassword {
    Plain(String),
    Crypted(String),
}

/// Bootloader placement intent recorded before partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootloaderPlacement {
    /// No bootloader will be installed
    pub skip: bool,
    pub stage1_location: Option<Stage1Location>,
    pub boot_args: Vec<String>,
    pub password: Option<BootPassword>,
    pub timeout: Option<u32>,
    pub disk_order: Vec<DeviceId>,
    pub stage1_disk: Option<DeviceId>,
    pub leave_boot_order: bool,
}

/// Errors raised by the storage engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("no such device: {0}")]
    NoSuchDevice(DeviceId),

    #[error("device {name} has dependent devices and cannot be destroyed")]
    HasDependents { name: String },

    #[error("Invalid target size ({size_mib}) for device {name}")]
    InvalidSize { name: String, size_mib: u64 },

    #[error("partitioning failed: {0}")]
    Allocation(String),

    #[error("storage configuration failed sanity check: {}", .0.join("; "))]
    Sanity(Vec<String>),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("bootloader placement was never recorded")]
    NoBootloaderPlacement,

    #[error("invalid inventory: {0}")]
    Inventory(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The storage engine as seen by command handlers.
///
/// Query methods return owned snapshots so handlers never hold borrows into the
/// engine's tree across mutations.
pub trait StorageEngine {
    /// One-time inventory refresh before a run starts.
    fn refresh(&mut self) -> StorageResult<()>;

    /// Every live device (pending requests included).
    fn devices(&self) -> Vec<DeviceId>;
    fn device(&self, id: DeviceId) -> Option<DeviceInfo>;
    fn disks(&self) -> Vec<DeviceId>;
    fn children(&self, id: DeviceId) -> Vec<DeviceId>;

    /// Direct lookup by name, path, `UUID=`/`LABEL=` or `/dev/disk/by-*` link.
    fn resolve_device(&self, spec: &str) -> Option<DeviceId>;
    fn device_by_name(&self, name: &str) -> Option<DeviceId>;
    fn mountpoint_owner(&self, mountpoint: &str) -> Option<DeviceId>;
    /// Map a BIOS disk number (hex, as in `--onbiosdisk`) to a disk.
    fn bios_disk(&self, bios_id: &str) -> Option<DeviceId>;
    /// Whether `clearpart` will wipe this disk.
    fn should_clear(&self, disk: DeviceId) -> bool;

    fn default_fs_type(&self) -> FormatType;
    fn default_boot_fs_type(&self) -> FormatType;
    fn total_memory_mib(&self) -> u64;
    /// Overall size of the disks that may be used (MiB).
    fn usable_disk_space_mib(&self) -> u64;

    fn create_device(&mut self, request: DeviceRequest) -> StorageResult<DeviceId>;
    fn destroy_device(&mut self, id: DeviceId) -> StorageResult<()>;
    fn resize_device(&mut self, id: DeviceId, size_mib: u64) -> StorageResult<()>;
    fn create_format(&mut self, id: DeviceId, format: Format) -> StorageResult<()>;
    fn destroy_format(&mut self, id: DeviceId) -> StorageResult<()>;
    fn resize_format(&mut self, id: DeviceId, size_mib: u64) -> StorageResult<()>;
    /// Replace the planned format of a device that does not exist yet.
    fn replace_format(&mut self, id: DeviceId, format: Format) -> StorageResult<()>;
    /// Mount an existing format without reformatting it.
    fn set_mount(
        &mut self,
        id: DeviceId,
        mountpoint: Option<String>,
        mount_options: Option<String>,
    ) -> StorageResult<()>;

    fn apply_disk_filter(&mut self, filter: &DiskFilter) -> StorageResult<()>;
    fn clear_partitions(&mut self, policy: &ClearPartPolicy) -> StorageResult<()>;
    fn auto_partition(&mut self, plan: &AutoPartPlan) -> StorageResult<()>;
    /// Partition layout solve over every pending partition request.
    fn do_partitioning(&mut self) -> StorageResult<()>;
    /// Logical volume growth solve over every volume group.
    fn grow_lvm(&mut self) -> StorageResult<()>;
    /// Returns warnings; errors are reported as `StorageError::Sanity`.
    fn sanity_check(&self) -> StorageResult<Vec<String>>;

    fn configure_bootloader(&mut self, placement: BootloaderPlacement) -> StorageResult<()>;
    fn set_up_bootloader(&mut self) -> StorageResult<()>;
}
