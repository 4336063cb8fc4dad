//! In-memory storage engine
//!
//! An arena device tree loaded from a JSON `Inventory`. Devices are never
//! removed from the arena, only flagged, so a `DeviceId` stays valid for the
//! whole run. Every mutation is recorded in an `ActionLog`.
//!
//! The solvers are deliberately simple: partitions are placed first-fit in
//! declaration order and growable requests share what is left on their disk;
//! logical volumes get fixed sizes first, then percentages, then growth.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::action::{ActionLog, StorageAction};
use super::autopart::{self, AutoContainer, AutoLayout, LayoutInput};
use super::{
    AutoPartPlan, BootloaderPlacement, ClearPartPolicy, DeviceId, DeviceInfo, DeviceKind,
    DeviceRequest, DiskFilter, Format, LuksSettings, LvSize, Reserved, StorageEngine,
    StorageError, StorageResult, ThinRole,
};
use crate::sizing::{self, DEFAULT_PE_SIZE_KIB};
use crate::types::{ClearPartType, FormatType, RaidLevel, Stage1Location};

/// Size given to a partition request that did not ask for one
pub const DEFAULT_PART_SIZE_MIB: u64 = 500;

/// Space taken by the LUKS header
pub const LUKS_HEADER_MIB: u64 = 2;

/// Leading space kept free on every disk for alignment and the label
const DISK_LABEL_MIB: u64 = 1;

// ============================================================================
// Inventory
// ============================================================================

fn default_memory_mib() -> u64 {
    2048
}

fn default_true() -> bool {
    true
}

fn default_pe_size() -> u64 {
    DEFAULT_PE_SIZE_KIB
}

/// Devices present on the system before the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub disks: Vec<InventoryDisk>,
    #[serde(default)]
    pub raids: Vec<InventoryRaid>,
    #[serde(default)]
    pub volume_groups: Vec<InventoryVolumeGroup>,
    #[serde(default)]
    pub btrfs: Vec<InventoryBtrfs>,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u64,
    #[serde(default)]
    pub uefi: bool,
    #[serde(default)]
    pub default_fs: Option<FormatType>,
    /// BIOS disk number (`80`, `81`, ...) to disk name
    #[serde(default)]
    pub bios_disks: BTreeMap<String, String>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            disks: Vec::new(),
            raids: Vec::new(),
            volume_groups: Vec::new(),
            btrfs: Vec::new(),
            memory_mib: default_memory_mib(),
            uefi: false,
            default_fs: None,
            bios_disks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDisk {
    pub name: String,
    pub size_mib: u64,
    /// Disk already carries a partition table
    #[serde(default = "default_true")]
    pub partitioned: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Installation media and the like; never cleared or used
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub partitions: Vec<InventoryPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryPartition {
    pub name: String,
    pub size_mib: u64,
    #[serde(default)]
    pub format: Option<FormatType>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    /// GPT partition UUID
    #[serde(default)]
    pub partuuid: Option<String>,
    /// GPT partition name
    #[serde(default)]
    pub partlabel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRaid {
    pub name: String,
    pub level: RaidLevel,
    pub members: Vec<String>,
    #[serde(default)]
    pub format: Option<FormatType>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryVolumeGroup {
    pub name: String,
    pub pvs: Vec<String>,
    #[serde(default = "default_pe_size")]
    pub pe_size_kib: u64,
    #[serde(default)]
    pub lvs: Vec<InventoryVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryVolume {
    pub name: String,
    pub size_mib: u64,
    #[serde(default)]
    pub format: Option<FormatType>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub thin_pool: bool,
    /// Thin volumes name their pool
    #[serde(default)]
    pub pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryBtrfs {
    pub name: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub subvolumes: Vec<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl Inventory {
    /// Load an inventory from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory file: {}", path.display()))?;
        let inventory: Inventory = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse inventory JSON from: {}", path.display()))?;
        Ok(inventory)
    }
}

// ============================================================================
// Device Arena
// ============================================================================

/// Placement constraints of a partition request
#[derive(Debug, Clone, PartialEq, Eq)]
struct Growth {
    base_mib: u64,
    grow: bool,
    max_mib: Option<u64>,
    candidates: Vec<DeviceId>,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    /// Name the request was created under, kept after allocation renames it
    temp_name: Option<String>,
    path: String,
    kind: DeviceKind,
    format: Format,
    format_exists: bool,
    uuid: Option<String>,
    partuuid: Option<String>,
    partlabel: Option<String>,
    size_mib: u64,
    current_size_mib: u64,
    exists: bool,
    req_name: Option<String>,
    parents: Vec<DeviceId>,
    protected: bool,
    hidden: bool,
    removed: bool,
    partitionable: bool,
    partitioned: bool,
    pe_size_kib: Option<u64>,
    growth: Option<Growth>,
    lv_size: Option<LvSize>,
    level: Option<RaidLevel>,
    member_devices: usize,
    reserved: Option<Reserved>,
}

impl Node {
    fn new(name: impl Into<String>, kind: DeviceKind, exists: bool) -> Self {
        let name = name.into();
        Self {
            path: format!("/dev/{}", name),
            name,
            temp_name: None,
            kind,
            format: Format::default(),
            format_exists: exists,
            uuid: None,
            partuuid: None,
            partlabel: None,
            size_mib: 0,
            current_size_mib: 0,
            exists,
            req_name: None,
            parents: Vec::new(),
            protected: false,
            hidden: false,
            removed: false,
            partitionable: false,
            partitioned: false,
            pe_size_kib: None,
            growth: None,
            lv_size: None,
            level: None,
            member_devices: 0,
            reserved: None,
        }
    }

    fn sized(mut self, size_mib: u64) -> Self {
        self.size_mib = size_mib;
        self.current_size_mib = if self.exists { size_mib } else { 0 };
        self
    }

    fn formatted(mut self, kind: Option<FormatType>, label: Option<String>) -> Self {
        self.format.kind = kind;
        self.format.label = label;
        self
    }

    fn with_path(mut self, path: String) -> Self {
        self.path = path;
        self
    }

    fn with_parents(mut self, parents: Vec<DeviceId>) -> Self {
        self.parents = parents;
        self
    }
}

/// In-memory implementation of [`StorageEngine`].
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    inventory: Inventory,
    nodes: Vec<Node>,
    log: ActionLog,
    serial: usize,
    clear_policy: ClearPartPolicy,
    bootloader: Option<BootloaderPlacement>,
    stage1_target: Option<DeviceId>,
    refreshed: bool,
}

impl MemoryEngine {
    /// Build the device tree described by `inventory`.
    pub fn from_inventory(inventory: Inventory) -> StorageResult<Self> {
        let mut engine = Self {
            inventory,
            nodes: Vec::new(),
            log: ActionLog::default(),
            serial: 0,
            clear_policy: ClearPartPolicy::default(),
            bootloader: None,
            stage1_target: None,
            refreshed: false,
        };
        engine.load()?;
        Ok(engine)
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Actions registered so far, in order.
    pub fn actions(&self) -> &ActionLog {
        &self.log
    }

    pub fn bootloader(&self) -> Option<&BootloaderPlacement> {
        self.bootloader.as_ref()
    }

    /// Device the bootloader's first stage was placed on by `set_up_bootloader`.
    pub fn stage1_target(&self) -> Option<DeviceId> {
        self.stage1_target
    }

    pub fn is_refreshed(&self) -> bool {
        self.refreshed
    }

    /// Snapshot of every visible device, in creation order.
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices().into_iter().filter_map(|id| self.device(id)).collect()
    }

    /// Text rendering of the device tree, disks first with their descendants indented.
    pub fn tree_summary(&self) -> String {
        let mut lines = vec!["Device tree:".to_string()];
        let roots: Vec<DeviceId> = self
            .devices()
            .into_iter()
            .filter(|id| self.nodes[id.0].parents.is_empty())
            .collect();
        for root in roots {
            self.render(root, 1, &mut lines);
        }
        lines.join("\n")
    }

    fn render(&self, id: DeviceId, depth: usize, lines: &mut Vec<String>) {
        let node = &self.nodes[id.0];
        let format = node.format.kind.map(|k| k.to_string()).unwrap_or_else(|| "-".to_string());
        let mount = node.format.mountpoint.as_deref().unwrap_or("");
        lines.push(format!(
            "{}{} [{}] {} MiB {} {}{}",
            "  ".repeat(depth),
            node.name,
            node.kind,
            self.effective_size(id),
            format,
            mount,
            if node.exists { "" } else { " (new)" },
        ));
        for child in self.children(id) {
            // Multi-parent devices are rendered under their first parent only
            if self.nodes[child.0].parents.first() == Some(&id) {
                self.render(child, depth + 1, lines);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    fn load(&mut self) -> StorageResult<()> {
        self.nodes.clear();
        self.log = ActionLog::default();
        self.serial = 0;
        self.clear_policy = ClearPartPolicy::default();
        self.bootloader = None;
        self.stage1_target = None;

        let inventory = self.inventory.clone();
        for disk in &inventory.disks {
            let mut node = Node::new(&disk.name, DeviceKind::Disk, true).sized(disk.size_mib);
            node.partitionable = !disk.read_only;
            node.partitioned = disk.partitioned;
            node.protected = disk.protected;
            let disk_id = self.push(node);
            for part in &disk.partitions {
                let node = Node::new(&part.name, DeviceKind::Partition, true)
                    .sized(part.size_mib)
                    .formatted(part.format, part.label.clone())
                    .with_parents(vec![disk_id]);
                let id = self.push(node);
                self.nodes[id.0].uuid = part.uuid.clone();
                self.nodes[id.0].partuuid = part.partuuid.clone();
                self.nodes[id.0].partlabel = part.partlabel.clone();
                self.nodes[id.0].protected = disk.protected;
            }
        }

        for raid in &inventory.raids {
            let members = self.lookup_all(&raid.members)?;
            let mut node = Node::new(&raid.name, DeviceKind::MdArray, true)
                .formatted(raid.format, raid.label.clone())
                .with_path(format!("/dev/md/{}", raid.name))
                .with_parents(members.clone());
            node.level = Some(raid.level);
            node.member_devices = members.len();
            node.uuid = raid.uuid.clone();
            self.push(node);
        }

        for vg in &inventory.volume_groups {
            let pvs = self.lookup_all(&vg.pvs)?;
            let mut node = Node::new(&vg.name, DeviceKind::VolumeGroup, true)
                .with_parents(pvs);
            node.pe_size_kib = Some(vg.pe_size_kib);
            let vg_id = self.push(node);
            // Pools first so thin volumes can find them
            let mut ordered: Vec<&InventoryVolume> = vg.lvs.iter().filter(|lv| lv.thin_pool).collect();
            ordered.extend(vg.lvs.iter().filter(|lv| !lv.thin_pool));
            for lv in ordered {
                let (kind, parent) = match (&lv.pool, lv.thin_pool) {
                    (_, true) => (DeviceKind::ThinPool, vg_id),
                    (Some(pool), false) => {
                        let pool_name = format!("{}-{}", vg.name, pool);
                        let pool_id = self.lookup(&pool_name)?;
                        (DeviceKind::ThinVolume, pool_id)
                    }
                    (None, false) => (DeviceKind::LogicalVolume, vg_id),
                };
                let name = format!("{}-{}", vg.name, lv.name);
                let mut node = Node::new(&name, kind, true)
                    .sized(lv.size_mib)
                    .formatted(lv.format, lv.label.clone())
                    .with_path(format!("/dev/mapper/{}", name))
                    .with_parents(vec![parent]);
                node.uuid = lv.uuid.clone();
                self.push(node);
            }
        }

        for vol in &inventory.btrfs {
            let members = self.lookup_all(&vol.members)?;
            let mut node = Node::new(&vol.name, DeviceKind::BtrfsVolume, true)
                .formatted(Some(FormatType::Btrfs), Some(vol.name.clone()))
                .with_path(format!("btrfs:{}", vol.name))
                .with_parents(members);
            node.uuid = vol.uuid.clone();
            let vol_id = self.push(node);
            for sub in &vol.subvolumes {
                let node = Node::new(sub, DeviceKind::BtrfsSubvolume, true)
                    .formatted(Some(FormatType::Btrfs), None)
                    .with_path(format!("btrfs:{}/{}", vol.name, sub))
                    .with_parents(vec![vol_id]);
                self.push(node);
            }
        }

        debug!("inventory loaded: {} devices", self.nodes.len());
        Ok(())
    }

    fn push(&mut self, node: Node) -> DeviceId {
        self.nodes.push(node);
        DeviceId(self.nodes.len() - 1)
    }

    fn lookup(&self, name: &str) -> StorageResult<DeviceId> {
        self.nodes
            .iter()
            .position(|n| n.name == name && !n.removed)
            .map(DeviceId)
            .ok_or_else(|| StorageError::Inventory(format!("unknown device '{}'", name)))
    }

    fn lookup_all(&self, names: &[String]) -> StorageResult<Vec<DeviceId>> {
        names.iter().map(|n| self.lookup(n)).collect()
    }

    fn next_serial(&mut self) -> usize {
        let serial = self.serial;
        self.serial += 1;
        serial
    }

    // ------------------------------------------------------------------------
    // Tree queries
    // ------------------------------------------------------------------------

    fn node(&self, id: DeviceId) -> StorageResult<&Node> {
        self.nodes
            .get(id.0)
            .filter(|n| !n.removed)
            .ok_or(StorageError::NoSuchDevice(id))
    }

    fn node_mut(&mut self, id: DeviceId) -> StorageResult<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .filter(|n| !n.removed)
            .ok_or(StorageError::NoSuchDevice(id))
    }

    fn is_visible(&self, id: DeviceId) -> bool {
        match self.nodes.get(id.0) {
            Some(node) => {
                !node.removed && !node.hidden && node.parents.iter().all(|p| self.is_visible(*p))
            }
            None => false,
        }
    }

    fn visible_matching(&self, pred: impl Fn(&Node) -> bool) -> Option<DeviceId> {
        (0..self.nodes.len())
            .map(DeviceId)
            .find(|id| self.is_visible(*id) && pred(&self.nodes[id.0]))
    }

    fn effective_size(&self, id: DeviceId) -> u64 {
        let Some(node) = self.nodes.get(id.0) else {
            return 0;
        };
        match node.kind {
            DeviceKind::MdArray => {
                let smallest = node
                    .parents
                    .iter()
                    .map(|p| self.effective_size(*p))
                    .min()
                    .unwrap_or(0);
                let active = node.member_devices.max(1) as u64;
                match node.level {
                    Some(RaidLevel::Raid0) => smallest * active,
                    Some(RaidLevel::Raid1) | None => smallest,
                    Some(RaidLevel::Raid4) | Some(RaidLevel::Raid5) => smallest * active.saturating_sub(1),
                    Some(RaidLevel::Raid6) => smallest * active.saturating_sub(2),
                    Some(RaidLevel::Raid10) => smallest * active / 2,
                }
            }
            DeviceKind::VolumeGroup => {
                let extent = extent_mib(node.pe_size_kib);
                node.parents
                    .iter()
                    .map(|p| sizing::round_down_to_extent(self.effective_size(*p), extent))
                    .sum()
            }
            DeviceKind::Luks => node
                .parents
                .first()
                .map(|p| self.effective_size(*p).saturating_sub(LUKS_HEADER_MIB))
                .unwrap_or(0),
            DeviceKind::BtrfsVolume => node.parents.iter().map(|p| self.effective_size(*p)).sum(),
            DeviceKind::BtrfsSubvolume => node
                .parents
                .first()
                .map(|p| self.effective_size(*p))
                .unwrap_or(0),
            _ => node.size_mib,
        }
    }

    fn info(&self, id: DeviceId) -> Option<DeviceInfo> {
        let node = self.nodes.get(id.0).filter(|n| !n.removed)?;
        let size = self.effective_size(id);
        Some(DeviceInfo {
            id,
            name: node.name.clone(),
            path: node.path.clone(),
            kind: node.kind,
            format: node.format.clone(),
            uuid: node.uuid.clone(),
            size_mib: size,
            current_size_mib: if node.exists {
                match node.kind {
                    DeviceKind::Disk | DeviceKind::Partition | DeviceKind::LogicalVolume
                    | DeviceKind::ThinPool | DeviceKind::ThinVolume => node.current_size_mib,
                    _ => size,
                }
            } else {
                size
            },
            exists: node.exists,
            req_name: node.req_name.clone(),
            parents: node.parents.clone(),
            protected: node.protected,
            hidden: !self.is_visible(id),
            partitionable: node.partitionable,
            partitioned: node.partitioned,
            pe_size_kib: node.pe_size_kib,
        })
    }

    /// Disks partitioning may place new partitions on.
    fn eligible_disks(&self) -> Vec<DeviceId> {
        self.disks()
            .into_iter()
            .filter(|id| {
                let node = &self.nodes[id.0];
                node.partitionable && !node.protected && node.partitioned
            })
            .collect()
    }

    fn vg_name(&self, id: DeviceId) -> String {
        self.nodes
            .get(id.0)
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Mutation helpers
    // ------------------------------------------------------------------------

    fn log_create(&mut self, id: DeviceId) {
        let node = &self.nodes[id.0];
        self.log.push(StorageAction::CreateDevice {
            device: id,
            name: node.name.clone(),
            kind: node.kind.to_string(),
        });
        if let Some(kind) = node.format.kind {
            self.log.push(StorageAction::CreateFormat {
                device: id,
                name: node.name.clone(),
                format: kind.to_string(),
            });
        }
    }

    /// Remove one device with no live children.
    fn remove_node(&mut self, id: DeviceId) {
        let node = &self.nodes[id.0];
        if node.exists {
            if node.format_exists {
                if let Some(kind) = node.format.kind {
                    self.log.push(StorageAction::DestroyFormat {
                        device: id,
                        name: node.name.clone(),
                        format: kind.to_string(),
                    });
                }
            }
            self.log.push(StorageAction::DestroyDevice { device: id, name: node.name.clone() });
        } else {
            self.log.cancel_device(id);
        }
        debug!("removed device {}", self.nodes[id.0].name);
        self.nodes[id.0].removed = true;
    }

    /// Remove a device and everything stacked on it, leaves first.
    fn remove_tree(&mut self, id: DeviceId) {
        for child in self.children(id) {
            self.remove_tree(child);
        }
        if !self.nodes[id.0].removed {
            self.remove_node(id);
        }
    }

    fn check_parents(&self, ids: &[DeviceId]) -> StorageResult<()> {
        for id in ids {
            self.node(*id)?;
        }
        Ok(())
    }

    fn new_partition_name(&mut self) -> String {
        format!("req{}", self.next_serial())
    }

    fn partitions_on(&self, disk: DeviceId) -> Vec<DeviceId> {
        self.children(disk)
            .into_iter()
            .filter(|c| self.nodes[c.0].kind == DeviceKind::Partition)
            .collect()
    }

    fn apply_layout(&mut self, layout: &AutoLayout, luks: Option<&LuksSettings>) -> StorageResult<()> {
        let mut members = Vec::new();
        for part in &layout.partitions {
            let mut inner = Format::new(part.format);
            inner.mountpoint = part.mountpoint.map(str::to_string);
            inner.mount_options = part.format.default_mount_options().map(str::to_string);
            let request = |format: Format| DeviceRequest::Partition {
                req_name: None,
                format,
                size_mib: Some(part.size_mib),
                grow: part.grow,
                max_size_mib: part.max_size_mib,
                primary: false,
                disks: Vec::new(),
            };
            let leaf = match (part.encrypted, luks) {
                (true, Some(settings)) => {
                    let backing = self.create_device(request(Format::luks(settings.clone())))?;
                    self.create_device(DeviceRequest::Luks { parent: backing, format: inner })?
                }
                _ => self.create_device(request(inner))?,
            };
            if part.member {
                members.push(leaf);
            }
        }

        match layout.container {
            Some(AutoContainer::VolumeGroup { name, thin_pool }) => {
                let mut vg_name = name.to_string();
                let mut n = 1;
                while self.device_by_name(&vg_name).is_some() {
                    vg_name = format!("{}{:02}", name, n);
                    n += 1;
                }
                let vg = self.create_device(DeviceRequest::VolumeGroup {
                    name: Some(vg_name),
                    pvs: members,
                    pe_size_kib: DEFAULT_PE_SIZE_KIB,
                    reserved: None,
                })?;
                let pool = if thin_pool {
                    Some(self.create_device(DeviceRequest::LogicalVolume {
                        name: Some("pool00".to_string()),
                        parent: vg,
                        format: Format::default(),
                        size: LvSize::Fixed { size_mib: autopart::ROOT_BASE_MIB, grow: true, max_size_mib: None },
                        thin: Some(ThinRole::Pool { metadata_size_mib: None, chunk_size_kib: None }),
                    })?)
                } else {
                    None
                };
                for vol in &layout.volumes {
                    let (parent, thin) = match (vol.thin, pool) {
                        (true, Some(pool)) => (pool, Some(ThinRole::Volume)),
                        _ => (vg, None),
                    };
                    self.create_device(DeviceRequest::LogicalVolume {
                        name: Some(vol.name.to_string()),
                        parent,
                        format: Format {
                            mountpoint: vol.mountpoint.map(str::to_string),
                            ..Format::new(vol.format)
                        },
                        size: LvSize::Fixed {
                            size_mib: vol.size_mib,
                            grow: vol.grow,
                            max_size_mib: vol.max_size_mib,
                        },
                        thin,
                    })?;
                }
            }
            Some(AutoContainer::Btrfs) => {
                let volume = self.create_device(DeviceRequest::Btrfs {
                    name: None,
                    subvol: false,
                    members,
                    format: Format::new(FormatType::Btrfs),
                    data_level: None,
                    metadata_level: None,
                })?;
                for vol in &layout.volumes {
                    self.create_device(DeviceRequest::Btrfs {
                        name: Some(vol.name.to_string()),
                        subvol: true,
                        members: vec![volume],
                        format: Format {
                            mountpoint: vol.mountpoint.map(str::to_string),
                            ..Format::new(FormatType::Btrfs)
                        },
                        data_level: None,
                        metadata_level: None,
                    })?;
                }
            }
            None => {}
        }
        Ok(())
    }
}

fn extent_mib(pe_size_kib: Option<u64>) -> u64 {
    (pe_size_kib.unwrap_or(DEFAULT_PE_SIZE_KIB) / 1024).max(1)
}

/// Name of partition `number` on `disk` (`sda` → `sda1`, `nvme0n1` → `nvme0n1p1`)
pub fn partition_name(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

/// Trailing partition number of a partition name
fn partition_number(name: &str) -> Option<u32> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Hand out `remaining` MiB to growable requests, respecting their caps.
fn distribute(sizes: &mut [(usize, u64, Option<u64>)], mut remaining: u64) {
    loop {
        let open: Vec<usize> = sizes
            .iter()
            .enumerate()
            .filter(|(_, (_, size, max))| max.is_none_or(|m| *size < m))
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() || remaining == 0 {
            return;
        }
        let share = (remaining / open.len() as u64).max(1);
        let mut progressed = false;
        for i in open {
            if remaining == 0 {
                break;
            }
            let (_, size, max) = &mut sizes[i];
            let room = max.map_or(u64::MAX, |m| m - *size);
            let add = share.min(room).min(remaining);
            if add > 0 {
                *size += add;
                remaining -= add;
                progressed = true;
            }
        }
        if !progressed {
            return;
        }
    }
}

// ============================================================================
// StorageEngine
// ============================================================================

impl StorageEngine for MemoryEngine {
    fn refresh(&mut self) -> StorageResult<()> {
        self.load()?;
        self.refreshed = true;
        info!("device inventory refreshed ({} devices)", self.devices().len());
        Ok(())
    }

    fn devices(&self) -> Vec<DeviceId> {
        (0..self.nodes.len())
            .map(DeviceId)
            .filter(|id| self.is_visible(*id))
            .collect()
    }

    fn device(&self, id: DeviceId) -> Option<DeviceInfo> {
        self.info(id)
    }

    fn disks(&self) -> Vec<DeviceId> {
        self.devices()
            .into_iter()
            .filter(|id| self.nodes[id.0].kind == DeviceKind::Disk)
            .collect()
    }

    fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        (0..self.nodes.len())
            .map(DeviceId)
            .filter(|c| {
                let node = &self.nodes[c.0];
                !node.removed && node.parents.contains(&id)
            })
            .collect()
    }

    fn resolve_device(&self, spec: &str) -> Option<DeviceId> {
        if let Some(uuid) = spec
            .strip_prefix("UUID=")
            .or_else(|| spec.strip_prefix("/dev/disk/by-uuid/"))
        {
            return self.visible_matching(|n| n.uuid.as_deref() == Some(uuid));
        }
        if let Some(label) = spec
            .strip_prefix("LABEL=")
            .or_else(|| spec.strip_prefix("/dev/disk/by-label/"))
        {
            return self.visible_matching(|n| n.format.label.as_deref() == Some(label));
        }
        if let Some(partuuid) = spec
            .strip_prefix("PARTUUID=")
            .or_else(|| spec.strip_prefix("/dev/disk/by-partuuid/"))
        {
            return self.visible_matching(|n| n.partuuid.as_deref() == Some(partuuid));
        }
        if let Some(partlabel) = spec
            .strip_prefix("PARTLABEL=")
            .or_else(|| spec.strip_prefix("/dev/disk/by-partlabel/"))
        {
            return self.visible_matching(|n| n.partlabel.as_deref() == Some(partlabel));
        }
        if let Some(found) = self.visible_matching(|n| n.path == spec) {
            return Some(found);
        }
        if let Some(rest) = spec.strip_prefix("/dev/") {
            if let Some(name) = rest.strip_prefix("mapper/").or_else(|| rest.strip_prefix("md/")) {
                return self.device_by_name(name);
            }
            // /dev/<vg>/<lv>
            if let Some((vg, lv)) = rest.split_once('/') {
                return self.device_by_name(&format!("{}-{}", vg, lv));
            }
            return self.device_by_name(rest);
        }
        self.device_by_name(spec)
    }

    fn device_by_name(&self, name: &str) -> Option<DeviceId> {
        self.visible_matching(|n| n.name == name || n.temp_name.as_deref() == Some(name))
    }

    fn mountpoint_owner(&self, mountpoint: &str) -> Option<DeviceId> {
        self.visible_matching(|n| n.format.mountpoint.as_deref() == Some(mountpoint))
    }

    fn bios_disk(&self, bios_id: &str) -> Option<DeviceId> {
        let key = bios_id.trim_start_matches("0x").to_ascii_lowercase();
        let name = self.inventory.bios_disks.get(&key)?;
        self.disks().into_iter().find(|id| &self.nodes[id.0].name == name)
    }

    fn should_clear(&self, disk: DeviceId) -> bool {
        let policy = &self.clear_policy;
        let selected = policy.disks.is_empty() || policy.disks.contains(&disk);
        if !selected {
            return false;
        }
        if policy.initialize_disks {
            return true;
        }
        match policy.kind {
            ClearPartType::All => true,
            ClearPartType::Linux => self.partitions_on(disk).into_iter().all(|p| {
                self.nodes[p.0].format.kind.is_some_and(FormatType::is_linux_native)
            }),
            ClearPartType::None | ClearPartType::List => false,
        }
    }

    fn default_fs_type(&self) -> FormatType {
        self.inventory.default_fs.unwrap_or(FormatType::Xfs)
    }

    fn default_boot_fs_type(&self) -> FormatType {
        match self.default_fs_type() {
            FormatType::Btrfs => FormatType::Ext4,
            other => other,
        }
    }

    fn total_memory_mib(&self) -> u64 {
        self.inventory.memory_mib
    }

    fn usable_disk_space_mib(&self) -> u64 {
        self.disks()
            .into_iter()
            .map(|id| &self.nodes[id.0])
            .filter(|n| n.partitionable && !n.protected)
            .map(|n| n.size_mib)
            .sum()
    }

    fn create_device(&mut self, request: DeviceRequest) -> StorageResult<DeviceId> {
        let node = match request {
            DeviceRequest::Partition { req_name, format, size_mib, grow, max_size_mib, primary: _, disks } => {
                self.check_parents(&disks)?;
                let name = self.new_partition_name();
                let base = size_mib.unwrap_or(DEFAULT_PART_SIZE_MIB);
                let mut node = Node::new(&name, DeviceKind::Partition, false).sized(base);
                node.temp_name = Some(name);
                node.format = format;
                node.req_name = req_name;
                node.growth = Some(Growth { base_mib: base, grow, max_mib: max_size_mib, candidates: disks });
                node
            }
            DeviceRequest::Tmpfs { format, size_mib } => {
                let name = format!("tmpfs{}", self.next_serial());
                let mut node = Node::new(&name, DeviceKind::Tmpfs, false)
                    .sized(size_mib.unwrap_or(self.inventory.memory_mib / 2))
                    .with_path("tmpfs".to_string());
                node.format = format;
                node
            }
            DeviceRequest::MdArray { name, level, members, member_devices, total_devices: _, format } => {
                self.check_parents(&members)?;
                let name = name.unwrap_or_else(|| format!("md{}", self.next_serial()));
                let mut node = Node::new(&name, DeviceKind::MdArray, false)
                    .with_path(format!("/dev/md/{}", name))
                    .with_parents(members);
                node.format = format;
                node.level = Some(level);
                node.member_devices = member_devices;
                node
            }
            DeviceRequest::VolumeGroup { name, pvs, pe_size_kib, reserved } => {
                self.check_parents(&pvs)?;
                let name = name.unwrap_or_else(|| format!("vg{:02}", self.next_serial()));
                let mut node = Node::new(&name, DeviceKind::VolumeGroup, false).with_parents(pvs);
                node.pe_size_kib = Some(pe_size_kib);
                node.reserved = reserved;
                node
            }
            DeviceRequest::LogicalVolume { name, parent, format, size, thin } => {
                let parent_kind = self.node(parent)?.kind;
                let kind = match (thin, parent_kind) {
                    (None, DeviceKind::VolumeGroup) => DeviceKind::LogicalVolume,
                    (Some(ThinRole::Pool { .. }), DeviceKind::VolumeGroup) => DeviceKind::ThinPool,
                    (Some(ThinRole::Volume), DeviceKind::ThinPool) => DeviceKind::ThinVolume,
                    _ => {
                        return Err(StorageError::Unsupported(format!(
                            "cannot allocate a logical volume from a {}",
                            parent_kind
                        )));
                    }
                };
                let vg = if kind == DeviceKind::ThinVolume {
                    self.node(parent)?.parents.first().copied().unwrap_or(parent)
                } else {
                    parent
                };
                let lv = name.unwrap_or_else(|| format!("lv{:02}", self.next_serial()));
                let full = format!("{}-{}", self.vg_name(vg), lv);
                let base = match size {
                    LvSize::Fixed { size_mib, .. } => size_mib,
                    LvSize::Percent(_) => 0,
                };
                let mut node = Node::new(&full, kind, false)
                    .sized(base)
                    .with_path(format!("/dev/mapper/{}", full))
                    .with_parents(vec![parent]);
                node.format = format;
                node.lv_size = Some(size);
                node
            }
            DeviceRequest::Btrfs { name, subvol, members, format, data_level, metadata_level } => {
                self.check_parents(&members)?;
                if subvol {
                    let volume = members.first().copied().ok_or_else(|| {
                        StorageError::Unsupported("btrfs subvolume without a volume".to_string())
                    })?;
                    if self.node(volume)?.kind != DeviceKind::BtrfsVolume {
                        return Err(StorageError::Unsupported(
                            "btrfs subvolumes must be created inside a btrfs volume".to_string(),
                        ));
                    }
                    let name = name.unwrap_or_else(|| format!("subvol{}", self.next_serial()));
                    let path = format!("btrfs:{}/{}", self.nodes[volume.0].name, name);
                    let mut node = Node::new(&name, DeviceKind::BtrfsSubvolume, false)
                        .with_path(path)
                        .with_parents(vec![volume]);
                    node.format = format;
                    node
                } else {
                    let name = name.unwrap_or_else(|| format!("btrfs.{}", self.next_serial()));
                    let mut node = Node::new(&name, DeviceKind::BtrfsVolume, false)
                        .with_path(format!("btrfs:{}", name))
                        .with_parents(members);
                    node.format = format;
                    node.format.fs_profile = match (data_level, metadata_level) {
                        (None, None) => None,
                        (d, m) => Some(format!(
                            "data={},metadata={}",
                            d.map_or("default".to_string(), |l| l.to_string()),
                            m.map_or("default".to_string(), |l| l.to_string()),
                        )),
                    };
                    node
                }
            }
            DeviceRequest::Luks { parent, format } => {
                self.node(parent)?;
                let name = format!("luks{}", self.next_serial());
                let mut node = Node::new(&name, DeviceKind::Luks, false)
                    .with_path(format!("/dev/mapper/{}", name))
                    .with_parents(vec![parent]);
                node.format = format;
                node
            }
        };

        let id = self.push(node);
        self.log_create(id);
        debug!("created {} {}", self.nodes[id.0].kind, self.nodes[id.0].name);
        Ok(id)
    }

    fn destroy_device(&mut self, id: DeviceId) -> StorageResult<()> {
        let node = self.node(id)?;
        if node.kind == DeviceKind::Disk {
            return Err(StorageError::Unsupported(format!("cannot destroy disk {}", node.name)));
        }
        if node.protected {
            return Err(StorageError::Unsupported(format!("device {} is protected", node.name)));
        }
        if !self.children(id).is_empty() {
            return Err(StorageError::HasDependents { name: node.name.clone() });
        }
        self.remove_node(id);
        Ok(())
    }

    fn resize_device(&mut self, id: DeviceId, size_mib: u64) -> StorageResult<()> {
        let node = self.node_mut(id)?;
        if !node.exists || size_mib == 0 {
            return Err(StorageError::InvalidSize { name: node.name.clone(), size_mib });
        }
        node.size_mib = size_mib;
        let name = node.name.clone();
        self.log.push(StorageAction::ResizeDevice { device: id, name, size_mib });
        Ok(())
    }

    fn create_format(&mut self, id: DeviceId, format: Format) -> StorageResult<()> {
        // A new format supersedes one that is still pending
        self.log.cancel_format(id);
        let node = self.node_mut(id)?;
        let kind = format.kind;
        node.format = format;
        node.format_exists = false;
        let name = node.name.clone();
        if let Some(kind) = kind {
            self.log.push(StorageAction::CreateFormat { device: id, name, format: kind.to_string() });
        }
        Ok(())
    }

    fn destroy_format(&mut self, id: DeviceId) -> StorageResult<()> {
        let node = self.node_mut(id)?;
        let previous = node.format.kind;
        let existed = node.format_exists;
        node.format = Format::default();
        node.format_exists = false;
        let name = node.name.clone();
        match previous {
            Some(kind) if existed => {
                self.log.push(StorageAction::DestroyFormat { device: id, name, format: kind.to_string() });
            }
            Some(_) => self.log.cancel_format(id),
            None => {}
        }
        Ok(())
    }

    fn resize_format(&mut self, id: DeviceId, size_mib: u64) -> StorageResult<()> {
        let node = self.node(id)?;
        let resizable = node.format.kind.is_some_and(FormatType::is_resizable);
        if !node.format_exists || !resizable {
            return Err(StorageError::Unsupported(format!(
                "format on {} cannot be resized",
                node.name
            )));
        }
        let name = node.name.clone();
        self.log.push(StorageAction::ResizeFormat { device: id, name, size_mib });
        Ok(())
    }

    fn replace_format(&mut self, id: DeviceId, format: Format) -> StorageResult<()> {
        let node = self.node(id)?;
        if node.exists {
            return Err(StorageError::Unsupported(format!(
                "{} already exists; destroy its format instead of replacing it",
                node.name
            )));
        }
        self.log.cancel_format(id);
        self.create_format(id, format)
    }

    fn set_mount(
        &mut self,
        id: DeviceId,
        mountpoint: Option<String>,
        mount_options: Option<String>,
    ) -> StorageResult<()> {
        let node = self.node_mut(id)?;
        node.format.mountpoint = mountpoint;
        node.format.mount_options = mount_options;
        Ok(())
    }

    fn apply_disk_filter(&mut self, filter: &DiskFilter) -> StorageResult<()> {
        for id in filter.ignored.iter().chain(filter.only_use.iter()) {
            self.node(*id)?;
        }
        for i in 0..self.nodes.len() {
            if self.nodes[i].kind != DeviceKind::Disk || self.nodes[i].removed {
                continue;
            }
            let id = DeviceId(i);
            let hidden = filter.ignored.contains(&id)
                || (!filter.only_use.is_empty() && !filter.only_use.contains(&id));
            if hidden {
                info!("hiding disk {}", self.nodes[i].name);
            }
            self.nodes[i].hidden = hidden;
        }
        Ok(())
    }

    fn clear_partitions(&mut self, policy: &ClearPartPolicy) -> StorageResult<()> {
        self.clear_policy = policy.clone();

        if policy.kind == ClearPartType::List {
            for id in &policy.devices {
                if self.is_visible(*id) && !self.nodes[id.0].protected {
                    self.remove_tree(*id);
                }
            }
        }

        let disks: Vec<DeviceId> = self
            .disks()
            .into_iter()
            .filter(|d| policy.disks.is_empty() || policy.disks.contains(d))
            .filter(|d| !self.nodes[d.0].protected)
            .collect();

        for disk in disks {
            let doomed: Vec<DeviceId> = match policy.kind {
                ClearPartType::All => self.partitions_on(disk),
                ClearPartType::Linux => self
                    .partitions_on(disk)
                    .into_iter()
                    .filter(|p| self.nodes[p.0].format.kind.is_some_and(FormatType::is_linux_native))
                    .collect(),
                ClearPartType::None | ClearPartType::List => Vec::new(),
            };
            for part in doomed {
                info!("clearing {}", self.nodes[part.0].name);
                self.remove_tree(part);
            }

            let emptied = self.partitions_on(disk).is_empty();
            let relabel = self.nodes[disk.0].partitionable
                && (policy.initialize_disks
                    || (policy.kind == ClearPartType::All && emptied)
                    || (!self.nodes[disk.0].partitioned && self.should_clear(disk)));
            if relabel && emptied {
                let node = &mut self.nodes[disk.0];
                node.partitioned = true;
                let name = node.name.clone();
                self.log.push(StorageAction::CreateFormat {
                    device: disk,
                    name,
                    format: "disklabel".to_string(),
                });
            }
        }
        Ok(())
    }

    fn auto_partition(&mut self, plan: &AutoPartPlan) -> StorageResult<()> {
        let swap_mib = sizing::swap_suggestion(
            self.total_memory_mib(),
            Some(self.usable_disk_space_mib()),
            false,
        );
        let input = LayoutInput {
            kind: plan.kind,
            uefi: self.inventory.uefi,
            encrypted: plan.encryption.is_some(),
            default_fs: self.default_fs_type(),
            boot_fs: self.default_boot_fs_type(),
            swap_mib,
        };
        let layout = autopart::default_layout(&input);
        info!("automatic partitioning: {} ({})", plan.kind, layout.mountpoints().join(", "));
        self.apply_layout(&layout, plan.encryption.as_ref())?;
        self.do_partitioning()?;
        self.grow_lvm()
    }

    fn do_partitioning(&mut self) -> StorageResult<()> {
        let eligible = self.eligible_disks();
        let mut free: BTreeMap<DeviceId, u64> = BTreeMap::new();
        for disk in &eligible {
            let used: u64 = self
                .partitions_on(*disk)
                .into_iter()
                .filter(|p| self.nodes[p.0].exists)
                .map(|p| self.nodes[p.0].size_mib)
                .sum();
            free.insert(*disk, self.nodes[disk.0].size_mib.saturating_sub(DISK_LABEL_MIB + used));
        }

        let requests: Vec<DeviceId> = (0..self.nodes.len())
            .map(DeviceId)
            .filter(|id| {
                let n = &self.nodes[id.0];
                n.kind == DeviceKind::Partition && !n.exists && !n.removed && n.growth.is_some()
            })
            .collect();

        // Base sizes, first fit in declaration order
        let mut placed: Vec<(DeviceId, DeviceId)> = Vec::new();
        for id in &requests {
            let Some(growth) = self.nodes[id.0].growth.clone() else {
                continue;
            };
            let candidates: Vec<DeviceId> = if growth.candidates.is_empty() {
                eligible.clone()
            } else {
                growth.candidates.iter().copied().filter(|d| eligible.contains(d)).collect()
            };
            let disk = candidates
                .into_iter()
                .find(|d| free.get(d).is_some_and(|f| *f >= growth.base_mib))
                .ok_or_else(|| {
                    StorageError::Allocation(format!(
                        "not enough free space on disks for {} ({} MiB)",
                        self.nodes[id.0].name, growth.base_mib
                    ))
                })?;
            if let Some(f) = free.get_mut(&disk) {
                *f -= growth.base_mib;
            }
            let node = &mut self.nodes[id.0];
            node.parents = vec![disk];
            node.size_mib = growth.base_mib;
            placed.push((*id, disk));
        }

        // Growth, per disk
        for disk in &eligible {
            let mut growers: Vec<(usize, u64, Option<u64>)> = placed
                .iter()
                .filter(|(_, d)| d == disk)
                .filter_map(|(id, _)| {
                    let g = self.nodes[id.0].growth.as_ref()?;
                    g.grow.then_some((id.0, g.base_mib, g.max_mib))
                })
                .collect();
            distribute(&mut growers, free.get(disk).copied().unwrap_or(0));
            for (idx, size, _) in growers {
                self.nodes[idx].size_mib = size;
            }
        }

        // Naming
        for disk in &eligible {
            let mut next = self
                .partitions_on(*disk)
                .into_iter()
                .filter(|p| self.nodes[p.0].exists)
                .filter_map(|p| partition_number(&self.nodes[p.0].name))
                .max()
                .unwrap_or(0)
                + 1;
            let disk_name = self.nodes[disk.0].name.clone();
            for (id, _) in placed.iter().filter(|(_, d)| d == disk) {
                let name = partition_name(&disk_name, next);
                next += 1;
                let node = &mut self.nodes[id.0];
                node.path = format!("/dev/{}", name);
                node.name = name;
            }
        }
        debug!("partition layout solved for {} requests", placed.len());
        Ok(())
    }

    fn grow_lvm(&mut self) -> StorageResult<()> {
        let vgs: Vec<DeviceId> = self
            .devices()
            .into_iter()
            .filter(|id| self.nodes[id.0].kind == DeviceKind::VolumeGroup)
            .collect();

        for vg in vgs {
            let extent = extent_mib(self.nodes[vg.0].pe_size_kib);
            let total = self.effective_size(vg);
            let reserved = match self.nodes[vg.0].reserved {
                Some(Reserved::SpaceMib(mib)) => mib,
                Some(Reserved::Percent(p)) => total * u64::from(p) / 100,
                None => 0,
            };
            let available = total.saturating_sub(reserved);

            let lvs: Vec<DeviceId> = self
                .children(vg)
                .into_iter()
                .filter(|c| matches!(self.nodes[c.0].kind, DeviceKind::LogicalVolume | DeviceKind::ThinPool))
                .collect();

            let mut used = 0u64;
            let mut growers = Vec::new();
            for lv in &lvs {
                let node = &self.nodes[lv.0];
                let size = match (node.exists, node.lv_size) {
                    (true, _) | (false, None) => node.size_mib,
                    (false, Some(LvSize::Fixed { size_mib, grow, max_size_mib })) => {
                        let size = sizing::round_up_to_extent(size_mib, extent);
                        if grow {
                            growers.push((lv.0, size, max_size_mib));
                        }
                        size
                    }
                    (false, Some(LvSize::Percent(p))) => {
                        sizing::round_down_to_extent(available * u64::from(p) / 100, extent)
                    }
                };
                self.nodes[lv.0].size_mib = size;
                used = used.saturating_add(size);
            }

            if used > available {
                return Err(StorageError::Allocation(format!(
                    "not enough free space in volume group {}: need {} MiB, have {} MiB",
                    self.nodes[vg.0].name, used, available
                )));
            }

            let remaining = sizing::round_down_to_extent(available - used, extent);
            distribute(&mut growers, remaining);
            for (idx, size, _) in growers {
                self.nodes[idx].size_mib = sizing::round_down_to_extent(size, extent);
            }
        }
        Ok(())
    }

    fn sanity_check(&self) -> StorageResult<Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match self.mountpoint_owner("/") {
            None => warnings.push("no root file system is defined".to_string()),
            Some(root) => {
                let kind = self.nodes[root.0].format.kind;
                let ok = kind.is_some_and(|k| {
                    k.is_filesystem() && !matches!(k, FormatType::Vfat | FormatType::Efi | FormatType::Tmpfs)
                });
                if !ok {
                    errors.push(format!(
                        "the root file system cannot use format {}",
                        kind.map_or("none".to_string(), |k| k.to_string())
                    ));
                }
            }
        }

        if self.inventory.uefi {
            let esp = self
                .mountpoint_owner("/boot/efi")
                .is_some_and(|id| self.nodes[id.0].format.is(FormatType::Efi));
            if !esp {
                warnings.push("no EFI System Partition is mounted at /boot/efi".to_string());
            }
        }

        if !self.devices().iter().any(|id| self.nodes[id.0].format.is(FormatType::Swap)) {
            warnings.push("no swap space is defined".to_string());
        }

        for id in self.devices() {
            let node = &self.nodes[id.0];
            if node.kind == DeviceKind::Partition && !node.exists && node.parents.is_empty() {
                errors.push(format!("partition {} was never allocated", node.name));
            }
            let missing_passphrase = node
                .format
                .luks
                .as_ref()
                .is_some_and(|l| l.passphrase.is_none());
            if !node.format_exists && missing_passphrase {
                warnings.push(format!("no passphrase is set for the encrypted device {}", node.name));
            }
        }

        for w in &warnings {
            warn!("sanity check: {}", w);
        }
        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(StorageError::Sanity(errors))
        }
    }

    fn configure_bootloader(&mut self, placement: BootloaderPlacement) -> StorageResult<()> {
        for id in placement.disk_order.iter().chain(placement.stage1_disk.iter()) {
            let node = self.node(*id)?;
            if node.kind != DeviceKind::Disk {
                return Err(StorageError::Unsupported(format!(
                    "{} is not a disk and cannot hold the bootloader",
                    node.name
                )));
            }
        }
        self.bootloader = Some(placement);
        Ok(())
    }

    fn set_up_bootloader(&mut self) -> StorageResult<()> {
        let placement = self.bootloader.clone().ok_or(StorageError::NoBootloaderPlacement)?;
        if placement.skip {
            self.stage1_target = None;
            info!("bootloader installation skipped");
            return Ok(());
        }

        let target = if self.inventory.uefi {
            self.mountpoint_owner("/boot/efi")
                .filter(|id| self.nodes[id.0].format.is(FormatType::Efi))
                .ok_or_else(|| {
                    StorageError::Sanity(vec!["no EFI System Partition for the bootloader".to_string()])
                })?
        } else {
            match placement.stage1_location.unwrap_or_default() {
                Stage1Location::Partition => self
                    .mountpoint_owner("/boot")
                    .or_else(|| self.mountpoint_owner("/"))
                    .ok_or_else(|| {
                        StorageError::Sanity(vec!["no boot partition for the bootloader".to_string()])
                    })?,
                Stage1Location::Mbr | Stage1Location::None => placement
                    .stage1_disk
                    .or_else(|| placement.disk_order.first().copied())
                    .or_else(|| self.eligible_disks().first().copied())
                    .ok_or_else(|| {
                        StorageError::Sanity(vec!["no disk available for the bootloader".to_string()])
                    })?,
            }
        };
        info!("bootloader stage1 target: {}", self.nodes[target.0].name);
        self.stage1_target = Some(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(name: &str, size_mib: u64) -> InventoryDisk {
        InventoryDisk {
            name: name.to_string(),
            size_mib,
            partitioned: true,
            read_only: false,
            protected: false,
            partitions: Vec::new(),
        }
    }

    fn part(name: &str, size_mib: u64, format: Option<FormatType>) -> InventoryPartition {
        InventoryPartition {
            name: name.to_string(),
            size_mib,
            format,
            label: None,
            uuid: None,
            partuuid: None,
            partlabel: None,
        }
    }

    fn engine_with(disks: Vec<InventoryDisk>) -> MemoryEngine {
        let inventory = Inventory { disks, ..Inventory::default() };
        MemoryEngine::from_inventory(inventory).expect("inventory should load") // test: known-good input
    }

    fn new_partition(size: u64, grow: bool, mountpoint: &str) -> DeviceRequest {
        DeviceRequest::Partition {
            req_name: None,
            format: Format::new(FormatType::Xfs).with_mountpoint(mountpoint),
            size_mib: Some(size),
            grow,
            max_size_mib: None,
            primary: false,
            disks: Vec::new(),
        }
    }

    #[test]
    fn test_partition_name_nvme() {
        assert_eq!(partition_name("sda", 1), "sda1");
        assert_eq!(partition_name("nvme0n1", 2), "nvme0n1p2");
        assert_eq!(partition_name("mmcblk0", 1), "mmcblk0p1");
        assert_eq!(partition_number("nvme0n1p12"), Some(12));
        assert_eq!(partition_number("sda"), None);
    }

    #[test]
    fn test_inventory_unknown_member_rejected() {
        let inventory = Inventory {
            disks: vec![disk("sda", 1000)],
            volume_groups: vec![InventoryVolumeGroup {
                name: "vg".to_string(),
                pvs: vec!["sdz1".to_string()],
                pe_size_kib: DEFAULT_PE_SIZE_KIB,
                lvs: Vec::new(),
            }],
            ..Inventory::default()
        };
        let err = MemoryEngine::from_inventory(inventory).expect_err("unknown pv must fail");
        assert!(matches!(err, StorageError::Inventory(_)));
    }

    #[test]
    fn test_resolve_by_path_uuid_and_label() {
        let mut sda = disk("sda", 10_000);
        let mut p1 = part("sda1", 500, Some(FormatType::Ext4));
        p1.uuid = Some("1234-abcd".to_string());
        p1.label = Some("boot".to_string());
        sda.partitions.push(p1);
        let engine = engine_with(vec![sda]);

        let by_path = engine.resolve_device("/dev/sda1");
        assert!(by_path.is_some());
        assert_eq!(engine.resolve_device("UUID=1234-abcd"), by_path);
        assert_eq!(engine.resolve_device("LABEL=boot"), by_path);
        assert_eq!(engine.resolve_device("/dev/disk/by-label/boot"), by_path);
        assert_eq!(engine.resolve_device("/dev/sdb"), None);
    }

    #[test]
    fn test_resolve_by_partuuid_and_partlabel() {
        let mut sda = disk("sda", 10_000);
        sda.partitions.push(part("sda1", 500, Some(FormatType::Efi)));
        let mut p2 = part("sda2", 4000, Some(FormatType::Xfs));
        p2.partuuid = Some("5e1f-02".to_string());
        p2.partlabel = Some("system".to_string());
        sda.partitions.push(p2);
        let engine = engine_with(vec![sda]);

        let sda2 = engine.device_by_name("sda2");
        assert!(sda2.is_some());
        assert_eq!(engine.resolve_device("PARTUUID=5e1f-02"), sda2);
        assert_eq!(engine.resolve_device("PARTLABEL=system"), sda2);
        assert_eq!(engine.resolve_device("/dev/disk/by-partuuid/5e1f-02"), sda2);
        assert_eq!(engine.resolve_device("/dev/disk/by-partlabel/system"), sda2);
        assert_eq!(engine.resolve_device("PARTLABEL=missing"), None);
        // a partition label is not a filesystem label
        assert_eq!(engine.resolve_device("LABEL=system"), None);
    }

    #[test]
    fn test_destroy_with_children_is_refused() {
        let engine_inv = Inventory {
            disks: vec![{
                let mut d = disk("sda", 10_000);
                d.partitions.push(part("sda1", 5000, Some(FormatType::LvmPv)));
                d
            }],
            volume_groups: vec![InventoryVolumeGroup {
                name: "vg".to_string(),
                pvs: vec!["sda1".to_string()],
                pe_size_kib: DEFAULT_PE_SIZE_KIB,
                lvs: Vec::new(),
            }],
            ..Inventory::default()
        };
        let mut engine = MemoryEngine::from_inventory(engine_inv).expect("inventory"); // test: known-good input
        let sda1 = engine.device_by_name("sda1").expect("sda1 present");
        let err = engine.destroy_device(sda1).expect_err("pv with vg on top");
        assert!(matches!(err, StorageError::HasDependents { .. }));
    }

    #[test]
    fn test_destroying_pending_request_cancels_its_actions() {
        let mut engine = engine_with(vec![disk("sda", 10_000)]);
        let id = engine.create_device(new_partition(1000, false, "/data")).expect("create");
        assert_eq!(engine.actions().len(), 2);
        engine.destroy_device(id).expect("destroy");
        assert!(engine.actions().is_empty());
        assert!(engine.device(id).is_none());
    }

    #[test]
    fn test_do_partitioning_first_fit_and_growth() {
        let mut engine = engine_with(vec![disk("sda", 2001), disk("sdb", 10_001)]);
        let a = engine.create_device(new_partition(1500, false, "/a")).expect("a");
        let b = engine.create_device(new_partition(1000, true, "/b")).expect("b");
        engine.do_partitioning().expect("layout fits");

        let a = engine.device(a).expect("a");
        let b = engine.device(b).expect("b");
        assert_eq!(a.name, "sda1");
        assert_eq!(a.size_mib, 1500);
        // 500 MiB left on sda is too small for b, so it lands on sdb and grows
        assert_eq!(b.name, "sdb1");
        assert_eq!(b.size_mib, 10_000);
        // Requests stay addressable under their request name
        assert_eq!(engine.device_by_name("req1"), Some(b.id));
    }

    #[test]
    fn test_do_partitioning_out_of_space() {
        let mut engine = engine_with(vec![disk("sda", 1000)]);
        engine.create_device(new_partition(4000, false, "/big")).expect("request");
        let err = engine.do_partitioning().expect_err("does not fit");
        assert!(matches!(err, StorageError::Allocation(_)));
    }

    #[test]
    fn test_new_partitions_numbered_after_existing() {
        let mut sda = disk("sda", 10_000);
        sda.partitions.push(part("sda1", 500, Some(FormatType::Vfat)));
        sda.partitions.push(part("sda3", 500, Some(FormatType::Ext4)));
        let mut engine = engine_with(vec![sda]);
        let id = engine.create_device(new_partition(1000, false, "/x")).expect("request");
        engine.do_partitioning().expect("fits");
        assert_eq!(engine.device(id).expect("x").name, "sda4");
    }

    #[test]
    fn test_clearpart_linux_keeps_foreign_partitions() {
        let mut sda = disk("sda", 10_000);
        sda.partitions.push(part("sda1", 500, Some(FormatType::Vfat)));
        sda.partitions.push(part("sda2", 500, Some(FormatType::Ext4)));
        let mut engine = engine_with(vec![sda]);
        engine
            .clear_partitions(&ClearPartPolicy { kind: ClearPartType::Linux, ..Default::default() })
            .expect("clear");
        assert!(engine.device_by_name("sda1").is_some());
        assert!(engine.device_by_name("sda2").is_none());
        assert!(engine
            .actions()
            .actions()
            .iter()
            .any(|a| matches!(a, StorageAction::DestroyDevice { name, .. } if name == "sda2")));
    }

    #[test]
    fn test_clearpart_all_relabels_unpartitioned_disk() {
        let mut sdb = disk("sdb", 10_000);
        sdb.partitioned = false;
        let mut engine = engine_with(vec![sdb]);
        let sdb = engine.device_by_name("sdb").expect("sdb");
        assert!(!engine.device(sdb).expect("info").partitioned);
        engine
            .clear_partitions(&ClearPartPolicy { kind: ClearPartType::All, ..Default::default() })
            .expect("clear");
        assert!(engine.device(sdb).expect("info").partitioned);
        assert!(engine.should_clear(sdb));
    }

    #[test]
    fn test_disk_filter_hides_descendants() {
        let mut sda = disk("sda", 10_000);
        sda.partitions.push(part("sda1", 500, Some(FormatType::Ext4)));
        let mut engine = engine_with(vec![sda, disk("sdb", 10_000)]);
        let sda = engine.device_by_name("sda").expect("sda");
        engine
            .apply_disk_filter(&DiskFilter { ignored: vec![sda], only_use: Vec::new() })
            .expect("filter");
        assert_eq!(engine.disks().len(), 1);
        assert!(engine.device_by_name("sda1").is_none());
        assert!(engine.device(sda).expect("still known").hidden);
    }

    #[test]
    fn test_grow_lvm_fixed_percent_and_grow() {
        let mut engine = engine_with(vec![disk("sda", 10_001)]);
        let pv = engine
            .create_device(DeviceRequest::Partition {
                req_name: Some("pv.01".to_string()),
                format: Format::new(FormatType::LvmPv),
                size_mib: Some(1000),
                grow: true,
                max_size_mib: None,
                primary: false,
                disks: Vec::new(),
            })
            .expect("pv");
        engine.do_partitioning().expect("layout");
        let vg = engine
            .create_device(DeviceRequest::VolumeGroup {
                name: Some("sys".to_string()),
                pvs: vec![pv],
                pe_size_kib: DEFAULT_PE_SIZE_KIB,
                reserved: Some(Reserved::SpaceMib(1000)),
            })
            .expect("vg");
        let lv = |name: &str, size: LvSize| DeviceRequest::LogicalVolume {
            name: Some(name.to_string()),
            parent: vg,
            format: Format::new(FormatType::Xfs),
            size,
            thin: None,
        };
        let fixed = engine
            .create_device(lv("root", LvSize::Fixed { size_mib: 4097, grow: false, max_size_mib: None }))
            .expect("root");
        let pct = engine.create_device(lv("var", LvSize::Percent(10))).expect("var");
        let grow = engine
            .create_device(lv("home", LvSize::Fixed { size_mib: 100, grow: true, max_size_mib: Some(2000) }))
            .expect("home");
        engine.grow_lvm().expect("fits");

        assert_eq!(engine.device(vg).expect("vg").size_mib, 10_000);
        assert_eq!(engine.device(fixed).expect("root").size_mib, 4100);
        assert_eq!(engine.device(pct).expect("var").size_mib, 900);
        assert_eq!(engine.device(grow).expect("home").size_mib, 2000);
        assert_eq!(engine.device(fixed).expect("root").name, "sys-root");
    }

    #[test]
    fn test_grow_lvm_overcommit_fails() {
        let mut engine = engine_with(vec![disk("sda", 2001)]);
        let pv = engine
            .create_device(DeviceRequest::Partition {
                req_name: None,
                format: Format::new(FormatType::LvmPv),
                size_mib: Some(2000),
                grow: false,
                max_size_mib: None,
                primary: false,
                disks: Vec::new(),
            })
            .expect("pv");
        engine.do_partitioning().expect("layout");
        let vg = engine
            .create_device(DeviceRequest::VolumeGroup {
                name: Some("vg".to_string()),
                pvs: vec![pv],
                pe_size_kib: DEFAULT_PE_SIZE_KIB,
                reserved: None,
            })
            .expect("vg");
        engine
            .create_device(DeviceRequest::LogicalVolume {
                name: Some("big".to_string()),
                parent: vg,
                format: Format::new(FormatType::Xfs),
                size: LvSize::Fixed { size_mib: 5000, grow: false, max_size_mib: None },
                thin: None,
            })
            .expect("lv request");
        let err = engine.grow_lvm().expect_err("overcommitted");
        assert!(err.to_string().contains("volume group vg"));
    }

    #[test]
    fn test_replace_format_on_existing_device_refused() {
        let mut sda = disk("sda", 10_000);
        sda.partitions.push(part("sda1", 500, Some(FormatType::Ext4)));
        let mut engine = engine_with(vec![sda]);
        let sda1 = engine.device_by_name("sda1").expect("sda1");
        assert!(engine.replace_format(sda1, Format::new(FormatType::Xfs)).is_err());
    }

    #[test]
    fn test_autopart_lvm_bios() {
        let mut engine = engine_with(vec![disk("sda", 40_001)]);
        engine
            .auto_partition(&AutoPartPlan { kind: crate::types::AutoPartType::Lvm, encryption: None })
            .expect("autopart");
        let root = engine.mountpoint_owner("/").expect("root claimed");
        let root = engine.device(root).expect("root");
        assert_eq!(root.kind, DeviceKind::LogicalVolume);
        assert_eq!(root.name, "system-root");
        assert!(engine.mountpoint_owner("/boot").is_some());
        assert!(engine.snapshot().iter().any(|d| d.format.is(FormatType::Swap)));
        assert!(engine.sanity_check().is_ok());
    }

    #[test]
    fn test_autopart_encrypted_btrfs_uefi() {
        let inventory = Inventory {
            disks: vec![disk("nvme0n1", 60_001)],
            uefi: true,
            ..Inventory::default()
        };
        let mut engine = MemoryEngine::from_inventory(inventory).expect("inventory"); // test: known-good input
        let luks = LuksSettings { passphrase: Some("secret".to_string()), ..LuksSettings::default() };
        engine
            .auto_partition(&AutoPartPlan { kind: crate::types::AutoPartType::Btrfs, encryption: Some(luks) })
            .expect("autopart");
        let esp = engine.mountpoint_owner("/boot/efi").expect("esp");
        assert_eq!(engine.device(esp).expect("esp").name, "nvme0n1p1");
        let home = engine.mountpoint_owner("/home").expect("home");
        assert_eq!(engine.device(home).expect("home").kind, DeviceKind::BtrfsSubvolume);
        let luks_count = engine
            .snapshot()
            .iter()
            .filter(|d| d.kind == DeviceKind::Luks)
            .count();
        assert_eq!(luks_count, 2);
    }

    #[test]
    fn test_set_up_bootloader_requires_placement() {
        let mut engine = engine_with(vec![disk("sda", 10_000)]);
        assert_eq!(engine.set_up_bootloader(), Err(StorageError::NoBootloaderPlacement));
        engine.configure_bootloader(BootloaderPlacement::default()).expect("placement");
        engine.set_up_bootloader().expect("mbr on first disk");
        assert_eq!(engine.stage1_target(), engine.device_by_name("sda"));
    }

    #[test]
    fn test_sanity_rejects_vfat_root() {
        let mut engine = engine_with(vec![disk("sda", 10_000)]);
        engine
            .create_device(DeviceRequest::Partition {
                req_name: None,
                format: Format::new(FormatType::Vfat).with_mountpoint("/"),
                size_mib: Some(1000),
                grow: false,
                max_size_mib: None,
                primary: false,
                disks: Vec::new(),
            })
            .expect("request");
        engine.do_partitioning().expect("layout");
        assert!(matches!(engine.sanity_check(), Err(StorageError::Sanity(_))));
    }
}
