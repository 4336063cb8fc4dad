//! Type-safe vocabularies for kickstart storage commands
//!
//! Closed sets of values (format types, clearing scopes, RAID levels, ...) are
//! Rust enums instead of strings, giving exhaustive matching and a single parse
//! point. Free-form fields that the handlers must reject with a domain error
//! (e.g. `--fstype`) stay strings in the requests and are parsed here.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Mount options of an EFI System Partition
pub const EFI_MOUNT_OPTIONS: &str = "defaults,uid=0,gid=0,umask=0077,shortname=winnt";

/// Format carried by a device: a filesystem or a membership/boot signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(try_from = "String", into = "String")]
#[strum(ascii_case_insensitive)]
pub enum FormatType {
    #[strum(serialize = "ext2")]
    Ext2,
    #[strum(serialize = "ext3")]
    Ext3,
    #[strum(serialize = "ext4")]
    Ext4,
    #[strum(serialize = "xfs")]
    Xfs,
    #[strum(serialize = "btrfs")]
    Btrfs,
    #[strum(serialize = "vfat")]
    Vfat,
    /// EFI System Partition
    #[strum(to_string = "efi", serialize = "EFI System Partition")]
    Efi,
    #[strum(to_string = "hfs+", serialize = "hfsplus")]
    HfsPlus,
    #[strum(serialize = "swap")]
    Swap,
    /// Software RAID member
    #[strum(serialize = "mdmember")]
    MdMember,
    /// LVM physical volume
    #[strum(serialize = "lvmpv")]
    LvmPv,
    /// LUKS container
    #[strum(serialize = "luks")]
    Luks,
    #[strum(serialize = "biosboot")]
    BiosBoot,
    #[strum(serialize = "prepboot")]
    PrepBoot,
    #[strum(serialize = "appleboot")]
    AppleBoot,
    #[strum(serialize = "tmpfs")]
    Tmpfs,
}

impl FormatType {
    /// Returns true for formats that hold files and can be mounted
    pub fn is_filesystem(self) -> bool {
        matches!(
            self,
            Self::Ext2
                | Self::Ext3
                | Self::Ext4
                | Self::Xfs
                | Self::Btrfs
                | Self::Vfat
                | Self::Efi
                | Self::HfsPlus
                | Self::Tmpfs
        )
    }

    /// Returns true for formats whose contents can be resized in place
    pub fn is_resizable(self) -> bool {
        matches!(
            self,
            Self::Ext2 | Self::Ext3 | Self::Ext4 | Self::Btrfs | Self::Swap | Self::LvmPv
        )
    }

    /// Mount options a format always gets when the request gives none
    pub fn default_mount_options(self) -> Option<&'static str> {
        match self {
            Self::Efi => Some(EFI_MOUNT_OPTIONS),
            _ => None,
        }
    }

    /// Formats considered "Linux" by `clearpart --linux`
    pub fn is_linux_native(self) -> bool {
        matches!(
            self,
            Self::Ext2
                | Self::Ext3
                | Self::Ext4
                | Self::Xfs
                | Self::Btrfs
                | Self::Swap
                | Self::MdMember
                | Self::LvmPv
                | Self::Luks
        )
    }
}

impl TryFrom<String> for FormatType {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FormatType> for String {
    fn from(value: FormatType) -> Self {
        value.to_string()
    }
}

/// Which existing devices `clearpart` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClearPartType {
    /// Remove nothing
    #[default]
    None,
    /// Remove every partition on the selected disks
    All,
    /// Remove only partitions carrying Linux formats
    Linux,
    /// Remove exactly the devices listed in `--list`
    List,
}

/// Layout produced by `autopart`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AutoPartType {
    Plain,
    #[default]
    Lvm,
    #[serde(rename = "thinp")]
    #[strum(serialize = "thinp")]
    ThinP,
    Btrfs,
}

/// Software RAID level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum RaidLevel {
    #[strum(to_string = "raid0", serialize = "0")]
    Raid0,
    #[strum(to_string = "raid1", serialize = "1")]
    Raid1,
    #[strum(to_string = "raid4", serialize = "4")]
    Raid4,
    #[strum(to_string = "raid5", serialize = "5")]
    Raid5,
    #[strum(to_string = "raid6", serialize = "6")]
    Raid6,
    #[strum(to_string = "raid10", serialize = "10")]
    Raid10,
}

impl RaidLevel {
    /// Minimum number of active members the level can be assembled from
    pub fn min_members(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 => 2,
            Self::Raid4 | Self::Raid5 => 3,
            Self::Raid6 | Self::Raid10 => 4,
        }
    }
}

/// BTRFS data/metadata profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BtrfsLevel {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
}

/// Where the bootloader's first stage goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage1Location {
    /// Master boot record / boot disk
    #[default]
    Mbr,
    /// The boot partition itself
    Partition,
    /// Do not install a bootloader
    None,
}

/// Prefix of a placeholder mount point (`raid.01`, `pv.01`, `btrfs.01`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlaceholderKind {
    Raid,
    Pv,
    Btrfs,
}

impl PlaceholderKind {
    /// Format a member device must carry to be used under this placeholder
    pub fn member_format(self) -> FormatType {
        match self {
            Self::Raid => FormatType::MdMember,
            Self::Pv => FormatType::LvmPv,
            Self::Btrfs => FormatType::Btrfs,
        }
    }
}

/// A placeholder mount point naming a member device that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub label: String,
}

impl Placeholder {
    /// Parse `raid.<label>`, `pv.<label>` or `btrfs.<label>`; anything else is not a placeholder.
    pub fn parse(mountpoint: &str) -> Option<Self> {
        let (prefix, label) = mountpoint.split_once('.')?;
        if label.is_empty() {
            return None;
        }
        let kind = prefix.parse::<PlaceholderKind>().ok()?;
        Some(Self { kind, label: label.to_string() })
    }

    /// Full symbolic name as written in the script (`pv.01`)
    pub fn name(&self) -> String {
        format!("{}.{}", self.kind, self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_format_type_parse_aliases() {
        assert_eq!("ext4".parse::<FormatType>().ok(), Some(FormatType::Ext4));
        assert_eq!("XFS".parse::<FormatType>().ok(), Some(FormatType::Xfs));
        assert_eq!(
            "EFI System Partition".parse::<FormatType>().ok(),
            Some(FormatType::Efi)
        );
        assert!("reiserfs4".parse::<FormatType>().is_err());
    }

    #[test]
    fn test_format_type_display_round_trip() {
        for fmt in FormatType::iter() {
            let parsed: FormatType = fmt.to_string().parse().expect("display must parse back");
            assert_eq!(parsed, fmt);
        }
    }

    #[test]
    fn test_format_type_serde_uses_display() {
        let json = serde_json::to_string(&FormatType::HfsPlus).expect("serialize");
        assert_eq!(json, "\"hfs+\"");
        let back: FormatType = serde_json::from_str("\"lvmpv\"").expect("deserialize");
        assert_eq!(back, FormatType::LvmPv);
    }

    #[test]
    fn test_linux_native_formats() {
        assert!(FormatType::Ext4.is_linux_native());
        assert!(FormatType::LvmPv.is_linux_native());
        assert!(!FormatType::Vfat.is_linux_native());
        assert!(!FormatType::Efi.is_linux_native());
    }

    #[test]
    fn test_raid_level_parse() {
        assert_eq!("raid1".parse::<RaidLevel>().ok(), Some(RaidLevel::Raid1));
        assert_eq!("5".parse::<RaidLevel>().ok(), Some(RaidLevel::Raid5));
        assert_eq!(RaidLevel::Raid10.to_string(), "raid10");
        assert_eq!(RaidLevel::Raid6.min_members(), 4);
    }

    #[test]
    fn test_placeholder_parse() {
        let p = Placeholder::parse("pv.01").expect("pv placeholder");
        assert_eq!(p.kind, PlaceholderKind::Pv);
        assert_eq!(p.label, "01");
        assert_eq!(p.name(), "pv.01");

        assert_eq!(
            Placeholder::parse("raid.root").map(|p| p.kind),
            Some(PlaceholderKind::Raid)
        );
        assert!(Placeholder::parse("/home").is_none());
        assert!(Placeholder::parse("pv.").is_none());
        assert!(Placeholder::parse("lvm.01").is_none());
    }

    #[test]
    fn test_placeholder_member_format() {
        assert_eq!(PlaceholderKind::Raid.member_format(), FormatType::MdMember);
        assert_eq!(PlaceholderKind::Pv.member_format(), FormatType::LvmPv);
        assert_eq!(PlaceholderKind::Btrfs.member_format(), FormatType::Btrfs);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(ClearPartType::default(), ClearPartType::None);
        assert_eq!(AutoPartType::default(), AutoPartType::Lvm);
        assert_eq!(Stage1Location::default(), Stage1Location::Mbr);
        assert_eq!(AutoPartType::ThinP.to_string(), "thinp");
    }
}
