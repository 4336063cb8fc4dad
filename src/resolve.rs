//! Device reference resolution
//!
//! Turns the device specs written in a script (`sda`, `/dev/sd*`,
//! `UUID=...`, `pv.01`) into engine device handles. Resolution is read-only.

use std::collections::BTreeSet;

use crate::context::AliasTable;
use crate::engine::{DeviceId, StorageEngine};

const TAGGED_PREFIXES: [&str; 4] = ["UUID=", "LABEL=", "PARTUUID=", "PARTLABEL="];

/// Put a spec into the device namespace.
///
/// Tagged specs (`UUID=`, `LABEL=`, `PARTUUID=`, `PARTLABEL=`) are kept as they are; anything else is
/// prefixed with `/dev/` if needed and normalized like a path.
pub fn normalize_spec(spec: &str) -> String {
    if TAGGED_PREFIXES.iter().any(|p| spec.starts_with(p)) {
        return spec.to_string();
    }
    let raw = if spec.starts_with("/dev/") {
        spec.to_string()
    } else {
        format!("/dev/{}", spec)
    };
    normalize_path(&raw)
}

/// Lexical path normalization (`//`, `.` and `..` components).
fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Every device a spec names.
///
/// Union of the glob expansion of the normalized spec over device paths and
/// the engine's direct lookup. Empty when nothing matches.
pub fn device_matches(engine: &dyn StorageEngine, spec: &str) -> BTreeSet<DeviceId> {
    let normalized = normalize_spec(spec);
    let mut matches = BTreeSet::new();

    if let Ok(pattern) = glob::Pattern::new(&normalized) {
        for id in engine.devices() {
            if let Some(info) = engine.device(id) {
                if pattern.matches(&info.path) {
                    matches.insert(id);
                }
            }
        }
    }

    if let Some(id) = engine.resolve_device(&normalized) {
        matches.insert(id);
    }
    matches
}

/// The device that was requested under symbolic name `name`.
pub fn lookup_alias(engine: &dyn StorageEngine, name: &str) -> Option<DeviceId> {
    engine.devices().into_iter().find(|id| {
        engine
            .device(*id)
            .is_some_and(|info| info.req_name.as_deref() == Some(name))
    })
}

/// Resolve one member/parent reference of a new device.
///
/// Precedence is fixed: direct engine lookup, then the run's alias table,
/// then the requested-name scan. The first hit wins.
pub fn resolve_member(engine: &dyn StorageEngine, aliases: &AliasTable, spec: &str) -> Option<DeviceId> {
    engine
        .resolve_device(&normalize_spec(spec))
        .or_else(|| aliases.get(spec).and_then(|name| engine.device_by_name(name)))
        .or_else(|| lookup_alias(engine, spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Inventory, InventoryDisk, InventoryPartition, MemoryEngine};
    use crate::types::FormatType;

    fn engine() -> MemoryEngine {
        let disk = |name: &str, parts: &[&str]| InventoryDisk {
            name: name.to_string(),
            size_mib: 20_000,
            partitioned: true,
            read_only: false,
            protected: false,
            partitions: parts
                .iter()
                .map(|p| InventoryPartition {
                    name: p.to_string(),
                    size_mib: 1000,
                    format: Some(FormatType::Ext4),
                    label: None,
                    uuid: Some(format!("uuid-{}", p)),
                    partuuid: Some(format!("part-{}", p)),
                    partlabel: None,
                })
                .collect(),
        };
        let inventory = Inventory {
            disks: vec![disk("sda", &["sda1", "sda2"]), disk("sdb", &[])],
            ..Inventory::default()
        };
        MemoryEngine::from_inventory(inventory).expect("inventory") // test: known-good input
    }

    #[test]
    fn test_normalize_spec() {
        assert_eq!(normalize_spec("sda"), "/dev/sda");
        assert_eq!(normalize_spec("/dev/sda"), "/dev/sda");
        assert_eq!(normalize_spec("disk/by-id/../../sdb"), "/dev/sdb");
        assert_eq!(normalize_spec("//dev//./sdc"), "/dev/sdc");
        assert_eq!(normalize_spec("UUID=abc"), "UUID=abc");
        assert_eq!(normalize_spec("LABEL=root"), "LABEL=root");
        assert_eq!(normalize_spec("PARTLABEL=esp"), "PARTLABEL=esp");
    }

    #[test]
    fn test_glob_expansion() {
        let engine = engine();
        let found = device_matches(&engine, "sda?");
        assert_eq!(found.len(), 2);
        let all = device_matches(&engine, "/dev/sd*");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_singleton_matches_direct_lookup() {
        let engine = engine();
        let direct = engine.resolve_device("/dev/sda2").expect("sda2");
        let found = device_matches(&engine, "sda2");
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![direct]);
    }

    #[test]
    fn test_uuid_spec_uses_direct_lookup() {
        let engine = engine();
        let found = device_matches(&engine, "UUID=uuid-sda1");
        assert_eq!(found.len(), 1);
        assert_eq!(found.first().copied(), engine.device_by_name("sda1"));
        let found = device_matches(&engine, "PARTUUID=part-sda2");
        assert_eq!(found.first().copied(), engine.device_by_name("sda2"));
    }

    #[test]
    fn test_no_match_is_empty() {
        let engine = engine();
        assert!(device_matches(&engine, "sdq").is_empty());
        assert!(device_matches(&engine, "UUID=nope").is_empty());
    }

    #[test]
    fn test_resolve_member_precedence() {
        let engine = engine();
        let mut aliases = AliasTable::default();
        aliases.register(1, "pv.01", "sdb").expect("first registration");
        // Direct lookup wins over the table
        assert_eq!(resolve_member(&engine, &aliases, "sda1"), engine.device_by_name("sda1"));
        assert_eq!(resolve_member(&engine, &aliases, "pv.01"), engine.device_by_name("sdb"));
        assert_eq!(resolve_member(&engine, &aliases, "pv.02"), None);
    }
}
