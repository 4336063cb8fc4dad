//! Size helpers shared by the handlers and the in-memory engine.

/// Largest physical extent size LVM accepts (16 GiB, in KiB)
pub const MAX_PE_SIZE_KIB: u64 = 16 * 1024 * 1024;

/// Default physical extent size (4 MiB, in KiB)
pub const DEFAULT_PE_SIZE_KIB: u64 = 4096;

/// Smallest extent size accepted from a `volgroup --pesize` request
pub const PE_SIZE_FLOOR_KIB: u64 = 1024;

const GIB: u64 = 1024;

/// Suggested swap size (MiB) for a machine with `memory_mib` of RAM.
///
/// Without hibernation the suggestion is capped at 10% of the usable disk
/// space; with hibernation the RAM size is added on top and no cap applies.
pub fn swap_suggestion(memory_mib: u64, disk_space_mib: Option<u64>, hibernation: bool) -> u64 {
    let mut swap = if memory_mib < 2 * GIB {
        2 * memory_mib
    } else if memory_mib < 8 * GIB {
        memory_mib
    } else if memory_mib < 64 * GIB {
        memory_mib / 2
    } else {
        4 * GIB
    };

    if hibernation {
        swap += memory_mib;
        return swap;
    }

    if let Some(space) = disk_space_mib {
        let cap = space / 10;
        if swap > cap {
            tracing::debug!("capping swap suggestion {} MiB to 10% of disk space ({} MiB)", swap, cap);
            swap = cap;
        }
    }
    swap
}

/// Physical extent sizes (KiB) LVM accepts, from `floor_kib` up to 16 GiB.
pub fn possible_physical_extents(floor_kib: u64) -> Vec<u64> {
    let mut extents = Vec::new();
    let mut size = 1u64;
    while size <= MAX_PE_SIZE_KIB {
        if size >= floor_kib {
            extents.push(size);
        }
        size *= 2;
    }
    extents
}

/// Round `size_mib` up to a whole number of extents. Sizes too large to round
/// up saturate at the largest representable multiple.
pub fn round_up_to_extent(size_mib: u64, extent_mib: u64) -> u64 {
    let extent = extent_mib.max(1);
    size_mib
        .div_ceil(extent)
        .checked_mul(extent)
        .unwrap_or(u64::MAX / extent * extent)
}

/// Round `size_mib` down to a whole number of extents.
pub fn round_down_to_extent(size_mib: u64, extent_mib: u64) -> u64 {
    let extent = extent_mib.max(1);
    size_mib / extent * extent
}
