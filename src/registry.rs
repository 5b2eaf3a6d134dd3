//! Mapping registry (component C).
//!
//! A sorted, non-overlapping interval set of tracked mappings, keyed by
//! `base_addr`. Drives [`crate::ll::is_pmem`] and
//! [`crate::mapping::deep_flush`].
//!
//! Mirrors `map_range_register`/`map_range_find`/`map_range_split`/
//! `map_range_unregister`/`map_range_is_pmem` from `libpmem`, which keep
//! the same invariant over an intrusive sorted queue instead of a
//! `BTreeMap`. A handful of live mappings is the expected case, so a
//! `BTreeMap` keyed by `base_addr` gives the ordered walk `find` needs
//! for free without reaching for an interval-tree crate.

use crate::error::{PmemError, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

bitflags::bitflags! {
    /// Flags carried by a [`MapTracker`] entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// The region is byte-addressable PM, not page-cache-backed.
        const DIRECT_MAPPED = 0x0001;
    }
}

/// One entry per tracked mapping: a half-open byte interval
/// `[base_addr, end_addr)` in process virtual address space, plus the
/// backing device identity needed to drive a deep flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapTracker {
    pub base_addr: usize,
    pub end_addr: usize,
    pub flags: MapFlags,
    /// Opaque backing-device identifier (`st_rdev` on Linux), or `None`
    /// if not applicable.
    pub device_id: Option<u64>,
    /// PM region identifier used to address
    /// `/sys/bus/nd/devices/region<N>/deep_flush`, or `None` if absent.
    pub region_id: Option<i32>,
}

impl MapTracker {
    fn len(&self) -> usize {
        self.end_addr - self.base_addr
    }
}

/// Ordered set of [`MapTracker`]s keyed by `base_addr`. A single
/// reader/writer lock covers the whole set: readers
/// (`find`/`is_pmem_range`/deep-flush walks) take a shared lock,
/// `register`/`unregister` take an exclusive one.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    entries: RwLock<BTreeMap<usize, MapTracker>>,
}

impl MappingRegistry {
    pub const fn new() -> Self {
        MappingRegistry {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the first tracked entry that at least partially overlaps
    /// `[addr, addr+len)`, or `None`.
    ///
    /// Walks entries in ascending `base_addr` order and stops as soon as
    /// an entry starts at or past `addr + len`, mirroring the original's
    /// early `break` when `addr < mt->base_addr`.
    pub fn find(&self, addr: usize, len: usize) -> Result<Option<MapTracker>> {
        let end = addr + len;
        let map = self.entries.read().map_err(|_| PmemError::Busy)?;
        for mt in map.values() {
            if addr < mt.end_addr && (addr >= mt.base_addr || end > mt.base_addr) {
                return Ok(Some(*mt));
            }
            if addr < mt.base_addr {
                break;
            }
        }
        Ok(None)
    }

    /// Registers `[addr, addr+len)` as a `DIRECT_MAPPED` mapping backed by
    /// `device_id`/`region_id`. Overlap with an existing entry is a
    /// programmer error, not a recoverable API state, and panics (the
    /// source asserts in the equivalent spot).
    pub fn register(
        &self,
        addr: usize,
        len: usize,
        device_id: Option<u64>,
        region_id: Option<i32>,
    ) -> Result<()> {
        let mut map = self.entries.write().map_err(|_| PmemError::Busy)?;
        assert!(
            !overlaps(&map, addr, len),
            "pmemcore: attempted to register an already-tracked range"
        );

        let mt = MapTracker {
            base_addr: addr,
            end_addr: addr + len,
            flags: MapFlags::DIRECT_MAPPED,
            device_id,
            region_id,
        };
        map.insert(addr, mt);
        log::trace!(
            "pmemcore: registered [{:#x}, {:#x})",
            mt.base_addr,
            mt.end_addr
        );
        Ok(())
    }

    /// Removes the tracked range `[addr, addr+len)`, splitting any entry
    /// that only partially overlaps it. `addr` and `addr+len` must be
    /// aligned to the system mapping granularity.
    ///
    /// Best-effort: fragments are computed before the original entry is
    /// removed, so a failure partway through never leaves the registry
    /// with a gap or a dangling overlap.
    pub fn unregister(&self, addr: usize, len: usize, align: usize) -> Result<()> {
        if addr % align != 0 || (addr + len) % align != 0 {
            return Err(PmemError::InvalidArgument(format!(
                "unmap range [{:#x}, {:#x}) is not aligned to {}",
                addr,
                addr + len,
                align
            )));
        }

        let end = addr + len;
        let mut map = self.entries.write().map_err(|_| PmemError::Busy)?;

        loop {
            let hit = map
                .values()
                .find(|mt| addr < mt.end_addr && (addr >= mt.base_addr || end > mt.base_addr))
                .copied();

            let Some(mt) = hit else {
                break;
            };

            let head = if addr > mt.base_addr {
                Some(MapTracker {
                    base_addr: mt.base_addr,
                    end_addr: addr.max(mt.base_addr).min(mt.end_addr),
                    flags: mt.flags,
                    device_id: mt.device_id,
                    region_id: mt.region_id,
                })
            } else {
                None
            };
            let tail = if end < mt.end_addr {
                Some(MapTracker {
                    base_addr: end.min(mt.end_addr).max(mt.base_addr),
                    end_addr: mt.end_addr,
                    flags: mt.flags,
                    device_id: mt.device_id,
                    region_id: mt.region_id,
                })
            } else {
                None
            };

            map.remove(&mt.base_addr);
            if let Some(h) = head {
                if h.base_addr < h.end_addr {
                    map.insert(h.base_addr, h);
                }
            }
            if let Some(t) = tail {
                if t.base_addr < t.end_addr {
                    map.insert(t.base_addr, t);
                }
            }
        }

        Ok(())
    }

    /// True iff every byte of `[addr, addr+len)` is covered by tracked
    /// ranges that have `DIRECT_MAPPED` set.
    pub fn is_pmem_range(&self, addr: usize, len: usize) -> Result<bool> {
        if len == 0 {
            return Ok(true);
        }
        let map = self.entries.read().map_err(|_| PmemError::Busy)?;
        let mut addr = addr;
        let mut len = len;
        loop {
            let Some(mt) = find_locked(&map, addr, len) else {
                return Ok(false);
            };
            if mt.base_addr > addr {
                return Ok(false);
            }
            if !mt.flags.contains(MapFlags::DIRECT_MAPPED) {
                return Ok(false);
            }
            let covered = (mt.end_addr - addr).min(len);
            len -= covered;
            addr += covered;
            if len == 0 {
                return Ok(true);
            }
        }
    }
}

fn find_locked(map: &BTreeMap<usize, MapTracker>, addr: usize, len: usize) -> Option<MapTracker> {
    let end = addr + len;
    for mt in map.values() {
        if addr < mt.end_addr && (addr >= mt.base_addr || end > mt.base_addr) {
            return Some(*mt);
        }
        if addr < mt.base_addr {
            break;
        }
    }
    None
}

fn overlaps(map: &BTreeMap<usize, MapTracker>, addr: usize, len: usize) -> bool {
    find_locked(map, addr, len).is_some()
}

static REGISTRY: MappingRegistry = MappingRegistry::new();

/// The process-wide mapping registry shared by [`crate::ll::is_pmem`],
/// [`crate::mapping::map_file`]/`unmap`, and [`crate::mapping::deep_flush`].
pub(crate) fn registry() -> &'static MappingRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_find_unregister_round_trip() {
        let reg = MappingRegistry::new();
        reg.register(0x1000, 0x4000, None, None).unwrap();

        assert!(reg.find(0x1000, 0x4000).unwrap().is_some());
        reg.unregister(0x1000, 0x4000, 0x1000).unwrap();
        assert!(reg.find(0x1000, 0x4000).unwrap().is_none());
    }

    #[test]
    fn is_pmem_matches_scenario_from_spec() {
        let reg = MappingRegistry::new();
        reg.register(0x1000, 0x4000, None, None).unwrap(); // [0x1000, 0x5000)

        assert!(reg.is_pmem_range(0x2000, 0x1000).unwrap());
        assert!(!reg.is_pmem_range(0x4000, 0x2000).unwrap());
    }

    #[test]
    fn unregister_interior_range_splits_into_two() {
        let reg = MappingRegistry::new();
        reg.register(0x1000, 0x4000, None, None).unwrap(); // [0x1000, 0x5000)

        reg.unregister(0x2000, 0x1000, 0x1000).unwrap(); // remove [0x2000, 0x3000)

        let left = reg.find(0x1000, 0x1000).unwrap().unwrap();
        assert_eq!((left.base_addr, left.end_addr), (0x1000, 0x2000));

        let right = reg.find(0x3000, 0x2000).unwrap().unwrap();
        assert_eq!((right.base_addr, right.end_addr), (0x3000, 0x5000));

        assert!(reg.find(0x2000, 0x1000).unwrap().is_none());
    }

    #[test]
    fn unregister_preserves_flags_and_device_identity_on_split() {
        let reg = MappingRegistry::new();
        reg.register(0x1000, 0x4000, Some(7), Some(2)).unwrap();

        reg.unregister(0x2000, 0x1000, 0x1000).unwrap();

        let left = reg.find(0x1000, 0x1000).unwrap().unwrap();
        assert_eq!(left.device_id, Some(7));
        assert_eq!(left.region_id, Some(2));
        assert!(left.flags.contains(MapFlags::DIRECT_MAPPED));
    }

    #[test]
    fn unregister_of_untracked_range_is_a_no_op() {
        let reg = MappingRegistry::new();
        // No entries at all: unregistering an untracked range is a no-op.
        reg.unregister(0x9000, 0x1000, 0x1000).unwrap();
    }

    #[test]
    fn unregister_unaligned_range_is_rejected() {
        let reg = MappingRegistry::new();
        reg.register(0x1000, 0x4000, None, None).unwrap();
        let err = reg.unregister(0x1001, 0x1000, 0x1000).unwrap_err();
        assert!(matches!(err, PmemError::InvalidArgument(_)));
    }

    #[test]
    fn entries_stay_disjoint_after_a_sequence_of_operations() {
        let reg = MappingRegistry::new();
        reg.register(0x0000, 0x10000, None, None).unwrap();
        reg.unregister(0x2000, 0x2000, 0x1000).unwrap();
        reg.unregister(0x6000, 0x1000, 0x1000).unwrap();
        reg.register(0x2000, 0x1000, None, None).unwrap();

        let map = reg.entries.read().unwrap();
        let mut prev_end: Option<usize> = None;
        for mt in map.values() {
            assert!(mt.base_addr < mt.end_addr);
            if let Some(pe) = prev_end {
                assert!(pe <= mt.base_addr, "overlapping or unsorted entries");
            }
            prev_end = Some(mt.end_addr);
        }
    }

    #[test]
    fn register_rejects_overlap() {
        let reg = MappingRegistry::new();
        reg.register(0x1000, 0x1000, None, None).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reg.register(0x1800, 0x1000, None, None)
        }));
        assert!(result.is_err());
    }
}
