//! Mapping façade + deep flush (component D).
//!
//! `map_file`/`unmap` wrap the open/truncate/mmap dance and keep the
//! mapping registry in sync; `deep_flush` walks the registry to combine
//! page-cache `msync` with device-level "deep flush" for the ranges that
//! need it.
//!
//! The flag-validation rules and the deep-flush walk mirror
//! `pmem_map_fileU`/`pmem_unmap`/`pmem_deep_flush`/`range_deep_flush`
//! from `libpmem`.

use crate::error::{PmemError, Result};
use crate::ll::{msync_sync, page_size};
use crate::registry::{registry, MapTracker};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

bitflags::bitflags! {
    /// Flags accepted by [`map_file`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFileFlags: u32 {
        /// Create the file if it does not exist, and truncate it to `len`.
        const CREATE = 1 << 0;
        /// Fail instead of opening an existing file (requires `CREATE`).
        const EXCL = 1 << 1;
        /// Skip pre-allocating blocks for the new length (punches a hole
        /// instead of a fully-backed file).
        const SPARSE = 1 << 2;
        /// Create an unnamed temporary file in the directory named by
        /// `path` instead of opening `path` itself (requires `CREATE`).
        const TMPFILE = 1 << 3;
    }
}

const DAX_VALID_FLAGS: MapFileFlags =
    MapFileFlags::CREATE.union(MapFileFlags::SPARSE);

/// A successful [`map_file`] result.
#[derive(Debug)]
pub struct Mapping {
    addr: *mut u8,
    len: usize,
    is_pmem: bool,
}

// The mapping owns a raw allocation the OS gave us; moving a `Mapping`
// around threads is fine, only concurrent *use* of the pointer needs
// external synchronization.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Raw start address of the mapping.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Length in bytes actually mapped.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True iff this mapping is backed by byte-addressable PM (a DAX
    /// device, or a regular file the registry has otherwise confirmed is
    /// PM-backed).
    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }
}

fn is_device_dax(path: &Path) -> io::Result<bool> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.file_type().is_char_device() && meta.rdev() != 0)
}

/// Creates or opens `path` and maps `len` bytes of it shared,
/// read-write. See [`MapFileFlags`] for the accepted combinations.
///
/// On a DAX character device the mapping is registered with the
/// mapping registry so [`crate::ll::is_pmem`] and [`deep_flush`] can see
/// it; on a regular file no registration happens and `is_pmem` reports
/// whatever the dispatch table's `is_pmem_fn` says for an untracked
/// range (`false` under `detect`).
pub fn map_file(
    path: &Path,
    len: usize,
    flags: MapFileFlags,
    mode: u32,
) -> Result<Mapping> {
    let create = flags.contains(MapFileFlags::CREATE);
    let excl = flags.contains(MapFileFlags::EXCL);
    let sparse = flags.contains(MapFileFlags::SPARSE);
    let tmpfile = flags.contains(MapFileFlags::TMPFILE);

    let is_dax = is_device_dax(path).unwrap_or(false);

    let mut len = len;
    if is_dax {
        if !DAX_VALID_FLAGS.contains(flags) {
            return Err(PmemError::InvalidArgument(
                "flag unsupported for a DAX device".into(),
            ));
        }
        let actual = std::fs::metadata(path)?.len() as usize;
        if len != 0 && len != actual {
            return Err(PmemError::InvalidArgument(format!(
                "DAX device length must be 0 or the device size ({actual}), got {len}"
            )));
        }
        len = actual;
    } else {
        if tmpfile && !create {
            return Err(PmemError::InvalidArgument(
                "TMPFILE requires CREATE".into(),
            ));
        }
        if len != 0 && !create {
            return Err(PmemError::InvalidArgument(
                "non-zero len is not allowed without CREATE".into(),
            ));
        }
        if len == 0 && create {
            return Err(PmemError::InvalidArgument(
                "zero len is not allowed with CREATE".into(),
            ));
        }
    }

    let mut opts = OpenOptions::new();
    opts.read(true).write(true).mode(mode);

    let mut os_flags: libc::c_int = 0;
    if tmpfile && !is_dax {
        // An unnamed file created in the directory named by `path`,
        // linked into the filesystem only if `map_file` is given a name
        // for it later (not exposed by this API, matching the spec's
        // scope: callers that want TMPFILE get an anonymous backing file
        // for the lifetime of the mapping).
        os_flags |= libc::O_TMPFILE;
    } else if create && !is_dax {
        opts.create(true);
        if excl {
            os_flags |= libc::O_EXCL;
        }
    }
    if os_flags != 0 {
        opts.custom_flags(os_flags);
    }

    let owned_on_create = create && excl && !is_dax && !tmpfile;

    let file = match opts.open(path) {
        Ok(f) => f,
        Err(e) => return Err(e.into()),
    };

    let result = (|| -> Result<Mapping> {
        if create && !is_dax {
            file.set_len(len as u64)?;
            if !sparse {
                let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
                if rc != 0 {
                    return Err(io::Error::from_raw_os_error(rc).into());
                }
            }
        } else if !is_dax {
            len = file.metadata()?.len() as usize;
        }

        let mmap = unsafe { memmap2::MmapOptions::new().len(len).map_raw(&file)? };
        let addr = mmap.as_ptr() as *mut u8;
        // The mapping is now owned by this `Mapping` value; leak the
        // `MmapRaw` handle itself (it carries no Drop-significant state
        // beyond the kernel mapping, which `unmap` releases explicitly).
        std::mem::forget(mmap);

        let mut is_pmem = is_dax;
        if is_dax {
            let rdev = std::fs::metadata(path).ok().map(|m| m.rdev());
            let region_id = region_id_for_device(path);
            if let Err(e) = registry().register(addr as usize, len, rdev, region_id) {
                log::warn!("pmemcore: can't track mapped region: {e}");
            }
        } else {
            is_pmem = crate::ll::is_pmem(addr, len);
        }

        Ok(Mapping { addr, len, is_pmem })
    })();

    if result.is_err() && owned_on_create {
        let _ = std::fs::remove_file(path);
    }

    result
}

/// Reads the PM region number backing a DAX device from
/// `/sys/class/dax/daxN.M/device/../region_id`-style metadata. Returns
/// `None` when it cannot be determined; deep flush then degrades to a
/// plain `msync`.
fn region_id_for_device(path: &Path) -> Option<i32> {
    let canon = std::fs::canonicalize(path).ok()?;
    let name = canon.file_name()?.to_str()?;
    let region = name.strip_prefix("dax")?.split('.').next()?;
    region.parse().ok()
}

/// Unmaps `[addr, addr+len)` and removes it from the mapping registry
/// (a range with no tracked entry is a silent no-op, matching the
/// registry's own `unregister` contract).
///
/// # Safety
/// `addr` must be the base of a mapping obtained from [`map_file`], with
/// `len` equal to the length that mapping returned.
pub unsafe fn unmap(addr: *mut u8, len: usize) -> Result<()> {
    registry().unregister(addr as usize, len, page_size())?;
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Ensures every byte written in `[addr, addr+len)` has reached media
/// that survives a power failure, not merely the page cache: tracked
/// `DIRECT_MAPPED` sub-ranges get a device-level deep flush, everything
/// else falls back to `msync_sync`.
pub fn deep_flush(addr: *const u8, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }

    let mut addr = addr as usize;
    let mut len = len;

    loop {
        let Some(mt) = registry().find(addr, len)? else {
            return msync_sync(addr as *const u8, len);
        };

        if mt.base_addr > addr {
            let gap = (mt.base_addr - addr).min(len);
            msync_sync(addr as *const u8, gap)?;
            len -= gap;
            if len == 0 {
                return Ok(());
            }
            addr = mt.base_addr;
        }

        deep_flush_device(&mt)?;

        let covered_end = mt.end_addr.min(addr + len);
        let covered = covered_end - addr;
        len -= covered;
        addr += covered;
        if len == 0 {
            return Ok(());
        }
    }
}

/// Writes a sentinel byte to the kernel's per-region deep-flush control
/// file. Absence of the file is not an error: the region has no
/// separate deep-flush step (e.g. it is always durable past the CPU
/// cache), so we log and move on.
fn deep_flush_device(mt: &MapTracker) -> Result<()> {
    let Some(region_id) = mt.region_id else {
        return Ok(());
    };
    let path = format!("/sys/bus/nd/devices/region{region_id}/deep_flush");
    match std::fs::write(&path, b"1") {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::warn!("pmemcore: deep_flush control file {path} not found, skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut p = std::env::temp_dir();
        p.push(format!("pmemcore-test-{}-{}-{}", std::process::id(), name, n));
        p
    }

    #[test]
    fn create_nonzero_len_round_trips_through_write_and_remap() {
        let path = tmp_path("roundtrip");
        let mapping = map_file(&path, 4096, MapFileFlags::CREATE, 0o600).unwrap();
        assert_eq!(mapping.len(), 4096);
        assert!(!mapping.is_pmem());

        unsafe {
            std::ptr::write_bytes(mapping.addr(), 0xAB, mapping.len());
            crate::ll::persist(mapping.addr(), mapping.len());
            unmap(mapping.addr(), mapping.len()).unwrap();
        }

        let mut buf = Vec::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn create_with_zero_len_is_rejected() {
        let path = tmp_path("zerolen");
        let err = map_file(&path, 0, MapFileFlags::CREATE, 0o600).unwrap_err();
        assert!(matches!(err, PmemError::InvalidArgument(_)));
    }

    #[test]
    fn nonzero_len_without_create_is_rejected() {
        let path = tmp_path("nocreate");
        std::fs::File::create(&path).unwrap().write_all(b"x").ok();
        let err = map_file(&path, 10, MapFileFlags::empty(), 0o600).unwrap_err();
        assert!(matches!(err, PmemError::InvalidArgument(_)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn tmpfile_without_create_is_rejected() {
        let path = tmp_path("tmpfilenocreate");
        let err = map_file(&path, 0, MapFileFlags::TMPFILE, 0o600).unwrap_err();
        assert!(matches!(err, PmemError::InvalidArgument(_)));
    }

    #[test]
    fn opening_existing_file_maps_its_actual_length() {
        let path = tmp_path("existing");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&vec![0u8; 8192]).unwrap();
        }
        let mapping = map_file(&path, 0, MapFileFlags::empty(), 0o600).unwrap();
        assert_eq!(mapping.len(), 8192);
        unsafe { unmap(mapping.addr(), mapping.len()).unwrap() };
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn tmpfile_creates_an_anonymous_backing_file() {
        // O_TMPFILE needs a directory as its "path", not a future
        // filename: `path` here names the directory the anonymous file
        // is created in, never linked into it.
        let dir = std::env::temp_dir();
        let mapping = match map_file(
            &dir,
            4096,
            MapFileFlags::CREATE | MapFileFlags::TMPFILE,
            0o600,
        ) {
            Ok(m) => m,
            // O_TMPFILE isn't supported on every filesystem temp_dir()
            // might resolve to; treat that as "can't exercise this path
            // here" rather than a failure of map_file itself.
            Err(_) => return,
        };
        assert_eq!(mapping.len(), 4096);
        unsafe {
            std::ptr::write_bytes(mapping.addr(), 0x7E, mapping.len());
            crate::ll::persist(mapping.addr(), mapping.len());
            assert_eq!(*mapping.addr(), 0x7E);
            unmap(mapping.addr(), mapping.len()).unwrap();
        }
    }

    #[test]
    fn deep_flush_with_no_tracked_entries_falls_back_to_msync() {
        let path = tmp_path("deepflush");
        let mapping = map_file(&path, 4096, MapFileFlags::CREATE, 0o600).unwrap();
        unsafe {
            std::ptr::write_bytes(mapping.addr(), 1, mapping.len());
        }
        deep_flush(mapping.addr(), mapping.len()).unwrap();
        unsafe { unmap(mapping.addr(), mapping.len()).unwrap() };
        std::fs::remove_file(&path).ok();
    }
}
