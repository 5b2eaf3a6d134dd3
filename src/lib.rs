//! `pmemcore` gives user-space programs a thin, safe-as-possible layer
//! over persistent memory: cache-line flush/fence primitives, bulk
//! copy/fill routines that skip the cache when it pays off, and a
//! mapping registry that lets the rest of the crate tell a DAX-backed
//! byte range from an ordinary page-cache mapping.
//!
//! # Layout
//! - [`probe`]: one-shot CPU/environment detection, building the
//!   process-wide [dispatch table](probe) every other module reads.
//! - [`ll`]: `flush`/`drain`/`persist`, `memmove`/`memcpy`/`memset`
//!   `_nodrain`/`_persist` families, `msync_sync`, `is_pmem`,
//!   `has_hw_drain`.
//! - [`registry`]: the sorted, non-overlapping set of tracked mappings.
//! - [`mapping`]: `map_file`/`unmap`/`deep_flush`.
//! - [`error`]: [`PmemError`] and the crate's `Result` alias.
//!
//! None of the bulk primitives in [`ll`] can fail — there is no error
//! channel for `flush`/`drain`/`persist`/the `memmove`/`memset` family,
//! matching the C library this crate's design is grounded on. Anything
//! that touches the file system or the mapping registry returns
//! [`PmemError`].

pub mod error;
pub mod ll;
pub mod mapping;
pub mod probe;
pub mod registry;

pub use error::{PmemError, Result};
pub use ll::{
    drain, flush, has_hw_drain, is_pmem, memcpy_nodrain, memcpy_persist, memmove_nodrain,
    memmove_persist, memset_nodrain, memset_persist, msync_sync, FLUSH_ALIGN,
};
pub use mapping::{deep_flush, map_file, unmap, MapFileFlags, Mapping};
pub use registry::MapFlags;
