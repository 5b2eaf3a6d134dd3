//! Error kinds returned by the fallible parts of the public API.
//!
//! The bulk persistence primitives (`flush`, `drain`, `persist`, the
//! `*_nodrain`/`*_persist` family, `is_pmem`, `has_hw_drain`) never fail
//! and have no error channel. Everything that touches the mapping
//! registry or the file system can fail and returns [`PmemError`].

use thiserror::Error;

/// Errors produced by the mapping registry and mapping façade.
#[derive(Debug, Error)]
pub enum PmemError {
    /// A bad flag combination, a `len` constraint violation, or an
    /// unaligned `unmap`/`unregister` range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An open/truncate/fallocate/mmap/msync/write failure. Carries the
    /// underlying OS error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation failure while registering or splitting a registry entry.
    #[error("resource exhausted while updating the mapping registry")]
    ResourceExhausted,

    /// The registry lock could not be acquired. Treated as fatal to the
    /// call that requested it.
    #[error("mapping registry is busy")]
    Busy,

    /// A feature was requested that the current dispatch configuration
    /// does not support. Note that a missing deep-flush device is *not*
    /// reported this way: it degrades silently to `msync_sync`.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// A `Result` alias for the fallible parts of this crate's API.
pub type Result<T> = std::result::Result<T, PmemError>;
