//! Persistence primitives (component B).
//!
//! `flush`, `drain`, `persist`, the bulk `memmove`/`memcpy`/`memset`
//! `_nodrain`/`_persist` families, `msync_sync`, `is_pmem`, and
//! `has_hw_drain`. Every function here is thread-safe and lock-free once
//! [`crate::probe::dispatch`] has run.
//!
//! Cache-line instructions are dispatched through
//! [`crate::probe::DispatchTable`] rather than compile-time `cfg`
//! switches, so a single binary adapts to whatever CPU it actually runs
//! on. The streaming memmove/memset algorithm (head alignment, 128-byte
//! non-temporal chunks, 16-byte and sub-dword tails) mirrors
//! `memmove_nodrain_movnt`/`memset_nodrain_movnt` from `libpmem`.

use crate::error::Result;
use crate::probe::{dispatch, BulkFn, FlushFn, IsPmemFn, PredrainFn};
use crate::registry::registry;
use std::arch::x86_64::*;

/// Cache line size in bytes that `flush` operates on.
pub const FLUSH_ALIGN: usize = 64;
const CHUNK: usize = 128;
const MOVNT_UNIT: usize = 16;
const DWORD: usize = 4;

/// Flushes every cache line intersecting `[addr, addr+len)` toward the
/// persistence domain, using whichever instruction the platform probe
/// selected. Issues no fence; pair with [`drain`] (or call [`persist`]).
///
/// `len == 0` is a no-op. A misaligned `addr` still flushes the single
/// line it falls in.
pub fn flush(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    match dispatch().flush_fn {
        FlushFn::Clwb => flush_clwb(addr, len),
        FlushFn::Clflushopt => flush_clflushopt(addr, len),
        FlushFn::Clflush => flush_clflush(addr, len),
        FlushFn::Empty => {}
    }
}

/// Serializes outstanding cache-line flushes and non-temporal stores.
/// SFENCE with CLWB/CLFLUSHOPT, a no-op with CLFLUSH (already
/// serializing).
pub fn drain() {
    match dispatch().predrain_fn {
        PredrainFn::Sfence => sfence(),
        PredrainFn::Empty => {}
    }
}

/// `flush(addr, len); drain()`.
pub fn persist(addr: *const u8, len: usize) {
    flush(addr, len);
    drain();
}

/// Always `false` on x86: hardware drain is invisible to software here.
pub const fn has_hw_drain() -> bool {
    false
}

/// True iff every byte of `[addr, addr+len)` is covered by tracked
/// `DIRECT_MAPPED` ranges.
pub fn is_pmem(addr: *const u8, len: usize) -> bool {
    match dispatch().is_pmem_fn {
        IsPmemFn::Always => true,
        IsPmemFn::Never => false,
        IsPmemFn::Detect => registry()
            .is_pmem_range(addr as usize, len)
            .unwrap_or(false),
    }
}

/// Page-granular sync, safe on any memory-mapped file (not only PM).
/// Rounds `addr` down to a page boundary and widens `len` to match
/// before issuing a synchronous `msync`.
pub fn msync_sync(addr: *const u8, len: usize) -> Result<()> {
    let page = page_size();
    let off = addr as usize;
    let aligned = off & !(page - 1);
    let len = len + (off - aligned);

    let rc = unsafe { libc::msync(aligned as *mut libc::c_void, len, libc::MS_SYNC) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

// ---------------------------------------------------------------------
// Flush backends
// ---------------------------------------------------------------------

fn cache_line_range(addr: *const u8, len: usize) -> (usize, usize) {
    let start = (addr as usize) & !(FLUSH_ALIGN - 1);
    let end = addr as usize + len;
    (start, end)
}

fn flush_clflush(addr: *const u8, len: usize) {
    let (mut start, end) = cache_line_range(addr, len);
    while start < end {
        unsafe { _mm_clflush(start as *const u8) };
        start += FLUSH_ALIGN;
    }
}

#[target_feature(enable = "clflushopt")]
unsafe fn clflushopt_at(addr: *const u8) {
    unsafe { _mm_clflushopt(addr as *mut u8) };
}

fn flush_clflushopt(addr: *const u8, len: usize) {
    let (mut start, end) = cache_line_range(addr, len);
    while start < end {
        unsafe { clflushopt_at(start as *const u8) };
        start += FLUSH_ALIGN;
    }
}

#[target_feature(enable = "clwb")]
unsafe fn clwb_at(addr: *const u8) {
    unsafe { _mm_clwb(addr as *mut u8) };
}

fn flush_clwb(addr: *const u8, len: usize) {
    let (mut start, end) = cache_line_range(addr, len);
    while start < end {
        unsafe { clwb_at(start as *const u8) };
        start += FLUSH_ALIGN;
    }
}

fn sfence() {
    unsafe { _mm_sfence() };
}

// ---------------------------------------------------------------------
// Bulk transfer: memmove/memcpy
// ---------------------------------------------------------------------

/// Memmove to pmem without a drain. Destination bytes end up matching
/// `memmove` semantics (overlap-safe); every byte written becomes
/// durable after a subsequent [`drain`].
///
/// # Safety
/// `dst` and `src` must each be valid for `n` bytes, per the usual
/// `memmove` contract.
pub unsafe fn memmove_nodrain(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    if n == 0 || dst as *const u8 == src {
        return dst;
    }
    match dispatch().memmove_nodrain_fn {
        BulkFn::Normal => unsafe { memmove_nodrain_normal(dst, src, n) },
        BulkFn::Streaming => {
            if n < dispatch().movnt_threshold {
                unsafe { memmove_nodrain_normal(dst, src, n) }
            } else {
                unsafe { memmove_nodrain_streaming(dst, src, n) }
            }
        }
    }
}

/// Forwarding alias to [`memmove_nodrain`].
///
/// # Safety
/// Same contract as [`memmove_nodrain`].
pub unsafe fn memcpy_nodrain(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    unsafe { memmove_nodrain(dst, src, n) }
}

/// [`memmove_nodrain`] followed by [`drain`].
///
/// # Safety
/// Same contract as [`memmove_nodrain`].
pub unsafe fn memmove_persist(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    let r = unsafe { memmove_nodrain(dst, src, n) };
    drain();
    r
}

/// [`memcpy_nodrain`] followed by [`drain`].
///
/// # Safety
/// Same contract as [`memmove_nodrain`].
pub unsafe fn memcpy_persist(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    let r = unsafe { memcpy_nodrain(dst, src, n) };
    drain();
    r
}

unsafe fn memmove_nodrain_normal(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    unsafe { std::ptr::copy(src, dst, n) };
    flush(dst, n);
    dst
}

/// Streaming memmove: non-temporal stores bypass the cache entirely, so
/// only the unaligned head and sub-dword tail need an explicit flush.
/// Direction is chosen so overlapping ranges are still handled
/// correctly, exactly as libc `memmove` would.
unsafe fn memmove_nodrain_streaming(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    // Unsigned arithmetic: true when the ranges don't overlap with
    // src < dst, i.e. it's safe to copy forward.
    let forward = (dst as usize).wrapping_sub(src as usize) >= n;

    if forward {
        unsafe { memmove_forward(dst, src, n) };
    } else {
        unsafe { memmove_backward(dst, src, n) };
    }
    sfence();
    dst
}

unsafe fn memmove_forward(mut dst: *mut u8, mut src: *const u8, mut n: usize) {
    // 1. Head alignment: plain byte stores up to a FLUSH_ALIGN boundary.
    let misalign = (dst as usize) & (FLUSH_ALIGN - 1);
    if misalign != 0 {
        let mut head = FLUSH_ALIGN - misalign;
        if head > n {
            head = n;
        }
        unsafe { std::ptr::copy_nonoverlapping(src, dst, head) };
        flush(dst, head);
        dst = unsafe { dst.add(head) };
        src = unsafe { src.add(head) };
        n -= head;
    }

    // 2. Streaming body: eight 16-byte non-temporal stores per 128-byte
    // chunk.
    let mut d = dst as *mut __m128i;
    let mut s = src as *const __m128i;
    let chunks = n / CHUNK;
    for _ in 0..chunks {
        unsafe {
            let x0 = _mm_loadu_si128(s);
            let x1 = _mm_loadu_si128(s.add(1));
            let x2 = _mm_loadu_si128(s.add(2));
            let x3 = _mm_loadu_si128(s.add(3));
            let x4 = _mm_loadu_si128(s.add(4));
            let x5 = _mm_loadu_si128(s.add(5));
            let x6 = _mm_loadu_si128(s.add(6));
            let x7 = _mm_loadu_si128(s.add(7));
            s = s.add(8);
            _mm_stream_si128(d, x0);
            _mm_stream_si128(d.add(1), x1);
            _mm_stream_si128(d.add(2), x2);
            _mm_stream_si128(d.add(3), x3);
            _mm_stream_si128(d.add(4), x4);
            _mm_stream_si128(d.add(5), x5);
            _mm_stream_si128(d.add(6), x6);
            _mm_stream_si128(d.add(7), x7);
            d = d.add(8);
        }
    }
    n &= CHUNK - 1;

    // 3. 16-byte tail.
    let units = n / MOVNT_UNIT;
    for _ in 0..units {
        unsafe {
            let x0 = _mm_loadu_si128(s);
            _mm_stream_si128(d, x0);
            s = s.add(1);
            d = d.add(1);
        }
    }
    n &= MOVNT_UNIT - 1;

    // 4. Sub-16 tail: dwords via non-temporal store, then bytes + flush.
    if n != 0 {
        let mut d32 = d as *mut i32;
        let mut s32 = s as *const i32;
        let dwords = n / DWORD;
        for _ in 0..dwords {
            unsafe {
                _mm_stream_si32(d32, *s32);
                d32 = d32.add(1);
                s32 = s32.add(1);
            }
        }
        let rem = n % DWORD;
        if rem != 0 {
            unsafe { std::ptr::copy_nonoverlapping(s32 as *const u8, d32 as *mut u8, rem) };
            flush(d32 as *const u8, rem);
        }
    }
}

unsafe fn memmove_backward(dst: *mut u8, src: *const u8, n: usize) {
    let mut dst = unsafe { dst.add(n) };
    let mut src = unsafe { src.add(n) };
    let mut n = n;

    let misalign = (dst as usize) & (FLUSH_ALIGN - 1);
    if misalign != 0 {
        let mut head = misalign;
        if head > n {
            head = n;
        }
        unsafe {
            dst = dst.sub(head);
            src = src.sub(head);
            std::ptr::copy_nonoverlapping(src, dst, head);
        }
        flush(dst, head);
        n -= head;
    }

    let mut d = dst as *mut __m128i;
    let mut s = src as *const __m128i;
    let chunks = n / CHUNK;
    for _ in 0..chunks {
        unsafe {
            let x0 = _mm_loadu_si128(s.sub(1));
            let x1 = _mm_loadu_si128(s.sub(2));
            let x2 = _mm_loadu_si128(s.sub(3));
            let x3 = _mm_loadu_si128(s.sub(4));
            let x4 = _mm_loadu_si128(s.sub(5));
            let x5 = _mm_loadu_si128(s.sub(6));
            let x6 = _mm_loadu_si128(s.sub(7));
            let x7 = _mm_loadu_si128(s.sub(8));
            s = s.sub(8);
            _mm_stream_si128(d.sub(1), x0);
            _mm_stream_si128(d.sub(2), x1);
            _mm_stream_si128(d.sub(3), x2);
            _mm_stream_si128(d.sub(4), x3);
            _mm_stream_si128(d.sub(5), x4);
            _mm_stream_si128(d.sub(6), x5);
            _mm_stream_si128(d.sub(7), x6);
            _mm_stream_si128(d.sub(8), x7);
            d = d.sub(8);
        }
    }
    n &= CHUNK - 1;

    let units = n / MOVNT_UNIT;
    for _ in 0..units {
        unsafe {
            d = d.sub(1);
            s = s.sub(1);
            let x0 = _mm_loadu_si128(s);
            _mm_stream_si128(d, x0);
        }
    }
    n &= MOVNT_UNIT - 1;

    if n != 0 {
        let mut d32 = d as *mut i32;
        let mut s32 = s as *const i32;
        let dwords = n / DWORD;
        for _ in 0..dwords {
            unsafe {
                d32 = d32.sub(1);
                s32 = s32.sub(1);
                _mm_stream_si32(d32, *s32);
            }
        }
        let rem = n % DWORD;
        if rem != 0 {
            unsafe {
                let d8 = (d32 as *mut u8).sub(rem);
                let s8 = (s32 as *const u8).sub(rem);
                std::ptr::copy_nonoverlapping(s8, d8, rem);
                flush(d8, rem);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Bulk transfer: memset
// ---------------------------------------------------------------------

/// Memset to pmem without a drain. Every byte in `[dst, dst+n)` equals
/// `c` on return; durable after a subsequent [`drain`].
///
/// # Safety
/// `dst` must be valid for `n` bytes.
pub unsafe fn memset_nodrain(dst: *mut u8, c: u8, n: usize) -> *mut u8 {
    if n == 0 {
        return dst;
    }
    match dispatch().memset_nodrain_fn {
        BulkFn::Normal => unsafe { memset_nodrain_normal(dst, c, n) },
        BulkFn::Streaming => {
            if n < dispatch().movnt_threshold {
                unsafe { memset_nodrain_normal(dst, c, n) }
            } else {
                unsafe { memset_nodrain_streaming(dst, c, n) }
            }
        }
    }
}

/// [`memset_nodrain`] followed by [`drain`].
///
/// # Safety
/// Same contract as [`memset_nodrain`].
pub unsafe fn memset_persist(dst: *mut u8, c: u8, n: usize) -> *mut u8 {
    let r = unsafe { memset_nodrain(dst, c, n) };
    drain();
    r
}

unsafe fn memset_nodrain_normal(dst: *mut u8, c: u8, n: usize) -> *mut u8 {
    unsafe { std::ptr::write_bytes(dst, c, n) };
    flush(dst, n);
    dst
}

unsafe fn memset_nodrain_streaming(dst: *mut u8, c: u8, n: usize) -> *mut u8 {
    let mut dst1 = dst;
    let mut n = n;

    let misalign = (dst1 as usize) & (FLUSH_ALIGN - 1);
    if misalign != 0 {
        let mut head = FLUSH_ALIGN - misalign;
        if head > n {
            head = n;
        }
        unsafe { std::ptr::write_bytes(dst1, c, head) };
        flush(dst1, head);
        n -= head;
        dst1 = unsafe { dst1.add(head) };
    }

    let pattern = unsafe { _mm_set1_epi8(c as i8) };
    let mut d = dst1 as *mut __m128i;
    let chunks = n / CHUNK;
    for _ in 0..chunks {
        unsafe {
            _mm_stream_si128(d, pattern);
            _mm_stream_si128(d.add(1), pattern);
            _mm_stream_si128(d.add(2), pattern);
            _mm_stream_si128(d.add(3), pattern);
            _mm_stream_si128(d.add(4), pattern);
            _mm_stream_si128(d.add(5), pattern);
            _mm_stream_si128(d.add(6), pattern);
            _mm_stream_si128(d.add(7), pattern);
            d = d.add(8);
        }
    }
    n &= CHUNK - 1;

    let units = n / MOVNT_UNIT;
    for _ in 0..units {
        unsafe {
            _mm_stream_si128(d, pattern);
            d = d.add(1);
        }
    }
    n &= MOVNT_UNIT - 1;

    if n != 0 {
        let mut d32 = d as *mut i32;
        let dwords = n / DWORD;
        if dwords != 0 {
            let word = unsafe { _mm_cvtsi128_si32(pattern) };
            for _ in 0..dwords {
                unsafe {
                    _mm_stream_si32(d32, word);
                    d32 = d32.add(1);
                }
            }
        }
        let rem = n & (DWORD - 1);
        if rem != 0 {
            unsafe { std::ptr::write_bytes(d32 as *mut u8, c, rem) };
            flush(d32 as *const u8, rem);
        }
    }

    sfence();
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_zero_length_is_a_no_op() {
        let buf = [0u8; 8];
        flush(buf.as_ptr(), 0); // must not panic or touch memory oddly
    }

    #[test]
    fn memmove_zero_length_returns_dst() {
        let mut buf = [0u8; 8];
        let p = buf.as_mut_ptr();
        let r = unsafe { memmove_nodrain(p, p, 0) };
        assert_eq!(r, p);
    }

    #[test]
    fn memset_zero_length_returns_dst() {
        let mut buf = [0u8; 8];
        let p = buf.as_mut_ptr();
        let r = unsafe { memset_nodrain(p, 7, 0) };
        assert_eq!(r, p);
    }

    #[test]
    fn memcpy_persist_copies_bytes_and_forwards_to_memmove() {
        let src = vec![0xABu8; 4096];
        let mut dst = vec![0u8; 4096];
        unsafe {
            memcpy_persist(dst.as_mut_ptr(), src.as_ptr(), src.len());
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn memset_persist_fills_every_byte() {
        let mut dst = vec![0u8; 4096];
        unsafe {
            memset_persist(dst.as_mut_ptr(), 0x5A, dst.len());
        }
        assert!(dst.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn streaming_and_normal_paths_agree_on_unaligned_buffers() {
        for &(len, src_off, dst_off) in &[
            (255usize, 0usize, 0usize),
            (256, 1, 3),
            (257, 5, 0),
            (1024, 7, 13),
            (4096, 0, 1),
        ] {
            let total = len + 64;
            let src_buf = vec![0x11u8; total];

            let mut normal = vec![0u8; total];
            unsafe {
                memmove_nodrain_normal(
                    normal.as_mut_ptr().add(dst_off),
                    src_buf.as_ptr().add(src_off),
                    len,
                );
            }

            let mut streaming = vec![0u8; total];
            unsafe {
                memmove_nodrain_streaming(
                    streaming.as_mut_ptr().add(dst_off),
                    src_buf.as_ptr().add(src_off),
                    len,
                );
            }

            assert_eq!(
                normal[dst_off..dst_off + len],
                streaming[dst_off..dst_off + len],
                "mismatch at len={len}"
            );
        }
    }

    #[test]
    fn streaming_memmove_handles_backward_overlap() {
        // dst inside src's range, forcing the backward path.
        let mut buf = vec![0u8; 1024];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut expected = buf.clone();
        expected.copy_within(0..900, 50);

        unsafe {
            let base = buf.as_mut_ptr();
            let src = base as *const u8;
            let dst = base.add(50);
            memmove_nodrain_streaming(dst, src, 900);
        }

        assert_eq!(buf, expected);
    }

    #[test]
    fn streaming_memset_matches_normal_memset() {
        for &len in &[255usize, 256, 257, 1024, 4096] {
            let mut normal = vec![0u8; len + 64];
            unsafe { memset_nodrain_normal(normal.as_mut_ptr().add(3), 0x42, len) };

            let mut streaming = vec![0u8; len + 64];
            unsafe { memset_nodrain_streaming(streaming.as_mut_ptr().add(3), 0x42, len) };

            assert_eq!(normal[3..3 + len], streaming[3..3 + len]);
        }
    }

    #[test]
    fn has_hw_drain_is_always_false() {
        assert!(!has_hw_drain());
    }
}
