//! Adaptive transfer entry points.
//!
//! [`transfer`] picks a bulk strategy from the caller's hint and the logical
//! transfer size, then finishes the tail with the small-copy path. [`copy`]
//! additionally consults the process-wide policy to decide whether the
//! streaming engine is worth it at all.
#![allow(unsafe_code)]

use core::arch::x86_64::*;
use core::ptr;

use bitflags::bitflags;

use crate::cpu::{CpuFlags, get_flags};
use crate::nt;
use crate::policy::thresholds;
use crate::relaxed::copy_in_window;
use crate::stream_load::memcpy_stream_load_for;

bitflags! {
    /// Caller knowledge about how the buffers are used afterwards.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CopyHint: u8 {
        /// The destination will not be read again soon.
        const STREAM_DEST = 1 << 0;
        /// The source will not be read again soon.
        const STREAM_SOURCE = 1 << 1;
    }
}

/// Largest copy handled entirely by the small-copy path.
pub const SMALL_COPY_MAX: usize = 128;

/// Copy `len` bytes as part of a logical transfer of `total_len` bytes.
///
/// # Safety
///
/// - `src` must be readable and `dst` writable for `len` bytes
/// - The regions must not overlap
/// - `len <= total_len`, with `total_len` the same for every chunk of one
///   logical transfer
#[inline]
pub unsafe fn transfer(dst: *mut u8, src: *const u8, len: usize, hint: CopyHint, total_len: usize) {
    transfer_with(dst, src, len, hint, total_len, thresholds().nt_dest_threshold)
}

/// [`transfer`] with an explicit destination-bypass threshold.
///
/// # Safety
///
/// Same as [`transfer`].
pub unsafe fn transfer_with(
    dst: *mut u8,
    src: *const u8,
    len: usize,
    hint: CopyHint,
    total_len: usize,
    nt_dest_threshold: usize,
) {
    transfer_for(get_flags(), dst, src, len, hint, total_len, nt_dest_threshold)
}

/// Dispatch on an explicit feature set. `flags` must not claim anything the
/// running processor lacks.
unsafe fn transfer_for(
    flags: CpuFlags,
    dst: *mut u8,
    src: *const u8,
    len: usize,
    hint: CopyHint,
    total_len: usize,
    nt_dest_threshold: usize,
) {
    if flags.contains(CpuFlags::AVX) {
        transfer_avx(dst, src, len, hint, total_len, nt_dest_threshold);
    } else if len <= SMALL_COPY_MAX {
        copy_small_sse2(dst, src, len);
    } else if hint.contains(CopyHint::STREAM_SOURCE) {
        memcpy_stream_load_for(flags, dst, src, len);
    } else {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}

#[target_feature(enable = "avx")]
unsafe fn transfer_avx(
    dst: *mut u8,
    src: *const u8,
    len: usize,
    hint: CopyHint,
    total_len: usize,
    nt_dest_threshold: usize,
) {
    if len <= SMALL_COPY_MAX {
        copy_small_avx(dst, src, len);
        return;
    }

    let tail = if total_len > nt_dest_threshold {
        // NTA-prefetched lines that are dirty elsewhere cost an extra write
        // on eviction, so only stream both sides when asked for the source.
        if hint.contains(CopyHint::STREAM_SOURCE) {
            nt::stream_both(dst, src, len)
        } else {
            nt::stream_dest(dst, src, len, total_len)
        }
    } else if hint.contains(CopyHint::STREAM_DEST) {
        nt::stream_dest(dst, src, len, total_len)
    } else if hint.contains(CopyHint::STREAM_SOURCE) {
        nt::stream_source(dst, src, len)
    } else {
        ptr::copy_nonoverlapping(src, dst, len);
        0
    };

    let done = len - tail;
    copy_small_avx(dst.add(done), src.add(done), tail);
}

/// Policy-driven copy: the streaming engine for logical transfers of at least
/// `nt_buffer_transfer_min` bytes, the relaxed copy otherwise.
///
/// # Safety
///
/// Same as [`transfer`].
pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize, hint: CopyHint, total_len: usize) {
    let policy = thresholds();
    if total_len >= policy.nt_buffer_transfer_min {
        transfer_with(dst, src, len, hint, total_len, policy.nt_dest_threshold);
    } else {
        copy_in_window(dst, src, len, policy.builtin_memcpy_min, policy.builtin_memcpy_max);
    }
}

// =============================================================================
// SMALL PATH (0-128 bytes)
// =============================================================================
//
// Bucketed by leading zeros of the 32-bit length. Each bucket is two
// overlapping accesses, one from the start and one ending at `len`.

/// # Safety
///
/// `len <= 128`, buffers valid and non-overlapping, AVX available.
#[target_feature(enable = "avx")]
pub unsafe fn copy_small_avx(dst: *mut u8, src: *const u8, len: usize) {
    debug_assert!(len <= SMALL_COPY_MAX);

    match (len as u32).leading_zeros() {
        // 32-63 bytes
        26 => {
            let y0 = _mm256_loadu_si256(src as *const __m256i);
            let y1 = _mm256_loadu_si256(src.add(len - 32) as *const __m256i);
            _mm256_storeu_si256(dst as *mut __m256i, y0);
            _mm256_storeu_si256(dst.add(len - 32) as *mut __m256i, y1);
        }
        // 64-128 bytes: two 64-byte halves
        24 | 25 => {
            let y0 = _mm256_loadu_si256(src as *const __m256i);
            let y1 = _mm256_loadu_si256(src.add(32) as *const __m256i);
            let y2 = _mm256_loadu_si256(src.add(len - 64) as *const __m256i);
            let y3 = _mm256_loadu_si256(src.add(len - 32) as *const __m256i);
            _mm256_storeu_si256(dst as *mut __m256i, y0);
            _mm256_storeu_si256(dst.add(32) as *mut __m256i, y1);
            _mm256_storeu_si256(dst.add(len - 64) as *mut __m256i, y2);
            _mm256_storeu_si256(dst.add(len - 32) as *mut __m256i, y3);
        }
        _ => copy_small_le_31(dst, src, len),
    }
}

/// SSE2 rendition of the small path for processors without AVX.
///
/// # Safety
///
/// `len <= 128`, buffers valid and non-overlapping.
#[inline]
pub unsafe fn copy_small_sse2(dst: *mut u8, src: *const u8, len: usize) {
    debug_assert!(len <= SMALL_COPY_MAX);

    match (len as u32).leading_zeros() {
        // 32-63 bytes
        26 => {
            let v0 = _mm_loadu_si128(src as *const __m128i);
            let v1 = _mm_loadu_si128(src.add(16) as *const __m128i);
            let v2 = _mm_loadu_si128(src.add(len - 32) as *const __m128i);
            let v3 = _mm_loadu_si128(src.add(len - 16) as *const __m128i);
            _mm_storeu_si128(dst as *mut __m128i, v0);
            _mm_storeu_si128(dst.add(16) as *mut __m128i, v1);
            _mm_storeu_si128(dst.add(len - 32) as *mut __m128i, v2);
            _mm_storeu_si128(dst.add(len - 16) as *mut __m128i, v3);
        }
        // 64-128 bytes
        24 | 25 => {
            let h0 = _mm_loadu_si128(src as *const __m128i);
            let h1 = _mm_loadu_si128(src.add(16) as *const __m128i);
            let h2 = _mm_loadu_si128(src.add(32) as *const __m128i);
            let h3 = _mm_loadu_si128(src.add(48) as *const __m128i);
            let t = src.add(len - 64);
            let t0 = _mm_loadu_si128(t as *const __m128i);
            let t1 = _mm_loadu_si128(t.add(16) as *const __m128i);
            let t2 = _mm_loadu_si128(t.add(32) as *const __m128i);
            let t3 = _mm_loadu_si128(t.add(48) as *const __m128i);

            _mm_storeu_si128(dst as *mut __m128i, h0);
            _mm_storeu_si128(dst.add(16) as *mut __m128i, h1);
            _mm_storeu_si128(dst.add(32) as *mut __m128i, h2);
            _mm_storeu_si128(dst.add(48) as *mut __m128i, h3);
            let td = dst.add(len - 64);
            _mm_storeu_si128(td as *mut __m128i, t0);
            _mm_storeu_si128(td.add(16) as *mut __m128i, t1);
            _mm_storeu_si128(td.add(32) as *mut __m128i, t2);
            _mm_storeu_si128(td.add(48) as *mut __m128i, t3);
        }
        _ => copy_small_le_31(dst, src, len),
    }
}

/// 0-31 bytes. Shared by both small paths; the widest access is 16 bytes.
#[inline(always)]
unsafe fn copy_small_le_31(dst: *mut u8, src: *const u8, len: usize) {
    match (len as u32).leading_zeros() {
        32 => {}
        31 => *dst = *src,
        // 2-3 bytes
        30 => {
            let a = ptr::read_unaligned(src as *const u16);
            let b = ptr::read_unaligned(src.add(len - 2) as *const u16);
            ptr::write_unaligned(dst as *mut u16, a);
            ptr::write_unaligned(dst.add(len - 2) as *mut u16, b);
        }
        // 4-7 bytes
        29 => {
            let a = ptr::read_unaligned(src as *const u32);
            let b = ptr::read_unaligned(src.add(len - 4) as *const u32);
            ptr::write_unaligned(dst as *mut u32, a);
            ptr::write_unaligned(dst.add(len - 4) as *mut u32, b);
        }
        // 8-15 bytes
        28 => {
            let a = ptr::read_unaligned(src as *const u64);
            let b = ptr::read_unaligned(src.add(len - 8) as *const u64);
            ptr::write_unaligned(dst as *mut u64, a);
            ptr::write_unaligned(dst.add(len - 8) as *mut u64, b);
        }
        // 16-31 bytes
        27 => {
            // SAFETY: SSE2 is baseline on x86_64; unaligned accesses are valid
            // at any alignment.
            let v0 = _mm_loadu_si128(src as *const __m128i);
            let v1 = _mm_loadu_si128(src.add(len - 16) as *const __m128i);
            _mm_storeu_si128(dst as *mut __m128i, v0);
            _mm_storeu_si128(dst.add(len - 16) as *mut __m128i, v1);
        }
        _ => unreachable!("small copy of {len} bytes"),
    }
}
