//! Bulk copy variants with cache-bypass and prefetch hints.
//!
//! Each variant copies an unconditional prologue with unaligned accesses,
//! then realigns so the destination of the main loop is 32-byte aligned:
//! `offset = prologue - (dst & 31)`. Whether the source is aligned at that
//! offset only picks between aligned and unaligned loads.
//!
//! Every variant copies a prefix of the buffers and returns the number of
//! bytes left at the end, which the caller finishes with the small-copy path.
//! All of them require `len > 128`.
#![allow(unsafe_code)]

use core::arch::x86_64::*;

/// Stream-destination switches from cached to non-temporal stores above
/// this logical transfer size.
pub const SWITCH_TO_NT_STORE_SIZE: usize = 2048;

const LINE: usize = 64;

// =============================================================================
// HELPERS
// =============================================================================

#[inline(always)]
fn prefetch_read_nta(p: *const u8) {
    // SAFETY: Prefetch is a hint and never faults, even on unmapped addresses.
    unsafe { _mm_prefetch::<_MM_HINT_NTA>(p as *const i8) }
}

#[inline(always)]
fn prefetch_write(p: *const u8) {
    // SAFETY: Prefetch is a hint and never faults, even on unmapped addresses.
    unsafe { _mm_prefetch::<_MM_HINT_ET0>(p as *const i8) }
}

#[target_feature(enable = "avx")]
#[inline]
unsafe fn load<const ALIGNED: bool>(p: *const u8) -> __m256i {
    if ALIGNED {
        _mm256_load_si256(p as *const __m256i)
    } else {
        _mm256_loadu_si256(p as *const __m256i)
    }
}

#[target_feature(enable = "avx")]
#[inline]
unsafe fn copy_64_unaligned(d: *mut u8, s: *const u8) {
    let y0 = _mm256_loadu_si256(s as *const __m256i);
    let y1 = _mm256_loadu_si256(s.add(32) as *const __m256i);
    _mm256_storeu_si256(d as *mut __m256i, y0);
    _mm256_storeu_si256(d.add(32) as *mut __m256i, y1);
}

/// 64 bytes, unaligned loads, non-temporal stores. `d` must be 32-byte aligned.
#[target_feature(enable = "avx")]
#[inline]
unsafe fn stream_64(d: *mut u8, s: *const u8) {
    let y0 = _mm256_loadu_si256(s as *const __m256i);
    let y1 = _mm256_loadu_si256(s.add(32) as *const __m256i);
    _mm256_stream_si256(d as *mut __m256i, y0);
    _mm256_stream_si256(d.add(32) as *mut __m256i, y1);
}

/// 256 bytes with non-temporal stores. `d` must be 32-byte aligned, and `s`
/// too when `SRC_ALIGNED`.
#[target_feature(enable = "avx")]
#[inline]
unsafe fn stream_256<const SRC_ALIGNED: bool>(d: *mut u8, s: *const u8) {
    // Issue all loads before the stores.
    let y0 = load::<SRC_ALIGNED>(s);
    let y1 = load::<SRC_ALIGNED>(s.add(32));
    let y2 = load::<SRC_ALIGNED>(s.add(64));
    let y3 = load::<SRC_ALIGNED>(s.add(96));
    let y4 = load::<SRC_ALIGNED>(s.add(128));
    let y5 = load::<SRC_ALIGNED>(s.add(160));
    let y6 = load::<SRC_ALIGNED>(s.add(192));
    let y7 = load::<SRC_ALIGNED>(s.add(224));

    // SAFETY: Non-temporal stores require 32-byte alignment; the caller
    // passes an aligned `d`.
    _mm256_stream_si256(d as *mut __m256i, y0);
    _mm256_stream_si256(d.add(32) as *mut __m256i, y1);
    _mm256_stream_si256(d.add(64) as *mut __m256i, y2);
    _mm256_stream_si256(d.add(96) as *mut __m256i, y3);
    _mm256_stream_si256(d.add(128) as *mut __m256i, y4);
    _mm256_stream_si256(d.add(160) as *mut __m256i, y5);
    _mm256_stream_si256(d.add(192) as *mut __m256i, y6);
    _mm256_stream_si256(d.add(224) as *mut __m256i, y7);
}

/// 128 bytes with regular aligned stores. `d` must be 32-byte aligned, and
/// `s` too when `SRC_ALIGNED`.
#[target_feature(enable = "avx")]
#[inline]
unsafe fn store_128<const SRC_ALIGNED: bool>(d: *mut u8, s: *const u8) {
    let y0 = load::<SRC_ALIGNED>(s);
    let y1 = load::<SRC_ALIGNED>(s.add(32));
    let y2 = load::<SRC_ALIGNED>(s.add(64));
    let y3 = load::<SRC_ALIGNED>(s.add(96));
    _mm256_store_si256(d as *mut __m256i, y0);
    _mm256_store_si256(d.add(32) as *mut __m256i, y1);
    _mm256_store_si256(d.add(64) as *mut __m256i, y2);
    _mm256_store_si256(d.add(96) as *mut __m256i, y3);
}

/// Main 256-byte streaming loop shared by stream-both and stream-destination.
/// Returns the updated `(offset, len)`.
#[target_feature(enable = "avx")]
#[inline]
unsafe fn stream_256_loop<const SRC_ALIGNED: bool, const PREFETCH_SRC: bool>(
    dst: *mut u8,
    src: *const u8,
    mut offset: usize,
    mut len: usize,
) -> (usize, usize) {
    while len >= 256 {
        stream_256::<SRC_ALIGNED>(dst.add(offset), src.add(offset));

        // Every fourth block, fetch the next 512 source bytes.
        if PREFETCH_SRC && len > 1024 && (offset >> 8) & 3 == 0 {
            for line in 8..16 {
                prefetch_read_nta(src.wrapping_add(offset + line * LINE));
            }
        }

        offset += 256;
        len -= 256;
    }
    (offset, len)
}

#[target_feature(enable = "avx")]
#[inline]
unsafe fn stream_64_loop(dst: *mut u8, src: *const u8, mut offset: usize, mut len: usize) -> (usize, usize) {
    while len >= 64 {
        stream_64(dst.add(offset), src.add(offset));
        offset += 64;
        len -= 64;
    }
    (offset, len)
}

#[inline(always)]
fn src_aligned_at(src: *const u8, offset: usize) -> bool {
    (src as usize).wrapping_add(offset) & 31 == 0
}

// =============================================================================
// STREAM-BOTH
// =============================================================================

/// Source and destination both bypass the cache. Ends with a store fence.
/// Returns the uncopied tail length (< 64).
///
/// # Safety
///
/// - `src` readable and `dst` writable for `len` bytes, not overlapping
/// - `len > 128`
/// - AVX must be available
#[target_feature(enable = "avx")]
pub unsafe fn stream_both(dst: *mut u8, src: *const u8, len: usize) -> usize {
    debug_assert!(len > 128);

    copy_64_unaligned(dst, src);

    let offset = LINE - (dst as usize & 31);
    let len = len - offset;

    let (offset, len) = if src_aligned_at(src, offset) {
        stream_256_loop::<true, true>(dst, src, offset, len)
    } else {
        stream_256_loop::<false, true>(dst, src, offset, len)
    };
    let (_, len) = stream_64_loop(dst, src, offset, len);

    // SAFETY: SFENCE orders the non-temporal stores before any later store,
    // so a consumer signalled after return sees the data.
    _mm_sfence();

    len
}

// =============================================================================
// STREAM-DESTINATION
// =============================================================================

/// Destination-side cache control. Large logical transfers use non-temporal
/// stores and end with a store fence; small ones use regular aligned stores
/// with write-prefetch look-ahead. Returns the uncopied tail length (< 64 for
/// the streaming branch, < 128 otherwise).
///
/// # Safety
///
/// - `src` readable and `dst` writable for `len` bytes, not overlapping
/// - `len > 128`
/// - AVX must be available
#[target_feature(enable = "avx")]
pub unsafe fn stream_dest(dst: *mut u8, src: *const u8, len: usize, total_len: usize) -> usize {
    debug_assert!(len > 128);

    prefetch_write(dst);
    prefetch_write(dst.wrapping_add(LINE));
    prefetch_write(dst.wrapping_add(2 * LINE));

    copy_64_unaligned(dst, src);

    if total_len > SWITCH_TO_NT_STORE_SIZE {
        let offset = LINE - (dst as usize & 31);
        let len = len - offset;

        let (offset, len) = if src_aligned_at(src, offset) {
            stream_256_loop::<true, false>(dst, src, offset, len)
        } else {
            stream_256_loop::<false, false>(dst, src, offset, len)
        };
        let (offset, len) = stream_64_loop(dst, src, offset, len);

        if len != 0 {
            prefetch_write(dst.wrapping_add(offset));
        }

        // SAFETY: SFENCE orders the non-temporal stores before any later
        // store, so a consumer signalled after return sees the data.
        _mm_sfence();

        return len;
    }

    copy_64_unaligned(dst.add(LINE), src.add(LINE));

    let mut offset = 2 * LINE - (dst as usize & 31);
    // Distance from the aligned loop start to the next line boundary not yet
    // prefetched; at most 64.
    let prefetch_tail = 3 * LINE - (offset + (dst as usize & 63));
    let mut len = len - offset;

    if len > prefetch_tail {
        prefetch_write(dst.wrapping_add(3 * LINE));
        if len > prefetch_tail + LINE {
            prefetch_write(dst.wrapping_add(4 * LINE));
        }
    }

    while len >= 128 {
        if len > prefetch_tail + 2 * LINE {
            prefetch_write(dst.wrapping_add(offset + 3 * LINE));
            if len > prefetch_tail + 3 * LINE {
                prefetch_write(dst.wrapping_add(offset + 4 * LINE));
            }
        }

        store_128::<false>(dst.add(offset), src.add(offset));

        offset += 128;
        len -= 128;
    }

    len
}

// =============================================================================
// STREAM-SOURCE
// =============================================================================

/// Source-side cache control: non-temporal read prefetch at increasing depth,
/// regular aligned stores so the destination stays cached. Returns the
/// uncopied tail length (< 128).
///
/// # Safety
///
/// - `src` readable and `dst` writable for `len` bytes, not overlapping
/// - `len > 128`
/// - AVX must be available
#[target_feature(enable = "avx")]
pub unsafe fn stream_source(dst: *mut u8, src: *const u8, len: usize) -> usize {
    debug_assert!(len > 128);

    prefetch_read_nta(src);
    prefetch_read_nta(src.wrapping_add(LINE));
    prefetch_read_nta(src.wrapping_add(2 * LINE));

    copy_64_unaligned(dst, src);
    copy_64_unaligned(dst.add(LINE), src.add(LINE));

    let mut offset = 2 * LINE - (dst as usize & 31);
    let prefetch_tail = 3 * LINE - (offset + (src as usize & 63));
    let mut len = len - offset;

    if len > prefetch_tail {
        prefetch_read_nta(src.wrapping_add(3 * LINE));
        if len > prefetch_tail + LINE {
            prefetch_read_nta(src.wrapping_add(4 * LINE));
        }
    }

    if !src_aligned_at(src, offset) {
        if len > prefetch_tail + 2 * LINE {
            prefetch_read_nta(src.wrapping_add(5 * LINE));
            if len > prefetch_tail + 3 * LINE {
                prefetch_read_nta(src.wrapping_add(6 * LINE));
            }
        }

        while len >= 128 {
            store_128::<false>(dst.add(offset), src.add(offset));

            if len > prefetch_tail + 4 * LINE {
                prefetch_read_nta(src.wrapping_add(prefetch_tail + offset + 4 * LINE));
                if len > prefetch_tail + 5 * LINE {
                    prefetch_read_nta(src.wrapping_add(prefetch_tail + offset + 5 * LINE));
                }
            }

            offset += 128;
            len -= 128;
        }
    } else {
        while len >= 128 {
            if len > prefetch_tail + 2 * LINE {
                prefetch_read_nta(src.wrapping_add(offset + 3 * LINE));
                if len > prefetch_tail + 3 * LINE {
                    prefetch_read_nta(src.wrapping_add(offset + 4 * LINE));
                }
            }

            store_128::<true>(dst.add(offset), src.add(offset));

            offset += 128;
            len -= 128;
        }
    }

    len
}
