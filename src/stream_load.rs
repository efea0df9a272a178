//! 128-bit streaming-load copy for processors without the 256-bit path.
#![allow(unsafe_code)]

use core::arch::x86_64::*;
use core::ptr;

use crate::cpu::{CpuFlags, get_flags};

/// Copy with non-temporal 16-byte source loads when SSE4.1 is available,
/// plain copy otherwise.
///
/// # Safety
///
/// - `src` must be readable and `dst` writable for `len` bytes
/// - The regions must not overlap
pub unsafe fn memcpy_stream_load(dst: *mut u8, src: *const u8, len: usize) {
    memcpy_stream_load_for(get_flags(), dst, src, len)
}

/// [`memcpy_stream_load`] against an explicit feature set.
pub(crate) unsafe fn memcpy_stream_load_for(flags: CpuFlags, dst: *mut u8, src: *const u8, len: usize) {
    if flags.contains(CpuFlags::SSE41) {
        stream_load_sse41(dst, src, len);
    } else {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}

#[target_feature(enable = "sse4.1")]
unsafe fn stream_load_sse41(mut dst: *mut u8, mut src: *const u8, mut len: usize) {
    // Bring the source to 16-byte alignment. Only bytes inside the buffer
    // are touched.
    let misalign = src as usize & 15;
    if misalign != 0 {
        let head = len.min(16 - misalign);
        ptr::copy_nonoverlapping(src, dst, head);
        src = src.add(head);
        dst = dst.add(head);
        len -= head;
    }

    // SAFETY: `src` is 16-byte aligned from here on, as MOVNTDQA requires.
    while len >= 64 {
        let s = src as *const __m128i;
        let v0 = _mm_stream_load_si128(s);
        let v1 = _mm_stream_load_si128(s.add(1));
        let v2 = _mm_stream_load_si128(s.add(2));
        let v3 = _mm_stream_load_si128(s.add(3));

        let d = dst as *mut __m128i;
        _mm_storeu_si128(d, v0);
        _mm_storeu_si128(d.add(1), v1);
        _mm_storeu_si128(d.add(2), v2);
        _mm_storeu_si128(d.add(3), v3);

        src = src.add(64);
        dst = dst.add(64);
        len -= 64;
    }

    while len >= 16 {
        let v = _mm_stream_load_si128(src as *const __m128i);
        _mm_storeu_si128(dst as *mut __m128i, v);
        src = src.add(16);
        dst = dst.add(16);
        len -= 16;
    }

    if len != 0 {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}
