//! Size-windowed string-move copy.
//!
//! Inside the `[builtin_memcpy_min, builtin_memcpy_max]` window the processor's
//! `rep movsb` microcode beats a vector loop; outside it the generic copy wins.
#![allow(unsafe_code)]

use core::arch::asm;
use core::ptr;

use crate::policy::thresholds;

/// Copy using the process-wide string-move window.
///
/// # Safety
///
/// - `src` must be readable and `dst` writable for `len` bytes
/// - The regions must not overlap
#[inline]
pub unsafe fn relaxed_copy(dst: *mut u8, src: *const u8, len: usize) {
    let policy = thresholds();
    copy_in_window(dst, src, len, policy.builtin_memcpy_min, policy.builtin_memcpy_max);
}

/// `rep movsb` when `min <= len <= max`, generic copy otherwise.
///
/// # Safety
///
/// Same as [`relaxed_copy`].
#[inline]
pub unsafe fn copy_in_window(dst: *mut u8, src: *const u8, len: usize, min: usize, max: usize) {
    if (min..=max).contains(&len) {
        rep_movsb(dst, src, len);
    } else {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}

#[inline(always)]
unsafe fn rep_movsb(dst: *mut u8, src: *const u8, len: usize) {
    // SAFETY: The direction flag is clear per the SysV ABI, so the move runs
    // forward over exactly `len` bytes the caller vouched for.
    asm!(
        "rep movsb",
        inout("rdi") dst => _,
        inout("rsi") src => _,
        inout("rcx") len => _,
        options(nostack, preserves_flags)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(len: usize, min: usize, max: usize) {
        let src: Vec<u8> = (0..len + 32).map(|i| (i % 241) as u8).collect();
        let mut dst = vec![0u8; len + 32];
        unsafe {
            copy_in_window(dst[3..].as_mut_ptr(), src[11..].as_ptr(), len, min, max);
        }
        assert_eq!(&dst[3..3 + len], &src[11..11 + len], "len={len} window=[{min}, {max}]");
        assert!(dst[3 + len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_inside_and_outside_window() {
        for len in [0, 1, 15, 1023, 1024, 1025, 8192, 140_000] {
            run(len, 1024, 136 * 1024);
            run(len, 0, usize::MAX);
            run(len, usize::MAX, usize::MAX);
        }
    }

    #[test]
    fn test_relaxed_copy_global_window() {
        let src: Vec<u8> = (0..10_000).map(|i| (i % 199) as u8).collect();
        let mut dst = vec![0u8; 10_000];
        for len in [0, 64, 1024, 4096, 10_000] {
            unsafe { relaxed_copy(dst.as_mut_ptr(), src.as_ptr(), len) };
            assert_eq!(&dst[..len], &src[..len]);
        }
    }
}
