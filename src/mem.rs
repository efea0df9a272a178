//! Slice-level copy functions
//!
//! Safe wrappers over the raw-pointer entry points. Each copies
//! `min(dest.len(), src.len())` bytes and returns that count.

use crate::memcpy::{self, CopyHint};
use crate::relaxed;

/// Copy through the transfer engine as one chunk of a `total_len`-byte
/// logical transfer.
///
/// `total_len` is raised to the copied length if it is smaller.
///
/// # Examples
/// ```
/// use fastcopy::mem::transfer;
/// use fastcopy::CopyHint;
/// let src = vec![7u8; 4096];
/// let mut dest = vec![0u8; 4096];
/// assert_eq!(transfer(&mut dest, &src, CopyHint::STREAM_DEST, 1 << 20), 4096);
/// assert_eq!(dest, src);
/// ```
pub fn transfer(dest: &mut [u8], src: &[u8], hint: CopyHint, total_len: usize) -> usize {
    let n = dest.len().min(src.len());
    // SAFETY: Both slices cover `n` bytes, and a `&mut` slice cannot alias
    // a shared one.
    unsafe { memcpy::transfer(dest.as_mut_ptr(), src.as_ptr(), n, hint, total_len.max(n)) };
    n
}

/// Copy whole slices, letting the process-wide policy pick the strategy.
///
/// # Examples
/// ```
/// use fastcopy::mem::copy;
/// use fastcopy::CopyHint;
/// let mut dest = [0u8; 5];
/// assert_eq!(copy(&mut dest, b"hello", CopyHint::empty()), 5);
/// assert_eq!(&dest, b"hello");
/// ```
pub fn copy(dest: &mut [u8], src: &[u8], hint: CopyHint) -> usize {
    let n = dest.len().min(src.len());
    // SAFETY: Both slices cover `n` bytes and cannot overlap.
    unsafe { memcpy::copy(dest.as_mut_ptr(), src.as_ptr(), n, hint, n) };
    n
}

/// Copy with the string-move window.
pub fn relaxed_copy(dest: &mut [u8], src: &[u8]) -> usize {
    let n = dest.len().min(src.len());
    // SAFETY: Both slices cover `n` bytes and cannot overlap.
    unsafe { relaxed::relaxed_copy(dest.as_mut_ptr(), src.as_ptr(), n) };
    n
}
