//! Page-aligned buffers handed to the kernel for direct i/o.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment of all i/o buffers. O_DIRECT requires at least the logical
/// sector size; one page covers both supported sector sizes.
pub const BUF_ALIGN: usize = 4096;

/// An owned, page-aligned, zero-initialized byte buffer.
///
/// Buffers move into the blocking task that performs the transfer. When a
/// deadline is missed the task keeps the buffer until the syscall returns,
/// so a caller can never observe a buffer the kernel is still writing into.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is exclusively owned plain memory.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// Panics if `len` is zero.
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-length i/o buffer");
        let layout = Layout::from_size_align(len, BUF_ALIGN).expect("i/o buffer layout");
        // SAFETY: the layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        AlignedBuf { ptr, len }
    }

    /// Allocate a buffer holding a copy of `data`, zero-padded to `len`.
    pub fn from_slice(data: &[u8], len: usize) -> Self {
        assert!(data.len() <= len, "data longer than i/o buffer");
        let mut buf = Self::zeroed(len);
        buf[..data.len()].copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero the buffer in place.
    pub fn clear(&mut self) {
        self.fill(0);
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, BUF_ALIGN).expect("i/o buffer layout");
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len describe our exclusive allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe our exclusive allocation.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for AlignedBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for AlignedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}
