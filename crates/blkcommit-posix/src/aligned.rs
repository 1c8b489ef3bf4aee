//! Sector-aligned scratch buffer for `O_DIRECT` I/O.
//!
//! `block/raw-posix.c` requires buffers passed to direct I/O to be aligned
//! to the underlying device's sector size; callers that can't guarantee
//! that allocate a bounce buffer instead. This is the bounce buffer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

pub(crate) struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    pub(crate) fn new(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), align).expect("valid alignment");
        // SAFETY: `layout` has non-zero size and a valid (power-of-two)
        // alignment checked by `Layout::from_size_align`.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, len, layout }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` was allocated for `len` bytes and is not mutated
        // concurrently; `self` outlives the slice's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same allocation as `as_slice`, exclusive borrow via `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` are exactly what `alloc_zeroed` returned.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
