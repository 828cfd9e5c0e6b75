//! The generic heap the size classes sit in front of.

use std::{fmt, ptr::NonNull};

use libc::c_void;

/// The four operations consumed from the host's general purpose allocator.
///
/// Used for requests no class can hold, for classes that are exhausted and
/// cannot grow, and for resizing blocks that already live here.
///
/// # Safety
///
/// Implementations must return blocks that are valid for reads and writes
/// of the requested size and aligned to at least 8 bytes, and must accept
/// back in `resize`/`free` any block they handed out.
pub unsafe trait FallbackAllocator: Send + Sync + fmt::Debug {
    /// `malloc`: a block of `size` bytes, or `None` if the heap is exhausted.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// `calloc`: a zero-filled block of `count * size` bytes.
    fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>>;

    /// `realloc`: grows or shrinks `block`, possibly moving it. On `None`
    /// the original block is left untouched.
    ///
    /// # Safety
    ///
    /// `block` must come from this allocator and not have been freed.
    unsafe fn resize(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// `free`.
    ///
    /// # Safety
    ///
    /// `block` must come from this allocator and not have been freed.
    unsafe fn free(&self, block: NonNull<u8>);
}

/// The C library heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

unsafe impl FallbackAllocator for LibcHeap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc has no preconditions.
        NonNull::new(unsafe { libc::malloc(size) }.cast())
    }

    fn zero_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: calloc checks the multiplication itself.
        NonNull::new(unsafe { libc::calloc(count, size) }.cast())
    }

    unsafe fn resize(&self, block: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { libc::realloc(block.as_ptr().cast::<c_void>(), size) }.cast())
    }

    unsafe fn free(&self, block: NonNull<u8>) {
        unsafe { libc::free(block.as_ptr().cast::<c_void>()) }
    }
}
