//! Backing-allocator abstraction used by the deferred allocator.
//!
//! The deferred allocator never assumes that an allocation handle is a raw
//! address. Everything it stores (element allocations, delay buffers, the
//! links of the delay list) is kept as an opaque [`BackingAllocator::Handle`]
//! and only turned into a dereferenceable pointer through
//! [`BackingAllocator::resolve`]. A backing over an offset-addressed arena
//! (e.g. a shared-memory segment) works the same way as the process heap.

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

/// Error returned when a backing allocator cannot satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backing allocator failed to satisfy an allocation request")
    }
}

impl std::error::Error for AllocError {}

/// Source of raw memory for a [`DeferredAllocator`](crate::DeferredAllocator).
///
/// `Handle` identifies an allocation but is not required to be an address.
/// [`resolve`](Self::resolve) is the only sanctioned way to obtain a pointer
/// into the allocation, and the result is only valid until the handle is
/// passed back to [`deallocate`](Self::deallocate).
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - a handle returned by `allocate(layout)` denotes a region of at least
///   `layout.size()` bytes aligned to `layout.align()`, disjoint from every
///   other live allocation of this backing;
/// - `resolve` returns a pointer to the start of that region, and the pointer
///   stays valid until the handle is deallocated;
/// - `deallocate` is only required to accept a handle previously returned by
///   `allocate` on an equal backing, together with the original layout.
pub unsafe trait BackingAllocator {
    /// Opaque identifier for one allocation.
    type Handle: Copy;

    /// Allocates a region for `layout`. `layout.size()` is never zero.
    fn allocate(&self, layout: Layout) -> Result<Self::Handle, AllocError>;

    /// Returns the region identified by `handle` to the backing.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by [`allocate`](Self::allocate) on an
    /// equal backing with the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, handle: Self::Handle, layout: Layout);

    /// Resolves `handle` to the address of its region.
    fn resolve(&self, handle: Self::Handle) -> NonNull<u8>;
}

/// Process-heap backing over [`std::alloc`].
///
/// Handles are plain addresses; `resolve` is the identity. All `Heap` values
/// compare equal, so any heap-backed deferred allocator may reclaim memory
/// obtained from any other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heap;

unsafe impl BackingAllocator for Heap {
    type Handle = NonNull<u8>;

    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0);
        // SAFETY: the trait contract guarantees a non-zero-sized layout.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, handle: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller passes back a live allocation with its layout.
        unsafe { std::alloc::dealloc(handle.as_ptr(), layout) };
    }

    fn resolve(&self, handle: NonNull<u8>) -> NonNull<u8> {
        handle
    }
}
