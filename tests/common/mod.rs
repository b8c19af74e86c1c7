//! Instrumented backings and element types shared by the allocator tests.

#![allow(dead_code)]

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use reprieve::{AllocError, BackingAllocator, Heap};

/// Element that records its drop on a shared counter.
pub struct DropCounter {
    hits: Rc<Cell<usize>>,
}

impl DropCounter {
    pub fn new(hits: &Rc<Cell<usize>>) -> Self {
        Self {
            hits: Rc::clone(hits),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.hits.set(self.hits.get() + 1);
    }
}

/// Element that runs an arbitrary callback on drop.
pub struct OnDrop(pub Box<dyn FnMut()>);

impl Drop for OnDrop {
    fn drop(&mut self) {
        (self.0)();
    }
}

/// Heap backing that fails one allocation when the shared flag is set, then
/// clears the flag so the test can observe that the failure was hit.
#[derive(Clone)]
pub struct OomHeap {
    oom: Rc<Cell<bool>>,
}

impl OomHeap {
    pub fn new(oom: Rc<Cell<bool>>) -> Self {
        Self { oom }
    }
}

impl PartialEq for OomHeap {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.oom, &other.oom)
    }
}

unsafe impl BackingAllocator for OomHeap {
    type Handle = NonNull<u8>;

    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if self.oom.get() {
            self.oom.set(false);
            return Err(AllocError);
        }
        Heap.allocate(layout)
    }

    unsafe fn deallocate(&self, handle: NonNull<u8>, layout: Layout) {
        unsafe { Heap.deallocate(handle, layout) };
    }

    fn resolve(&self, handle: NonNull<u8>) -> NonNull<u8> {
        handle
    }
}

/// Heap backing bounded to a maximum number of live allocations.
#[derive(Clone)]
pub struct BoundedHeap {
    live: Rc<Cell<usize>>,
    max_live: usize,
}

impl BoundedHeap {
    pub fn new(max_live: usize) -> Self {
        Self {
            live: Rc::new(Cell::new(0)),
            max_live,
        }
    }

    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl PartialEq for BoundedHeap {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.live, &other.live)
    }
}

unsafe impl BackingAllocator for BoundedHeap {
    type Handle = NonNull<u8>;

    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if self.live.get() >= self.max_live {
            return Err(AllocError);
        }
        let handle = Heap.allocate(layout)?;
        self.live.set(self.live.get() + 1);
        Ok(handle)
    }

    unsafe fn deallocate(&self, handle: NonNull<u8>, layout: Layout) {
        self.live.set(self.live.get() - 1);
        unsafe { Heap.deallocate(handle, layout) };
    }

    fn resolve(&self, handle: NonNull<u8>) -> NonNull<u8> {
        handle
    }
}

/// Fixed arena whose handles are byte offsets from the arena base, not
/// addresses. Exercises the backing contract the way a shared-memory segment
/// allocator would.
///
/// Allocation bumps; `deallocate` only tracks liveness, the memory returns
/// with the arena.
#[derive(Clone)]
pub struct OffsetArena {
    inner: Rc<ArenaInner>,
}

struct ArenaInner {
    _storage: Box<[u64]>,
    base: *mut u8,
    size: usize,
    next: Cell<usize>,
    live: Cell<usize>,
}

impl OffsetArena {
    pub fn with_capacity(bytes: usize) -> Self {
        let words = bytes.div_ceil(8);
        let mut storage = vec![0u64; words].into_boxed_slice();
        let base = storage.as_mut_ptr().cast::<u8>();
        Self {
            inner: Rc::new(ArenaInner {
                _storage: storage,
                base,
                size: words * 8,
                next: Cell::new(0),
                live: Cell::new(0),
            }),
        }
    }

    pub fn live(&self) -> usize {
        self.inner.live.get()
    }
}

impl PartialEq for OffsetArena {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

unsafe impl BackingAllocator for OffsetArena {
    type Handle = usize;

    fn allocate(&self, layout: Layout) -> Result<usize, AllocError> {
        assert!(layout.align() <= 8, "arena storage is 8-byte aligned");
        let start = self
            .inner
            .next
            .get()
            .next_multiple_of(layout.align());
        let end = start.checked_add(layout.size()).ok_or(AllocError)?;
        if end > self.inner.size {
            return Err(AllocError);
        }
        self.inner.next.set(end);
        self.inner.live.set(self.inner.live.get() + 1);
        Ok(start)
    }

    unsafe fn deallocate(&self, _handle: usize, _layout: Layout) {
        self.inner.live.set(self.inner.live.get() - 1);
    }

    fn resolve(&self, handle: usize) -> NonNull<u8> {
        debug_assert!(handle < self.inner.size);
        // SAFETY: `handle` was produced by `allocate`, so it is in bounds.
        unsafe { NonNull::new_unchecked(self.inner.base.add(handle)) }
    }
}
