//! Allocator adaptor that defers object destruction and memory reclamation
//! until a fixed time window has elapsed.
//!
//! Under read-copy-update, a writer that has made old data unreachable must
//! wait for all pre-existing readers to drop their references before the data
//! can be destroyed. When readers are known to never hold a reference for
//! longer than some bounded time, the wait can be replaced by a fixed delay:
//! do not destroy anything until that time window has elapsed after the
//! unpublish. [`DeferredAllocator`] makes the delay explicit and batched:
//!
//! 1. `destroy` does nothing; destruction is deferred to reclamation.
//! 2. `deallocate` records the allocation in a fixed-capacity *delay buffer*.
//!    A full buffer is stamped with the monotonic clock and appended to the
//!    *delay list*, which is kept in ascending stamp order.
//! 3. Each time a buffer is offloaded, the allocator *purges*: it walks the
//!    delay list from the oldest entry, runs the destructors of every entry
//!    whose stamp plus the timeout has passed, and returns the memory to the
//!    backing allocator.
//!
//! The one guarantee is a lower bound: nothing is destroyed or freed before
//! its timeout has elapsed. Memory is not promised back *as soon as* it is
//! safe. A larger buffer capacity trades reclamation granularity for fewer
//! delay-list allocations.
//!
//! An allocator instance is single-threaded by contract: callers serialize
//! all operations on it. It may be moved between threads wholesale.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::thread;
use std::time::{Duration, Instant};

use crate::backing::{AllocError, BackingAllocator, Heap};

/// How far [`DeferredAllocator::purge`] should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Stop at the first delay-list entry whose timeout has not yet elapsed.
    Opportunistic,
    /// Drain the entire delay list, sleeping entries ripe as needed.
    Exhaustive,
}

// One deallocation awaiting reclamation: the element allocation and the
// element count that was passed to `allocate`.
struct Record<H> {
    handle: H,
    count: usize,
}

// Header of a delay buffer. `buffer_capacity` records follow it in the same
// allocation. `next` links buffers on the delay list; `stamp` is meaningful
// only once the buffer has been offloaded (or, for the current buffer, once
// the allocator is being dropped).
struct BufferHeader<H> {
    next: Option<H>,
    stamp: Instant,
}

/// Allocator adaptor that delays destruction and deallocation by a fixed
/// timeout.
///
/// Wraps a [`BackingAllocator`] `A` and allocates `T` elements through it.
/// See the [module documentation](self) for the reclamation scheme.
///
/// # Misuse
///
/// Because destruction happens together with the delayed deallocation, two
/// usage patterns that are legal with ordinary allocators are undefined here
/// and must be avoided:
///
/// - deallocating storage whose elements were never constructed: reclamation
///   would run destructors on garbage;
/// - reusing storage after [`destroy`](Self::destroy): the previous object
///   is still alive until its timed reclamation.
///
/// An element destructor that panics during reclamation propagates out of
/// whichever operation triggered it; the allocator stays droppable and
/// purgeable afterwards, but records caught mid-reclamation are leaked.
///
/// # Equality and cloning
///
/// Two allocators compare equal exactly when their backings compare equal and
/// their timeouts are equal; equal allocators may reclaim each other's
/// allocations. Cloning copies the configuration only: the clone starts with
/// its own empty delay buffer and an empty delay list, and compares equal to
/// its source. Moving transfers the buffer and the delay list.
pub struct DeferredAllocator<T, A: BackingAllocator = Heap> {
    backing: A,
    timeout: Duration,
    // Cached monotonic clock reading, refreshed when a buffer is offloaded
    // or a purge starts.
    now: Instant,
    buffer_capacity: usize,
    buffer_layout: Layout,
    records_offset: usize,
    // `None` only while a full buffer is being offloaded; a reclamation
    // panic can leave it that way, in which case the allocator only accepts
    // being purged and dropped.
    current: Option<A::Handle>,
    current_len: usize,
    // Delay list: singly linked through the buffer headers, oldest first,
    // with a cached tail. Buffers on it are always full and their stamps are
    // non-decreasing. The current buffer is never on it.
    head: Option<A::Handle>,
    tail: Option<A::Handle>,
    marker: PhantomData<T>,
}

// SAFETY: the allocator owns its buffers and the queued elements outright;
// handing the whole instance to another thread moves that ownership with it.
unsafe impl<T: Send, A: BackingAllocator + Send> Send for DeferredAllocator<T, A> {}

impl<T, A: BackingAllocator> DeferredAllocator<T, A> {
    /// Creates a deferred allocator over `backing`.
    ///
    /// `timeout` is the window during which a deallocated element is
    /// guaranteed to stay alive. `buffer_capacity` is the number of
    /// deallocations batched per delay buffer and must be at least 1.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_capacity` is zero, if `T` is zero-sized, or if the
    /// backing cannot supply the initial delay buffer (there is no delay
    /// list to fall back on yet).
    pub fn new(backing: A, timeout: Duration, buffer_capacity: usize) -> Self {
        assert!(buffer_capacity >= 1, "delay buffer capacity must be at least 1");
        assert!(mem::size_of::<T>() != 0, "zero-sized element types need no allocator");
        let (buffer_layout, records_offset) = buffer_layout_for::<A::Handle>(buffer_capacity);

        let now = Instant::now();
        let current = match buffer_new(&backing, buffer_layout, now) {
            Ok(buffer) => buffer,
            Err(AllocError) => std::alloc::handle_alloc_error(buffer_layout),
        };

        Self {
            backing,
            timeout,
            now,
            buffer_capacity,
            buffer_layout,
            records_offset,
            current: Some(current),
            current_len: 0,
            head: None,
            tail: None,
            marker: PhantomData,
        }
    }

    /// Forwards an allocation of `n` elements to the backing allocator.
    ///
    /// Every allocation must be matched by [`construct`](Self::construct)
    /// (or [`construct_at`](Self::construct_at) for each element) before it
    /// is eventually passed to [`deallocate`](Self::deallocate).
    pub fn allocate(&self, n: usize) -> Result<A::Handle, AllocError> {
        debug_assert!(n >= 1);
        let layout = Layout::array::<T>(n).map_err(|_| AllocError)?;
        self.backing.allocate(layout)
    }

    /// Resolves an element handle to a typed pointer.
    pub fn resolve(&self, handle: A::Handle) -> NonNull<T> {
        self.backing.resolve(handle).cast()
    }

    /// Constructs `value` in place at the start of the allocation.
    ///
    /// # Safety
    ///
    /// `handle` must come from [`allocate`](Self::allocate) on an equal
    /// allocator and the slot must not already hold a live element.
    pub unsafe fn construct(&self, handle: A::Handle, value: T) {
        // SAFETY: per the caller, the slot is allocated and vacant.
        unsafe { self.resolve(handle).as_ptr().write(value) };
    }

    /// Constructs `value` in place at element `index` of the allocation.
    ///
    /// # Safety
    ///
    /// As for [`construct`](Self::construct), and `index` must be within the
    /// element count passed to `allocate`.
    pub unsafe fn construct_at(&self, handle: A::Handle, index: usize, value: T) {
        // SAFETY: per the caller, slot `index` is allocated and vacant.
        unsafe { self.resolve(handle).as_ptr().add(index).write(value) };
    }

    /// Does nothing: destruction is deferred until the delayed deallocation.
    ///
    /// The storage must not be reused afterwards: the element is still
    /// alive and stays so until its timeout elapses after
    /// [`deallocate`](Self::deallocate).
    pub fn destroy(&self, _handle: A::Handle) {}

    /// Marks an allocation for delayed destruction and deallocation.
    ///
    /// The allocation is appended to the current delay buffer; its elements'
    /// destructors and the backing `deallocate` run no earlier than `timeout`
    /// after this call returns. When the call fills the buffer, the buffer is
    /// stamped and offloaded to the delay list, ripe delay-list entries are
    /// reclaimed inline, and a replacement buffer is reused or allocated.
    ///
    /// If the backing cannot supply a replacement buffer, the call blocks
    /// until the oldest delay-list entry ripens (at worst the full timeout)
    /// and reuses that entry's buffer. The failure is never reported to the
    /// caller: the buffer that was just offloaded guarantees the delay list
    /// is non-empty.
    ///
    /// Panics from element destructors run during the inline purge propagate
    /// out of this call; the buffer being reclaimed is unlinked first, so
    /// already-queued records are leaked rather than dropped twice.
    ///
    /// # Safety
    ///
    /// `handle` must come from [`allocate`](Self::allocate)`(n)` on an equal
    /// allocator, all `n` elements must be constructed and not yet dropped,
    /// and the handle must not be used again afterwards.
    pub unsafe fn deallocate(&mut self, handle: A::Handle, n: usize) {
        debug_assert!(
            self.current_len < self.buffer_capacity,
            "the current buffer is offloaded as soon as it fills, so it is never full on entry"
        );
        debug_assert!(self.current.is_some(), "allocator used after a reclamation panic");
        let Some(current) = self.current else { return };

        // Preallocated slot; cannot fail.
        let record = Record { handle, count: n };
        // SAFETY: `current` is live and `current_len` is within capacity.
        unsafe { self.record_ptr(current, self.current_len).write(record) };
        self.current_len += 1;

        if self.current_len == self.buffer_capacity {
            self.offload_current_buffer(current);
        }
    }

    /// Destroys and deallocates delay-list entries whose timeout has elapsed.
    ///
    /// `Opportunistic` stops at the first entry that is still too young;
    /// `Exhaustive` sleeps such entries ripe and drains the whole list. The
    /// current delay buffer is never purged: it has no stamp yet, so nothing
    /// short of waiting the full timeout could prove its records safe.
    ///
    /// Panics from element destructors propagate; see
    /// [`deallocate`](Self::deallocate).
    pub fn purge(&mut self, mode: PurgeMode) {
        self.now = Instant::now();

        while let Some(oldest) = self.head {
            let ready = self.stamp(oldest) + self.timeout;
            if self.now >= ready {
                self.pop_front_and_reclaim(oldest);
                self.buffer_free(oldest);
            } else {
                match mode {
                    PurgeMode::Opportunistic => return,
                    PurgeMode::Exhaustive => {
                        sleep_until(ready);
                        // We slept at least until `ready`; reuse it as our
                        // view of the clock instead of sampling again.
                        self.now = ready;
                        self.pop_front_and_reclaim(oldest);
                        self.buffer_free(oldest);
                    }
                }
            }
        }
    }

    // Stamps and offloads the full current buffer, then installs a
    // replacement: a buffer freed by the inline purge if any, a freshly
    // allocated one otherwise, and failing that a buffer recovered by
    // waiting out the oldest delay-list entry.
    //
    // While this runs there is no current buffer: its records are owned by
    // the delay-list entry, so a destructor panic unwinding through here
    // cannot make `drop` revisit them.
    fn offload_current_buffer(&mut self, full: A::Handle) {
        self.now = Instant::now();
        self.set_stamp(full, self.now);
        self.current = None;
        self.current_len = 0;
        self.list_push_back(full);

        let replacement = match self.purge_and_reuse() {
            Some(buffer) => buffer,
            None => match buffer_new(&self.backing, self.buffer_layout, self.now) {
                Ok(buffer) => buffer,
                Err(AllocError) => {
                    // Out of memory. The buffer we just offloaded sits on the
                    // delay list, so waiting out the oldest entry always
                    // recovers a buffer to reuse.
                    debug_assert!(self.head.is_some());
                    if let Some(oldest) = self.head {
                        sleep_until(self.stamp(oldest) + self.timeout);
                    }
                    self.now = Instant::now();
                    match self.purge_and_reuse() {
                        Some(buffer) => buffer,
                        None => unreachable!(
                            "sleeping out the oldest delay-list entry always frees a buffer"
                        ),
                    }
                }
            },
        };
        self.current = Some(replacement);
    }

    // Reclaims every ripe delay-list entry against the cached `now`. The
    // oldest freed buffer is kept for reuse and the younger ones are
    // released, which keeps the allocator's working set young.
    fn purge_and_reuse(&mut self) -> Option<A::Handle> {
        let mut reuse = None;
        while let Some(oldest) = self.head {
            if self.now < self.stamp(oldest) + self.timeout {
                break;
            }
            self.pop_front_and_reclaim(oldest);
            match reuse {
                None => reuse = Some(oldest),
                Some(_) => self.buffer_free(oldest),
            }
        }
        reuse
    }

    // Unlinks the head of the delay list (which must be `buffer`) and
    // reclaims all of its records. Unlinking happens first: if a destructor
    // panics, the remainder of the buffer leaks instead of being revisited.
    fn pop_front_and_reclaim(&mut self, buffer: A::Handle) {
        let popped = self.list_pop_front();
        debug_assert!(popped.is_some());
        // Buffers reach the delay list only when full.
        // SAFETY: every record was registered through `deallocate`, whose
        // contract makes its elements live and exclusively ours.
        unsafe { self.reclaim_records(buffer, self.buffer_capacity) };
    }

    // Runs the destructors of records `0..len` of `buffer` and returns each
    // element region to the backing. No timeout check is made here.
    unsafe fn reclaim_records(&self, buffer: A::Handle, len: usize) {
        for i in 0..len {
            // SAFETY: record `i` was written by `deallocate` and is in bounds.
            let record = unsafe { self.record_ptr(buffer, i).read() };
            let elements = self.backing.resolve(record.handle).cast::<T>().as_ptr();
            for j in 0..record.count {
                // SAFETY: `deallocate`'s contract: all `count` elements are
                // constructed and dropped nowhere else.
                unsafe { ptr::drop_in_place(elements.add(j)) };
            }
            // SAFETY: `Layout::array` succeeded when this allocation was made.
            let layout = unsafe {
                Layout::from_size_align_unchecked(
                    mem::size_of::<T>() * record.count,
                    mem::align_of::<T>(),
                )
            };
            // SAFETY: the handle came from `allocate` with this layout.
            unsafe { self.backing.deallocate(record.handle, layout) };
        }
    }

    fn buffer_free(&self, buffer: A::Handle) {
        // Header and records are plain data; nothing to drop.
        // SAFETY: `buffer` was allocated with `buffer_layout` and is unlinked.
        unsafe { self.backing.deallocate(buffer, self.buffer_layout) };
    }

    fn header_ptr(&self, buffer: A::Handle) -> *mut BufferHeader<A::Handle> {
        self.backing.resolve(buffer).as_ptr().cast()
    }

    fn record_ptr(&self, buffer: A::Handle, index: usize) -> *mut Record<A::Handle> {
        debug_assert!(index < self.buffer_capacity);
        let base = self.backing.resolve(buffer).as_ptr();
        // SAFETY: `records_offset + index` stays within the buffer layout.
        unsafe { base.add(self.records_offset).cast::<Record<A::Handle>>().add(index) }
    }

    fn stamp(&self, buffer: A::Handle) -> Instant {
        // SAFETY: `buffer` is a live delay buffer.
        unsafe { (*self.header_ptr(buffer)).stamp }
    }

    fn set_stamp(&self, buffer: A::Handle, stamp: Instant) {
        // SAFETY: `buffer` is a live delay buffer.
        unsafe { (*self.header_ptr(buffer)).stamp = stamp };
    }

    fn next_of(&self, buffer: A::Handle) -> Option<A::Handle> {
        // SAFETY: `buffer` is a live delay buffer.
        unsafe { (*self.header_ptr(buffer)).next }
    }

    fn set_next(&self, buffer: A::Handle, next: Option<A::Handle>) {
        // SAFETY: `buffer` is a live delay buffer.
        unsafe { (*self.header_ptr(buffer)).next = next };
    }

    fn list_push_back(&mut self, buffer: A::Handle) {
        self.set_next(buffer, None);
        match self.tail {
            Some(tail) => self.set_next(tail, Some(buffer)),
            None => self.head = Some(buffer),
        }
        self.tail = Some(buffer);
    }

    fn list_pop_front(&mut self) -> Option<A::Handle> {
        let head = self.head?;
        self.head = self.next_of(head);
        if self.head.is_none() {
            self.tail = None;
        }
        Some(head)
    }
}

impl<T, A: BackingAllocator + Default> DeferredAllocator<T, A> {
    /// Creates a deferred allocator over a default-constructed backing.
    pub fn with_timeout(timeout: Duration, buffer_capacity: usize) -> Self {
        Self::new(A::default(), timeout, buffer_capacity)
    }
}

impl<T, A: BackingAllocator + PartialEq> PartialEq for DeferredAllocator<T, A> {
    fn eq(&self, other: &Self) -> bool {
        self.timeout == other.timeout && self.backing == other.backing
    }
}

impl<T, A: BackingAllocator + Eq> Eq for DeferredAllocator<T, A> {}

impl<T, A: BackingAllocator + Clone> Clone for DeferredAllocator<T, A> {
    // Configuration only: the clone starts with its own empty delay buffer
    // and an empty delay list. Queued reclamations stay with the original,
    // and the clone still compares equal to it, so either may deallocate
    // what the other allocated.
    fn clone(&self) -> Self {
        Self::new(self.backing.clone(), self.timeout, self.buffer_capacity)
    }
}

impl<T, A: BackingAllocator> Drop for DeferredAllocator<T, A> {
    /// Reclaims everything that was passed to
    /// [`deallocate`](Self::deallocate), waiting out each entry's timeout.
    ///
    /// The delay list is drained oldest-first; by the time the younger
    /// entries are reached their timeouts have often already elapsed, which
    /// keeps the destructor's latency close to one timeout rather than one
    /// per entry. Records in the current buffer were never stamped, so they
    /// wait the full timeout measured from here.
    fn drop(&mut self) {
        // A propagated reclamation panic can leave no current buffer; the
        // delay list is still drained either way.
        if let Some(current) = self.current {
            self.set_stamp(current, Instant::now());
        }

        self.purge(PurgeMode::Exhaustive);
        debug_assert!(self.head.is_none() && self.tail.is_none());

        if let Some(current) = self.current.take() {
            if self.current_len > 0 {
                sleep_until(self.stamp(current) + self.timeout);
                let len = mem::replace(&mut self.current_len, 0);
                // SAFETY: as in `pop_front_and_reclaim`; only `len` records
                // of the current buffer were ever written.
                unsafe { self.reclaim_records(current, len) };
            }
            self.buffer_free(current);
        }
    }
}

// Layout of one delay buffer and the offset of its record array.
fn buffer_layout_for<H>(capacity: usize) -> (Layout, usize) {
    let header = Layout::new::<BufferHeader<H>>();
    let records = match Layout::array::<Record<H>>(capacity) {
        Ok(records) => records,
        Err(_) => panic!("delay buffer capacity overflows the address space"),
    };
    match header.extend(records) {
        Ok((layout, offset)) => (layout.pad_to_align(), offset),
        Err(_) => panic!("delay buffer capacity overflows the address space"),
    }
}

// Allocates an empty, unlinked delay buffer. `stamp` is a placeholder; a
// meaningful stamp is assigned when the buffer is offloaded.
fn buffer_new<A: BackingAllocator>(
    backing: &A,
    layout: Layout,
    stamp: Instant,
) -> Result<A::Handle, AllocError> {
    let buffer = backing.allocate(layout)?;
    let header = backing.resolve(buffer).as_ptr().cast::<BufferHeader<A::Handle>>();
    // SAFETY: freshly allocated region, properly aligned for the header.
    unsafe { header.write(BufferHeader { next: None, stamp }) };
    Ok(buffer)
}

// `Instant` is monotonic and never fails, so every sleep here is bounded by
// the configured timeout. `thread::sleep` guarantees at least the requested
// duration, so the clock reads at or past `deadline` on return.
fn sleep_until(deadline: Instant) {
    let wait = deadline.saturating_duration_since(Instant::now());
    if !wait.is_zero() {
        thread::sleep(wait);
    }
}
