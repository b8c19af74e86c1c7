//! The allocator never assumes handles are addresses: an offset-addressed
//! arena backing must work end to end, delay buffers included.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use common::{DropCounter, OffsetArena};
use reprieve::DeferredAllocator;

#[test]
#[cfg_attr(miri, ignore)]
fn offset_handles_work_end_to_end() {
    let arena = OffsetArena::with_capacity(64 * 1024);
    let hits = Rc::new(Cell::new(0));

    {
        let mut allocator: DeferredAllocator<DropCounter, OffsetArena> =
            DeferredAllocator::new(arena.clone(), Duration::from_millis(1), 8);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let handle = allocator.allocate(1).unwrap();
            unsafe { allocator.construct(handle, DropCounter::new(&hits)) };
            handles.push(handle);
        }

        // Handles are small arena offsets, not addresses.
        for &handle in &handles {
            assert!(handle < 64 * 1024);
        }

        for &handle in &handles {
            allocator.destroy(handle);
            unsafe { allocator.deallocate(handle, 1) };
        }
    }

    assert_eq!(hits.get(), 20);
    assert_eq!(arena.live(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn resolve_reads_back_what_construct_wrote() {
    let arena = OffsetArena::with_capacity(4096);
    let mut allocator: DeferredAllocator<u64, OffsetArena> =
        DeferredAllocator::new(arena, Duration::from_millis(1), 4);

    let handle = allocator.allocate(3).unwrap();
    for i in 0..3 {
        unsafe { allocator.construct_at(handle, i, (i as u64) * 7) };
    }
    for i in 0..3 {
        let value = unsafe { *allocator.resolve(handle).as_ptr().add(i) };
        assert_eq!(value, (i as u64) * 7);
    }

    allocator.destroy(handle);
    unsafe { allocator.deallocate(handle, 3) };
}
