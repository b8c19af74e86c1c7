//! Reprieve: time-deferred memory reclamation for RCU-style services.
//! Bounded destruction latency, batched reclamation, predictable blocking.
//!
//! When shared data is unpublished by a writer while readers may still hold
//! references to it, destruction has to wait until those readers are gone.
//! If readers are known to never hold a reference longer than a fixed time
//! window, no grace-period tracking is needed: it is enough to not destroy
//! anything until that window has elapsed. Reprieve packages that discipline
//! as an allocator adaptor, together with the small locking primitive its
//! users tend to reach for.
//!
//! # Components
//!
//! - [`DeferredAllocator`]: allocator adaptor that batches deallocations into
//!   timestamped delay buffers and reclaims them only after a configured
//!   timeout, over any [`BackingAllocator`].
//! - [`SmallSpinMutex`] / [`SpinLock`]: a one-byte non-recursive spin mutex,
//!   raw and RAII flavors, for microscopic critical sections.
//!
//! The companion `reprieve-channel` crate provides the bounded MPMC channel
//! used to hand work between the producer and consumer sides of such
//! services.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use reprieve::{DeferredAllocator, Heap};
//!
//! let mut allocator: DeferredAllocator<u64> =
//!     DeferredAllocator::new(Heap, Duration::from_millis(1), 4);
//!
//! let handle = allocator.allocate(1).unwrap();
//! unsafe { allocator.construct(handle, 42u64) };
//! assert_eq!(unsafe { *allocator.resolve(handle).as_ref() }, 42);
//!
//! // Destruction is deferred: the value stays alive for at least the
//! // timeout after `deallocate` returns, and is reclaimed at the latest
//! // when the allocator is dropped.
//! allocator.destroy(handle);
//! unsafe { allocator.deallocate(handle, 1) };
//! ```

#![warn(missing_docs)]

mod backing;
mod deferred;
mod spin;

pub use backing::{AllocError, BackingAllocator, Heap};
pub use deferred::{DeferredAllocator, PurgeMode};
pub use spin::{SmallSpinMutex, SpinGuard, SpinLock};
