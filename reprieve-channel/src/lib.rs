//! Bounded multi-producer multi-consumer channel with close-to-drain
//! semantics.
//!
//! [`BoundedChannel`] is a thread-safe bounded FIFO: producers block (or
//! soft-fail, or time out) when it is full, consumers block when it is
//! empty, and closing it stops producers while letting consumers drain what
//! remains. Every operation outcome is a typed result (success, empty,
//! full, closed, or timeout), so callers can tell back-pressure from
//! shutdown.
//!
//! # Key features
//!
//! - **MPMC**: any number of concurrent producers and consumers, through a
//!   shared reference.
//! - **Blocking, non-blocking, and timed** push/pop variants; the timed ones
//!   honor their deadline even for acquiring the internal lock.
//! - **Close-to-drain**: [`close`](BoundedChannel::close) is idempotent,
//!   never blocks, wakes everyone, and consumers still drain queued values.
//! - **Pluggable storage**: any [`Buffer`] can back the queue; `VecDeque` is
//!   the default and `LinkedList` works out of the box.
//! - **Cursors**: [`Cursor`] turns consumption into a plain iterator that
//!   ends when the channel is closed and drained.
//!
//! # Example
//!
//! ```rust
//! use reprieve_channel::BoundedChannel;
//! use std::thread;
//!
//! let channel: BoundedChannel<i32> = BoundedChannel::new(64);
//!
//! thread::scope(|scope| {
//!     scope.spawn(|| {
//!         for i in 0..4 {
//!             channel.push(i).unwrap();
//!         }
//!         channel.close();
//!     });
//!
//!     let drained: Vec<i32> = channel.cursor().collect();
//!     assert_eq!(drained, [0, 1, 2, 3]);
//! });
//! ```

#![warn(missing_docs)]

mod bounded;
mod buffer;
mod errors;

pub use bounded::{BoundedChannel, Cursor};
pub use buffer::Buffer;
pub use errors::{PopError, PushError};
