//! Bounded multi-producer multi-consumer channel.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::Buffer;
use crate::errors::{PopError, PushError};

struct Shared<C> {
    queue: C,
    closed: bool,
}

/// Bounded thread-safe FIFO channel.
///
/// Any number of threads may push to and pop from the channel concurrently.
/// The channel is bounded: pushing into a full channel blocks (or soft-fails,
/// for the non-blocking variants) until a consumer makes room. Closing the
/// channel stops producers immediately while consumers keep draining whatever
/// is still queued.
///
/// The queue storage is pluggable through the [`Buffer`] trait; `VecDeque`
/// is the default.
///
/// Synchronization is one timed mutex and two condition variables: one
/// woken per push for consumers, one woken per pop for producers, both
/// broadcast on close. This is not lock-free, and the timed mutex is what
/// lets the timed operations honor their deadline even while contending
/// for the lock.
///
/// # Lifetime
///
/// Threads blocked in `push` or `pop` hold a borrow of the channel, so the
/// borrow checker already guarantees the channel outlives its users. What it
/// cannot guarantee is progress: a consumer that pops unconditionally only
/// returns once the channel is closed. Close the channel before joining such
/// threads.
pub struct BoundedChannel<T, C: Buffer<T> = VecDeque<T>> {
    capacity: usize,
    shared: Mutex<Shared<C>>,
    /// Notified when a value is pushed; waited on by popping threads.
    consumers: Condvar,
    /// Notified when a value is popped; waited on by pushing threads.
    producers: Condvar,
    marker: PhantomData<fn(T) -> T>,
}

impl<T> BoundedChannel<T> {
    /// Creates a channel over a `VecDeque` with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_buffer(capacity)
    }
}

impl<T, C: Buffer<T>> BoundedChannel<T, C> {
    /// Creates a channel over a default-constructed `C` with the given
    /// capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_buffer(capacity: usize) -> Self {
        assert!(capacity >= 1, "channel capacity must be at least 1");
        Self {
            capacity,
            shared: Mutex::new(Shared {
                queue: C::default(),
                closed: false,
            }),
            consumers: Condvar::new(),
            producers: Condvar::new(),
            marker: PhantomData,
        }
    }

    /// The fixed capacity of the channel.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Closes the channel, preventing any further pushes.
    ///
    /// Producers blocked in a push return [`PushError::Closed`]; consumers
    /// keep draining queued values and only see [`PopError::Closed`] once the
    /// channel is empty. Closing is idempotent and never blocks; it does not
    /// wait for users of the channel to go away.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        drop(shared);
        self.producers.notify_all();
        self.consumers.notify_all();
    }

    /// Pushes a value, blocking while the channel is full.
    ///
    /// Returns `Ok(())` after enqueueing and waking one consumer, or
    /// [`PushError::Closed`] if the channel is (or becomes) closed.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let mut shared = self.shared.lock();
        while !shared.closed && shared.queue.len() >= self.capacity {
            self.producers.wait(&mut shared);
        }
        if shared.closed {
            return Err(PushError::Closed(value));
        }
        self.finish_push(shared, value);
        Ok(())
    }

    /// Pushes a value without blocking.
    ///
    /// Returns [`PushError::Closed`] on a closed channel and
    /// [`PushError::Full`] on a full one.
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let mut shared = self.shared.lock();
        if shared.closed {
            Err(PushError::Closed(value))
        } else if shared.queue.len() < self.capacity {
            self.finish_push(shared, value);
            Ok(())
        } else {
            Err(PushError::Full(value))
        }
    }

    /// Pushes a value, blocking at most for `timeout`.
    ///
    /// See [`try_push_until`](Self::try_push_until).
    pub fn try_push_for(&self, timeout: Duration, value: T) -> Result<(), PushError<T>> {
        self.try_push_until(Instant::now() + timeout, value)
    }

    /// Pushes a value, blocking at most until `deadline`.
    ///
    /// Returns [`PushError::Timeout`] if the deadline passes first; the
    /// deadline covers acquiring the internal lock as well as waiting for
    /// room. The deadline is best-effort: the call may time out even if room
    /// became available around the same moment.
    pub fn try_push_until(&self, deadline: Instant, value: T) -> Result<(), PushError<T>> {
        let Some(mut shared) = self.shared.try_lock_until(deadline) else {
            return Err(PushError::Timeout(value));
        };
        while !shared.closed && shared.queue.len() >= self.capacity {
            if self.producers.wait_until(&mut shared, deadline).timed_out() {
                return Err(PushError::Timeout(value));
            }
        }
        if shared.closed {
            return Err(PushError::Closed(value));
        }
        self.finish_push(shared, value);
        Ok(())
    }

    /// Pops a value, blocking while the channel is open and empty.
    ///
    /// Returns the value after waking one producer. A closed channel keeps
    /// delivering until it is drained; only a closed *and* empty channel
    /// returns [`PopError::Closed`].
    pub fn pop(&self) -> Result<T, PopError> {
        let mut shared = self.shared.lock();
        loop {
            if let Some(value) = shared.queue.pop_front() {
                drop(shared);
                self.producers.notify_one();
                return Ok(value);
            }
            if shared.closed {
                return Err(PopError::Closed);
            }
            self.consumers.wait(&mut shared);
        }
    }

    /// Pops a value without blocking.
    ///
    /// Returns [`PopError::Closed`] on a closed and drained channel, and
    /// [`PopError::Empty`] on an open empty one.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let mut shared = self.shared.lock();
        if let Some(value) = shared.queue.pop_front() {
            drop(shared);
            self.producers.notify_one();
            Ok(value)
        } else if shared.closed {
            Err(PopError::Closed)
        } else {
            Err(PopError::Empty)
        }
    }

    /// Pops a value, blocking at most for `timeout`.
    ///
    /// See [`try_pop_until`](Self::try_pop_until).
    pub fn try_pop_for(&self, timeout: Duration) -> Result<T, PopError> {
        self.try_pop_until(Instant::now() + timeout)
    }

    /// Pops a value, blocking at most until `deadline`.
    ///
    /// Returns [`PopError::Timeout`] if the deadline passes first; the
    /// deadline covers lock acquisition and is best-effort, as for
    /// [`try_push_until`](Self::try_push_until).
    pub fn try_pop_until(&self, deadline: Instant) -> Result<T, PopError> {
        let Some(mut shared) = self.shared.try_lock_until(deadline) else {
            return Err(PopError::Timeout);
        };
        loop {
            if let Some(value) = shared.queue.pop_front() {
                drop(shared);
                self.producers.notify_one();
                return Ok(value);
            }
            if shared.closed {
                return Err(PopError::Closed);
            }
            if self.consumers.wait_until(&mut shared, deadline).timed_out() {
                return Err(PopError::Timeout);
            }
        }
    }

    /// Returns a consuming cursor over the channel.
    ///
    /// The cursor pops one value per advance and ends once the channel is
    /// closed and drained. Several cursors may consume the same channel
    /// concurrently; each queued value is delivered to exactly one of them.
    pub fn cursor(&self) -> Cursor<'_, T, C> {
        Cursor {
            channel: Some(self),
        }
    }

    // Enqueue under the lock, then release it before waking one consumer.
    fn finish_push(&self, mut shared: MutexGuard<'_, Shared<C>>, value: T) {
        shared.queue.push_back(value);
        drop(shared);
        self.consumers.notify_one();
    }
}

impl<'a, T, C: Buffer<T>> IntoIterator for &'a BoundedChannel<T, C> {
    type Item = T;
    type IntoIter = Cursor<'a, T, C>;

    fn into_iter(self) -> Cursor<'a, T, C> {
        self.cursor()
    }
}

/// Single-pass consuming cursor over a [`BoundedChannel`].
///
/// Each advance performs one blocking [`pop`](BoundedChannel::pop), so a
/// cursor over an open empty channel waits for producers. Once `pop` reports
/// the channel closed and drained, the cursor ends and stays ended.
///
/// A value taken by one cursor is never seen by another: cursors over the
/// same channel split the stream between them by pop order.
pub struct Cursor<'a, T, C: Buffer<T> = VecDeque<T>> {
    channel: Option<&'a BoundedChannel<T, C>>,
}

impl<T, C: Buffer<T>> Iterator for Cursor<'_, T, C> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let channel = self.channel?;
        match channel.pop() {
            Ok(value) => Some(value),
            Err(_) => {
                self.channel = None;
                None
            }
        }
    }
}
