//! Small spin mutex with strict size guarantees.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// One-byte non-recursive spin mutex.
///
/// Like all spin mutexes, this is almost certainly not what you want: a
/// thread waiting to acquire it busy-waits without doing useful work and
/// without letting the system schedule anything else. In the rare cases where
/// a critical section is known to be microscopic, it makes fine-grained
/// locking cheap where a standard mutex would be too large or too slow.
///
/// Guarantees, which must be weakened under no circumstances:
///
/// - the type is at most one byte;
/// - only true-atomic operations are used; there is no fallback to a
///   system-level locking mechanism;
/// - [`lock`](Self::lock) busy-waits without yielding;
/// - the type is trivially destructible.
///
/// The mutex is not recursive: re-locking from the owning thread deadlocks.
/// Frequent need for this kind of locking usually hints that RCU-style
/// publication (see [`DeferredAllocator`](crate::DeferredAllocator)) fits the
/// workload better.
pub struct SmallSpinMutex {
    locked: AtomicBool,
}

impl SmallSpinMutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Tries to acquire the mutex, returning whether it succeeded.
    ///
    /// Returns immediately either way; use [`lock`](Self::lock) to block.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Busy-waits until the calling thread acquires the mutex.
    ///
    /// There is no yield and no backoff policy. The behavior is undefined if
    /// the calling thread already owns the mutex (expect a deadlock).
    #[inline]
    pub fn lock(&self) {
        loop {
            // Test phase: spin on a relaxed load so the line stays cached.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
            if self.try_lock() {
                return;
            }
        }
    }

    /// Unlocks the mutex.
    ///
    /// The behavior is undefined if the mutex is not owned by the calling
    /// thread.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for SmallSpinMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Data guarded by a [`SmallSpinMutex`].
///
/// The RAII form of the same lock: [`lock`](Self::lock) returns a guard that
/// dereferences to the data and releases the mutex on drop.
pub struct SpinLock<T: ?Sized> {
    mutex: SmallSpinMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unlocked `SpinLock` around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            mutex: SmallSpinMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock and returns the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Busy-waits until the data can be borrowed exclusively.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.mutex.lock();
        SpinGuard { lock: self }
    }

    /// Tries to acquire the lock without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.mutex.try_lock().then(|| SpinGuard { lock: self })
    }
}

/// RAII guard for a [`SpinLock`]. Releases the lock on drop.
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the mutex, so access is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the mutex, so access is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.mutex.unlock();
    }
}
