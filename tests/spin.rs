//! Size, state, and mutual-exclusion guarantees of the small spin mutex.

use std::mem::{self, MaybeUninit};
use std::thread;

use rand::Rng;
use reprieve::{SmallSpinMutex, SpinLock};

#[test]
fn the_mutex_is_at_most_one_byte() {
    assert!(mem::size_of::<SmallSpinMutex>() <= 1);
}

#[test]
fn default_constructed_is_unlocked() {
    let mutex = SmallSpinMutex::default();
    assert!(mutex.try_lock());
    assert!(!mutex.try_lock());
    mutex.unlock();
    assert!(mutex.try_lock());
    mutex.unlock();
}

#[test]
fn construction_over_dirty_memory_yields_an_unlocked_mutex() {
    let mut slot = MaybeUninit::<SmallSpinMutex>::uninit();
    // Poison the storage, then construct in place without zeroing first.
    unsafe { slot.as_mut_ptr().cast::<u8>().write(0xFF) };
    unsafe { slot.as_mut_ptr().write(SmallSpinMutex::new()) };
    let mutex = unsafe { slot.assume_init_ref() };
    assert!(mutex.try_lock());
    mutex.unlock();
}

#[test]
fn try_lock_on_a_spinlock_respects_the_holder() {
    let lock = SpinLock::new(7);
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert_eq!(*lock.try_lock().unwrap(), 7);
}

#[test]
#[cfg_attr(miri, ignore)]
fn contended_lock_keeps_data_consistent() {
    const WORDS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];
    let shared = SpinLock::new(String::from(WORDS[0]));

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut rng = rand::rng();
                for _ in 0..1000 {
                    let mut guard = shared.lock();
                    assert!(WORDS.contains(&guard.as_str()));
                    *guard = String::from(WORDS[rng.random_range(0..WORDS.len())]);
                }
            });
        }
    });

    assert!(WORDS.contains(&shared.lock().as_str()));
}

#[test]
#[cfg_attr(miri, ignore)]
fn lock_acquires_once_the_holder_unlocks() {
    let mutex = SmallSpinMutex::new();
    assert!(mutex.try_lock());

    thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            mutex.lock();
            mutex.unlock();
        });
        thread::sleep(std::time::Duration::from_millis(10));
        mutex.unlock();
        waiter.join().unwrap();
    });
}
