use std::{
    hint,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spins this many times before yielding the thread.
const SPINS_BEFORE_YIELD: u32 = 64;

/// A mutual exclusion lock that lives inside shared memory.
///
/// `std::sync::Mutex` is process-local, so the lock state is a single atomic word that every
/// process mapping the region operates on. All-zero bytes are the unlocked state.
/// Critical sections are a copy of a few words, so contention is resolved by spinning and yielding.
#[repr(C)]
pub(crate) struct SharedLock {
    state: AtomicU32,
}

impl SharedLock {
    /// Acquires the lock. A lock that could not be acquired within `timeout` is treated as
    /// abandoned by a process that died while holding it, and is taken over.
    ///
    /// Returns the guard and whether the lock had to be broken.
    pub fn lock_or_break(&self, timeout: Duration) -> (SharedLockGuard<'_>, bool) {
        let start = Instant::now();
        let mut spins = 0;
        while !self.try_acquire() {
            if start.elapsed() > timeout {
                self.state.swap(LOCKED, Ordering::Acquire);
                return (SharedLockGuard { lock: self }, true);
            }
            backoff(&mut spins);
        }
        (SharedLockGuard { lock: self }, false)
    }

    fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

/// Releases the [`SharedLock`] when dropped.
pub(crate) struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const NEVER: Duration = Duration::from_secs(60);

    fn new_lock() -> SharedLock {
        SharedLock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = new_lock();
        {
            let (_guard, broken) = lock.lock_or_break(NEVER);
            assert!(!broken);
            assert!(lock.is_locked());
            assert!(!lock.try_acquire());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_abandoned_lock_is_broken() {
        let lock = new_lock();
        std::mem::forget(lock.lock_or_break(NEVER).0);

        let (guard, broken) = lock.lock_or_break(Duration::from_millis(5));
        assert!(broken);
        drop(guard);
        assert!(!lock.is_locked());

        let (_guard, broken) = lock.lock_or_break(Duration::from_millis(5));
        assert!(!broken);
    }

    #[test]
    fn test_mutual_exclusion() {
        struct Counter {
            lock: SharedLock,
            value: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Counter {}

        let counter = Arc::new(Counter {
            lock: new_lock(),
            value: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let (_guard, broken) = counter.lock.lock_or_break(NEVER);
                        assert!(!broken);
                        // SAFETY: only accessed while holding the lock
                        unsafe { *counter.value.get() += 1 };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { *counter.value.get() }, 40_000);
    }
}
