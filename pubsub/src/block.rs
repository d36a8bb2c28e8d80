use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use common::TelemetrySample;

use crate::lock::{SharedLock, SharedLockGuard};

/// Upper bound for waiting on a lock that may have been abandoned by a crashed process.
/// Critical sections are a copy of a few words, a live holder never comes close to this.
const ABANDONED_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// The sample fields exactly as they are laid out in shared memory.
#[repr(C)]
#[derive(Clone, Copy)]
struct SampleSlot {
    left_rpm: f64,
    right_rpm: f64,
    linear_velocity: f64,
    angular_velocity: f64,
    produced_at_ms: i64,
    fresh: u8,
}

impl SampleSlot {
    const EMPTY: Self = Self {
        left_rpm: 0.0,
        right_rpm: 0.0,
        linear_velocity: 0.0,
        angular_velocity: 0.0,
        produced_at_ms: 0,
        fresh: 0,
    };
}

impl From<SampleSlot> for TelemetrySample {
    fn from(s: SampleSlot) -> Self {
        Self {
            left_rpm: s.left_rpm,
            right_rpm: s.right_rpm,
            linear_velocity: s.linear_velocity,
            angular_velocity: s.angular_velocity,
            produced_at_ms: s.produced_at_ms,
            // any non-zero byte written by another process counts as set
            fresh: s.fresh != 0,
        }
    }
}

/// Contents of the shared memory region: the sample followed by its synchronization state.
///
/// The all-zero bit pattern is the valid initial state (unlocked, nothing published), which is
/// what a freshly truncated shared memory object contains.
#[repr(C)]
pub(crate) struct ChannelBlock {
    sample: UnsafeCell<SampleSlot>,
    lock: SharedLock,
    /// Number of publishes since the region was initialized. Doubles as change notification.
    sequence: AtomicU64,
}

// SAFETY: the sample is only accessed while holding `lock`, the other fields are atomics.
unsafe impl Sync for ChannelBlock {}

impl ChannelBlock {
    /// Returns the block to its initial state. Breaks a lock left behind by a dead process.
    ///
    /// Returns true if the lock had to be broken.
    pub fn reset(&self) -> bool {
        let (_guard, broken) = self.lock.lock_or_break(ABANDONED_LOCK_TIMEOUT);
        // SAFETY: exclusive access through the lock
        unsafe { ptr::write_volatile(self.sample.get(), SampleSlot::EMPTY) };
        self.sequence.store(0, Ordering::Release);
        broken
    }

    /// Overwrites the whole sample, marks it fresh and bumps the sequence.
    pub fn write(&self, sample: &TelemetrySample) -> u64 {
        let slot = SampleSlot {
            left_rpm: sample.left_rpm,
            right_rpm: sample.right_rpm,
            linear_velocity: sample.linear_velocity,
            angular_velocity: sample.angular_velocity,
            produced_at_ms: sample.produced_at_ms,
            fresh: 1,
        };

        let _guard = self.lock();
        // SAFETY: exclusive access through the lock, the region is mapped for the lifetime of self
        unsafe { ptr::write_volatile(self.sample.get(), slot) };
        self.sequence.fetch_add(1, Ordering::Release) + 1
    }

    /// Copies out the current sample together with the sequence number it was written with.
    pub fn read(&self) -> (TelemetrySample, u64) {
        let (slot, sequence) = {
            let _guard = self.lock();
            // SAFETY: exclusive access through the lock
            let slot = unsafe { ptr::read_volatile(self.sample.get()) };
            (slot, self.sequence.load(Ordering::Acquire))
        };
        (slot.into(), sequence)
    }

    /// Takes the lock, breaking it if its holder went away without releasing it.
    fn lock(&self) -> SharedLockGuard<'_> {
        let (guard, broken) = self.lock.lock_or_break(ABANDONED_LOCK_TIMEOUT);
        if broken {
            tracing::warn!(
                "Took over the channel lock from a process that stopped while holding it"
            );
        }
        guard
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
