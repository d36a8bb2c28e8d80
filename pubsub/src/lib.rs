//! A latest-value channel for [`TelemetrySample`]s shared between processes.
//!
//! The channel is a small named POSIX shared memory region holding one sample plus the state
//! needed to synchronize access to it. A [`Channel<Writer>`] creates (or takes over) the region
//! and publishes into it, any number of [`Channel<Reader>`]s attach to it by name and copy out
//! whatever sample is currently stored. Readers never wait for new data and are not guaranteed
//! to see every published sample.
//!
//! ```no_run
//! use common::TelemetrySample;
//! use pubsub::{Channel, Reader, Writer};
//!
//! let mut writer = Channel::<Writer>::create_or_attach("/wheel_velocity_data")?;
//! let reader = Channel::<Reader>::attach("/wheel_velocity_data")?;
//!
//! writer.publish(&TelemetrySample::default());
//! assert!(reader.read_latest().fresh);
//! # Ok::<(), pubsub::ChannelError>(())
//! ```
use std::{
    marker::PhantomData,
    mem::ManuallyDrop,
    thread,
    time::{Duration, Instant},
};

use common::TelemetrySample;
use rustix::io::Errno;

mod block;
mod lock;
mod region;

use region::Region;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// No region with this name exists (yet).
    #[error("channel `{name}` is not available")]
    Unavailable { name: String },

    #[error("{op} failed for channel `{name}`: {source}")]
    Posix {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },

    /// The region exists but was created with a different layout.
    #[error("channel `{name}` has size {actual}, expected {expected} bytes")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: i64,
    },
}

impl ChannelError {
    fn posix(op: &'static str, name: &str, source: Errno) -> Self {
        Self::Posix {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// True if the operating system refused access to shared memory altogether.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Posix { source, .. } if *source == Errno::ACCESS || *source == Errno::PERM)
    }
}

/// Access role of a [`Channel`] handle.
pub trait Role {
    /// Whether the name is removed when the handle is dropped.
    const REMOVE_ON_DROP: bool;
}

/// The single producer. Owns the channel name and removes it when dropped.
pub struct Writer;
impl Role for Writer {
    const REMOVE_ON_DROP: bool = true;
}

/// A consumer. Can only read and leaves the name in place when dropped.
pub struct Reader;
impl Role for Reader {
    const REMOVE_ON_DROP: bool = false;
}

/// Handle to a named telemetry channel.
pub struct Channel<R: Role> {
    region: ManuallyDrop<Region>,
    _role: PhantomData<R>,
}

impl Channel<Writer> {
    /// Creates the named channel, or attaches to it if it already exists.
    ///
    /// Either way the channel is reset to its initial state: an all-zero sample with
    /// `fresh = false`. A lock abandoned by a crashed process is taken over.
    pub fn create_or_attach(name: &str) -> Result<Self> {
        let name = region::normalize_name(name)?;
        let (region, created) = Region::create_or_attach(&name)?;

        if region.block().reset() {
            tracing::warn!("Channel {name}: broke a lock left behind by a previous process");
        }

        if created {
            tracing::info!("Created channel {name}");
        } else {
            tracing::info!("Attached to existing channel {name}, reset its contents");
        }

        Ok(Self {
            region: ManuallyDrop::new(region),
            _role: PhantomData,
        })
    }

    /// Replaces the current sample. All fields become visible to readers at once and the
    /// sample is marked fresh. Waiters polling [`Channel::sequence`] observe the change.
    ///
    /// Returns the sequence number of this publish.
    pub fn publish(&mut self, sample: &TelemetrySample) -> u64 {
        self.region.block().write(sample)
    }
}

impl Channel<Reader> {
    /// Attaches to an existing channel. Fails with [`ChannelError::Unavailable`] if no producer
    /// has created it.
    pub fn attach(name: &str) -> Result<Self> {
        let name = region::normalize_name(name)?;
        let region = Region::attach(&name)?;

        tracing::info!("Attached to channel {name}");

        Ok(Self {
            region: ManuallyDrop::new(region),
            _role: PhantomData,
        })
    }

    /// True if the channel name was removed (or removed and created anew) since we attached.
    /// The mapping itself stays readable and keeps returning the last sample.
    pub fn is_detached(&self) -> bool {
        self.region.is_detached()
    }
}

impl<R: Role> Channel<R> {
    /// Copies out the sample currently stored. Never waits for a new one.
    pub fn read_latest(&self) -> TelemetrySample {
        self.region.block().read().0
    }

    /// Like [`Channel::read_latest`], also returning the sequence number of the sample.
    pub fn read_with_sequence(&self) -> (TelemetrySample, u64) {
        self.region.block().read()
    }

    /// Number of publishes since the channel was (re)initialized.
    pub fn sequence(&self) -> u64 {
        self.region.block().sequence()
    }

    /// Polls until a publish newer than `last_seen` happened or `timeout` expired.
    ///
    /// Returns the new sequence number, or `None` on timeout.
    pub fn wait_for_update(&self, last_seen: u64, timeout: Duration) -> Option<u64> {
        let start = Instant::now();
        loop {
            let sequence = self.sequence();
            if sequence != last_seen {
                return Some(sequence);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }
}

impl<R: Role> Drop for Channel<R> {
    fn drop(&mut self) {
        let name = self.region.name().to_string();

        // unmap before the name is released
        // SAFETY: the region is never accessed again
        unsafe { ManuallyDrop::drop(&mut self.region) };

        if R::REMOVE_ON_DROP {
            match region::unlink(&name) {
                Ok(()) => tracing::info!("Removed channel {name}"),
                Err(ChannelError::Unavailable { .. }) => {}
                Err(e) => tracing::warn!("{e}"),
            }
        }
    }
}

/// Removes the name of a channel so that no further process can attach to it.
///
/// Processes that are already attached keep their mapping.
pub fn remove(name: &str) -> Result<()> {
    let name = region::normalize_name(name)?;
    region::unlink(&name)
}
