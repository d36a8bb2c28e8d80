use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use common::{
    now_ms,
    robot::{Twist, WheelGeometry, WheelRpm},
    TelemetrySample,
};
use pubsub::{Channel, Writer};
use rosbag::{DecodeError, RawMessage, MIN_RECORD_LEN};

/// Why a recorded message did not produce a sample.
#[derive(Debug, thiserror::Error)]
pub enum SkipReason {
    #[error("record is {len} bytes, at least {MIN_RECORD_LEN} are needed")]
    TooShort { len: usize },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Turns one serialized velocity command into the body velocity and the wheel speeds.
///
/// Records shorter than [`MIN_RECORD_LEN`] are rejected before the decoder sees them.
pub fn process_record(
    bytes: &[u8],
    geometry: &WheelGeometry,
) -> Result<(Twist, WheelRpm), SkipReason> {
    if bytes.len() < MIN_RECORD_LEN {
        return Err(SkipReason::TooShort { len: bytes.len() });
    }

    let twist = rosbag::decode_twist(bytes)?;
    Ok((twist, geometry.rpm(twist)))
}

/// Where the replayer puts the samples it produces.
pub trait TelemetrySink {
    fn publish(&mut self, sample: &TelemetrySample);
}

impl TelemetrySink for Channel<Writer> {
    fn publish(&mut self, sample: &TelemetrySample) {
        Channel::<Writer>::publish(self, sample);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub published: usize,
    pub too_short: usize,
    pub undecodable: usize,
}

impl ReplayStats {
    pub fn skipped(&self) -> usize {
        self.too_short + self.undecodable
    }
}

impl Display for ReplayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "published {}, skipped {} ({} too short, {} undecodable)",
            self.published,
            self.skipped(),
            self.too_short,
            self.undecodable
        )
    }
}

/// Feeds recorded messages through the wheel speed computation into a [`TelemetrySink`],
/// one message per `pace` to approximate the recording's timing.
pub struct Replayer {
    geometry: WheelGeometry,
    pace: Duration,
    running: Arc<AtomicBool>,
}

impl Replayer {
    pub fn new(geometry: WheelGeometry, pace: Duration) -> Self {
        Self {
            geometry,
            pace,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag that stops [`Replayer::run`] before the next message once it is cleared.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Replays all `messages` in the order given. Messages that cannot be turned into a sample
    /// are logged and skipped, they never end the replay.
    pub fn run<S>(&self, messages: impl IntoIterator<Item = RawMessage>, sink: &mut S) -> ReplayStats
    where
        S: TelemetrySink + ?Sized,
    {
        let mut stats = ReplayStats::default();
        let mut last_produced_at = i64::MIN;

        for message in messages {
            if !self.running.load(Ordering::Relaxed) {
                tracing::info!("Replay interrupted");
                break;
            }

            tracing::debug!(
                "Message at {} ns, {} bytes",
                message.timestamp_ns,
                message.data.len()
            );

            let (twist, rpm) = match process_record(&message.data, &self.geometry) {
                Ok(v) => v,
                Err(reason) => {
                    match reason {
                        SkipReason::TooShort { .. } => stats.too_short += 1,
                        SkipReason::Decode(_) => stats.undecodable += 1,
                    }
                    tracing::warn!(
                        "Skipping message at {} ns: {reason}",
                        message.timestamp_ns
                    );
                    continue;
                }
            };

            tracing::info!(
                "Linear {:.3} m/s, angular {:.3} rad/s -> left {:.2} rpm, right {:.2} rpm",
                twist.linear,
                twist.angular,
                rpm.left,
                rpm.right
            );

            // the wall clock may step backwards, consumers expect non-decreasing timestamps
            let produced_at_ms = now_ms().max(last_produced_at);
            last_produced_at = produced_at_ms;

            sink.publish(&TelemetrySample::from_command(twist, rpm, produced_at_ms));
            stats.published += 1;

            if !self.pace.is_zero() {
                thread::sleep(self.pace);
            }
        }

        stats
    }
}
