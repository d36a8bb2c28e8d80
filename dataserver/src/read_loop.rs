use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use common::{CycleStats, TelemetrySample};
use pubsub::{Channel, ChannelError, Reader};

use crate::sink::Sink;

struct SinkSlot {
    sink: Box<dyn Sink + Send>,
    failing: bool,
}

/// Sinks that are updated independently of each other.
#[derive(Default)]
pub(crate) struct SinkSet {
    slots: Vec<SinkSlot>,
}

impl SinkSet {
    pub fn push(&mut self, sink: Box<dyn Sink + Send>) {
        self.slots.push(SinkSlot {
            sink,
            failing: false,
        });
    }

    /// Updates every sink. A failure is logged once when it starts and once when it stops.
    ///
    /// Returns the number of sinks that failed.
    pub fn update_all(&mut self, sample: &TelemetrySample) -> usize {
        let mut failed = 0;
        for slot in &mut self.slots {
            match slot.sink.update(sample) {
                Ok(()) => {
                    if slot.failing {
                        tracing::info!("Sink {} recovered", slot.sink.name());
                        slot.failing = false;
                    }
                }
                Err(e) => {
                    failed += 1;
                    if !slot.failing {
                        tracing::warn!("Sink {} failed: {e}", slot.sink.name());
                        slot.failing = true;
                    }
                }
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Periodically copies the latest sample out of the channel and hands it to every sink.
pub struct ReadLoop {
    channel: Channel<Reader>,
    sinks: SinkSet,
    period: Duration,
    running: Arc<AtomicBool>,
    stats: CycleStats,
    producer_gone: bool,
}

impl ReadLoop {
    pub fn new(channel: Channel<Reader>, period: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            channel,
            sinks: SinkSet::default(),
            period,
            running,
            stats: CycleStats::new(),
            producer_gone: false,
        }
    }

    pub fn add_sink(&mut self, sink: impl Sink + Send + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Runs cycles until the running flag is cleared. The current cycle is always finished.
    pub fn run(&mut self) {
        tracing::info!(
            "Reading {} every {:?} into {} sinks",
            self.channel.name(),
            self.period,
            self.sinks.len()
        );

        while self.running.load(Ordering::Relaxed) {
            let start = Instant::now();

            self.cycle();

            let elapsed = start.elapsed();
            self.stats.update(elapsed, self.period);

            // an overrun cycle is followed by the next one right away
            thread::sleep(self.period.saturating_sub(elapsed));
        }

        tracing::info!("Read loop stopped: {}", self.stats);
    }

    /// Reads the channel once and updates all sinks.
    pub fn cycle(&mut self) -> TelemetrySample {
        self.follow_producer();

        let sample = self.channel.read_latest();
        self.sinks.update_all(&sample);
        sample
    }

    /// Switches to a channel created by a new producer. While there is none the old mapping keeps
    /// being read, it holds the last sample the previous producer published.
    fn follow_producer(&mut self) {
        if !self.channel.is_detached() {
            return;
        }

        match Channel::<Reader>::attach(self.channel.name()) {
            Ok(channel) => {
                tracing::info!("Channel {} was recreated, re-attached", channel.name());
                self.channel = channel;
                self.producer_gone = false;
            }
            Err(e) => {
                if !self.producer_gone {
                    match e {
                        ChannelError::Unavailable { .. } => tracing::warn!(
                            "Channel {} was removed, serving the last sample",
                            self.channel.name()
                        ),
                        e => tracing::warn!("Could not re-attach: {e}"),
                    }
                    self.producer_gone = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ConsoleReport, LatestSnapshot, SinkError};
    use pubsub::Writer;
    use std::sync::atomic::AtomicUsize;

    struct Broken;

    impl Sink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn update(&mut self, _sample: &TelemetrySample) -> Result<(), SinkError> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed").into())
        }
    }

    fn sample(tag: f64) -> TelemetrySample {
        TelemetrySample {
            left_rpm: tag,
            right_rpm: tag,
            linear_velocity: tag,
            angular_velocity: tag,
            produced_at_ms: 1,
            fresh: true,
        }
    }

    #[test]
    fn test_failing_sink_does_not_affect_others() {
        let snapshot = LatestSnapshot::new();

        let mut sinks = SinkSet::default();
        sinks.push(Box::new(Broken));
        sinks.push(Box::new(snapshot.clone()));
        sinks.push(Box::new(ConsoleReport::new(Vec::new())));

        assert_eq!(sinks.update_all(&sample(1.0)), 1);
        assert_eq!(snapshot.get().unwrap().sample, sample(1.0));

        // still failing, still updating the rest
        assert_eq!(sinks.update_all(&sample(2.0)), 1);
        assert_eq!(snapshot.get().unwrap().sample, sample(2.0));
    }

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    fn try_writer(tag: &str) -> Option<Channel<Writer>> {
        let name = format!(
            "/wheelbridge-loop-{}-{tag}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        );
        match Channel::<Writer>::create_or_attach(&name) {
            Ok(channel) => Some(channel),
            Err(e) if e.is_permission_denied() => {
                eprintln!("Skipping shared memory test: {e}");
                None
            }
            Err(e) => panic!("{e}"),
        }
    }

    #[test]
    fn test_cycle_feeds_snapshot() {
        let Some(mut writer) = try_writer("cycle") else {
            return;
        };
        let reader = Channel::<Reader>::attach(writer.name()).unwrap();

        let snapshot = LatestSnapshot::new();
        let mut read_loop = ReadLoop::new(
            reader,
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(true)),
        );
        read_loop.add_sink(snapshot.clone());

        assert!(!read_loop.cycle().fresh);
        assert!(!snapshot.get().unwrap().sample.fresh);

        writer.publish(&sample(3.0));
        assert_eq!(read_loop.cycle(), sample(3.0));
        assert_eq!(snapshot.get().unwrap().sample, sample(3.0));
    }

    #[test]
    fn test_follows_recreated_channel() {
        let Some(writer) = try_writer("follow") else {
            return;
        };
        let name = writer.name().to_string();
        let reader = Channel::<Reader>::attach(&name).unwrap();
        let mut read_loop = ReadLoop::new(
            reader,
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(true)),
        );

        let mut writer = writer;
        writer.publish(&sample(1.0));
        assert_eq!(read_loop.cycle(), sample(1.0));

        // producer exits, the last sample is still served
        drop(writer);
        assert_eq!(read_loop.cycle(), sample(1.0));
        assert!(read_loop.producer_gone);

        // a new producer starts over with an unpublished channel
        let mut writer = Channel::<Writer>::create_or_attach(&name).unwrap();
        assert!(!read_loop.cycle().fresh);
        assert!(!read_loop.producer_gone);

        writer.publish(&sample(2.0));
        assert_eq!(read_loop.cycle(), sample(2.0));
    }

    #[test]
    fn test_run_stops_when_flag_clears() {
        let Some(writer) = try_writer("run") else {
            return;
        };
        let reader = Channel::<Reader>::attach(writer.name()).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let mut read_loop = ReadLoop::new(reader, Duration::from_millis(5), running.clone());

        let handle = thread::spawn(move || {
            read_loop.run();
            read_loop.stats().cycles()
        });

        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::Relaxed);

        let cycles = handle.join().unwrap();
        assert!(cycles >= 1);
        drop(writer);
    }
}
