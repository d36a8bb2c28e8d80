use std::{
    io::{self, Stdout, Write},
    sync::Arc,
};

use common::{now_ms, TelemetrySample};
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Receives every sample the read loop copies out of the channel.
pub trait Sink {
    fn name(&self) -> &str;

    fn update(&mut self, sample: &TelemetrySample) -> Result<(), SinkError>;
}

/// Plain text report of the current sample, one block per cycle once the producer published.
pub struct ConsoleReport<W: Write> {
    out: W,
}

impl ConsoleReport<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleReport<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Sink for ConsoleReport<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn update(&mut self, sample: &TelemetrySample) -> Result<(), SinkError> {
        if !sample.fresh {
            return Ok(());
        }

        write!(
            self.out,
            "Left RPM: {}\nRight RPM: {}\nLinear Vel: {}\nAngular Vel: {}\nTimestamp: {}\n\n",
            sample.left_rpm,
            sample.right_rpm,
            sample.linear_velocity,
            sample.angular_velocity,
            sample.produced_at_ms
        )?;
        self.out.flush()?;

        Ok(())
    }
}

/// A sample together with the time the read loop copied it out of the channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub sample: TelemetrySample,
    pub read_at_ms: i64,
}

/// The most recent sample read by the loop, shared with the query endpoint.
#[derive(Clone, Default)]
pub struct LatestSnapshot {
    inner: Arc<RwLock<Option<Snapshot>>>,
}

impl LatestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the read loop completed its first cycle.
    pub fn get(&self) -> Option<Snapshot> {
        *self.inner.read()
    }
}

impl Sink for LatestSnapshot {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn update(&mut self, sample: &TelemetrySample) -> Result<(), SinkError> {
        *self.inner.write() = Some(Snapshot {
            sample: *sample,
            read_at_ms: now_ms(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fresh: bool) -> TelemetrySample {
        TelemetrySample {
            left_rpm: 10.5,
            right_rpm: -3.0,
            linear_velocity: 0.25,
            angular_velocity: 1.5,
            produced_at_ms: 1_700_000_000_123,
            fresh,
        }
    }

    #[test]
    fn test_console_report_format() {
        let mut report = ConsoleReport::new(Vec::new());
        report.update(&sample(true)).unwrap();

        let text = String::from_utf8(report.into_inner()).unwrap();
        assert_eq!(
            text,
            "Left RPM: 10.5\nRight RPM: -3\nLinear Vel: 0.25\nAngular Vel: 1.5\nTimestamp: 1700000000123\n\n"
        );
    }

    #[test]
    fn test_console_report_skips_unpublished() {
        let mut report = ConsoleReport::new(Vec::new());
        report.update(&sample(false)).unwrap();

        assert!(report.into_inner().is_empty());
    }

    #[test]
    fn test_snapshot_is_shared() {
        let snapshot = LatestSnapshot::new();
        assert!(snapshot.get().is_none());

        let mut writer = snapshot.clone();
        let before = now_ms();
        writer.update(&sample(false)).unwrap();

        let latest = snapshot.get().unwrap();
        assert_eq!(latest.sample, sample(false));
        assert!(latest.read_at_ms >= before);
    }
}
