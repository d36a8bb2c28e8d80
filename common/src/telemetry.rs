use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::robot::{Twist, WheelRpm};

/// The latest state of the drive train as exchanged between the replaying and the serving process.
///
/// All numeric fields belong to the same velocity command and are always updated together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Computed left wheel speed in revolutions/minute.
    pub left_rpm: f64,

    /// Computed right wheel speed in revolutions/minute.
    pub right_rpm: f64,

    /// Source linear velocity in meters/second.
    pub linear_velocity: f64,

    /// Source angular velocity in radians/second.
    pub angular_velocity: f64,

    /// Wall clock time (milliseconds since the UNIX epoch) when the producer published the sample.
    pub produced_at_ms: i64,

    /// False until the first sample was published into the channel.
    pub fresh: bool,
}

impl TelemetrySample {
    pub fn from_command(twist: Twist, rpm: WheelRpm, produced_at_ms: i64) -> Self {
        Self {
            left_rpm: rpm.left,
            right_rpm: rpm.right,
            linear_velocity: twist.linear,
            angular_velocity: twist.angular,
            produced_at_ms,
            fresh: false,
        }
    }

    pub fn twist(&self) -> Twist {
        Twist::new(self.linear_velocity, self.angular_velocity)
    }

    pub fn rpm(&self) -> WheelRpm {
        WheelRpm {
            left: self.left_rpm,
            right: self.right_rpm,
        }
    }
}

/// Milliseconds since the UNIX epoch according to the system clock.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        // clock set before 1970, report it as negative instead of failing
        .unwrap_or_else(|e| -(e.duration().as_millis() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_keeps_fields_together() {
        let sample = TelemetrySample::from_command(
            Twist::new(0.5, -0.25),
            WheelRpm {
                left: 10.0,
                right: 20.0,
            },
            1234,
        );

        assert_eq!(sample.twist(), Twist::new(0.5, -0.25));
        assert_eq!(sample.rpm().left, 10.0);
        assert_eq!(sample.rpm().right, 20.0);
        assert_eq!(sample.produced_at_ms, 1234);
        assert!(!sample.fresh);
    }

    #[test]
    fn test_default_is_not_fresh() {
        assert!(!TelemetrySample::default().fresh);
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
