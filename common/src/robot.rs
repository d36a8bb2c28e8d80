use std::f64::consts::PI;

use nalgebra::{Matrix2, Vector2};
use serde::Deserialize;

/// Distance between the two drive wheels of the recorded robot, in meters.
pub const WHEEL_SEPARATION: f64 = 0.443;

/// Diameter of the drive wheels of the recorded robot, in meters.
pub const WHEEL_DIAMETER: f64 = 0.181;

/// Converts rad/s into revolutions per minute.
const RPM_PER_RAD_PER_SEC: f64 = 60.0 / (2.0 * PI);

/// Fixed geometry of a differential drive robot.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct WheelGeometry {
    /// The distance in meters between the left and the right wheel.
    pub wheel_separation: f64,

    /// The diameter in meters of a drive wheel.
    pub wheel_diameter: f64,
}

impl Default for WheelGeometry {
    fn default() -> Self {
        Self {
            wheel_separation: WHEEL_SEPARATION,
            wheel_diameter: WHEEL_DIAMETER,
        }
    }
}

impl WheelGeometry {
    pub fn wheel_radius(&self) -> f64 {
        self.wheel_diameter / 2.0
    }

    /// Maps a body velocity command onto the rotational speed of each wheel.
    ///
    /// Non-finite inputs propagate to the outputs, nothing is clamped.
    pub fn rpm(&self, twist: Twist) -> WheelRpm {
        let half = self.wheel_separation / 2.0;

        // rows: left and right wheel surface speed in m/s
        let mixing = Matrix2::new(1.0, -half, 1.0, half);
        let surface = mixing * Vector2::new(twist.linear, twist.angular);

        let radius = self.wheel_radius();
        let rpm = surface.map(|v| (v / radius) * RPM_PER_RAD_PER_SEC);

        WheelRpm {
            left: rpm.x,
            right: rpm.y,
        }
    }
}

/// A velocity command for the robot body.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Twist {
    /// Forward velocity in meters/second.
    pub linear: f64,

    /// Rotational velocity in radians/second, counter-clockwise positive.
    pub angular: f64,
}

impl Twist {
    pub fn new(linear: f64, angular: f64) -> Self {
        Self { linear, angular }
    }
}

/// Rotational speed of the left and right wheel in revolutions/minute.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelRpm {
    pub left: f64,
    pub right: f64,
}
