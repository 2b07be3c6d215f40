//! Dead-reckoning position filter.
//!
//! Reconstructs a cursor position from discrete accelerometer samples by
//! double integration, per axis, with a dead zone that swallows sensor noise.
//! Drift accumulates over long sessions; that is inherent to the method.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Gravitational constant used to calibrate raw samples.
pub const GRAVITY: f64 = 9.8;

/// Raw samples below this magnitude leave the axis untouched.
pub const DEAD_ZONE: f64 = 0.2;

/// Divisor applied to the elapsed time between samples. Damps the
/// integration; it is not a unit conversion.
pub const TIME_SCALE: f64 = 100.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ORIGIN: Vector3 = Vector3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn axes_mut(&mut self) -> [&mut f64; 3] {
        [&mut self.x, &mut self.y, &mut self.z]
    }

    fn axes(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Per-session integrator state.
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    previous_sample_time: Option<f64>,
    acceleration: Vector3,
    velocity: Vector3,
    position: Vector3,
}

impl PositionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last computed position.
    pub fn position(&self) -> Vector3 {
        self.position
    }

    /// Feed one sample taken at `time` (milliseconds) and return the new position.
    ///
    /// The first sample only seeds the clock and yields the origin. A sample
    /// older than the previous one is dropped and the current position returned.
    pub fn update(&mut self, time: f64, sample: Vector3) -> Vector3 {
        let Some(previous) = self.previous_sample_time else {
            self.previous_sample_time = Some(time);
            return Vector3::ORIGIN;
        };

        if time < previous {
            debug!(time, previous, "dropping out-of-order motion sample");
            return self.position;
        }

        let interval = (time - previous) / TIME_SCALE;
        let raw = sample.axes();

        let accelerations = self.acceleration.axes_mut();
        let velocities = self.velocity.axes_mut();
        let positions = self.position.axes_mut();

        for (axis, ((acceleration, velocity), position)) in accelerations
            .into_iter()
            .zip(velocities)
            .zip(positions)
            .enumerate()
        {
            if raw[axis].abs() < DEAD_ZONE {
                continue;
            }

            *acceleration += raw[axis] * GRAVITY;
            *velocity += *acceleration * interval;
            *position += *velocity * interval + *acceleration * interval * interval / 2.0;
        }

        self.previous_sample_time = Some(time);
        self.position
    }
}
