//! `kinematics`
//!
//! Converts between the pen's position on the paper and the cable lengths
//! the motors report, in steps.
//!
//! Step counts are rounded half away from zero. Cable lengths are never
//! negative, so this only ever rounds non-negative values.

use serde::{Deserialize, Serialize};

use crate::machine::MachineConfig;

/// A pen position in mm.
///
/// The origin is halfway between the motors, on the top edge of the paper.
/// +x is more right and +y is more down.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CartesianPosition {
    /// Horizontal axis.
    pub x: f64,
    /// Vertical axis.
    pub y: f64,
}

impl CartesianPosition {
    /// The position the pen is homed to at the start of every job.
    pub const ORIGIN: CartesianPosition = CartesianPosition { x: 0.0, y: 0.0 };

    /// Creates a new [`CartesianPosition`].
    pub fn new(x: f64, y: f64) -> Self {
        CartesianPosition { x, y }
    }
}

impl From<(f64, f64)> for CartesianPosition {
    fn from((x, y): (f64, f64)) -> Self {
        CartesianPosition { x, y }
    }
}

/// The lengths of the two cables, in motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MotorPosition {
    /// Cable length from the left motor.
    pub a: u32,
    /// Cable length from the right motor.
    pub b: u32,
}

impl From<(u32, u32)> for MotorPosition {
    fn from((a, b): (u32, u32)) -> Self {
        MotorPosition { a, b }
    }
}

/// The cable lengths do not describe a point the pen could be at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cable lengths a={} b={} do not meet below the motors", .0.a, .0.b)]
pub struct GeometryError(pub MotorPosition);

/// Converts a pen position to the cable lengths that put the pen there.
///
/// # Arguments
/// * `position`: Where the pen should be, in mm.
/// * `config`: The machine being driven.
///
/// # Returns
/// The cable lengths in whole steps.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_motor(position: CartesianPosition, config: &MachineConfig) -> MotorPosition {
    let width = config.width();
    let x = position.x + width / 2.0;
    let y = position.y + config.paper_position();

    let steps = |length_mm: f64| (length_mm * config.steps_per_millimeter()).round() as u32;

    MotorPosition {
        a: steps(x.hypot(y)),
        b: steps((width - x).hypot(y)),
    }
}

/// Triangulates the pen position from the cable lengths.
///
/// # Arguments
/// * `position`: The cable lengths, as reported by the device.
/// * `config`: The machine being driven.
///
/// # Returns
/// The pen position in mm.
///
/// # Errors
/// A [`GeometryError`] if the two cables cannot meet, for example when one is
/// shorter than the horizontal distance it has to span.
pub fn to_cartesian(
    position: MotorPosition,
    config: &MachineConfig,
) -> Result<CartesianPosition, GeometryError> {
    let width = config.width();
    let a = f64::from(position.a) * config.millimeters_per_step();
    let b = f64::from(position.b) * config.millimeters_per_step();

    let x = (a.powi(2) - b.powi(2) + width.powi(2)) / (2.0 * width);
    let y_squared = a.powi(2) - x.powi(2);
    if !y_squared.is_finite() || y_squared < 0.0 {
        return Err(GeometryError(position));
    }

    Ok(CartesianPosition {
        x: x - width / 2.0,
        y: y_squared.sqrt() - config.paper_position(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_motor() {
        let config = MachineConfig::default();

        assert_eq!(
            to_motor(CartesianPosition::ORIGIN, &config),
            MotorPosition { a: 989, b: 989 },
            "origin is symmetric"
        );
        assert_eq!(
            to_motor((-50.0, 100.0).into(), &config),
            MotorPosition { a: 1137, b: 1382 },
            "left of centre"
        );
    }

    #[test]
    fn test_round_trip_within_a_step() {
        let config = MachineConfig::default();
        let tolerance = config.millimeters_per_step();

        for x in (-100..=100).step_by(25) {
            for y in (0..=300).step_by(30) {
                let position = CartesianPosition::new(f64::from(x), f64::from(y));
                let back = to_cartesian(to_motor(position, &config), &config).unwrap();
                assert!(
                    (back.x - position.x).abs() <= tolerance
                        && (back.y - position.y).abs() <= tolerance,
                    "{position:?} came back as {back:?}"
                );
            }
        }
    }

    #[test]
    fn test_to_motor_is_monotonic_in_x() {
        let config = MachineConfig::default();

        let mut previous = to_motor((-200.0, 100.0).into(), &config);
        for x in (-190..=200).step_by(10) {
            let next = to_motor((f64::from(x), 100.0).into(), &config);
            assert!(next.a > previous.a, "a grows moving right at x={x}");
            assert!(next.b < previous.b, "b shrinks moving right at x={x}");
            previous = next;
        }
    }

    #[test]
    fn test_to_cartesian_rejects_degenerate_lengths() {
        let config = MachineConfig::default();

        // The right cable is far longer than the left cable plus the frame.
        assert_eq!(
            to_cartesian(MotorPosition { a: 10, b: 5000 }, &config),
            Err(GeometryError(MotorPosition { a: 10, b: 5000 })),
            "cables cannot meet"
        );
        assert!(
            to_cartesian(MotorPosition { a: 0, b: 0 }, &config).is_err(),
            "both cables fully wound in"
        );
    }
}
