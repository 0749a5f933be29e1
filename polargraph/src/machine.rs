//! `machine`
//!
//! Physical constants of the plotter being driven.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

/// Errors that can occur when building a [`MachineConfig`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// A length or ratio that must be a finite, positive number was not.
    #[error("`{field}` must be a finite number greater than zero, got {value}")]
    NotPositive {
        /// The name of the offending field.
        field: &'static str,
        /// The value that was supplied.
        value: f64,
    },
    /// The motors must have at least one step per revolution.
    #[error("`steps_per_revolution` must be greater than zero")]
    NoStepsPerRevolution,
    /// The configuration file could not be read.
    #[error("could not read the configuration file: {0}")]
    Unreadable(String),
    /// The configuration file was not valid JSON for a plotter configuration.
    #[error("invalid configuration file: {0}")]
    Invalid(String),
}

/// The measurements of a plotter, as written down by whoever built it.
///
/// All lengths are in millimetres. This is the serialized form of a
/// [`MachineConfig`]; derived constants are never read from a file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineDimensions {
    /// Horizontal distance between the two motors.
    pub width: f64,
    /// Vertical distance between the motors and the bottom of the frame.
    pub height: f64,
    /// Radius of the pulley the cable is wound around.
    pub pulley_radius: f64,
    /// Resolution of the stepper motors.
    pub steps_per_revolution: u32,
    /// Vertical distance between the motors and the top edge of the paper.
    pub paper_position: f64,
    /// Width of the paper.
    pub paper_width: f64,
    /// Height of the paper.
    pub paper_height: f64,
    /// Maximum speed of the pen, in mm/s.
    pub max_speed: f64,
    /// Acceleration of the pen, in mm/s².
    pub acceleration: f64,
    /// Microstepping multiplier of the motor drivers.
    pub step_multiplier: u32,
}

impl Default for MachineDimensions {
    fn default() -> Self {
        MachineDimensions {
            width: 420.0,
            height: 600.0,
            pulley_radius: 16.62,
            steps_per_revolution: 400,
            paper_position: 150.0,
            paper_width: 210.0,
            paper_height: 297.0,
            max_speed: 20.0,
            acceleration: 20.0,
            step_multiplier: 1,
        }
    }
}

/// Validated machine constants, with the step conversion factors worked out.
///
/// Immutable once built; construct it with [`MachineConfig::new`] or by
/// deserializing [`MachineDimensions`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MachineDimensions", into = "MachineDimensions")]
pub struct MachineConfig {
    /// The measurements the config was built from.
    dimensions: MachineDimensions,
    /// Motor steps needed to pay out one millimetre of cable.
    steps_per_millimeter: f64,
    /// Cable paid out by a single motor step, in mm.
    millimeters_per_step: f64,
}

impl MachineConfig {
    /// Creates a new [`MachineConfig`].
    ///
    /// # Arguments
    /// * `dimensions`: The physical measurements of the plotter.
    ///
    /// # Returns
    /// The validated configuration.
    ///
    /// # Errors
    /// A [`ConfigError`] if any of the lengths are not positive or the motors have no steps.
    pub fn new(dimensions: MachineDimensions) -> Result<Self, ConfigError> {
        for (field, value) in [
            ("width", dimensions.width),
            ("height", dimensions.height),
            ("pulley_radius", dimensions.pulley_radius),
            ("paper_width", dimensions.paper_width),
            ("paper_height", dimensions.paper_height),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        if !dimensions.paper_position.is_finite() {
            return Err(ConfigError::NotPositive {
                field: "paper_position",
                value: dimensions.paper_position,
            });
        }
        if dimensions.steps_per_revolution == 0 {
            return Err(ConfigError::NoStepsPerRevolution);
        }

        let steps_per_millimeter =
            f64::from(dimensions.steps_per_revolution) / pulley_circumference(&dimensions);

        Ok(MachineConfig {
            dimensions,
            steps_per_millimeter,
            millimeters_per_step: steps_per_millimeter.recip(),
        })
    }

    /// Gets the measurements this config was built from.
    pub fn dimensions(&self) -> &MachineDimensions {
        &self.dimensions
    }

    /// Horizontal distance between the motors, in mm.
    pub fn width(&self) -> f64 {
        self.dimensions.width
    }

    /// Distance from the motors to the top edge of the paper, in mm.
    pub fn paper_position(&self) -> f64 {
        self.dimensions.paper_position
    }

    /// Gets the circumference of the pulley.
    ///
    /// # Returns
    /// The circumference in mm, unrounded.
    pub fn pulley_circumference(&self) -> f64 {
        pulley_circumference(&self.dimensions)
    }

    /// Gets the number of motor steps per millimetre of cable.
    pub fn steps_per_millimeter(&self) -> f64 {
        self.steps_per_millimeter
    }

    /// Gets the length of cable moved by one motor step, in mm.
    ///
    /// This is also the tolerance of any conversion that goes through whole steps.
    pub fn millimeters_per_step(&self) -> f64 {
        self.millimeters_per_step
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        let dimensions = MachineDimensions::default();
        let steps_per_millimeter =
            f64::from(dimensions.steps_per_revolution) / pulley_circumference(&dimensions);
        MachineConfig {
            dimensions,
            steps_per_millimeter,
            millimeters_per_step: steps_per_millimeter.recip(),
        }
    }
}

impl TryFrom<MachineDimensions> for MachineConfig {
    type Error = ConfigError;

    fn try_from(dimensions: MachineDimensions) -> Result<Self, Self::Error> {
        MachineConfig::new(dimensions)
    }
}

impl From<MachineConfig> for MachineDimensions {
    fn from(config: MachineConfig) -> Self {
        config.dimensions
    }
}

/// Works out the circumference of the pulley.
fn pulley_circumference(dimensions: &MachineDimensions) -> f64 {
    dimensions.pulley_radius * TAU
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_constants() {
        let config = MachineConfig::default();

        let expected = 400.0 / (16.62 * 2.0 * std::f64::consts::PI);
        assert!(
            (config.steps_per_millimeter() - expected).abs() < 1e-12,
            "steps per mm"
        );
        assert!(
            (config.steps_per_millimeter() * config.millimeters_per_step() - 1.0).abs() < 1e-12,
            "mm per step is the reciprocal"
        );
        assert_eq!(
            MachineConfig::new(MachineDimensions::default()).unwrap(),
            config,
            "default matches validated default"
        );
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        assert_eq!(
            MachineConfig::new(MachineDimensions {
                pulley_radius: 0.0,
                ..Default::default()
            }),
            Err(ConfigError::NotPositive {
                field: "pulley_radius",
                value: 0.0
            }),
            "zero pulley"
        );
        assert_eq!(
            MachineConfig::new(MachineDimensions {
                steps_per_revolution: 0,
                ..Default::default()
            }),
            Err(ConfigError::NoStepsPerRevolution),
            "no steps"
        );
        assert!(
            MachineConfig::new(MachineDimensions {
                width: f64::NAN,
                ..Default::default()
            })
            .is_err(),
            "NaN width"
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let config: MachineConfig =
            serde_json::from_str(r#"{ "width": 500, "pulley_radius": 10 }"#).unwrap();
        assert_eq!(config.width(), 500.0, "width read from file");
        assert_eq!(
            config.dimensions().height,
            600.0,
            "missing fields use defaults"
        );
        assert!(
            (config.steps_per_millimeter() - 400.0 / (10.0 * TAU)).abs() < 1e-12,
            "derived constants are recomputed"
        );

        assert!(
            serde_json::from_str::<MachineConfig>(r#"{ "width": -1 }"#).is_err(),
            "negative width"
        );
    }
}
