//! `config`
//!
//! Settings for a plotter installation, read from a JSON file.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    commands::DEFAULT_LINE_RESOLUTION,
    executor::{ErrorPolicy, ExecutorSettings},
    machine::{ConfigError, MachineConfig},
    sender::RetryPolicy,
};

/// How fast to drive the plotter, in milliseconds where it is a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTiming {
    /// Pause before moving the pen servo.
    pub pen_settle_before_ms: u64,
    /// Pause after moving the pen servo.
    pub pen_settle_after_ms: u64,
    /// How often to check for a response while waiting for the plotter.
    pub poll_interval_ms: u64,
    /// How long to wait between send attempts.
    pub retry_backoff_ms: u64,
    /// How many send attempts to make.
    pub retry_attempts: u32,
    /// Resolution sent with every line.
    pub line_resolution: u32,
    /// What to do when a command cannot be delivered.
    pub error_policy: ErrorPolicy,
}

impl Default for FlowTiming {
    fn default() -> Self {
        FlowTiming {
            pen_settle_before_ms: 1000,
            pen_settle_after_ms: 6500,
            poll_interval_ms: 15,
            retry_backoff_ms: 5000,
            retry_attempts: 10,
            line_resolution: DEFAULT_LINE_RESOLUTION,
            error_policy: ErrorPolicy::ContinueOnError,
        }
    }
}

impl FlowTiming {
    /// Checks the timing can be used.
    ///
    /// # Errors
    /// [`ConfigError::NotPositive`] if the poll interval is zero, which would
    /// turn every wait for the plotter into a busy loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "poll_interval_ms",
                value: 0.0,
            });
        }
        Ok(())
    }
}

impl From<FlowTiming> for ExecutorSettings {
    fn from(timing: FlowTiming) -> Self {
        ExecutorSettings {
            retry: RetryPolicy {
                attempts: timing.retry_attempts,
                backoff: Duration::from_millis(timing.retry_backoff_ms),
            },
            pen_settle_before: Duration::from_millis(timing.pen_settle_before_ms),
            pen_settle_after: Duration::from_millis(timing.pen_settle_after_ms),
            poll_interval: Duration::from_millis(timing.poll_interval_ms),
            line_resolution: timing.line_resolution,
            error_policy: timing.error_policy,
        }
    }
}

/// Everything needed to drive one plotter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotterConfig {
    /// The machine's measurements.
    pub machine: MachineConfig,
    /// Timing and failure handling.
    pub timing: FlowTiming,
}

impl PlotterConfig {
    /// Reads a configuration file. Anything left out takes its default.
    ///
    /// # Arguments
    /// * `path`: The JSON file to read.
    ///
    /// # Returns
    /// The configuration.
    ///
    /// # Errors
    /// [`ConfigError::Unreadable`] if the file cannot be read, [`ConfigError::Invalid`] if its contents are not a usable configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json_string = fs::read_to_string(path)
            .map_err(|err| ConfigError::Unreadable(format!("{}: {err}", path.display())))?;
        let config: PlotterConfig = serde_json::from_str(&json_string)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        config.timing.validate()?;
        Ok(config)
    }

    /// Gets the executor settings for this configuration.
    pub fn executor_settings(&self) -> ExecutorSettings {
        self.timing.into()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Writes some text to a temporary file.
    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_partial() {
        let file = config_file(
            r#"{
                "machine": { "width": 600.0, "paper_position": 120.0 },
                "timing": { "poll_interval_ms": 5, "error_policy": "abort_on_error" }
            }"#,
        );
        let config = PlotterConfig::load(file.path()).unwrap();

        assert!((config.machine.width() - 600.0).abs() < 1e-9, "width read");
        assert!(
            (config.machine.paper_position() - 120.0).abs() < 1e-9,
            "paper position read"
        );
        assert_eq!(
            config.machine.dimensions().paper_width,
            MachineConfig::default().dimensions().paper_width,
            "paper width defaulted"
        );
        assert_eq!(config.timing.poll_interval_ms, 5, "poll interval read");
        assert_eq!(config.timing.pen_settle_after_ms, 6500, "settle defaulted");

        let settings = config.executor_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(5), "settings");
        assert_eq!(settings.error_policy, ErrorPolicy::AbortOnError, "policy");
    }

    #[test]
    fn test_load_empty_object() {
        let file = config_file("{}");
        assert_eq!(
            PlotterConfig::load(file.path()),
            Ok(PlotterConfig::default()),
            "everything defaulted"
        );
    }

    #[test]
    fn test_load_errors() {
        assert!(
            matches!(
                PlotterConfig::load("/does/not/exist.json"),
                Err(ConfigError::Unreadable(_))
            ),
            "missing file"
        );

        let file = config_file(r#"{ "machine": { "width": -1.0 } }"#);
        assert!(
            matches!(PlotterConfig::load(file.path()), Err(ConfigError::Invalid(_))),
            "bad width"
        );

        let file = config_file(r#"{ "timing": { "poll_interval_ms": 0 } }"#);
        assert_eq!(
            PlotterConfig::load(file.path()),
            Err(ConfigError::NotPositive {
                field: "poll_interval_ms",
                value: 0.0
            }),
            "zero poll interval"
        );

        let file = config_file("not json");
        assert!(
            matches!(PlotterConfig::load(file.path()), Err(ConfigError::Invalid(_))),
            "not json"
        );
    }
}
