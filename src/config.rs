//! Configuration System using Figment
//!
//! Strongly-typed configuration for a closed-loop run. Configuration is loaded from:
//! 1. `config/laser_loop.toml` (base configuration)
//! 2. Environment variables (prefixed with `LASER_LOOP_`, sections separated by `__`)
//!
//! Every section has defaults, so an empty file (or no file) yields a usable
//! dry-run configuration.
//!
//! # Example
//! ```no_run
//! use laser_loop::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Tick interval: {} ms", settings.run.tick_interval_ms);
//! # Ok::<(), laser_loop::error::LoopError>(())
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerSpec;
use crate::controller::ControllerSpec;
use crate::error::{AppResult, LoopError};
use crate::frame::Roi;
use crate::laser::LaserTarget;
use crate::limits::{
    DEFAULT_MAX_ACTUATION_FAILURES, DEFAULT_TELEMETRY_CAPACITY, DEFAULT_WATCHDOG_TIMEOUT,
    MAX_DEADZONE_FRACTION, MIN_TICK_INTERVAL_MS,
};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/laser_loop.toml";

/// Prefix of environment overrides, e.g. `LASER_LOOP_RUN__TICK_INTERVAL_MS=200`.
pub const ENV_PREFIX: &str = "LASER_LOOP_";

// =============================================================================
// RunConfiguration
// =============================================================================

/// How the acquisition worker obtains frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagingMode {
    /// Pull frames on demand at the source's native rate
    #[default]
    ContinuousGrab,
    /// Receive frames pushed by an external live-view pipeline
    LivePipelineTap,
    /// Consume exactly one externally triggered acquisition sequence
    NextAcquisition,
}

impl fmt::Display for ImagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagingMode::ContinuousGrab => write!(f, "continuous_grab"),
            ImagingMode::LivePipelineTap => write!(f, "live_pipeline_tap"),
            ImagingMode::NextAcquisition => write!(f, "next_acquisition"),
        }
    }
}

impl std::str::FromStr for ImagingMode {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous_grab" => Ok(ImagingMode::ContinuousGrab),
            "live_pipeline_tap" => Ok(ImagingMode::LivePipelineTap),
            "next_acquisition" => Ok(ImagingMode::NextAcquisition),
            other => Err(LoopError::Configuration(format!(
                "unknown imaging mode '{}'",
                other
            ))),
        }
    }
}

/// Parameters fixed for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Frame acquisition strategy
    pub imaging_mode: ImagingMode,

    /// Control tick interval in milliseconds (>= 50)
    pub tick_interval_ms: u64,

    /// Upper laser power bound (> 0)
    pub max_laser_power: f64,

    /// Relative change below which power commands are suppressed, in `[0, 0.5]`
    pub deadzone_fraction: f64,

    /// Simulate the laser instead of commanding hardware
    pub laser_is_virtual: bool,

    /// Region of each frame handed to the analyzer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi: Option<Roi>,

    /// Bound on waiting for in-flight work when stopping (e.g. "1s", "500ms")
    #[serde(with = "humantime_serde")]
    pub watchdog_timeout: Duration,

    /// Consecutive actuation failures on a real laser that stop the run
    pub max_actuation_failures: u32,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            imaging_mode: ImagingMode::default(),
            tick_interval_ms: 100,
            max_laser_power: 50.0,
            deadzone_fraction: 0.1,
            laser_is_virtual: true,
            roi: None,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            max_actuation_failures: DEFAULT_MAX_ACTUATION_FAILURES,
        }
    }
}

impl RunConfiguration {
    /// Reject configurations no run may start with.
    pub fn validate(&self) -> AppResult<()> {
        if self.tick_interval_ms < MIN_TICK_INTERVAL_MS {
            return Err(LoopError::Configuration(format!(
                "tick interval {} ms is below the minimum of {} ms",
                self.tick_interval_ms, MIN_TICK_INTERVAL_MS
            )));
        }

        if !self.max_laser_power.is_finite() || self.max_laser_power <= 0.0 {
            return Err(LoopError::Configuration(format!(
                "max laser power must be positive, got {}",
                self.max_laser_power
            )));
        }

        if !(0.0..=MAX_DEADZONE_FRACTION).contains(&self.deadzone_fraction) {
            return Err(LoopError::Configuration(format!(
                "deadzone fraction must be in [0, {}], got {}",
                MAX_DEADZONE_FRACTION, self.deadzone_fraction
            )));
        }

        if let Some(roi) = &self.roi {
            if roi.width == 0 || roi.height == 0 {
                return Err(LoopError::Configuration(format!(
                    "ROI must have a non-zero size, got {}x{}",
                    roi.width, roi.height
                )));
            }
        }

        if self.watchdog_timeout.is_zero() {
            return Err(LoopError::Configuration(
                "watchdog timeout must be positive".into(),
            ));
        }

        if self.max_actuation_failures == 0 {
            return Err(LoopError::Configuration(
                "max_actuation_failures must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Run parameters
    pub run: RunConfiguration,
    /// Laser device selection
    pub laser: LaserTarget,
    /// Analyzer selection
    pub analyzer: AnalyzerSpec,
    /// Controller selection
    pub controller: ControllerSpec,
    /// Telemetry channel settings
    pub telemetry: TelemetryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "laser_loop".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Telemetry channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Bounded channel capacity; records beyond it are dropped and counted
    pub capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_TELEMETRY_CAPACITY,
        }
    }
}

impl Settings {
    /// Load configuration from `config/laser_loop.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix `LASER_LOOP_`.
    /// Example: `LASER_LOOP_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load and validate configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Layered providers: the file, then the environment. Missing keys fall
    /// back to the serde defaults.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(LoopError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.run.validate()?;

        if self.laser.device.is_empty() || self.laser.property.is_empty() {
            return Err(LoopError::Configuration(
                "laser device and property must be set".into(),
            ));
        }
        if !(0.0..self.run.max_laser_power).contains(&self.laser.min_power) {
            return Err(LoopError::Configuration(format!(
                "laser min power {} must be in [0, {})",
                self.laser.min_power, self.run.max_laser_power
            )));
        }

        // Building validates strategy parameters
        self.analyzer.build()?;
        self.controller.build()?;

        if self.telemetry.capacity == 0 {
            return Err(LoopError::Configuration(
                "telemetry capacity must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LoopError::Configuration(format!("cannot render configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.run.tick_interval_ms, 100);
        assert!(settings.run.laser_is_virtual);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.run, RunConfiguration::default());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [application]
            name = "bench"
            log_level = "debug"

            [run]
            imaging_mode = "live_pipeline_tap"
            tick_interval_ms = 250
            max_laser_power = 20.0
            deadzone_fraction = 0.05
            laser_is_virtual = false
            watchdog_timeout = "500ms"
            roi = { x = 10, y = 10, width = 64, height = 32 }

            [laser]
            device = "Laser-405"
            property = "Power (mW)"

            [analyzer]
            type = "intensity"
            background = 90.0

            [controller]
            type = "pi"
            setpoint = 2.0
            "#,
        );

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.name, "bench");
        assert_eq!(settings.run.imaging_mode, ImagingMode::LivePipelineTap);
        assert_eq!(settings.run.tick_interval_ms, 250);
        assert_eq!(settings.run.watchdog_timeout, Duration::from_millis(500));
        assert_eq!(settings.run.roi, Some(Roi::new(10, 10, 64, 32)));
        assert!(!settings.run.laser_is_virtual);
        assert_eq!(settings.run.max_actuation_failures, DEFAULT_MAX_ACTUATION_FAILURES);
        assert_eq!(settings.laser.device, "Laser-405");
        assert_eq!(settings.analyzer.name(), "intensity");
        assert_eq!(settings.controller.name(), "pi");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let file = write_config(
            r#"
            [run]
            tick_interval_ms = 20
            "#,
        );
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, LoopError::Configuration(_)));
    }

    #[test]
    fn test_type_mismatch_is_figment_error() {
        let file = write_config(
            r#"
            [run]
            tick_interval_ms = "fast"
            "#,
        );
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, LoopError::Config(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_run_validation_bounds() {
        let base = RunConfiguration::default();

        let cases = [
            RunConfiguration { tick_interval_ms: 49, ..base.clone() },
            RunConfiguration { max_laser_power: 0.0, ..base.clone() },
            RunConfiguration { max_laser_power: f64::NAN, ..base.clone() },
            RunConfiguration { deadzone_fraction: 0.51, ..base.clone() },
            RunConfiguration { deadzone_fraction: -0.1, ..base.clone() },
            RunConfiguration { roi: Some(Roi::new(0, 0, 0, 10)), ..base.clone() },
            RunConfiguration { watchdog_timeout: Duration::ZERO, ..base.clone() },
            RunConfiguration { max_actuation_failures: 0, ..base.clone() },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }

        let edge = RunConfiguration {
            tick_interval_ms: 50,
            deadzone_fraction: 0.5,
            ..base
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_settings_render_as_toml() {
        let rendered = Settings::default().to_toml().unwrap();
        assert!(rendered.contains("[run]"));
        assert!(rendered.contains("watchdog_timeout = \"1s\""));

        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.run, RunConfiguration::default());
    }

    #[test]
    fn test_imaging_mode_names() {
        for mode in [
            ImagingMode::ContinuousGrab,
            ImagingMode::LivePipelineTap,
            ImagingMode::NextAcquisition,
        ] {
            assert_eq!(mode.to_string().parse::<ImagingMode>().unwrap(), mode);
        }
        assert!("snap".parse::<ImagingMode>().is_err());
    }
}
