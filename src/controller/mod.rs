//! Control Laws
//!
//! A controller turns the latest analyzer output into a target laser power.
//! It is called once per control tick from the control worker and owns its
//! accumulator state exclusively.
//!
//! # Contract
//! - `compute_power` is pure apart from the controller's own state: no I/O,
//!   no blocking.
//! - Out-of-domain inputs (negative counts) are clamped to zero before the
//!   control law runs.
//! - Non-finite inputs carry no information; the previous target is returned
//!   and the accumulator is left untouched.
//! - The returned target may lie outside the laser range. Clamping is the
//!   actuator's job.

pub mod pi;
pub mod proportional;

use serde::{Deserialize, Serialize};

use crate::error::LoopError;

pub use pi::{PiConfig, PiController};
pub use proportional::ProportionalController;

/// Pluggable control law.
pub trait Controller: Send {
    /// Compute the target power for the given analyzer output.
    fn compute_power(&mut self, analyzer_output: f64) -> f64;

    /// Stable identifier of the law.
    fn name(&self) -> &str;
}

/// Clamp an analyzer output into the controller domain.
///
/// Returns `None` for non-finite values.
pub(crate) fn sanitize_input(analyzer_output: f64) -> Option<f64> {
    analyzer_output
        .is_finite()
        .then(|| analyzer_output.max(0.0))
}

// =============================================================================
// ManualController - Fixed Power
// =============================================================================

/// Ignores the analyzer and always requests the same power.
pub struct ManualController {
    power: f64,
}

impl ManualController {
    /// Create a controller that always requests `power`.
    pub fn new(power: f64) -> Self {
        Self { power }
    }
}

impl Controller for ManualController {
    fn compute_power(&mut self, _analyzer_output: f64) -> f64 {
        self.power
    }

    fn name(&self) -> &str {
        "manual"
    }
}

// =============================================================================
// ControllerSpec - Configuration
// =============================================================================

/// Controller selection, as it appears in configuration files.
///
/// ```toml
/// [controller]
/// type = "pi"
/// setpoint = 1.5
/// kp = 2.0
/// ki = 0.5
/// integral_limit = 50.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerSpec {
    /// `target = gain × max(output, 0)`
    Proportional {
        /// Power per unit of analyzer output
        #[serde(default = "default_gain")]
        gain: f64,
    },

    /// Proportional-integral tracking of a setpoint
    Pi(PiConfig),

    /// Constant power
    Manual {
        /// Requested power in laser units
        #[serde(default)]
        power: f64,
    },
}

fn default_gain() -> f64 {
    1.0
}

impl ControllerSpec {
    /// Names accepted by [`ControllerSpec::from_name`].
    pub const NAMES: [&'static str; 3] = ["proportional", "pi", "manual"];

    /// Default parameters for the law called `name`.
    pub fn from_name(name: &str) -> Result<Self, LoopError> {
        match name {
            "proportional" => Ok(Self::Proportional {
                gain: default_gain(),
            }),
            "pi" => Ok(Self::Pi(PiConfig::default())),
            "manual" => Ok(Self::Manual { power: 0.0 }),
            other => Err(LoopError::Configuration(format!(
                "unknown controller '{}', expected one of {:?}",
                other,
                Self::NAMES
            ))),
        }
    }

    /// Law name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Proportional { .. } => "proportional",
            Self::Pi(_) => "pi",
            Self::Manual { .. } => "manual",
        }
    }

    /// Instantiate the controller, validating its parameters.
    pub fn build(&self) -> Result<Box<dyn Controller>, LoopError> {
        match self {
            Self::Proportional { gain } => Ok(Box::new(ProportionalController::new(*gain)?)),
            Self::Pi(config) => Ok(Box::new(PiController::new(config.clone())?)),
            Self::Manual { power } => {
                if !power.is_finite() {
                    return Err(LoopError::Configuration(
                        "manual power must be finite".into(),
                    ));
                }
                Ok(Box::new(ManualController::new(*power)))
            }
        }
    }
}

impl Default for ControllerSpec {
    fn default() -> Self {
        Self::Proportional {
            gain: default_gain(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_ignores_input() {
        let mut controller = ManualController::new(12.0);
        assert_eq!(controller.compute_power(0.0), 12.0);
        assert_eq!(controller.compute_power(f64::NAN), 12.0);
    }

    #[test]
    fn sanitize_clamps_negative_and_drops_non_finite() {
        assert_eq!(sanitize_input(-3.0), Some(0.0));
        assert_eq!(sanitize_input(2.5), Some(2.5));
        assert_eq!(sanitize_input(f64::INFINITY), None);
        assert_eq!(sanitize_input(f64::NAN), None);
    }

    #[test]
    fn spec_from_name_builds_every_law() {
        for name in ControllerSpec::NAMES {
            let spec = ControllerSpec::from_name(name).unwrap();
            assert_eq!(spec.build().unwrap().name(), name);
        }
        assert!(ControllerSpec::from_name("pid").is_err());
    }

    #[test]
    fn spec_deserializes_from_toml() {
        let spec: ControllerSpec = toml::from_str(
            r#"
            type = "proportional"
            gain = 2.5
            "#,
        )
        .unwrap();
        assert_eq!(spec, ControllerSpec::Proportional { gain: 2.5 });

        let spec: ControllerSpec = toml::from_str(
            r#"
            type = "pi"
            setpoint = 1.5
            "#,
        )
        .unwrap();
        match spec {
            ControllerSpec::Pi(config) => {
                assert_eq!(config.setpoint, 1.5);
                assert_eq!(config.kp, PiConfig::default().kp);
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }
}
