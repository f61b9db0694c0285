//! Proportional-integral setpoint tracking with a clamped integral.

use serde::{Deserialize, Serialize};

use super::{sanitize_input, Controller};
use crate::error::LoopError;

/// Configuration for [`PiController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiConfig {
    /// Desired analyzer output
    pub setpoint: f64,
    /// Proportional gain
    pub kp: f64,
    /// Integral gain (per tick)
    pub ki: f64,
    /// Bound on the accumulated error, in analyzer units
    pub integral_limit: f64,
}

impl Default for PiConfig {
    fn default() -> Self {
        Self {
            setpoint: 1.0,
            kp: 1.0,
            ki: 0.1,
            integral_limit: 100.0,
        }
    }
}

/// Drives the analyzer output towards a setpoint.
///
/// `error = output − setpoint`, `target = kp·error + ki·Σerror`. The error sum
/// is clamped to `±integral_limit` so a long saturation does not wind up.
pub struct PiController {
    config: PiConfig,
    integral: f64,
    last_target: f64,
}

impl PiController {
    /// Create a PI controller.
    pub fn new(config: PiConfig) -> Result<Self, LoopError> {
        let all_finite = [config.setpoint, config.kp, config.ki, config.integral_limit]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(LoopError::Configuration(
                "pi controller parameters must be finite".into(),
            ));
        }
        if config.integral_limit < 0.0 {
            return Err(LoopError::Configuration(format!(
                "pi integral_limit must be >= 0, got {}",
                config.integral_limit
            )));
        }
        Ok(Self {
            config,
            integral: 0.0,
            last_target: 0.0,
        })
    }

    /// Current accumulated error.
    pub fn integral(&self) -> f64 {
        self.integral
    }
}

impl Controller for PiController {
    fn compute_power(&mut self, analyzer_output: f64) -> f64 {
        let Some(input) = sanitize_input(analyzer_output) else {
            return self.last_target;
        };

        let error = input - self.config.setpoint;
        let limit = self.config.integral_limit;
        self.integral = (self.integral + error).clamp(-limit, limit);
        self.last_target = self.config.kp * error + self.config.ki * self.integral;
        self.last_target
    }

    fn name(&self) -> &str {
        "pi"
    }
}
