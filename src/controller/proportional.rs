use super::{sanitize_input, Controller};
use crate::error::LoopError;

/// `target = gain × max(output, 0)`
pub struct ProportionalController {
    gain: f64,
    last_target: f64,
}

impl ProportionalController {
    /// Create a proportional controller.
    pub fn new(gain: f64) -> Result<Self, LoopError> {
        if !gain.is_finite() {
            return Err(LoopError::Configuration(format!(
                "proportional gain must be finite, got {}",
                gain
            )));
        }
        Ok(Self {
            gain,
            last_target: 0.0,
        })
    }
}

impl Controller for ProportionalController {
    fn compute_power(&mut self, analyzer_output: f64) -> f64 {
        if let Some(input) = sanitize_input(analyzer_output) {
            self.last_target = self.gain * input;
        }
        self.last_target
    }

    fn name(&self) -> &str {
        "proportional"
    }
}
