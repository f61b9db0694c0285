//! Mean intensity above background.

use serde::{Deserialize, Serialize};

use super::Analyzer;
use crate::error::LoopError;
use crate::frame::Frame;

/// Configuration for [`IntensityAnalyzer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntensityConfig {
    /// Camera offset subtracted from every pixel (counts)
    pub background: f64,

    /// Weight of the previous output in the exponential moving average.
    /// `0.0` disables smoothing; must be below `1.0`.
    pub smoothing: f64,
}

impl Default for IntensityConfig {
    fn default() -> Self {
        Self {
            background: 100.0,
            smoothing: 0.0,
        }
    }
}

/// Reports the mean pixel value above a fixed background.
///
/// Pixels below the background contribute zero. Empty frames leave the output
/// unchanged.
pub struct IntensityAnalyzer {
    config: IntensityConfig,
    output: f64,
    primed: bool,
}

impl IntensityAnalyzer {
    /// Create the analyzer, rejecting out-of-range parameters.
    pub fn new(config: IntensityConfig) -> Result<Self, LoopError> {
        if !config.background.is_finite() {
            return Err(LoopError::Configuration(
                "intensity background must be finite".into(),
            ));
        }
        if !(0.0..1.0).contains(&config.smoothing) {
            return Err(LoopError::Configuration(format!(
                "intensity smoothing must be in [0, 1), got {}",
                config.smoothing
            )));
        }
        Ok(Self {
            config,
            output: 0.0,
            primed: false,
        })
    }
}

impl Analyzer for IntensityAnalyzer {
    fn process_image(&mut self, frame: &Frame) -> anyhow::Result<()> {
        frame.validate()?;
        if frame.pixels.is_empty() {
            return Ok(());
        }

        let sum: f64 = frame
            .pixels
            .iter()
            .map(|&p| (p as f64 - self.config.background).max(0.0))
            .sum();
        let mean = sum / frame.pixels.len() as f64;

        self.output = if self.primed {
            self.config.smoothing * self.output + (1.0 - self.config.smoothing) * mean
        } else {
            mean
        };
        self.primed = true;
        Ok(())
    }

    fn current_output(&self) -> f64 {
        self.output
    }

    fn name(&self) -> &str {
        "intensity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_above_background() {
        let mut analyzer = IntensityAnalyzer::new(IntensityConfig::default()).unwrap();
        let frame = Frame::new(2, 2, vec![100, 140, 50, 180]);
        analyzer.process_image(&frame).unwrap();
        assert!((analyzer.current_output() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn smoothing_blends_previous_output() {
        let config = IntensityConfig {
            background: 0.0,
            smoothing: 0.5,
        };
        let mut analyzer = IntensityAnalyzer::new(config).unwrap();
        analyzer.process_image(&Frame::filled(4, 4, 100)).unwrap();
        assert_eq!(analyzer.current_output(), 100.0);

        analyzer.process_image(&Frame::filled(4, 4, 0)).unwrap();
        assert_eq!(analyzer.current_output(), 50.0);
    }

    #[test]
    fn empty_frame_keeps_output() {
        let mut analyzer = IntensityAnalyzer::new(IntensityConfig::default()).unwrap();
        analyzer.process_image(&Frame::filled(1, 1, 150)).unwrap();
        analyzer.process_image(&Frame::new(0, 0, Vec::new())).unwrap();
        assert_eq!(analyzer.current_output(), 50.0);
    }

    #[test]
    fn malformed_frame_is_error() {
        let mut analyzer = IntensityAnalyzer::new(IntensityConfig::default()).unwrap();
        assert!(analyzer.process_image(&Frame::new(3, 3, vec![0; 4])).is_err());
        assert_eq!(analyzer.current_output(), 0.0);
    }

    #[test]
    fn rejects_bad_smoothing() {
        let config = IntensityConfig {
            background: 0.0,
            smoothing: 1.0,
        };
        assert!(IntensityAnalyzer::new(config).is_err());
    }
}
