//! Spot density from local maxima.
//!
//! A pixel counts as a spot when it is the maximum of the `box_size × box_size`
//! window centred on it and rises more than `noise_tolerance` counts above the
//! window minimum. The output is the spot count normalised to 100 µm² of
//! imaged area, which keeps the setpoint independent of ROI and binning.

use serde::{Deserialize, Serialize};

use super::Analyzer;
use crate::error::LoopError;
use crate::frame::Frame;

/// Configuration for [`SpotCounter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotCounterConfig {
    /// Minimum prominence of a spot over its local background (counts)
    pub noise_tolerance: u32,

    /// Side of the square neighbourhood searched for a maximum (pixels, odd)
    pub box_size: u32,
}

impl Default for SpotCounterConfig {
    fn default() -> Self {
        Self {
            noise_tolerance: 80,
            box_size: 5,
        }
    }
}

/// Counts local maxima and reports spots per 100 µm².
pub struct SpotCounter {
    config: SpotCounterConfig,
    last_count: usize,
    output: f64,
}

impl SpotCounter {
    /// Create the counter, rejecting degenerate windows.
    pub fn new(config: SpotCounterConfig) -> Result<Self, LoopError> {
        if config.box_size < 3 || config.box_size % 2 == 0 {
            return Err(LoopError::Configuration(format!(
                "spot counter box_size must be odd and >= 3, got {}",
                config.box_size
            )));
        }
        Ok(Self {
            config,
            last_count: 0,
            output: 0.0,
        })
    }

    /// Raw spot count of the last processed frame.
    pub fn last_count(&self) -> usize {
        self.last_count
    }

    fn count_spots(&self, frame: &Frame) -> usize {
        let (w, h) = (frame.width as i64, frame.height as i64);
        let half = (self.config.box_size / 2) as i64;
        let tolerance = self.config.noise_tolerance as i64;
        let px = |x: i64, y: i64| frame.pixels[(y * w + x) as usize] as i64;

        let mut count = 0;
        for y in 0..h {
            for x in 0..w {
                let centre = px(x, y);
                let idx = y * w + x;
                let mut is_max = true;
                let mut min = centre;

                'window: for wy in (y - half).max(0)..=(y + half).min(h - 1) {
                    for wx in (x - half).max(0)..=(x + half).min(w - 1) {
                        let v = px(wx, wy);
                        // Plateaus count once: ties lose to earlier pixels.
                        let earlier = wy * w + wx < idx;
                        if v > centre || (earlier && v == centre) {
                            is_max = false;
                            break 'window;
                        }
                        min = min.min(v);
                    }
                }

                if is_max && centre - min > tolerance {
                    count += 1;
                }
            }
        }
        count
    }
}

impl Analyzer for SpotCounter {
    fn process_image(&mut self, frame: &Frame) -> anyhow::Result<()> {
        frame.validate()?;

        let count = self.count_spots(frame);
        let area = frame.area_um2();
        self.last_count = count;
        self.output = if area > 0.0 {
            count as f64 * 100.0 / area
        } else {
            0.0
        };
        Ok(())
    }

    fn current_output(&self) -> f64 {
        self.output
    }

    fn name(&self) -> &str {
        "spot_counter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_spots(spots: &[(u32, u32, u16)]) -> Frame {
        let mut frame = Frame::filled(20, 20, 100).with_pixel_size(1.0);
        for &(x, y, value) in spots {
            frame.pixels[(y * 20 + x) as usize] = value;
        }
        frame
    }

    #[test]
    fn counts_isolated_spots() {
        let mut counter = SpotCounter::new(SpotCounterConfig::default()).unwrap();
        let frame = frame_with_spots(&[(3, 3, 500), (12, 4, 900), (10, 15, 400)]);
        counter.process_image(&frame).unwrap();

        assert_eq!(counter.last_count(), 3);
        // 3 spots on 400 µm²
        assert!((counter.current_output() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn ignores_dim_spots() {
        let mut counter = SpotCounter::new(SpotCounterConfig::default()).unwrap();
        let frame = frame_with_spots(&[(3, 3, 150), (12, 12, 500)]);
        counter.process_image(&frame).unwrap();
        assert_eq!(counter.last_count(), 1);
    }

    #[test]
    fn plateau_counts_once() {
        let mut counter = SpotCounter::new(SpotCounterConfig::default()).unwrap();
        let frame = frame_with_spots(&[(5, 5, 600), (6, 5, 600)]);
        counter.process_image(&frame).unwrap();
        assert_eq!(counter.last_count(), 1);
    }

    #[test]
    fn flat_and_empty_frames_have_no_spots() {
        let mut counter = SpotCounter::new(SpotCounterConfig::default()).unwrap();
        counter.process_image(&Frame::filled(8, 8, 300)).unwrap();
        assert_eq!(counter.last_count(), 0);

        counter.process_image(&Frame::new(0, 0, Vec::new())).unwrap();
        assert_eq!(counter.current_output(), 0.0);
    }

    #[test]
    fn rejects_even_box() {
        let config = SpotCounterConfig {
            noise_tolerance: 80,
            box_size: 4,
        };
        assert!(SpotCounter::new(config).is_err());
    }
}
