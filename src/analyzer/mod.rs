//! Image Analyzers
//!
//! An analyzer consumes one frame at a time, updates private state and exposes
//! a single scalar output (for example a spot density). The acquisition worker
//! drives it from a dedicated thread and publishes the output after every
//! successful frame through an [`OutputSnapshot`], which the control worker
//! reads on its own clock.
//!
//! # Contract
//! - `process_image` accepts frames of any size, including empty ones.
//! - An error (or panic) aborts only the current frame. The worker logs and
//!   counts it, then continues with the next frame.
//! - `current_output` returns the result of the most recently completed frame
//!   and must not block.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut analyzer = AnalyzerSpec::from_name("spot_counter")?.build()?;
//! analyzer.process_image(&frame)?;
//! println!("{} -> {}", analyzer.name(), analyzer.current_output());
//! ```

pub mod intensity;
pub mod spot_counter;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::LoopError;
use crate::frame::Frame;

pub use intensity::{IntensityAnalyzer, IntensityConfig};
pub use spot_counter::{SpotCounter, SpotCounterConfig};

/// Pluggable per-frame image analysis strategy.
pub trait Analyzer: Send {
    /// Analyze one frame and update the internal state.
    fn process_image(&mut self, frame: &Frame) -> anyhow::Result<()>;

    /// Output of the most recently completed analysis.
    fn current_output(&self) -> f64;

    /// Stable identifier of the strategy.
    fn name(&self) -> &str;
}

/// Single-slot, lock-free publication of the latest analyzer output.
///
/// The `f64` is stored as its bit pattern in an `AtomicU64`, so a reader always
/// sees a complete value from exactly one `store`. Last write wins.
#[derive(Debug)]
pub struct OutputSnapshot {
    bits: AtomicU64,
    updates: AtomicU64,
}

impl OutputSnapshot {
    /// Create a snapshot holding `initial`.
    pub fn new(initial: f64) -> Self {
        Self {
            bits: AtomicU64::new(initial.to_bits()),
            updates: AtomicU64::new(0),
        }
    }

    /// Publish a new output.
    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
        self.updates.fetch_add(1, Ordering::Release);
    }

    /// Latest published output.
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Number of values published since creation.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

impl Default for OutputSnapshot {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Analyzer selection, as it appears in configuration files.
///
/// ```toml
/// [analyzer]
/// type = "spot_counter"
/// noise_tolerance = 80
/// box_size = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalyzerSpec {
    /// Mean intensity above background
    Intensity(IntensityConfig),

    /// Local-maximum spot density
    SpotCounter(SpotCounterConfig),
}

impl AnalyzerSpec {
    /// Names accepted by [`AnalyzerSpec::from_name`].
    pub const NAMES: [&'static str; 2] = ["intensity", "spot_counter"];

    /// Default parameters for the strategy called `name`.
    pub fn from_name(name: &str) -> Result<Self, LoopError> {
        match name {
            "intensity" => Ok(Self::Intensity(IntensityConfig::default())),
            "spot_counter" => Ok(Self::SpotCounter(SpotCounterConfig::default())),
            other => Err(LoopError::Configuration(format!(
                "unknown analyzer '{}', expected one of {:?}",
                other,
                Self::NAMES
            ))),
        }
    }

    /// Strategy name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Intensity(_) => "intensity",
            Self::SpotCounter(_) => "spot_counter",
        }
    }

    /// Instantiate the analyzer, validating its parameters.
    pub fn build(&self) -> Result<Box<dyn Analyzer>, LoopError> {
        match self {
            Self::Intensity(config) => Ok(Box::new(IntensityAnalyzer::new(config.clone())?)),
            Self::SpotCounter(config) => Ok(Box::new(SpotCounter::new(config.clone())?)),
        }
    }
}

impl Default for AnalyzerSpec {
    fn default() -> Self {
        Self::SpotCounter(SpotCounterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_starts_at_zero() {
        let snapshot = OutputSnapshot::default();
        assert_eq!(snapshot.load(), 0.0);
        assert_eq!(snapshot.updates(), 0);
    }

    #[test]
    fn snapshot_last_write_wins() {
        let snapshot = OutputSnapshot::default();
        snapshot.store(1.5);
        snapshot.store(-3.25);
        assert_eq!(snapshot.load(), -3.25);
        assert_eq!(snapshot.updates(), 2);

        snapshot.store(f64::NAN);
        assert!(snapshot.load().is_nan());
    }

    #[test]
    fn snapshot_never_tears() {
        let snapshot = Arc::new(OutputSnapshot::default());
        let writer = {
            let snapshot = Arc::clone(&snapshot);
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    let v = if i % 2 == 0 { 1.0e300 } else { -7.0 };
                    snapshot.store(v);
                }
            })
        };
        for _ in 0..10_000 {
            let v = snapshot.load();
            assert!(v == 0.0 || v == 1.0e300 || v == -7.0, "torn value {}", v);
        }
        writer.join().unwrap();
    }

    #[test]
    fn spec_from_name() {
        assert_eq!(AnalyzerSpec::from_name("intensity").unwrap().name(), "intensity");
        let spec = AnalyzerSpec::from_name("spot_counter").unwrap();
        assert_eq!(spec.build().unwrap().name(), "spot_counter");
        assert!(matches!(
            AnalyzerSpec::from_name("quickpalm"),
            Err(LoopError::Configuration(_))
        ));
    }

    #[test]
    fn spec_deserializes_from_toml() {
        let spec: AnalyzerSpec = toml::from_str(
            r#"
            type = "spot_counter"
            noise_tolerance = 50
            box_size = 7
            "#,
        )
        .unwrap();
        assert_eq!(
            spec,
            AnalyzerSpec::SpotCounter(SpotCounterConfig {
                noise_tolerance: 50,
                box_size: 7,
            })
        );

        let spec: AnalyzerSpec = toml::from_str(r#"type = "intensity""#).unwrap();
        assert_eq!(spec, AnalyzerSpec::Intensity(IntensityConfig::default()));
    }
}
