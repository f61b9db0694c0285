//! # laser_loop
//!
//! Closed-loop laser illumination control driven by live microscope image
//! analysis. A per-frame scalar metric (for example the density of blinking
//! fluorophores) is turned into a laser power command on a fixed tick, so the
//! illumination tracks what the camera sees.
//!
//! ## Crate Structure
//!
//! - **`analyzer`**: The `Analyzer` trait, the lock-free `OutputSnapshot` and the
//!   provided strategies (`intensity`, `spot_counter`).
//! - **`controller`**: The `Controller` trait and the provided control laws
//!   (`proportional`, `pi`, `manual`).
//! - **`laser`**: `LaserActuator`, which clamps, deadzones and issues power
//!   commands, and `LaserFactory` for building one from a selection.
//! - **`workers`**: The acquisition worker (frame intake plus analysis thread)
//!   and the control worker (fixed-tick actuation with late-tick coalescing).
//! - **`coordinator`**: `RunCoordinator`, the start/stop surface that owns one run
//!   at a time.
//! - **`telemetry`**: Non-blocking delivery of per-tick decisions.
//! - **`hardware`**: Capability traits for the image source and device property
//!   layer, plus mocks.
//! - **`config`**: Figment-based configuration (`Settings`, `RunConfiguration`).
//! - **`error`**: The crate-wide `LoopError`.
//! - **`frame`**: Image frames and regions of interest.
//! - **`limits`**: Shared bounds and timeouts.
//! - **`tracing_setup`**: Structured logging initialization.

pub mod analyzer;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod laser;
pub mod limits;
pub mod telemetry;
pub mod tracing_setup;
pub mod workers;

pub use coordinator::{RunCoordinator, RunReport};
pub use error::{AppResult, LoopError};
