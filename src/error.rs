//! Custom error types for the control loop.
//!
//! This module defines the primary error type, `LoopError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while configuring and running a
//! closed-loop illumination run.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically invalid (tick interval below 50 ms, deadzone outside `[0, 0.5]`, ...).
//!   These are rejected before any run starts and are never fatal to the process.
//! - **`FrameProcessing`**: An analyzer failed on a single frame. The frame is skipped
//!   and the run continues.
//! - **`Actuation`**: The laser device refused or failed a command. The control worker
//!   holds the previously applied power for that tick.
//! - **`AlreadyRunning`** / **`NotRunning`**: Lifecycle misuse, returned synchronously
//!   by the run coordinator without touching any state.
//! - **`Device`**: Any other failure reported by an external collaborator.
//!
//! By using `#[from]`, `LoopError` can be created from the underlying error types,
//! keeping error handling terse with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LoopError>;

/// Primary error type for the control loop.
#[derive(Error, Debug)]
pub enum LoopError {
    /// Configuration sources could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// An analyzer failed while processing a single frame.
    #[error("Frame processing error: {0}")]
    FrameProcessing(String),

    /// The laser device refused or failed a power command.
    #[error("Actuation error on {device}/{property}: {message}")]
    Actuation {
        /// Device identifier the command was sent to
        device: String,
        /// Property identifier the command was sent to
        property: String,
        /// Failure reported by the device layer
        message: String,
    },

    /// A run is already active.
    #[error("A run is already active")]
    AlreadyRunning,

    /// No run is active.
    #[error("No run is active")]
    NotRunning,

    /// Failure reported by an external collaborator outside the actuation path.
    #[error("Device error: {0}")]
    Device(String),
}
