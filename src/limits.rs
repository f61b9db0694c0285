//! Shared hard limits for run configuration and worker supervision.
//!
//! This module centralizes:
//! - Bounds applied when validating a run configuration
//! - Timeout durations used when stopping workers
//! - Capacities of the bounded channels between workers and collaborators
//!
//! Using centralized constants keeps validation and supervision consistent.

use std::time::Duration;

// =============================================================================
// Configuration Bounds
// =============================================================================

/// Smallest accepted control tick interval in milliseconds.
pub const MIN_TICK_INTERVAL_MS: u64 = 50;

/// Largest accepted deadzone fraction.
pub const MAX_DEADZONE_FRACTION: f64 = 0.5;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default watchdog timeout (1 second).
///
/// Upper bound on how long a stop request waits for an in-flight frame analysis
/// or actuation before abandoning it.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval of the analysis thread while waiting for frames.
///
/// The stop flag is re-checked at least this often.
pub const ANALYSIS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Back-off after a failed frame grab before trying again.
pub const GRAB_RETRY_DELAY: Duration = Duration::from_millis(10);

// =============================================================================
// Failure Escalation
// =============================================================================

/// Default number of consecutive actuation failures on a real laser before the
/// run is stopped automatically.
pub const DEFAULT_MAX_ACTUATION_FAILURES: u32 = 3;

// =============================================================================
// Channel Capacities
// =============================================================================

/// Default capacity of the telemetry channel.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1024;

/// Capacity of the mock camera live-view broadcast channel.
pub const LIVE_VIEW_CAPACITY: usize = 16;
