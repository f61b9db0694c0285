//! Run Workers
//!
//! A run is driven by two independently paced workers:
//!
//! - [`acquisition`]: pulls frames from the image source and feeds the
//!   analyzer on a dedicated thread
//! - [`control`]: runs on a fixed tick, turns the latest analyzer output into a
//!   laser command and reports every decision
//!
//! They share only the [`OutputSnapshot`](crate::analyzer::OutputSnapshot), the
//! atomic counters in [`RunStats`] and the [`StopSignal`].

pub mod acquisition;
pub mod control;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

pub use acquisition::{AcquisitionHandle, AcquisitionWorker};
pub use control::{ControlHandle, ControlReport, ControlWorker};

// =============================================================================
// StopSignal
// =============================================================================

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop_run` was called
    Requested,
    /// Too many consecutive actuation failures on a real laser
    ActuationFailure,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "requested"),
            StopReason::ActuationFailure => write!(f, "actuation failure"),
        }
    }
}

/// Run-wide cancellation, checked between processing units.
///
/// Latches on the first trigger; later triggers do not change the reason.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Returns true if this call triggered the signal.
    pub fn trigger(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Non-blocking check.
    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Reason of the first trigger, if any.
    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    /// Resolve once the signal is triggered.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            // The sender lives in `self`, so the channel cannot close here
            Err(_) => None,
        };
        reason.unwrap_or(StopReason::Requested)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// WorkerState
// =============================================================================

/// Lifecycle of a worker: `Idle → Running → Stopping → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started, or fully stopped
    Idle,
    /// Processing
    Running,
    /// Stop requested, finishing in-flight work
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Lock-free cell holding a [`WorkerState`].
#[derive(Debug)]
pub struct WorkerStateCell(AtomicU8);

impl WorkerStateCell {
    /// New cell in `Idle`.
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Current state.
    pub fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Idle,
        }
    }

    /// Transition to `state`.
    pub fn set(&self, state: WorkerState) {
        let raw = match state {
            WorkerState::Idle => 0,
            WorkerState::Running => 1,
            WorkerState::Stopping => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

impl Default for WorkerStateCell {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RunStats
// =============================================================================

/// Counters shared by both workers of a run.
#[derive(Debug, Default)]
pub struct RunStats {
    ticks_executed: AtomicU64,
    ticks_skipped: AtomicU64,
    frames_acquired: AtomicU64,
    frames_processed: AtomicU64,
    frames_failed: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    /// Control cycles completed
    pub ticks_executed: u64,
    /// Tick deadlines skipped because a cycle overran
    pub ticks_skipped: u64,
    /// Frames received from the image source
    pub frames_acquired: u64,
    /// Frames analyzed successfully
    pub frames_processed: u64,
    /// Frames the analyzer rejected
    pub frames_failed: u64,
    /// Frames replaced or discarded before analysis
    pub frames_dropped: u64,
}

impl RunStats {
    pub(crate) fn tick_executed(&self) {
        self.ticks_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tick_skipped(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_acquired(&self) {
        self.frames_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_failed(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            ticks_executed: self.ticks_executed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            frames_acquired: self.frames_acquired.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_signal_latches_first_reason() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        assert_eq!(stop.reason(), None);

        assert!(stop.trigger(StopReason::ActuationFailure));
        assert!(!stop.clone().trigger(StopReason::Requested));
        assert!(stop.is_stopped());
        assert_eq!(stop.reason(), Some(StopReason::ActuationFailure));
    }

    #[tokio::test]
    async fn stopped_resolves_after_trigger() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        stop.trigger(StopReason::Requested);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Requested);
    }

    #[tokio::test]
    async fn stopped_resolves_immediately_when_already_triggered() {
        let stop = StopSignal::new();
        stop.trigger(StopReason::ActuationFailure);
        assert_eq!(stop.stopped().await, StopReason::ActuationFailure);
    }

    #[test]
    fn worker_state_transitions() {
        let cell = WorkerStateCell::new();
        assert_eq!(cell.get(), WorkerState::Idle);
        cell.set(WorkerState::Running);
        assert_eq!(cell.get(), WorkerState::Running);
        cell.set(WorkerState::Stopping);
        assert_eq!(cell.get().to_string(), "stopping");
    }

    #[test]
    fn stats_snapshot() {
        let stats = RunStats::default();
        stats.tick_executed();
        stats.tick_skipped();
        stats.tick_skipped();
        stats.frames_dropped(5);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ticks_executed, 1);
        assert_eq!(snapshot.ticks_skipped, 2);
        assert_eq!(snapshot.frames_dropped, 5);
    }
}
