//! Telemetry Sink
//!
//! Every control tick produces exactly one event: either a [`TickRecord`]
//! describing the decision, or a `Skipped` marker when the tick deadline passed
//! while a previous cycle was still in flight.
//!
//! Emission never blocks the control worker. Events go through a bounded
//! channel with `try_send`; when the consumer falls behind the event is dropped
//! and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Outcome of one actuation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    /// The actuator accepted the request (possibly clamped or deadzoned)
    Applied,
    /// Actuation failed; the previous power was kept
    Held,
}

/// One control decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Tick index since run start
    pub tick: u64,
    /// Wall-clock time the cycle completed
    pub timestamp: DateTime<Utc>,
    /// Analyzer output read at the start of the cycle
    pub analyzer_output: f64,
    /// Controller target before clamping
    pub requested_power: f64,
    /// Power in effect after the cycle
    pub applied_power: f64,
    /// Whether the actuation succeeded
    pub status: TickStatus,
}

/// Event delivered to the telemetry consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A completed control cycle
    Tick(TickRecord),
    /// A tick whose deadline passed while another cycle was in flight
    Skipped {
        /// Index of the skipped tick
        tick: u64,
        /// Time the skip was detected
        timestamp: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    /// Tick index of the event.
    pub fn tick(&self) -> u64 {
        match self {
            TelemetryEvent::Tick(record) => record.tick,
            TelemetryEvent::Skipped { tick, .. } => *tick,
        }
    }

    /// The tick record, if this event is a completed cycle.
    pub fn as_tick(&self) -> Option<&TickRecord> {
        match self {
            TelemetryEvent::Tick(record) => Some(record),
            TelemetryEvent::Skipped { .. } => None,
        }
    }
}

/// Non-blocking producer side of the telemetry channel.
///
/// Cheap to clone; clones share the drop counter.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: Option<mpsc::Sender<TelemetryEvent>>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySink {
    /// Create a sink and the receiver its events arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sink that discards everything without counting.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver an event if there is room, otherwise drop and count it.
    ///
    /// Returns true if the event was queued.
    pub fn emit(&self, event: TelemetryEvent) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Log the first drop and then every 100th to avoid flooding
                if total == 1 || total % 100 == 0 {
                    tracing::warn!(tick = event.tick(), dropped = total, "Telemetry channel full, dropping events");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(tick = event.tick(), "Telemetry receiver closed");
                false
            }
        }
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
