//! Control Worker
//!
//! Runs one actuation cycle per tick: read the published analyzer output, ask
//! the controller for a target, send it through the laser actuator and emit a
//! telemetry record.
//!
//! # Scheduling
//!
//! Tick `k` is due at `start + k × interval`. Cycles never overlap: when a
//! cycle overruns, every deadline that passed in the meantime is skipped and
//! reported as a `Skipped` event, and the worker resumes at the next future
//! deadline. There is no catch-up burst.
//!
//! # Failure policy
//!
//! - Non-finite analyzer output or controller target: the previous target is held.
//! - Actuation error: logged, the previous applied power stays in effect.
//! - `max_actuation_failures` consecutive errors on a real laser stop the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::Instrument;
use uuid::Uuid;

use super::{RunStats, StopReason, StopSignal, WorkerState, WorkerStateCell};
use crate::analyzer::OutputSnapshot;
use crate::config::RunConfiguration;
use crate::controller::Controller;
use crate::laser::LaserActuator;
use crate::telemetry::{TelemetryEvent, TelemetrySink, TickRecord, TickStatus};

/// Everything the control side of a run needs.
pub struct ControlWorker {
    /// Run identifier, attached to every log line
    pub run_id: Uuid,
    /// Frozen run configuration
    pub config: Arc<RunConfiguration>,
    /// Control law, owned exclusively by this worker
    pub controller: Box<dyn Controller>,
    /// Actuator, owned exclusively by this worker
    pub laser: LaserActuator,
    /// Latest analyzer output
    pub output: Arc<OutputSnapshot>,
    /// Decision sink
    pub telemetry: TelemetrySink,
    /// Shared counters
    pub stats: Arc<RunStats>,
    /// Run-wide cancellation
    pub stop: StopSignal,
}

/// Final state of the control worker.
#[derive(Debug, Clone)]
pub struct ControlReport {
    /// Power in effect when the worker stopped
    pub final_power: f64,
    /// Laser device identity
    pub device: String,
    /// Commands that reached the backend
    pub commands_issued: u64,
    /// The in-flight cycle had to be abandoned at stop
    pub cycle_abandoned: bool,
}

/// Running control worker.
pub struct ControlHandle {
    task: JoinHandle<ControlReport>,
    state: Arc<WorkerStateCell>,
}

struct ControlLoop {
    worker: ControlWorker,
    last_target: f64,
    consecutive_failures: u32,
}

impl ControlWorker {
    /// Start ticking on the current runtime.
    pub fn spawn(self) -> ControlHandle {
        let state = Arc::new(WorkerStateCell::new());
        state.set(WorkerState::Running);

        let span = tracing::info_span!("control", run_id = %self.run_id);
        let last_target = self.laser.laser_power_cached();
        let control = ControlLoop {
            worker: self,
            last_target,
            consecutive_failures: 0,
        };

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(
                async move {
                    let report = control.run().await;
                    state.set(WorkerState::Idle);
                    report
                }
                .instrument(span),
            )
        };

        ControlHandle { task, state }
    }
}

impl ControlHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Wait for the worker to finish. The stop signal must already be triggered.
    ///
    /// The worker bounds its own in-flight cycle by `watchdog`; this adds the
    /// same margin again before aborting the task outright.
    pub async fn join(self, watchdog: Duration) -> Option<ControlReport> {
        if self.state.get() == WorkerState::Running {
            self.state.set(WorkerState::Stopping);
        }
        let mut task = self.task;
        match timeout(watchdog.saturating_mul(2), &mut task).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Control task failed");
                None
            }
            Err(_) => {
                tracing::error!(?watchdog, "Control task did not stop, aborting");
                task.abort();
                None
            }
        }
    }
}

impl ControlLoop {
    async fn run(mut self) -> ControlReport {
        let stop = self.worker.stop.clone();
        let interval_ms = self.worker.config.tick_interval_ms.max(1);
        let watchdog = self.worker.config.watchdog_timeout;
        let start = Instant::now();
        let mut tick: u64 = 0;
        let mut cycle_abandoned = false;

        tracing::info!(
            interval_ms,
            controller = self.worker.controller.name(),
            laser = %self.worker.laser.device_name(),
            property = self.worker.laser.property_name(),
            "Control worker started"
        );

        loop {
            let deadline = start + Duration::from_millis(interval_ms.saturating_mul(tick));
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = sleep_until(deadline) => {}
            }

            let record = {
                let cycle = self.cycle(tick);
                tokio::pin!(cycle);
                tokio::select! {
                    biased;
                    record = &mut cycle => Some(record),
                    _ = stop.stopped() => match timeout(watchdog, &mut cycle).await {
                        Ok(record) => Some(record),
                        Err(_) => {
                            tracing::error!(tick, ?watchdog, "Actuation did not complete within watchdog, abandoning");
                            None
                        }
                    },
                }
            };

            let Some(record) = record else {
                cycle_abandoned = true;
                break;
            };

            self.worker.stats.tick_executed();
            self.worker.telemetry.emit(TelemetryEvent::Tick(record));

            if self.failure_limit_reached() {
                tracing::error!(
                    failures = self.consecutive_failures,
                    "Laser keeps refusing commands, stopping run"
                );
                stop.trigger(StopReason::ActuationFailure);
                break;
            }

            // Coalesce: skip every deadline that passed while the cycle ran
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let next = (elapsed_ms / interval_ms + 1).max(tick + 1);
            for skipped in tick + 1..next {
                self.worker.stats.tick_skipped();
                self.worker.telemetry.emit(TelemetryEvent::Skipped {
                    tick: skipped,
                    timestamp: Utc::now(),
                });
            }
            if next > tick + 1 {
                tracing::debug!(tick, skipped = next - tick - 1, "Cycle overran, skipping ticks");
            }
            tick = next;
        }

        let report = ControlReport {
            final_power: self.worker.laser.laser_power_cached(),
            device: self.worker.laser.device_name(),
            commands_issued: self.worker.laser.commands_issued(),
            cycle_abandoned,
        };
        tracing::info!(
            ticks = tick,
            final_power = report.final_power,
            "Control worker stopped"
        );
        report
    }

    async fn cycle(&mut self, tick: u64) -> TickRecord {
        let analyzer_output = self.worker.output.load();

        let requested_power = if analyzer_output.is_finite() {
            let target = self.worker.controller.compute_power(analyzer_output);
            if target.is_finite() {
                target
            } else {
                tracing::debug!(tick, target, "Controller target not finite, holding");
                self.last_target
            }
        } else {
            tracing::debug!(tick, analyzer_output, "Analyzer output not finite, holding");
            self.last_target
        };
        self.last_target = requested_power;

        let (applied_power, status) = match self.worker.laser.apply(requested_power).await {
            Ok(applied) => {
                self.consecutive_failures = 0;
                (applied, TickStatus::Applied)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    tick,
                    error = %e,
                    failures = self.consecutive_failures,
                    "Actuation failed, holding previous power"
                );
                (self.worker.laser.laser_power_cached(), TickStatus::Held)
            }
        };

        tracing::trace!(tick, analyzer_output, requested_power, applied_power, "Tick");
        TickRecord {
            tick,
            timestamp: Utc::now(),
            analyzer_output,
            requested_power,
            applied_power,
            status,
        }
    }

    fn failure_limit_reached(&self) -> bool {
        !self.worker.laser.is_virtual()
            && self.consecutive_failures >= self.worker.config.max_actuation_failures
    }
}
