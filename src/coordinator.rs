//! Run Coordinator
//!
//! The single control surface of the loop. A run is started with a frozen
//! configuration and the analyzer, controller and laser it will own, and is
//! torn down with `stop_run`. At most one run is active at a time.
//!
//! # Lifecycle
//!
//! ```text
//! start_run ──► acquisition worker ──► control worker ──► (running)
//!                                                            │
//! stop_run  ◄── bounded joins ◄── stop signal ◄──────────────┘
//! ```
//!
//! A run can also stop itself (repeated actuation failures on a real laser).
//! It then stays registered until `stop_run` collects its report, or until the
//! next `start_run` reaps it.
//!
//! # Example
//!
//! ```rust,ignore
//! let (telemetry, mut events) = TelemetrySink::channel(1024);
//! let mut coordinator = RunCoordinator::new(camera, telemetry);
//! let run_id = coordinator.start_run(config, analyzer, controller, laser).await?;
//! // ...
//! let report = coordinator.stop_run().await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::analyzer::{Analyzer, OutputSnapshot};
use crate::config::RunConfiguration;
use crate::controller::Controller;
use crate::error::{AppResult, LoopError};
use crate::hardware::ImageSource;
use crate::laser::LaserActuator;
use crate::telemetry::TelemetrySink;
use crate::workers::{
    AcquisitionHandle, AcquisitionWorker, ControlHandle, ControlWorker, RunStats,
    RunStatsSnapshot, StopReason, StopSignal, WorkerState,
};

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Why the run ended
    pub stop_reason: StopReason,
    /// Analyzer strategy used
    pub analyzer: String,
    /// Controller law used
    pub controller: String,
    /// Worker counters
    #[serde(flatten)]
    pub stats: RunStatsSnapshot,
    /// Telemetry events dropped during the run
    pub telemetry_dropped: u64,
    /// Last published analyzer output
    pub last_analyzer_output: f64,
    /// Laser power in effect at stop (unknown if the control task was lost)
    pub final_power: Option<f64>,
    /// The analysis thread was abandoned by the watchdog
    pub analysis_abandoned: bool,
    /// The in-flight actuation was abandoned by the watchdog
    pub actuation_abandoned: bool,
    /// Wall-clock run duration
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

struct ActiveRun {
    run_id: Uuid,
    config: Arc<RunConfiguration>,
    analyzer: String,
    controller: String,
    stop: StopSignal,
    stats: Arc<RunStats>,
    output: Arc<OutputSnapshot>,
    acquisition: AcquisitionHandle,
    control: ControlHandle,
    started: Instant,
    telemetry_dropped_at_start: u64,
}

/// Owns the lifecycle of the active run.
pub struct RunCoordinator {
    source: Arc<dyn ImageSource>,
    telemetry: TelemetrySink,
    active: Option<ActiveRun>,
}

impl RunCoordinator {
    /// Create a coordinator for an image source and telemetry sink.
    pub fn new(source: Arc<dyn ImageSource>, telemetry: TelemetrySink) -> Self {
        Self {
            source,
            telemetry,
            active: None,
        }
    }

    /// Validate, then start a run. Returns the run id.
    ///
    /// The first control tick may see the analyzer's initial output before
    /// any frame has been analyzed.
    pub async fn start_run(
        &mut self,
        config: RunConfiguration,
        analyzer: Box<dyn Analyzer>,
        controller: Box<dyn Controller>,
        laser: LaserActuator,
    ) -> AppResult<Uuid> {
        config.validate()?;
        check_laser_matches(&config, &laser)?;

        if let Some(active) = &self.active {
            if !active.stop.is_stopped() {
                return Err(LoopError::AlreadyRunning);
            }
            let report = self.finish_active().await;
            if let Some(report) = report {
                tracing::info!(
                    run_id = %report.run_id,
                    reason = %report.stop_reason,
                    "Reaped self-stopped run"
                );
            }
        }

        let run_id = Uuid::new_v4();
        let config = Arc::new(config);
        let stop = StopSignal::new();
        let stats = Arc::new(RunStats::default());
        let output = Arc::new(OutputSnapshot::new(analyzer.current_output()));
        let analyzer_name = analyzer.name().to_string();
        let controller_name = controller.name().to_string();

        let acquisition = AcquisitionWorker {
            source: Arc::clone(&self.source),
            config: Arc::clone(&config),
            analyzer,
            output: Arc::clone(&output),
            stats: Arc::clone(&stats),
            stop: stop.clone(),
        }
        .spawn()
        .await?;

        let control = ControlWorker {
            run_id,
            config: Arc::clone(&config),
            controller,
            laser,
            output: Arc::clone(&output),
            telemetry: self.telemetry.clone(),
            stats: Arc::clone(&stats),
            stop: stop.clone(),
        }
        .spawn();

        tracing::info!(
            %run_id,
            analyzer = %analyzer_name,
            controller = %controller_name,
            mode = %config.imaging_mode,
            tick_interval_ms = config.tick_interval_ms,
            "Run started"
        );

        self.active = Some(ActiveRun {
            run_id,
            config,
            analyzer: analyzer_name,
            controller: controller_name,
            stop,
            stats,
            output,
            acquisition,
            control,
            started: Instant::now(),
            telemetry_dropped_at_start: self.telemetry.dropped(),
        });
        Ok(run_id)
    }

    /// Stop the active run and return its report.
    ///
    /// Returns `NotRunning` without side effects if no run is active.
    pub async fn stop_run(&mut self) -> AppResult<RunReport> {
        self.finish_active().await.ok_or(LoopError::NotRunning)
    }

    async fn finish_active(&mut self) -> Option<RunReport> {
        let run = self.active.take()?;
        run.stop.trigger(StopReason::Requested);

        let watchdog = run.config.watchdog_timeout;
        let (acquisition, control) =
            tokio::join!(run.acquisition.join(watchdog), run.control.join(watchdog));

        let stop_reason = run.stop.reason().unwrap_or(StopReason::Requested);
        let report = RunReport {
            run_id: run.run_id,
            stop_reason,
            analyzer: run.analyzer,
            controller: run.controller,
            stats: run.stats.snapshot(),
            telemetry_dropped: self
                .telemetry
                .dropped()
                .saturating_sub(run.telemetry_dropped_at_start),
            last_analyzer_output: run.output.load(),
            final_power: control.as_ref().map(|c| c.final_power),
            analysis_abandoned: acquisition.analysis_abandoned,
            actuation_abandoned: control.as_ref().map_or(true, |c| c.cycle_abandoned),
            duration: run.started.elapsed(),
        };

        tracing::info!(
            run_id = %report.run_id,
            reason = %report.stop_reason,
            ticks = report.stats.ticks_executed,
            skipped = report.stats.ticks_skipped,
            frames = report.stats.frames_processed,
            "Run stopped"
        );
        Some(report)
    }

    /// True while a run is active and has not stopped itself.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|run| !run.stop.is_stopped())
    }

    /// Identifier of the active run.
    pub fn active_run_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|run| run.run_id)
    }

    /// Frozen configuration of the active run.
    pub fn config(&self) -> Option<&RunConfiguration> {
        self.active.as_ref().map(|run| run.config.as_ref())
    }

    /// Counters of the active run.
    pub fn stats(&self) -> Option<RunStatsSnapshot> {
        self.active.as_ref().map(|run| run.stats.snapshot())
    }

    /// Latest analyzer output of the active run.
    pub fn analyzer_output(&self) -> Option<f64> {
        self.active.as_ref().map(|run| run.output.load())
    }

    /// Worker states of the active run as `(acquisition, control)`.
    pub fn worker_states(&self) -> Option<(WorkerState, WorkerState)> {
        self.active
            .as_ref()
            .map(|run| (run.acquisition.state(), run.control.state()))
    }

    /// Resolve once the active run stops, for any reason.
    ///
    /// Returns `None` immediately if no run is active.
    pub async fn stopped(&self) -> Option<StopReason> {
        match &self.active {
            Some(run) => Some(run.stop.stopped().await),
            None => None,
        }
    }
}

impl Drop for RunCoordinator {
    fn drop(&mut self) {
        if let Some(run) = &self.active {
            run.stop.trigger(StopReason::Requested);
        }
    }
}

fn check_laser_matches(config: &RunConfiguration, laser: &LaserActuator) -> AppResult<()> {
    if laser.max_power() != config.max_laser_power {
        return Err(LoopError::Configuration(format!(
            "laser max power {} does not match configured {}",
            laser.max_power(),
            config.max_laser_power
        )));
    }
    if laser.is_virtual() != config.laser_is_virtual {
        return Err(LoopError::Configuration(format!(
            "laser {} is {} but the run expects a {} laser",
            laser.device_name(),
            if laser.is_virtual() { "virtual" } else { "real" },
            if config.laser_is_virtual { "virtual" } else { "real" },
        )));
    }
    if laser.deadzone_fraction() != config.deadzone_fraction {
        return Err(LoopError::Configuration(format!(
            "laser deadzone {} does not match configured {}",
            laser.deadzone_fraction(),
            config.deadzone_fraction
        )));
    }
    Ok(())
}
