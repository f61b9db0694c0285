//! Acquisition Worker
//!
//! Two cooperating pieces per run:
//!
//! - an **intake task** on the tokio runtime that obtains frames according to
//!   the imaging mode and drops each one into a single-slot mailbox;
//! - an **analysis thread** (a plain OS thread named `analyzer-<name>`) that
//!   takes frames out of the mailbox, crops them to the ROI, runs the analyzer
//!   and publishes its output.
//!
//! The mailbox holds at most one frame. A newer frame replaces an unprocessed
//! older one, so a slow analyzer throttles the effective analysis rate without
//! ever queueing stale frames or running concurrently with itself.
//!
//! Analysis runs on its own thread rather than `spawn_blocking` so that an
//! analyzer that never returns can be abandoned after the watchdog timeout
//! without holding up runtime shutdown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{RunStats, StopSignal, WorkerState, WorkerStateCell};
use crate::analyzer::{Analyzer, OutputSnapshot};
use crate::config::{ImagingMode, RunConfiguration};
use crate::error::LoopError;
use crate::frame::{Frame, Roi};
use crate::hardware::ImageSource;
use crate::limits::{ANALYSIS_POLL_INTERVAL, GRAB_RETRY_DELAY};

// =============================================================================
// FrameSlot - single-frame mailbox
// =============================================================================

struct SlotInner {
    frame: Option<Arc<Frame>>,
    closed: bool,
}

/// Result of waiting on the mailbox.
#[derive(Debug)]
pub(crate) enum SlotTake {
    Frame(Arc<Frame>),
    Empty,
    Closed,
}

/// Single-slot, last-write-wins handoff from the intake task to the analysis thread.
pub(crate) struct FrameSlot {
    inner: Mutex<SlotInner>,
    ready: Condvar,
}

impl FrameSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                frame: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store a frame. Returns true if an unprocessed frame was replaced.
    ///
    /// Frames offered after `close` are discarded and count as replaced.
    pub(crate) fn offer(&self, frame: Arc<Frame>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return true;
        }
        let replaced = inner.frame.replace(frame).is_some();
        drop(inner);
        self.ready.notify_one();
        replaced
    }

    /// Wait up to `timeout` for a frame.
    ///
    /// A pending frame is returned even after `close`, so the tail of a finite
    /// sequence is still analyzed.
    pub(crate) fn take(&self, timeout: Duration) -> SlotTake {
        let mut inner = self.inner.lock();
        if inner.frame.is_none() && !inner.closed {
            self.ready.wait_for(&mut inner, timeout);
        }
        match inner.frame.take() {
            Some(frame) => SlotTake::Frame(frame),
            None if inner.closed => SlotTake::Closed,
            None => SlotTake::Empty,
        }
    }

    /// No more frames will arrive.
    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    /// Close and throw away a pending frame. Returns true if one was discarded.
    pub(crate) fn shutdown(&self) -> bool {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.frame.take().is_some()
        };
        self.ready.notify_all();
        discarded
    }
}

// =============================================================================
// AcquisitionWorker
// =============================================================================

/// Everything the acquisition side of a run needs.
pub struct AcquisitionWorker {
    /// Frame source
    pub source: Arc<dyn ImageSource>,
    /// Frozen run configuration
    pub config: Arc<RunConfiguration>,
    /// Strategy, moved onto the analysis thread
    pub analyzer: Box<dyn Analyzer>,
    /// Where completed outputs are published
    pub output: Arc<OutputSnapshot>,
    /// Shared counters
    pub stats: Arc<RunStats>,
    /// Run-wide cancellation
    pub stop: StopSignal,
}

/// Running acquisition worker.
pub struct AcquisitionHandle {
    intake: JoinHandle<()>,
    analysis_done: oneshot::Receiver<()>,
    slot: Arc<FrameSlot>,
    stats: Arc<RunStats>,
    state: Arc<WorkerStateCell>,
}

/// How the acquisition worker ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionOutcome {
    /// The analysis thread was still busy when the watchdog expired
    pub analysis_abandoned: bool,
    /// The intake task had to be aborted
    pub intake_aborted: bool,
}

/// Where the intake task gets its frames from, resolved before any task starts.
enum FrameFeed {
    Grab,
    Live(broadcast::Receiver<Arc<Frame>>),
    Sequence(mpsc::Receiver<Arc<Frame>>),
}

impl FrameFeed {
    async fn attach(source: &dyn ImageSource, mode: ImagingMode) -> Result<Self, LoopError> {
        let unsupported = |what: &str, e: anyhow::Error| {
            LoopError::Device(format!("{}: cannot {}: {}", source.name(), what, e))
        };
        let feed = match mode {
            ImagingMode::ContinuousGrab => FrameFeed::Grab,
            ImagingMode::LivePipelineTap => FrameFeed::Live(
                source
                    .subscribe_live()
                    .await
                    .map_err(|e| unsupported("attach to live-view pipeline", e))?,
            ),
            ImagingMode::NextAcquisition => FrameFeed::Sequence(
                source
                    .next_acquisition()
                    .await
                    .map_err(|e| unsupported("wait for acquisition sequence", e))?,
            ),
        };
        Ok(feed)
    }
}

impl AcquisitionWorker {
    /// Attach to the image source, then start the analysis thread and the
    /// intake task.
    ///
    /// Fails with `Device` if the source does not support the imaging mode;
    /// nothing is started in that case.
    pub async fn spawn(self) -> Result<AcquisitionHandle, LoopError> {
        let AcquisitionWorker {
            source,
            config,
            analyzer,
            output,
            stats,
            stop,
        } = self;

        let feed = FrameFeed::attach(source.as_ref(), config.imaging_mode).await?;

        let slot = Arc::new(FrameSlot::new());
        let state = Arc::new(WorkerStateCell::new());
        let (done_tx, analysis_done) = oneshot::channel();

        let thread_name = format!("analyzer-{}", analyzer.name());
        {
            let slot = Arc::clone(&slot);
            let stats = Arc::clone(&stats);
            let stop = stop.clone();
            let state = Arc::clone(&state);
            let roi = config.roi;
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    analysis_loop(analyzer, roi, &slot, &output, &stats, &stop);
                    state.set(WorkerState::Idle);
                    let _ = done_tx.send(());
                })
                .map_err(|e| LoopError::Device(format!("cannot spawn analysis thread: {}", e)))?;
        }

        state.set(WorkerState::Running);

        let intake = {
            let slot = Arc::clone(&slot);
            let stats = Arc::clone(&stats);
            let span = tracing::info_span!("intake", source = source.name(), mode = %config.imaging_mode);
            tokio::spawn(
                async move {
                    match feed {
                        FrameFeed::Grab => continuous_grab(source.as_ref(), &slot, &stats, &stop).await,
                        FrameFeed::Live(rx) => live_pipeline_tap(rx, &slot, &stats, &stop).await,
                        FrameFeed::Sequence(rx) => next_acquisition(rx, &slot, &stats, &stop).await,
                    }
                    slot.close();
                }
                .instrument(span),
            )
        };

        Ok(AcquisitionHandle {
            intake,
            analysis_done,
            slot,
            stats,
            state,
        })
    }
}

impl AcquisitionHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Stop the worker. The stop signal must already be triggered.
    ///
    /// Queued frames are discarded. The frame in flight gets up to `watchdog`
    /// to complete, after which the analysis thread is abandoned.
    pub async fn join(self, watchdog: Duration) -> AcquisitionOutcome {
        let mut outcome = AcquisitionOutcome::default();
        self.state.set(WorkerState::Stopping);

        if self.slot.shutdown() {
            self.stats.frames_dropped(1);
        }

        let mut intake = self.intake;
        if tokio::time::timeout(watchdog, &mut intake).await.is_err() {
            tracing::error!(?watchdog, "Frame intake did not stop within watchdog, aborting");
            intake.abort();
            outcome.intake_aborted = true;
        }

        if tokio::time::timeout(watchdog, self.analysis_done).await.is_err() {
            tracing::error!(
                ?watchdog,
                "Analyzer did not finish its frame within watchdog, abandoning analysis thread"
            );
            outcome.analysis_abandoned = true;
        }

        self.state.set(WorkerState::Idle);
        outcome
    }
}

// =============================================================================
// Intake strategies
// =============================================================================

fn deliver(slot: &FrameSlot, stats: &RunStats, frame: Arc<Frame>) {
    stats.frame_acquired();
    if slot.offer(frame) {
        stats.frames_dropped(1);
    }
}

async fn continuous_grab(source: &dyn ImageSource, slot: &FrameSlot, stats: &RunStats, stop: &StopSignal) {
    let mut consecutive_errors: u64 = 0;
    loop {
        let grabbed = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            grabbed = source.grab() => grabbed,
        };

        match grabbed {
            Ok(frame) => {
                consecutive_errors = 0;
                deliver(slot, stats, frame);
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors == 1 {
                    tracing::warn!(error = %e, "Frame grab failed, retrying");
                } else {
                    tracing::debug!(error = %e, consecutive_errors, "Frame grab failed");
                }
                tokio::select! {
                    biased;
                    _ = stop.stopped() => break,
                    _ = tokio::time::sleep(GRAB_RETRY_DELAY) => {}
                }
            }
        }
    }
}

async fn live_pipeline_tap(
    mut rx: broadcast::Receiver<Arc<Frame>>,
    slot: &FrameSlot,
    stats: &RunStats,
    stop: &StopSignal,
) {

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            received = rx.recv() => received,
        };

        match received {
            Ok(frame) => deliver(slot, stats, frame),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Live-view receiver lagged");
                stats.frames_dropped(missed);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("Live-view pipeline closed");
                break;
            }
        }
    }
}

async fn next_acquisition(
    mut rx: mpsc::Receiver<Arc<Frame>>,
    slot: &FrameSlot,
    stats: &RunStats,
    stop: &StopSignal,
) {

    let mut frames: u64 = 0;
    loop {
        let received = tokio::select! {
            biased;
            _ = stop.stopped() => break,
            received = rx.recv() => received,
        };

        match received {
            Some(frame) => {
                frames += 1;
                deliver(slot, stats, frame);
            }
            None => {
                tracing::info!(frames, "Acquisition sequence complete, holding last analyzer output");
                break;
            }
        }
    }
}

// =============================================================================
// Analysis thread
// =============================================================================

fn analysis_loop(
    mut analyzer: Box<dyn Analyzer>,
    roi: Option<Roi>,
    slot: &FrameSlot,
    output: &OutputSnapshot,
    stats: &RunStats,
    stop: &StopSignal,
) {
    let name = analyzer.name().to_string();
    tracing::debug!(analyzer = %name, "Analysis thread started");

    while !stop.is_stopped() {
        let frame = match slot.take(ANALYSIS_POLL_INTERVAL) {
            SlotTake::Frame(frame) => frame,
            SlotTake::Empty => continue,
            SlotTake::Closed => break,
        };
        if stop.is_stopped() {
            stats.frames_dropped(1);
            break;
        }

        match analyze_frame(analyzer.as_mut(), &frame, roi) {
            Ok(()) => {
                output.store(analyzer.current_output());
                stats.frame_processed();
            }
            Err(e) => {
                tracing::warn!(
                    analyzer = %name,
                    frame = frame.frame_number,
                    error = %e,
                    "Frame skipped"
                );
                stats.frame_failed();
            }
        }
    }

    tracing::debug!(analyzer = %name, "Analysis thread finished");
}

/// Crop and analyze one frame. Panics inside the analyzer are frame errors.
fn analyze_frame(analyzer: &mut dyn Analyzer, frame: &Frame, roi: Option<Roi>) -> Result<(), LoopError> {
    let cropped;
    let input = match roi {
        Some(roi) => {
            cropped = frame.crop(&roi)?;
            &cropped
        }
        None => frame,
    };

    match catch_unwind(AssertUnwindSafe(|| analyzer.process_image(input))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LoopError::FrameProcessing(format!("{:#}", e))),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(LoopError::FrameProcessing(format!("analyzer panicked: {}", message)))
        }
    }
}
