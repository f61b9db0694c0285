//! Backpressure between frame intake and a slow analyzer.
//!
//! A source that produces frames far faster than the analyzer can handle them
//! must not queue frames or run the analyzer concurrently with itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use laser_loop::analyzer::Analyzer;
use laser_loop::config::RunConfiguration;
use laser_loop::controller::ProportionalController;
use laser_loop::frame::Frame;
use laser_loop::hardware::ImageSource;
use laser_loop::laser::LaserActuator;
use laser_loop::telemetry::TelemetrySink;
use laser_loop::RunCoordinator;

const BURST: u64 = 1000;

/// Yields `BURST` frames as fast as the runtime allows, then fails every grab.
struct BurstSource {
    produced: AtomicU64,
}

#[async_trait]
impl ImageSource for BurstSource {
    fn name(&self) -> &str {
        "burst"
    }

    async fn grab(&self) -> anyhow::Result<Arc<Frame>> {
        let n = self.produced.fetch_add(1, Ordering::SeqCst);
        if n >= BURST {
            bail!("burst exhausted");
        }
        tokio::task::yield_now().await;
        Ok(Arc::new(Frame::filled(8, 8, 200).with_frame_number(n)))
    }
}

#[derive(Default)]
struct Probe {
    calls: AtomicU64,
    busy: AtomicBool,
    overlapped: AtomicBool,
    last_frame: AtomicU64,
}

struct SlowAnalyzer {
    probe: Arc<Probe>,
}

impl Analyzer for SlowAnalyzer {
    fn process_image(&mut self, frame: &Frame) -> anyhow::Result<()> {
        if self.probe.busy.swap(true, Ordering::SeqCst) {
            self.probe.overlapped.store(true, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_millis(5));
        self.probe.last_frame.store(frame.frame_number, Ordering::SeqCst);
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        self.probe.busy.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn current_output(&self) -> f64 {
        self.probe.calls.load(Ordering::SeqCst) as f64
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_analyzer_drops_stale_frames() {
    let source = Arc::new(BurstSource {
        produced: AtomicU64::new(0),
    });
    let probe = Arc::new(Probe::default());
    let config = RunConfiguration::default();
    let laser = LaserActuator::new_virtual("Laser", "Power", 0.0, 50.0, 0.1).unwrap();

    let mut coordinator = RunCoordinator::new(source, TelemetrySink::disabled());
    coordinator
        .start_run(
            config,
            Box::new(SlowAnalyzer {
                probe: Arc::clone(&probe),
            }),
            Box::new(ProportionalController::new(0.01).unwrap()),
            laser,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let report = coordinator.stop_run().await.unwrap();

    let calls = probe.calls.load(Ordering::SeqCst);
    assert!(calls >= 1);
    assert!(calls < BURST, "analyzer saw every frame ({})", calls);
    assert!(!probe.overlapped.load(Ordering::SeqCst), "analyzer ran concurrently");

    let stats = report.stats;
    assert_eq!(stats.frames_acquired, BURST);
    assert!(stats.frames_dropped > 0);
    assert_eq!(stats.frames_processed, calls);
    assert_eq!(stats.frames_processed + stats.frames_dropped, stats.frames_acquired);

    // The newest frame always wins the slot
    assert_eq!(probe.last_frame.load(Ordering::SeqCst), BURST - 1);
}
