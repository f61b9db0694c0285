//! Overrunning control cycles are coalesced, never queued.

use std::sync::Arc;
use std::time::Duration;

use laser_loop::analyzer::Analyzer;
use laser_loop::config::RunConfiguration;
use laser_loop::controller::Controller;
use laser_loop::frame::Frame;
use laser_loop::hardware::{MockCamera, MockPropertyBus, PropertyBus};
use laser_loop::laser::LaserActuator;
use laser_loop::telemetry::{TelemetryEvent, TelemetrySink};
use laser_loop::RunCoordinator;

struct ConstantAnalyzer;

impl Analyzer for ConstantAnalyzer {
    fn process_image(&mut self, _frame: &Frame) -> anyhow::Result<()> {
        Ok(())
    }

    fn current_output(&self) -> f64 {
        1.0
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Alternates between two targets so every tick issues a command.
struct Alternating {
    high: bool,
}

impl Controller for Alternating {
    fn compute_power(&mut self, _analyzer_output: f64) -> f64 {
        self.high = !self.high;
        if self.high {
            40.0
        } else {
            10.0
        }
    }

    fn name(&self) -> &str {
        "alternating"
    }
}

#[tokio::test]
async fn test_slow_actuation_skips_ticks() {
    let bus = Arc::new(MockPropertyBus::new().with_latency(Duration::from_millis(120)));
    let device_bus: Arc<dyn PropertyBus> = bus.clone();
    let config = RunConfiguration {
        tick_interval_ms: 50,
        max_laser_power: 50.0,
        deadzone_fraction: 0.0,
        laser_is_virtual: false,
        ..RunConfiguration::default()
    };
    let laser = LaserActuator::new_device("Laser", "Power", 0.0, 50.0, 0.0, device_bus).unwrap();
    let camera = Arc::new(MockCamera::new(16, 16).with_frame_period(Duration::from_millis(10)));
    let (telemetry, mut rx) = TelemetrySink::channel(256);
    let mut coordinator = RunCoordinator::new(camera, telemetry);

    coordinator
        .start_run(
            config,
            Box::new(ConstantAnalyzer),
            Box::new(Alternating { high: false }),
            laser,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let report = coordinator.stop_run().await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let executed = events.iter().filter(|e| e.as_tick().is_some()).count() as u64;
    let skipped = events
        .iter()
        .filter(|e| matches!(e, TelemetryEvent::Skipped { .. }))
        .count() as u64;

    assert!(skipped > 0, "overrunning cycles must skip ticks");
    assert_eq!(executed, report.stats.ticks_executed);
    assert_eq!(skipped, report.stats.ticks_skipped);
    // 120 ms per cycle leaves room for at most one cycle per 120 ms
    assert!(executed <= 7, "{} cycles in 700 ms", executed);

    // Every tick index appears exactly once, in order
    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event.tick(), expected as u64);
    }

    // One command per executed cycle, never two in flight
    assert_eq!(bus.set_calls(), executed);
    assert_eq!(bus.peak_concurrent_sets(), 1);
    assert!(!report.actuation_abandoned);
}
