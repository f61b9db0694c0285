//! Mock Hardware Implementations
//!
//! Provides simulated collaborators for tests and dry runs without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockCamera` - Synthetic spot images in all three imaging modes
//! - `MockPropertyBus` - In-memory device property layer with fault injection
//!
//! # Performance Characteristics
//!
//! - MockCamera: 20ms frame readout by default (50fps simulation)
//! - MockPropertyBus: no latency unless configured

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

use crate::frame::Frame;
use crate::hardware::capabilities::{ImageSource, PropertyBus};
use crate::limits::LIVE_VIEW_CAPACITY;

// =============================================================================
// MockPropertyBus - Simulated Device Property Layer
// =============================================================================

/// Mock device property layer
///
/// Simulates a device layer with:
/// - In-memory `(device, property)` values
/// - Call counting for set and get operations, with the peak number of
///   overlapping `set_property` calls
/// - Configurable round-trip latency
/// - Failure injection (next N calls, or until cleared)
/// - Optional readback quantization
///
/// # Example
///
/// ```rust,ignore
/// let bus = MockPropertyBus::new().with_quantization(0.5);
/// let confirmed = bus.set_property("Laser-405", "Power", 10.2).await?;
/// assert_eq!(confirmed, 10.0);
/// ```
pub struct MockPropertyBus {
    values: Mutex<HashMap<(String, String), f64>>,
    latency: Duration,
    quantization: Option<f64>,
    set_calls: AtomicU64,
    sets_in_flight: AtomicU64,
    peak_sets_in_flight: AtomicU64,
    get_calls: AtomicU64,
    fail_remaining: AtomicU32,
    failing: AtomicBool,
}

impl MockPropertyBus {
    /// Create an empty bus with no latency
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            quantization: None,
            set_calls: AtomicU64::new(0),
            sets_in_flight: AtomicU64::new(0),
            peak_sets_in_flight: AtomicU64::new(0),
            get_calls: AtomicU64::new(0),
            fail_remaining: AtomicU32::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Round every set value to a multiple of `step`
    pub fn with_quantization(mut self, step: f64) -> Self {
        self.quantization = (step > 0.0).then_some(step);
        self
    }

    /// Seed a property value
    pub fn with_value(self, device: &str, property: &str, value: f64) -> Self {
        self.values
            .lock()
            .insert((device.to_string(), property.to_string()), value);
        self
    }

    /// Fail the next `count` calls
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every call until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Current value without counting a call or waiting
    pub fn peek(&self, device: &str, property: &str) -> Option<f64> {
        self.values
            .lock()
            .get(&(device.to_string(), property.to_string()))
            .copied()
    }

    /// Number of `set_property` calls received
    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Most `set_property` calls ever in progress at the same time
    pub fn peak_concurrent_sets(&self) -> u64 {
        self.peak_sets_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `get_property` calls received
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    async fn round_trip(&self) -> Result<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("MockPropertyBus: device not responding");
        }
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("MockPropertyBus: injected failure");
        }
        Ok(())
    }
}

impl Default for MockPropertyBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PropertyBus for MockPropertyBus {
    async fn set_property(&self, device: &str, property: &str, value: f64) -> Result<f64> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.sets_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_sets_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let result = self.round_trip().await;
        self.sets_in_flight.fetch_sub(1, Ordering::SeqCst);
        result?;

        let applied = match self.quantization {
            Some(step) => (value / step).round() * step,
            None => value,
        };
        self.values
            .lock()
            .insert((device.to_string(), property.to_string()), applied);
        tracing::trace!(device, property, requested = value, applied, "MockPropertyBus: set");
        Ok(applied)
    }

    async fn get_property(&self, device: &str, property: &str) -> Result<f64> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;

        self.peek(device, property)
            .ok_or_else(|| anyhow::anyhow!("MockPropertyBus: unknown property {device}/{property}"))
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Couples the simulated spot density to a laser power property.
///
/// Spot count follows `base * exp(-power / decay)`, a crude photobleaching /
/// photoswitching model that gives the control loop something to regulate.
struct PowerCoupling {
    bus: Arc<MockPropertyBus>,
    device: String,
    property: String,
    decay: f64,
}

/// Shared frame synthesis state, used by `grab`, the live-view task and the
/// acquisition sequence task.
struct SpotGenerator {
    resolution: (u32, u32),
    pixel_size_um: f64,
    spot_count: usize,
    coupling: Option<PowerCoupling>,
    frame_count: AtomicU64,
    epoch: Instant,
}

impl SpotGenerator {
    const BACKGROUND: f64 = 100.0;
    const NOISE: f64 = 10.0;
    const AMPLITUDE: f64 = 1000.0;
    const SIGMA_PX: f64 = 1.2;

    fn current_spot_count(&self) -> usize {
        match &self.coupling {
            Some(c) => {
                let power = c.bus.peek(&c.device, &c.property).unwrap_or(0.0).max(0.0);
                (self.spot_count as f64 * (-power / c.decay).exp()).round() as usize
            }
            None => self.spot_count,
        }
    }

    fn generate(&self) -> Frame {
        let (width, height) = self.resolution;
        let mut rng = rand::thread_rng();
        let mut buffer: Vec<f64> = (0..width as usize * height as usize)
            .map(|_| Self::BACKGROUND + rng.gen_range(0.0..Self::NOISE))
            .collect();

        if width > 0 && height > 0 {
            let radius = (3.0 * Self::SIGMA_PX).ceil() as i64;
            for _ in 0..self.current_spot_count() {
                let cx = rng.gen_range(0..width) as i64;
                let cy = rng.gen_range(0..height) as i64;
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let (x, y) = (cx + dx, cy + dy);
                        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
                            continue;
                        }
                        let r2 = (dx * dx + dy * dy) as f64;
                        let idx = y as usize * width as usize + x as usize;
                        buffer[idx] +=
                            Self::AMPLITUDE * (-r2 / (2.0 * Self::SIGMA_PX * Self::SIGMA_PX)).exp();
                    }
                }
            }
        }

        let pixels = buffer
            .into_iter()
            .map(|v| v.clamp(0.0, u16::MAX as f64) as u16)
            .collect();
        let number = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;

        Frame::new(width, height, pixels)
            .with_pixel_size(self.pixel_size_um)
            .with_timestamp(self.epoch.elapsed().as_millis() as u64)
            .with_frame_number(number)
    }
}

/// Mock camera producing synthetic single-molecule images
///
/// Simulates a camera with:
/// - Configurable resolution, pixel size and frame period
/// - Gaussian spots on a noisy background
/// - On-demand grabs, a live-view broadcast stream and triggered sequences
/// - Optional coupling of spot density to a laser property on a `MockPropertyBus`
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new(128, 128).with_spot_count(30);
/// let frame = camera.grab().await?;
/// assert_eq!(frame.width, 128);
/// ```
pub struct MockCamera {
    name: String,
    generator: Arc<SpotGenerator>,
    frame_period: Duration,
    streaming: Arc<AtomicBool>,
    /// Broadcast channel for live-view streaming
    frame_tx: broadcast::Sender<Arc<Frame>>,
    /// Consumers waiting for the next triggered sequence
    pending_sequences: Mutex<Vec<mpsc::Sender<Arc<Frame>>>>,
}

impl MockCamera {
    /// Create new mock camera with specified resolution
    ///
    /// # Arguments
    /// * `width` - Frame width in pixels
    /// * `height` - Frame height in pixels
    pub fn new(width: u32, height: u32) -> Self {
        let (frame_tx, _) = broadcast::channel(LIVE_VIEW_CAPACITY);
        Self {
            name: "MockCamera".to_string(),
            generator: Arc::new(SpotGenerator {
                resolution: (width, height),
                pixel_size_um: 0.1,
                spot_count: 20,
                coupling: None,
                frame_count: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
            frame_period: Duration::from_millis(20),
            streaming: Arc::new(AtomicBool::new(false)),
            frame_tx,
            pending_sequences: Mutex::new(Vec::new()),
        }
    }

    /// Set the frame readout period
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    /// Set the physical pixel size in micrometers
    pub fn with_pixel_size(self, pixel_size_um: f64) -> Self {
        self.configure(|g| g.pixel_size_um = pixel_size_um)
    }

    /// Set the number of spots per frame (before power coupling)
    pub fn with_spot_count(self, spot_count: usize) -> Self {
        self.configure(|g| g.spot_count = spot_count)
    }

    /// Scale the spot count with a laser property on `bus`
    pub fn with_power_coupling(
        self,
        bus: Arc<MockPropertyBus>,
        device: &str,
        property: &str,
        decay: f64,
    ) -> Self {
        let coupling = PowerCoupling {
            bus,
            device: device.to_string(),
            property: property.to_string(),
            decay: decay.max(f64::EPSILON),
        };
        self.configure(|g| g.coupling = Some(coupling))
    }

    // Builders only take effect before the generator is shared with a task.
    fn configure(mut self, f: impl FnOnce(&mut SpotGenerator)) -> Self {
        match Arc::get_mut(&mut self.generator) {
            Some(generator) => f(generator),
            None => tracing::warn!(
                camera = %self.name,
                "MockCamera: configuration ignored while frames are being produced"
            ),
        }
        self
    }

    /// Frame resolution
    pub fn resolution(&self) -> (u32, u32) {
        self.generator.resolution
    }

    /// Total number of frames produced in any mode
    pub fn frame_count(&self) -> u64 {
        self.generator.frame_count.load(Ordering::SeqCst)
    }

    /// Check if the live-view stream is running
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Start the live-view stream
    pub fn start_stream(&self) -> Result<()> {
        if self.streaming.swap(true, Ordering::SeqCst) {
            anyhow::bail!("MockCamera: Already streaming");
        }
        tracing::debug!(camera = %self.name, "MockCamera: Stream started");

        let streaming = Arc::clone(&self.streaming);
        let generator = Arc::clone(&self.generator);
        let frame_tx = self.frame_tx.clone();
        let period = self.frame_period;

        tokio::spawn(async move {
            while streaming.load(Ordering::SeqCst) {
                let frame = Arc::new(generator.generate());
                // No receivers is fine for a live view
                let _ = frame_tx.send(frame);
                sleep(period).await;
            }
        });
        Ok(())
    }

    /// Stop the live-view stream (idempotent)
    pub fn stop_stream(&self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            tracing::debug!(camera = %self.name, "MockCamera: Stream stopped");
        }
    }

    /// Trigger one acquisition sequence of `frames` frames
    ///
    /// Every consumer currently waiting in `next_acquisition` receives the
    /// sequence. Returns the number of consumers served.
    pub fn trigger_acquisition(&self, frames: usize) -> usize {
        let consumers: Vec<_> = std::mem::take(&mut *self.pending_sequences.lock());
        let served = consumers.len();
        if served == 0 {
            tracing::debug!(camera = %self.name, "MockCamera: Trigger with no waiting consumer");
            return 0;
        }

        let generator = Arc::clone(&self.generator);
        let period = self.frame_period;
        tokio::spawn(async move {
            for _ in 0..frames {
                sleep(period).await;
                let frame = Arc::new(generator.generate());
                for tx in &consumers {
                    let _ = tx.send(Arc::clone(&frame)).await;
                }
            }
            // Dropping the senders closes the sequence
        });
        served
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(128, 128)
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        self.streaming.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageSource for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn grab(&self) -> Result<Arc<Frame>> {
        // Simulate exposure + readout
        sleep(self.frame_period).await;
        Ok(Arc::new(self.generator.generate()))
    }

    async fn subscribe_live(&self) -> Result<broadcast::Receiver<Arc<Frame>>> {
        Ok(self.frame_tx.subscribe())
    }

    async fn next_acquisition(&self) -> Result<mpsc::Receiver<Arc<Frame>>> {
        let (tx, rx) = mpsc::channel(LIVE_VIEW_CAPACITY);
        self.pending_sequences.lock().push(tx);
        Ok(rx)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
