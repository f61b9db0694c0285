//! Collaborator Capabilities
//!
//! The control core talks to the outside world through two narrow capability
//! traits. Everything device-specific (camera SDKs, device property layers,
//! live-view pipelines) lives behind them:
//!
//! - An image source implements: `ImageSource`
//! - A device property layer implements: `PropertyBus`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! struct FileSequence {
//!     frames: Mutex<VecDeque<Frame>>,
//! }
//!
//! #[async_trait]
//! impl ImageSource for FileSequence {
//!     fn name(&self) -> &str {
//!         "file-sequence"
//!     }
//!
//!     async fn grab(&self) -> Result<Arc<Frame>> {
//!         match self.frames.lock().pop_front() {
//!             Some(frame) => Ok(Arc::new(frame)),
//!             None => anyhow::bail!("sequence exhausted"),
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::frame::Frame;

/// Capability: Image Acquisition
///
/// Sources of microscope frames (cameras, acquisition engines, replayed files).
///
/// # Contract
/// - `grab` returns the next frame at the source's native rate. It may wait for
///   the exposure to finish.
/// - `subscribe_live` attaches to a live-view pipeline that pushes frames
///   independently of the consumer. A slow consumer sees `Lagged` errors
///   rather than slowing the pipeline down.
/// - `next_acquisition` waits for one externally triggered acquisition
///   sequence. The returned receiver yields the frames of that sequence and is
///   closed when the sequence ends.
/// - Sources that do not support a mode keep the default implementation, which
///   returns an error.
///
/// # Thread Safety
/// - All methods take `&self`; use interior mutability for state
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Human-readable source identifier used in logs
    fn name(&self) -> &str;

    /// Pull the next frame on demand
    ///
    /// # Returns
    /// - Ok(frame) once a frame is read out
    /// - Err on readout failure (the caller may retry)
    async fn grab(&self) -> Result<Arc<Frame>>;

    /// Subscribe to frames pushed by a live-view pipeline
    async fn subscribe_live(&self) -> Result<broadcast::Receiver<Arc<Frame>>> {
        anyhow::bail!("{} has no live-view pipeline", self.name())
    }

    /// Wait for the next externally triggered acquisition sequence
    ///
    /// Resolves immediately with a receiver; frames arrive once the sequence is
    /// triggered. The channel closes after the last frame.
    async fn next_acquisition(&self) -> Result<mpsc::Receiver<Arc<Frame>>> {
        anyhow::bail!("{} does not support triggered acquisitions", self.name())
    }
}

/// Capability: Device Property Access
///
/// The hardware device layer, addressed by `(device, property)` pairs with
/// numeric values.
///
/// # Contract
/// - `set_property` returns the value the device actually applied, which may
///   differ from the request (quantization, firmware limits).
/// - `get_property` reads the current value without changing it.
/// - Both calls may block for the duration of a device round trip.
#[async_trait]
pub trait PropertyBus: Send + Sync {
    /// Set a numeric property and return the confirmed value
    ///
    /// # Arguments
    /// * `device` - Device identifier
    /// * `property` - Property identifier on that device
    /// * `value` - Requested value in property units
    async fn set_property(&self, device: &str, property: &str, value: f64) -> Result<f64>;

    /// Read a numeric property
    async fn get_property(&self, device: &str, property: &str) -> Result<f64>;
}
