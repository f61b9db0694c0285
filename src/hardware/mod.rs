//! Hardware Collaborators
//!
//! Capability traits for the image source and the device property layer, plus
//! mock implementations used by tests and dry runs.

pub mod capabilities;
pub mod mock;

pub use capabilities::{ImageSource, PropertyBus};
pub use mock::{MockCamera, MockPropertyBus};
