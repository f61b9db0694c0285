//! Laser Actuator
//!
//! Wraps one numeric laser property (typically output power) and makes every
//! command safe to issue:
//!
//! 1. Requests are clamped to `[min_power, max_power]`. NaN requests carry no
//!    information and leave the laser untouched.
//! 2. Changes smaller than `deadzone_fraction × max_power` are suppressed so
//!    analyzer noise does not turn into laser jitter. An exact repeat is never
//!    re-issued. When the whole `[min_power, max_power]` range is narrower than
//!    the deadzone, a request that lands on a bound passes anyway so the bounds
//!    stay reachable.
//! 3. The value confirmed by the device becomes the new applied power. A
//!    confirmation outside the bounds is logged and clamped.
//!
//! A virtual actuator runs the same logic without touching hardware, which is
//! how dry runs and tests exercise the loop.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut factory = LaserFactory::new();
//! factory.select_device("Laser-405").select_property("Power").set_max_power(50.0);
//! let mut laser = factory.build(0.1)?;
//! assert_eq!(laser.apply(80.0).await?, 50.0);
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RunConfiguration;
use crate::error::LoopError;
use crate::hardware::PropertyBus;

/// Where power commands go.
#[derive(Clone)]
pub enum LaserBackend {
    /// Simulated: commands are logged, never sent
    Virtual,

    /// Real device behind the property layer
    Device(Arc<dyn PropertyBus>),
}

impl std::fmt::Debug for LaserBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Virtual => f.write_str("Virtual"),
            Self::Device(_) => f.write_str("Device"),
        }
    }
}

/// Device property the actuator drives, as configured in `[laser]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserTarget {
    /// Device identifier in the property layer
    pub device: String,
    /// Property identifier on that device
    pub property: String,
    /// Lowest power the actuator may command
    pub min_power: f64,
}

impl Default for LaserTarget {
    fn default() -> Self {
        Self {
            device: "Laser".to_string(),
            property: "Power".to_string(),
            min_power: 0.0,
        }
    }
}

// =============================================================================
// LaserActuator
// =============================================================================

/// Bounds-respecting, damped laser power actuator.
///
/// Owned by the control worker for the duration of a run; no internal locking.
#[derive(Debug)]
pub struct LaserActuator {
    device: String,
    property: String,
    min_power: f64,
    max_power: f64,
    deadzone_fraction: f64,
    last_applied: f64,
    commands_issued: u64,
    backend: LaserBackend,
}

impl LaserActuator {
    /// Create a simulated actuator.
    pub fn new_virtual(
        device: impl Into<String>,
        property: impl Into<String>,
        min_power: f64,
        max_power: f64,
        deadzone_fraction: f64,
    ) -> Result<Self, LoopError> {
        Self::new(
            device.into(),
            property.into(),
            min_power,
            max_power,
            deadzone_fraction,
            LaserBackend::Virtual,
        )
    }

    /// Create an actuator that commands a real device through `bus`.
    pub fn new_device(
        device: impl Into<String>,
        property: impl Into<String>,
        min_power: f64,
        max_power: f64,
        deadzone_fraction: f64,
        bus: Arc<dyn PropertyBus>,
    ) -> Result<Self, LoopError> {
        Self::new(
            device.into(),
            property.into(),
            min_power,
            max_power,
            deadzone_fraction,
            LaserBackend::Device(bus),
        )
    }

    fn new(
        device: String,
        property: String,
        min_power: f64,
        max_power: f64,
        deadzone_fraction: f64,
        backend: LaserBackend,
    ) -> Result<Self, LoopError> {
        if device.is_empty() || property.is_empty() {
            return Err(LoopError::Configuration(
                "laser device and property must be selected".into(),
            ));
        }
        if !min_power.is_finite() || !max_power.is_finite() || min_power < 0.0 {
            return Err(LoopError::Configuration(format!(
                "laser power bounds must be finite and non-negative, got [{}, {}]",
                min_power, max_power
            )));
        }
        if min_power >= max_power {
            return Err(LoopError::Configuration(format!(
                "laser min power {} must be below max power {}",
                min_power, max_power
            )));
        }
        if !(0.0..=crate::limits::MAX_DEADZONE_FRACTION).contains(&deadzone_fraction) {
            return Err(LoopError::Configuration(format!(
                "deadzone fraction must be in [0, {}], got {}",
                crate::limits::MAX_DEADZONE_FRACTION,
                deadzone_fraction
            )));
        }

        Ok(Self {
            device,
            property,
            min_power,
            max_power,
            deadzone_fraction,
            last_applied: min_power,
            commands_issued: 0,
            backend,
        })
    }

    /// Request a new power and return the power actually applied.
    ///
    /// On a device error the applied power is unchanged.
    pub async fn apply(&mut self, requested: f64) -> Result<f64, LoopError> {
        if requested.is_nan() {
            return Ok(self.last_applied);
        }

        let clamped = requested.clamp(self.min_power, self.max_power);
        if clamped == self.last_applied {
            return Ok(self.last_applied);
        }

        // A bound only skips the deadzone when the whole range is narrower than it
        let at_bound = clamped == self.min_power || clamped == self.max_power;
        let range_within_deadzone =
            (self.max_power - self.min_power) / self.max_power < self.deadzone_fraction;
        let relative_change = (clamped - self.last_applied).abs() / self.max_power;
        if !(at_bound && range_within_deadzone) && relative_change < self.deadzone_fraction {
            return Ok(self.last_applied);
        }

        let confirmed = match &self.backend {
            LaserBackend::Virtual => {
                tracing::debug!(device = %self.device_name(), power = clamped, "Virtual: setting power");
                clamped
            }
            LaserBackend::Device(bus) => {
                let readback = bus
                    .set_property(&self.device, &self.property, clamped)
                    .await
                    .map_err(|e| self.actuation_error(e.to_string()))?;
                self.accept_readback(readback)?
            }
        };

        self.last_applied = confirmed;
        self.commands_issued += 1;
        Ok(confirmed)
    }

    /// Read the current power from the device.
    ///
    /// A virtual actuator returns the cached value. A device readback updates
    /// the cache.
    pub async fn laser_power(&mut self) -> Result<f64, LoopError> {
        if let LaserBackend::Device(bus) = &self.backend {
            let readback = bus
                .get_property(&self.device, &self.property)
                .await
                .map_err(|e| self.actuation_error(e.to_string()))?;
            self.last_applied = self.accept_readback(readback)?;
        }
        Ok(self.last_applied)
    }

    fn accept_readback(&self, readback: f64) -> Result<f64, LoopError> {
        if !readback.is_finite() {
            return Err(self.actuation_error(format!("device confirmed non-finite power {}", readback)));
        }
        let clamped = readback.clamp(self.min_power, self.max_power);
        if clamped != readback {
            tracing::warn!(
                device = %self.device,
                property = %self.property,
                readback,
                min = self.min_power,
                max = self.max_power,
                "Laser readback outside bounds, clamping"
            );
        }
        Ok(clamped)
    }

    fn actuation_error(&self, message: String) -> LoopError {
        LoopError::Actuation {
            device: self.device.clone(),
            property: self.property.clone(),
            message,
        }
    }

    /// Last applied power, without I/O.
    pub fn laser_power_cached(&self) -> f64 {
        self.last_applied
    }

    /// Lowest power the actuator commands.
    pub fn min_power(&self) -> f64 {
        self.min_power
    }

    /// Highest power the actuator commands.
    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    /// Fraction of `max_power` below which changes are suppressed.
    pub fn deadzone_fraction(&self) -> f64 {
        self.deadzone_fraction
    }

    /// Device identity; virtual devices carry a `V:` prefix.
    pub fn device_name(&self) -> String {
        match self.backend {
            LaserBackend::Virtual => format!("V:{}", self.device),
            LaserBackend::Device(_) => self.device.clone(),
        }
    }

    /// Property identity.
    pub fn property_name(&self) -> &str {
        &self.property
    }

    /// True when commands are simulated.
    pub fn is_virtual(&self) -> bool {
        matches!(self.backend, LaserBackend::Virtual)
    }

    /// Number of commands that passed clamp and deadzone and were issued.
    pub fn commands_issued(&self) -> u64 {
        self.commands_issued
    }
}

// =============================================================================
// LaserFactory
// =============================================================================

/// Stepwise construction of a [`LaserActuator`], mirroring how an operator
/// picks a device, then a property, then the power limit.
///
/// Starts out virtual.
#[derive(Debug, Clone)]
pub struct LaserFactory {
    device: Option<String>,
    property: Option<String>,
    is_virtual: bool,
    min_power: f64,
    max_power: f64,
    bus: Option<LaserBackend>,
}

impl LaserFactory {
    /// Create a factory with nothing selected.
    pub fn new() -> Self {
        Self {
            device: None,
            property: None,
            is_virtual: true,
            min_power: 0.0,
            max_power: 0.0,
            bus: None,
        }
    }

    /// Property layer used for non-virtual lasers.
    pub fn with_bus(mut self, bus: Arc<dyn PropertyBus>) -> Self {
        self.bus = Some(LaserBackend::Device(bus));
        self
    }

    /// Select the laser device.
    pub fn select_device(&mut self, device: &str) -> &mut Self {
        self.device = Some(device.to_string());
        self
    }

    /// Select the property of the selected device.
    pub fn select_property(&mut self, property: &str) -> &mut Self {
        self.property = Some(property.to_string());
        self
    }

    /// Simulate the laser instead of driving hardware.
    pub fn set_virtual(&mut self, is_virtual: bool) -> &mut Self {
        self.is_virtual = is_virtual;
        self
    }

    /// Lower power bound (defaults to 0).
    pub fn set_min_power(&mut self, min_power: f64) -> &mut Self {
        self.min_power = min_power;
        self
    }

    /// Upper power bound.
    pub fn set_max_power(&mut self, max_power: f64) -> &mut Self {
        self.max_power = max_power;
        self
    }

    /// Build an actuator from the current selection.
    pub fn build(&self, deadzone_fraction: f64) -> Result<LaserActuator, LoopError> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| LoopError::Configuration("no laser device selected".into()))?;
        let property = self
            .property
            .clone()
            .ok_or_else(|| LoopError::Configuration("no laser property selected".into()))?;

        let backend = if self.is_virtual {
            LaserBackend::Virtual
        } else {
            self.bus.clone().ok_or_else(|| {
                LoopError::Configuration(format!(
                    "laser {} is not virtual but no device layer is available",
                    device
                ))
            })?
        };

        LaserActuator::new(
            device,
            property,
            self.min_power,
            self.max_power,
            deadzone_fraction,
            backend,
        )
    }

    /// Build the actuator a run with `config` expects.
    pub fn for_run(
        config: &RunConfiguration,
        target: &LaserTarget,
        bus: Option<Arc<dyn PropertyBus>>,
    ) -> Result<LaserActuator, LoopError> {
        let mut factory = LaserFactory::new();
        if let Some(bus) = bus {
            factory = factory.with_bus(bus);
        }
        factory
            .select_device(&target.device)
            .select_property(&target.property)
            .set_virtual(config.laser_is_virtual)
            .set_min_power(target.min_power)
            .set_max_power(config.max_laser_power);
        factory.build(config.deadzone_fraction)
    }
}

impl Default for LaserFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockPropertyBus;

    fn virtual_laser(deadzone: f64) -> LaserActuator {
        LaserActuator::new_virtual("Laser", "Power", 0.0, 50.0, deadzone).unwrap()
    }

    fn device_laser(bus: &Arc<MockPropertyBus>, deadzone: f64) -> LaserActuator {
        let bus: Arc<dyn PropertyBus> = bus.clone();
        LaserActuator::new_device("Laser", "Power", 0.0, 50.0, deadzone, bus).unwrap()
    }

    #[tokio::test]
    async fn test_apply_always_within_bounds() {
        let mut laser = virtual_laser(0.0);
        for requested in [-1e9, -10.0, 0.0, 12.5, 49.99, 50.0, 73.0, f64::INFINITY] {
            let applied = laser.apply(requested).await.unwrap();
            assert!((0.0..=50.0).contains(&applied), "{} -> {}", requested, applied);
        }
        assert_eq!(laser.apply(f64::NEG_INFINITY).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_bounds_round_trip() {
        let mut laser = virtual_laser(0.1);
        assert_eq!(laser.apply(-10.0).await.unwrap(), 0.0);
        assert_eq!(laser.apply(60.0).await.unwrap(), 50.0);
        assert_eq!(laser.apply(-10.0).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_deadzone_suppresses_jitter() {
        let mut laser = virtual_laser(0.1);
        assert_eq!(laser.apply(20.0).await.unwrap(), 20.0);

        // 0.1 × 50 = 5 power units of deadzone
        for jitter in [20.5, 19.2, 24.9, 15.1, 20.0] {
            assert_eq!(laser.apply(jitter).await.unwrap(), 20.0);
        }
        assert_eq!(laser.commands_issued(), 1);

        assert_eq!(laser.apply(25.0).await.unwrap(), 25.0);
        assert_eq!(laser.commands_issued(), 2);
    }

    #[tokio::test]
    async fn test_full_range_moves_pass_deadzone() {
        let mut laser = virtual_laser(0.5);
        assert_eq!(laser.apply(3.0).await.unwrap(), 0.0);
        assert_eq!(laser.apply(200.0).await.unwrap(), 50.0);
        assert_eq!(laser.apply(48.0).await.unwrap(), 50.0);
        assert_eq!(laser.apply(0.0).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_jitter_at_upper_bound_is_suppressed() {
        let mut laser = virtual_laser(0.1);
        assert_eq!(laser.apply(46.0).await.unwrap(), 46.0);

        // Steps of 2 stay under the 5-unit deadzone, even when landing on max
        for jitter in [48.0, 50.0, 48.0, 50.0, 75.0] {
            assert_eq!(laser.apply(jitter).await.unwrap(), 46.0);
        }
        assert_eq!(laser.commands_issued(), 1);
        assert_eq!(laser.laser_power_cached(), 46.0);
    }

    #[tokio::test]
    async fn test_jitter_at_lower_bound_is_suppressed() {
        let mut laser = virtual_laser(0.1);
        assert_eq!(laser.apply(3.0).await.unwrap(), 0.0);
        assert_eq!(laser.apply(10.0).await.unwrap(), 10.0);
        assert_eq!(laser.apply(4.0).await.unwrap(), 4.0);
        assert_eq!(laser.apply(-3.0).await.unwrap(), 4.0);
        assert_eq!(laser.apply(0.0).await.unwrap(), 4.0);
        assert_eq!(laser.commands_issued(), 2);
    }

    #[tokio::test]
    async fn test_narrow_range_bounds_stay_reachable() {
        // Range of 10 on a max of 50 is 20%, below the 30% deadzone
        let mut laser = LaserActuator::new_virtual("Laser", "Power", 40.0, 50.0, 0.3).unwrap();
        assert_eq!(laser.laser_power_cached(), 40.0);
        assert_eq!(laser.apply(47.0).await.unwrap(), 40.0);
        assert_eq!(laser.apply(90.0).await.unwrap(), 50.0);
        assert_eq!(laser.apply(44.0).await.unwrap(), 50.0);
        assert_eq!(laser.apply(0.0).await.unwrap(), 40.0);
        assert_eq!(laser.commands_issued(), 2);
    }

    #[tokio::test]
    async fn test_nan_holds() {
        let mut laser = virtual_laser(0.0);
        laser.apply(10.0).await.unwrap();
        assert_eq!(laser.apply(f64::NAN).await.unwrap(), 10.0);
        assert_eq!(laser.commands_issued(), 1);
    }

    #[tokio::test]
    async fn test_virtual_never_touches_bus() {
        let bus = Arc::new(MockPropertyBus::new());
        let mut factory = LaserFactory::new().with_bus(bus.clone());
        factory
            .select_device("Laser")
            .select_property("Power")
            .set_max_power(50.0);
        let mut laser = factory.build(0.0).unwrap();

        let applied = laser.apply(30.0).await.unwrap();
        assert_eq!(laser.laser_power_cached(), applied);
        assert_eq!(laser.laser_power().await.unwrap(), 30.0);
        assert_eq!(bus.set_calls(), 0);
        assert_eq!(bus.get_calls(), 0);
        assert_eq!(laser.device_name(), "V:Laser");
    }

    #[tokio::test]
    async fn test_device_exact_repeat_not_reissued() {
        let bus = Arc::new(MockPropertyBus::new());
        let mut laser = device_laser(&bus, 0.0);

        laser.apply(12.0).await.unwrap();
        laser.apply(12.0).await.unwrap();
        laser.apply(12.0).await.unwrap();
        assert_eq!(bus.set_calls(), 1);
        assert_eq!(bus.peek("Laser", "Power"), Some(12.0));
        assert_eq!(laser.device_name(), "Laser");
    }

    #[tokio::test]
    async fn test_device_readback_wins() {
        let bus = Arc::new(MockPropertyBus::new().with_quantization(5.0));
        let mut laser = device_laser(&bus, 0.0);

        assert_eq!(laser.apply(12.0).await.unwrap(), 10.0);
        assert_eq!(laser.laser_power_cached(), 10.0);
    }

    #[tokio::test]
    async fn test_device_readback_clamped() {
        let bus = Arc::new(MockPropertyBus::new().with_quantization(30.0));
        let mut laser = device_laser(&bus, 0.0);

        // 49 rounds up to 60 on the device
        assert_eq!(laser.apply(49.0).await.unwrap(), 50.0);
        assert_eq!(laser.laser_power_cached(), 50.0);
    }

    #[tokio::test]
    async fn test_device_failure_keeps_previous_power() {
        let bus = Arc::new(MockPropertyBus::new());
        let mut laser = device_laser(&bus, 0.0);
        laser.apply(10.0).await.unwrap();

        bus.fail_next(1);
        let err = laser.apply(20.0).await.unwrap_err();
        assert!(matches!(err, LoopError::Actuation { .. }));
        assert_eq!(laser.laser_power_cached(), 10.0);

        assert_eq!(laser.apply(20.0).await.unwrap(), 20.0);
    }

    #[tokio::test]
    async fn test_laser_power_reads_device() {
        let bus = Arc::new(MockPropertyBus::new().with_value("Laser", "Power", 7.5));
        let mut laser = device_laser(&bus, 0.0);
        assert_eq!(laser.laser_power_cached(), 0.0);
        assert_eq!(laser.laser_power().await.unwrap(), 7.5);
        assert_eq!(laser.laser_power_cached(), 7.5);
    }

    #[test]
    fn test_construction_validation() {
        assert!(LaserActuator::new_virtual("Laser", "Power", 0.0, 0.0, 0.1).is_err());
        assert!(LaserActuator::new_virtual("Laser", "Power", 10.0, 5.0, 0.1).is_err());
        assert!(LaserActuator::new_virtual("Laser", "Power", 0.0, 5.0, 0.6).is_err());
        assert!(LaserActuator::new_virtual("", "Power", 0.0, 5.0, 0.1).is_err());

        let laser = LaserActuator::new_virtual("Laser", "Power", 1.0, 5.0, 0.1).unwrap();
        assert_eq!(laser.laser_power_cached(), 1.0);
    }

    #[test]
    fn test_factory_requires_selection_and_bus() {
        let mut factory = LaserFactory::new();
        factory.set_max_power(10.0);
        assert!(factory.build(0.1).is_err());

        factory.select_device("Laser").select_property("Power");
        assert!(factory.build(0.1).unwrap().is_virtual());

        factory.set_virtual(false);
        assert!(matches!(factory.build(0.1), Err(LoopError::Configuration(_))));
    }

    #[test]
    fn test_factory_for_run() {
        let config = RunConfiguration {
            max_laser_power: 40.0,
            deadzone_fraction: 0.2,
            ..RunConfiguration::default()
        };
        let laser = LaserFactory::for_run(&config, &LaserTarget::default(), None).unwrap();
        assert_eq!(laser.max_power(), 40.0);
        assert_eq!(laser.deadzone_fraction(), 0.2);
        assert!(laser.is_virtual());
    }
}
