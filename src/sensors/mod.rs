//! Sensor abstraction for the field node.
//!
//! Every driver implements [`Sensor`]. The scheduler never talks to drivers
//! directly: it goes through a [`Channel`], which turns disabled channels,
//! driver errors and blown time budgets into a [`Reading`] so one failing
//! sensor can never abort a tick.

pub mod bus;
pub mod climate;
pub mod pms;
pub mod so2;
pub mod types;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(not(target_os = "linux"))]
pub mod noop;

#[cfg(target_os = "linux")]
pub use linux::I2cBusDevice;

#[cfg(not(target_os = "linux"))]
pub use noop::I2cBusDevice;

pub use bus::{BusArbiter, SharedBus};
pub use types::{Climate, Gas, Particulate, PmsDetail, Reading, ReadingStatus, SensorError};

use crate::config::SensorsConfig;
use crate::core::scheduler::Clock;
use std::time::Duration;
use tracing::{info, warn};

/// Capability every sensor driver provides.
pub trait Sensor {
    type Output;

    /// Channel label used in logs.
    fn name(&self) -> &str;

    /// One-time setup. A failure disables the channel for the process lifetime.
    fn init(&mut self) -> Result<(), SensorError>;

    /// Take one measurement, giving up after roughly `budget`.
    ///
    /// Drivers check the budget between transfers; a single transfer is
    /// bounded by the transport's own timeout.
    fn read(&mut self, budget: Duration) -> Result<Self::Output, SensorError>;
}

/// A driver slot in the row: either a live driver or permanently disabled.
pub struct Channel<T> {
    label: &'static str,
    driver: Option<Box<dyn Sensor<Output = T>>>,
}

impl<T> Channel<T> {
    /// A channel that always yields `NODATA` without touching hardware.
    pub fn disabled(label: &'static str) -> Self {
        Self {
            label,
            driver: None,
        }
    }

    /// Initialise `driver`; on failure the channel is disabled and the reason logged.
    pub fn start(label: &'static str, mut driver: Box<dyn Sensor<Output = T>>) -> Self {
        match driver.init() {
            Ok(()) => {
                info!(channel = label, driver = driver.name(), "channel enabled");
                Self {
                    label,
                    driver: Some(driver),
                }
            }
            Err(e) => {
                warn!(channel = label, error = %e, "disabling channel after init failure");
                Self::disabled(label)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.driver.is_some()
    }

    /// Read the channel once under `budget`, measured on `clock`.
    pub fn sample<C: Clock + ?Sized>(&mut self, budget: Duration, clock: &C) -> Reading<T> {
        let Some(driver) = self.driver.as_mut() else {
            return Reading::NoData;
        };

        let started = clock.now();
        let result = driver.read(budget);
        let elapsed = clock.now().saturating_duration_since(started);

        let result = match result {
            Ok(_) if elapsed > budget => Err(SensorError::Timeout { budget }),
            other => other,
        };

        if let Err(e) = &result {
            match e {
                SensorError::Malformed { .. } => {
                    warn!(channel = self.label, error = %e, "malformed frame")
                }
                _ => warn!(channel = self.label, error = %e, "read failed"),
            }
        }
        result.into()
    }
}

/// The four channels of a node, in row order.
pub struct SensorSet {
    pub climate: Channel<Climate>,
    pub pms1: Channel<Particulate>,
    pub pms2: Channel<Particulate>,
    pub gas: Channel<Gas>,
}

/// Readings gathered in one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReadings {
    pub climate: Reading<Climate>,
    pub pms1: Reading<Particulate>,
    pub pms2: Reading<Particulate>,
    pub gas: Reading<Gas>,
}

impl SensorSet {
    pub fn all_disabled() -> Self {
        Self {
            climate: Channel::disabled("bme"),
            pms1: Channel::disabled("pms1"),
            pms2: Channel::disabled("pms2"),
            gas: Channel::disabled("so2"),
        }
    }

    /// Build and initialise drivers for every enabled channel in `config`.
    pub fn from_config(config: &SensorsConfig, arbiter: &BusArbiter) -> Self {
        let mut set = Self::all_disabled();

        if let Some(bme) = config.bme.as_ref().filter(|c| c.enabled) {
            let location = match &bme.iio_device {
                Some(path) => climate::IioLocation::Path(path.clone()),
                None => climate::IioLocation::Discover {
                    root: climate::IIO_ROOT.into(),
                    name: bme.iio_name.clone(),
                },
            };
            let driver = climate::ClimateSensor::new("bme68x", arbiter.bus(bme.i2c_bus), location);
            set.climate = Channel::start("bme", Box::new(driver));
        }

        set.pms1 = particulate_channel("pms1", config.pms1.as_ref());
        set.pms2 = particulate_channel("pms2", config.pms2.as_ref());

        if let Some(so2) = config.so2.as_ref().filter(|c| c.enabled) {
            let driver = so2::So2Sensor::on_bus("so2", &arbiter.bus(so2.i2c_bus), so2.address);
            set.gas = Channel::start("so2", Box::new(driver));
        }

        set
    }

    /// Read every channel once, sequentially in row order.
    ///
    /// The climate and gas channels share a bus and are never read concurrently.
    pub fn sample_all<C: Clock + ?Sized>(&mut self, budget: Duration, clock: &C) -> TickReadings {
        TickReadings {
            climate: self.climate.sample(budget, clock),
            pms1: self.pms1.sample(budget, clock),
            pms2: self.pms2.sample(budget, clock),
            gas: self.gas.sample(budget, clock),
        }
    }

    /// Whether both particulate channels are live, so pair diagnostics apply.
    pub fn pair_enabled(&self) -> bool {
        self.pms1.is_enabled() && self.pms2.is_enabled()
    }

    pub fn enabled_labels(&self) -> Vec<&'static str> {
        [
            (self.climate.label(), self.climate.is_enabled()),
            (self.pms1.label(), self.pms1.is_enabled()),
            (self.pms2.label(), self.pms2.is_enabled()),
            (self.gas.label(), self.gas.is_enabled()),
        ]
        .into_iter()
        .filter_map(|(label, on)| on.then_some(label))
        .collect()
    }
}

fn particulate_channel(
    label: &'static str,
    config: Option<&crate::config::ParticulateConfig>,
) -> Channel<Particulate> {
    let Some(cfg) = config.filter(|c| c.enabled) else {
        return Channel::disabled(label);
    };
    match &cfg.port {
        Some(port) => {
            let driver = pms::PmsSensor::serial(label, port.clone(), cfg.baudrate);
            Channel::start(label, Box::new(driver))
        }
        None => {
            warn!(channel = label, "enabled but no port provided; disabling");
            Channel::disabled(label)
        }
    }
}
