//! BME68x climate sensor read through the Linux IIO sysfs interface.
//!
//! The kernel `bme680` driver does the compensation maths and exposes the
//! results as text attributes under `/sys/bus/iio/devices/iio:deviceN`.
//! Each attribute read blocks until the kernel finishes a conversion, bounded
//! by the driver's own timeout; the read budget is checked between them.

use crate::sensors::bus::SharedBus;
use crate::sensors::types::{Climate, SensorError};
use crate::sensors::Sensor;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const IIO_ROOT: &str = "/sys/bus/iio/devices";
pub const DEFAULT_IIO_NAME: &str = "bme680";

const TEMP: &str = "in_temp_input";
const HUMIDITY: &str = "in_humidityrelative_input";
const PRESSURE: &str = "in_pressure_input";
const RESISTANCE: &str = "in_resistance_input";

/// Find the IIO device directory whose `name` attribute equals `name`.
pub fn discover(root: &Path, name: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            fs::read_to_string(p.join("name"))
                .map(|n| n.trim() == name)
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Where to find the device directory.
#[derive(Debug, Clone)]
pub enum IioLocation {
    /// Fixed directory from configuration
    Path(PathBuf),
    /// Search `root` for a device with this `name` attribute
    Discover { root: PathBuf, name: String },
}

/// Climate channel.
pub struct ClimateSensor {
    name: String,
    bus: SharedBus,
    location: IioLocation,
    device_dir: Option<PathBuf>,
}

impl ClimateSensor {
    pub fn new(name: impl Into<String>, bus: SharedBus, location: IioLocation) -> Self {
        Self {
            name: name.into(),
            bus,
            location,
            device_dir: None,
        }
    }
}

fn read_attr(dir: &Path, attr: &str) -> Result<f64, SensorError> {
    let path = dir.join(attr);
    let text = fs::read_to_string(&path)
        .map_err(|e| SensorError::Transient(format!("{}: {e}", path.display())))?;
    let value: f64 = text.trim().parse().map_err(|_| {
        SensorError::Transient(format!("{}: unparsable value {:?}", path.display(), text.trim()))
    })?;
    if !value.is_finite() {
        return Err(SensorError::Transient(format!(
            "{}: non-finite value",
            path.display()
        )));
    }
    Ok(value)
}

impl Sensor for ClimateSensor {
    type Output = Climate;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), SensorError> {
        let dir = match &self.location {
            IioLocation::Path(path) => path.clone(),
            IioLocation::Discover { root, name } => discover(root, name).ok_or_else(|| {
                SensorError::Unavailable(format!(
                    "no IIO device named {name:?} under {}",
                    root.display()
                ))
            })?,
        };
        if !dir.join(TEMP).exists() {
            return Err(SensorError::Unavailable(format!(
                "{} has no {TEMP} attribute",
                dir.display()
            )));
        }
        self.device_dir = Some(dir);
        Ok(())
    }

    fn read(&mut self, budget: Duration) -> Result<Climate, SensorError> {
        let Some(dir) = self.device_dir.as_deref() else {
            return Err(SensorError::Transient("device not initialised".to_string()));
        };

        // Each attribute read triggers a forced-mode conversion on the bus.
        let _bus = self.bus.lock();
        let deadline = Instant::now() + budget;
        let mut values = [0.0; 4];
        for (value, attr) in values.iter_mut().zip([TEMP, HUMIDITY, PRESSURE, RESISTANCE]) {
            if Instant::now() >= deadline {
                return Err(SensorError::Timeout { budget });
            }
            *value = read_attr(dir, attr)?;
        }

        let [temp, humidity, pressure, resistance] = values;
        Ok(Climate {
            temp_c: temp / 1000.0,
            rh_pct: humidity / 1000.0,
            pressure_hpa: pressure * 10.0,
            voc_ohm: resistance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::bus::BusArbiter;

    fn fake_device(root: &Path, dir: &str, name: &str) -> PathBuf {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("name"), format!("{name}\n")).unwrap();
        fs::write(path.join(TEMP), "21450\n").unwrap();
        fs::write(path.join(HUMIDITY), "40123\n").unwrap();
        fs::write(path.join(PRESSURE), "101.325\n").unwrap();
        fs::write(path.join(RESISTANCE), "52000\n").unwrap();
        path
    }

    #[test]
    fn test_discover_by_name() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "iio:device0", "ads1015");
        let expected = fake_device(root.path(), "iio:device1", "bme680");

        assert_eq!(discover(root.path(), "bme680"), Some(expected));
        assert_eq!(discover(root.path(), "sht4x"), None);
    }

    #[test]
    fn test_read_scales_units() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "iio:device0", "bme680");
        let mut sensor =
            ClimateSensor::new("bme", BusArbiter::new().bus(1), IioLocation::Path(dir));
        sensor.init().unwrap();

        let c = sensor.read(Duration::from_millis(100)).unwrap();
        assert!((c.temp_c - 21.45).abs() < 1e-9);
        assert!((c.rh_pct - 40.123).abs() < 1e-9);
        assert!((c.pressure_hpa - 1013.25).abs() < 1e-9);
        assert_eq!(c.voc_ohm, 52000.0);
    }

    #[test]
    fn test_missing_attribute_fails_whole_reading() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "iio:device0", "bme680");
        fs::remove_file(dir.join(RESISTANCE)).unwrap();

        let mut sensor =
            ClimateSensor::new("bme", BusArbiter::new().bus(1), IioLocation::Path(dir));
        sensor.init().unwrap();
        let err = sensor.read(Duration::from_millis(100)).unwrap_err();
        assert_eq!(err.code(), "TRANSIENT");
    }

    #[test]
    fn test_init_without_device_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let mut sensor = ClimateSensor::new(
            "bme",
            BusArbiter::new().bus(1),
            IioLocation::Discover {
                root: root.path().to_path_buf(),
                name: DEFAULT_IIO_NAME.to_string(),
            },
        );
        let err = sensor.init().unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
        assert!(sensor.device_dir.is_none());
    }

    #[test]
    fn test_spent_budget_is_timeout() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "iio:device0", "bme680");
        let mut sensor =
            ClimateSensor::new("bme", BusArbiter::new().bus(1), IioLocation::Path(dir));
        sensor.init().unwrap();

        let err = sensor.read(Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[test]
    fn test_read_holds_the_bus() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "iio:device0", "bme680");
        let arbiter = BusArbiter::new();
        let mut sensor = ClimateSensor::new("bme", arbiter.bus(1), IioLocation::Path(dir));
        sensor.init().unwrap();

        // Another holder of bus 1 makes the climate read wait.
        let gas = arbiter.bus(1);
        let guard = gas.lock();
        let reader = std::thread::spawn(move || sensor.read(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());
        drop(guard);

        let c = reader.join().unwrap().unwrap();
        assert!((c.temp_c - 21.45).abs() < 1e-9);
    }
}
