//! Reading types produced by the sensor channels.
//!
//! A reading is either fully populated ([`Reading::Valid`]) or carries no
//! payload at all. Partially valid readings cannot be represented.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Per-channel status column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingStatus {
    Ok,
    NoData,
    Error,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Ok => "OK",
            ReadingStatus::NoData => "NODATA",
            ReadingStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a sensor driver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorError {
    /// Bus or device hiccup; the next tick may succeed.
    #[error("transient read failure: {0}")]
    Transient(String),

    /// The device answered but no complete frame arrived in time.
    #[error("no frame received")]
    NoFrame,

    /// A wire frame arrived but failed structural validation.
    #[error("malformed frame: {detail} [{}]", hex(.frame))]
    Malformed { detail: String, frame: Vec<u8> },

    /// The read exceeded its time budget.
    #[error("read exceeded {}ms budget", .budget.as_millis())]
    Timeout { budget: Duration },

    /// The device could not be opened or configured.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

impl SensorError {
    /// Short token used in error columns.
    pub fn code(&self) -> &'static str {
        match self {
            SensorError::Transient(_) => "TRANSIENT",
            SensorError::NoFrame => "NO_FRAME",
            SensorError::Malformed { .. } => "MALFORMED",
            SensorError::Timeout { .. } => "TIMEOUT",
            SensorError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    pub fn malformed(detail: impl Into<String>, frame: &[u8]) -> Self {
        SensorError::Malformed {
            detail: detail.into(),
            frame: frame.to_vec(),
        }
    }
}

impl From<std::io::Error> for SensorError {
    fn from(e: std::io::Error) -> Self {
        SensorError::Transient(e.to_string())
    }
}

/// Render bytes as space separated hex for frame-level diagnostics.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One channel's outcome for one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<T> {
    /// Fully populated measurement.
    Valid(T),
    /// Channel disabled or never initialised.
    NoData,
    /// The read failed this tick.
    Failed(SensorError),
}

impl<T> Reading<T> {
    pub fn status(&self) -> ReadingStatus {
        match self {
            Reading::Valid(_) => ReadingStatus::Ok,
            Reading::NoData => ReadingStatus::NoData,
            Reading::Failed(_) => ReadingStatus::Error,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Reading::Valid(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SensorError> {
        match self {
            Reading::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl<T> From<Result<T, SensorError>> for Reading<T> {
    fn from(result: Result<T, SensorError>) -> Self {
        match result {
            Ok(v) => Reading::Valid(v),
            Err(e) => Reading::Failed(e),
        }
    }
}

/// Extra fields reported by PMS5003-style sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmsDetail {
    /// CF=1 (factory calibration) mass concentrations: pm1, pm2.5, pm10
    pub cf1: [u16; 3],
    /// Particle counts per 0.1 L above 0.3, 0.5, 1.0, 2.5, 5.0 and 10 µm
    pub counts: [u16; 6],
}

/// Particulate mass concentrations in µg/m³ (atmospheric environment).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particulate {
    pub pm1: f64,
    pub pm25: f64,
    pub pm10: f64,
    /// Present only for drivers that expose the full frame
    pub detail: Option<PmsDetail>,
}

impl Particulate {
    pub fn new(pm1: f64, pm25: f64, pm10: f64) -> Self {
        Self {
            pm1,
            pm25,
            pm10,
            detail: None,
        }
    }
}

/// Temperature / humidity / pressure / gas-resistance measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Climate {
    pub temp_c: f64,
    pub rh_pct: f64,
    pub pressure_hpa: f64,
    pub voc_ohm: f64,
}

/// Electrochemical gas measurement decoded from a byte frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gas {
    pub ppm: f64,
    pub raw: u16,
    pub byte0: u8,
    pub byte1: u8,
}
