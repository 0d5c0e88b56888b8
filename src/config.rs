//! Configuration for the field node.
//!
//! The node reads one YAML document (`node.yaml`). Only `node_id` and
//! `timezone` are required; everything else has a default.

use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Main configuration for the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identifier, embedded in every row and file name
    pub node_id: String,

    /// IANA zone used for the local timestamp column and daily rollover
    pub timezone: String,

    /// Sampling period in seconds
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: f64,

    /// Per-read time budget in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Directory for the daily CSV files
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Directory for `emis.log`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub agreement: AgreementConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub sensors: SensorsConfig,
}

fn default_tick_seconds() -> f64 {
    1.0
}

fn default_read_timeout_ms() -> u64 {
    800
}

impl Config {
    /// Minimal configuration with defaults for everything optional.
    pub fn new(node_id: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timezone: timezone.into(),
            tick_seconds: default_tick_seconds(),
            read_timeout_ms: default_read_timeout_ms(),
            data_dir: None,
            log_dir: None,
            agreement: AgreementConfig::default(),
            writer: WriterConfig::default(),
            sensors: SensorsConfig::default(),
        }
    }

    /// Load and validate configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        for key in config.sensors.unknown.keys() {
            warn!(sensor = %key, "ignoring unknown sensor block");
        }
        Ok(config)
    }

    /// Get the default path of the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("emis-node")
            .join("node.yaml")
    }

    fn data_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("emis-node")
    }

    /// Directory holding the daily CSV files.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::data_root().join("daily"))
    }

    /// Directory holding the node log.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| Self::data_root().join("logs"))
    }

    /// Parsed time zone. Validation guarantees this succeeds for loaded configs.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {:?}", self.timezone)))
    }

    /// Sampling period. Validation guarantees `tick_seconds` fits a `Duration`.
    pub fn tick(&self) -> Duration {
        Duration::try_from_secs_f64(self.tick_seconds).unwrap_or(Duration::MAX)
    }

    /// Read budget, never longer than one tick.
    pub fn read_budget(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms).min(self.tick())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty()
            || !self
                .node_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "node_id {:?} must be non-empty and use only letters, digits, '-' or '_'",
                self.node_id
            )));
        }
        self.tz()?;
        if self.tick_seconds <= 0.0 || Duration::try_from_secs_f64(self.tick_seconds).is_err() {
            return Err(ConfigError::Invalid(format!(
                "tick_seconds must be a positive number, got {}",
                self.tick_seconds
            )));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be > 0".into()));
        }
        self.agreement.validate()?;
        self.writer.validate()?;
        Ok(())
    }
}

/// Thresholds for the paired particulate diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    /// Below this mean PM2.5 (µg/m³) disagreement is treated as noise
    pub low_pm_threshold: f64,
    /// Maximum relative percent difference still counted as agreement
    pub rpd_threshold_pct: f64,
    /// How much larger one baseline deviation must be to single out a sensor
    pub attribution_ratio: f64,
    /// Number of valid values kept per sensor baseline
    pub baseline_capacity: usize,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            low_pm_threshold: 1.0,
            rpd_threshold_pct: 25.0,
            attribution_ratio: 1.5,
            baseline_capacity: 30,
        }
    }
}

impl AgreementConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.low_pm_threshold.is_finite() || self.low_pm_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "agreement.low_pm_threshold must be >= 0".into(),
            ));
        }
        if !self.rpd_threshold_pct.is_finite() || self.rpd_threshold_pct <= 0.0 {
            return Err(ConfigError::Invalid(
                "agreement.rpd_threshold_pct must be > 0".into(),
            ));
        }
        if !self.attribution_ratio.is_finite() || self.attribution_ratio < 1.0 {
            return Err(ConfigError::Invalid(
                "agreement.attribution_ratio must be >= 1".into(),
            ));
        }
        if self.baseline_capacity == 0 {
            return Err(ConfigError::Invalid(
                "agreement.baseline_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Retry behaviour of the daily writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("writer.max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// One block per sensor channel; absent blocks mean disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorsConfig {
    #[serde(default)]
    pub bme: Option<ClimateConfig>,
    #[serde(default)]
    pub pms1: Option<ParticulateConfig>,
    #[serde(default)]
    pub pms2: Option<ParticulateConfig>,
    #[serde(default)]
    pub so2: Option<GasConfig>,
    /// Blocks for sensors this build does not know
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

/// Particulate sensor on a serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticulateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<PathBuf>,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

fn default_baudrate() -> u32 {
    9600
}

/// Climate sensor exposed through IIO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClimateConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    /// Explicit IIO device directory; discovered by `iio_name` when absent
    #[serde(default)]
    pub iio_device: Option<PathBuf>,
    #[serde(default = "default_iio_name")]
    pub iio_name: String,
}

fn default_iio_name() -> String {
    crate::sensors::climate::DEFAULT_IIO_NAME.to_string()
}

/// Gas sensor on I2C.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(
        default = "default_so2_address",
        deserialize_with = "deserialize_address"
    )]
    pub address: u8,
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_so2_address() -> u8 {
    crate::sensors::so2::DEFAULT_ADDRESS
}

/// Accept `0x74`, `116` or `"0x74"`; 7-bit addresses only.
fn deserialize_address<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u16),
        Text(String),
    }

    let address = match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Some(v),
        Raw::Text(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u16::from_str_radix(hex, 16).ok(),
                None => s.parse::<u16>().ok(),
            }
        }
    };
    address
        .filter(|a| *a <= 0x7F)
        .and_then(|a| u8::try_from(a).ok())
        .ok_or_else(|| serde::de::Error::custom("I2C address must be a 7-bit value such as 0x74"))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
node_id: EMIS-01
timezone: America/Toronto
tick_seconds: 2
read_timeout_ms: 500
agreement:
  rpd_threshold_pct: 30
sensors:
  bme:
    enabled: true
  pms1:
    enabled: true
    port: /dev/ttyAMA0
  pms2:
    enabled: false
    port: /dev/ttyUSB0
  so2:
    enabled: true
    address: "0x75"
  opc:
    enabled: true
"#;

    #[test]
    fn test_full_document() {
        let config = Config::from_yaml(FULL).unwrap();
        assert_eq!(config.node_id, "EMIS-01");
        assert_eq!(config.tz().unwrap(), chrono_tz::America::Toronto);
        assert_eq!(config.tick(), Duration::from_secs(2));
        assert_eq!(config.read_budget(), Duration::from_millis(500));
        assert_eq!(config.agreement.rpd_threshold_pct, 30.0);
        assert_eq!(config.agreement.baseline_capacity, 30);

        let sensors = &config.sensors;
        assert!(sensors.bme.as_ref().unwrap().enabled);
        assert_eq!(sensors.bme.as_ref().unwrap().iio_name, "bme680");
        assert_eq!(sensors.pms1.as_ref().unwrap().baudrate, 9600);
        assert!(!sensors.pms2.as_ref().unwrap().enabled);
        assert_eq!(sensors.so2.as_ref().unwrap().address, 0x75);
        assert!(sensors.unknown.contains_key("opc"));
    }

    #[test]
    fn test_minimal_document_defaults() {
        let config = Config::from_yaml("node_id: N1\ntimezone: UTC\n").unwrap();
        assert_eq!(config.tick(), Duration::from_secs(1));
        assert_eq!(config.read_budget(), Duration::from_millis(800));
        assert!(config.sensors.bme.is_none());
        assert!(config.sensors.so2.is_none());
        assert_eq!(config.writer, WriterConfig::default());
    }

    #[test]
    fn test_read_budget_clamped_to_tick() {
        let mut config = Config::new("N1", "UTC");
        config.tick_seconds = 0.5;
        config.read_timeout_ms = 2000;
        assert_eq!(config.read_budget(), Duration::from_millis(500));
    }

    #[test]
    fn test_numeric_address() {
        let doc = "node_id: N1\ntimezone: UTC\nsensors:\n  so2:\n    enabled: true\n    address: 117\n";
        let config = Config::from_yaml(doc).unwrap();
        assert_eq!(config.sensors.so2.unwrap().address, 117);
    }

    #[test]
    fn test_address_out_of_range() {
        let doc = "node_id: N1\ntimezone: UTC\nsensors:\n  so2:\n    address: \"0x80\"\n";
        assert!(matches!(Config::from_yaml(doc), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_required_keys() {
        assert!(matches!(
            Config::from_yaml("timezone: UTC\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_yaml("node_id: N1\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            "node_id: N1\ntimezone: Mars/Olympus\n",
            "node_id: N1\ntimezone: UTC\ntick_seconds: 0\n",
            "node_id: N1\ntimezone: UTC\ntick_seconds: -1\n",
            "node_id: N1\ntimezone: UTC\ntick_seconds: 1e300\n",
            "node_id: N1\ntimezone: UTC\ntick_seconds: .nan\n",
            "node_id: 'a/b'\ntimezone: UTC\n",
            "node_id: N1\ntimezone: UTC\nagreement:\n  baseline_capacity: 0\n",
            "node_id: N1\ntimezone: UTC\nagreement:\n  attribution_ratio: 0.5\n",
            "node_id: N1\ntimezone: UTC\nwriter:\n  max_attempts: 0\n",
        ];
        for doc in bad {
            assert!(
                matches!(Config::from_yaml(doc), Err(ConfigError::Invalid(_))),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let writer = WriterConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(writer.backoff(1), Duration::from_millis(100));
        assert_eq!(writer.backoff(2), Duration::from_millis(200));
        assert_eq!(writer.backoff(3), Duration::from_millis(350));
        assert_eq!(writer.backoff(40), Duration::from_millis(350));
        assert_eq!(writer.backoff(80), Duration::from_millis(350));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/node.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
