//! File-based sensor status: inspect the newest daily CSV without touching hardware.

use crate::core::agreement::{PairFlag, SuspectSensor};
use crate::storage::daily_writer::daily_file_name;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("no daily file for node {node_id} in {}", .dir.display())]
    NoFile { dir: PathBuf, node_id: String },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Columns a sensor needs, plus its status column.
struct SensorColumns {
    name: &'static str,
    values: &'static [&'static str],
    status: &'static str,
}

const SENSORS: [SensorColumns; 4] = [
    SensorColumns {
        name: "bme",
        values: &["temp_c", "rh_pct", "pressure_hpa"],
        status: "bme_status",
    },
    SensorColumns {
        name: "pms1",
        values: &["pm1_atm_pms1", "pm25_atm_pms1", "pm10_atm_pms1"],
        status: "pms1_status",
    },
    SensorColumns {
        name: "pms2",
        values: &["pm1_atm_pms2", "pm25_atm_pms2", "pm10_atm_pms2"],
        status: "pms2_status",
    },
    SensorColumns {
        name: "so2",
        values: &["so2_raw", "so2_byte0", "so2_byte1"],
        status: "so2_status",
    },
];

/// What the last row says about one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SensorState {
    /// The file has no columns for this sensor.
    NotIntegrated,
    Recording,
    Error(String),
    /// Status present but no values, or a no-frame status from older files.
    NotConnected,
    Disabled,
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorState::NotIntegrated => f.write_str("not integrated (missing columns)"),
            SensorState::Recording => f.write_str("connected and recording"),
            SensorState::Error(detail) => write!(f, "error ({detail})"),
            SensorState::NotConnected => f.write_str("not connected"),
            SensorState::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorReport {
    pub name: &'static str,
    pub state: SensorState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub path: PathBuf,
    pub rows: usize,
    pub last_timestamp: Option<String>,
    pub sensors: Vec<SensorReport>,
    pub pair_flag: Option<PairFlag>,
    pub suspect: Option<SuspectSensor>,
}

/// Today's file for `node_id` if it exists, else the most recently modified one.
pub fn find_daily_file(dir: &Path, node_id: &str, today: NaiveDate) -> Option<PathBuf> {
    let todays = dir.join(daily_file_name(node_id, today));
    if todays.is_file() {
        return Some(todays);
    }

    let prefix = format!("{node_id}_");
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".csv")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Locate and summarise the daily file for `node_id`.
pub fn node_status(dir: &Path, node_id: &str, today: NaiveDate) -> Result<StatusReport, StatusError> {
    let path = find_daily_file(dir, node_id, today).ok_or_else(|| StatusError::NoFile {
        dir: dir.to_path_buf(),
        node_id: node_id.to_string(),
    })?;
    read_status(&path)
}

/// Summarise the header and last non-empty row of `path`.
pub fn read_status(path: &Path) -> Result<StatusReport, StatusError> {
    let io_err = |source| StatusError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut header: Vec<String> = Vec::new();
    let mut last: Option<Vec<String>> = None;
    let mut rows = 0;
    for line in reader.lines() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        if header.is_empty() {
            header = split_csv_line(&line);
        } else {
            rows += 1;
            last = Some(split_csv_line(&line));
        }
    }

    let values: HashMap<&str, &str> = match &last {
        Some(row) => header
            .iter()
            .zip(row.iter())
            .map(|(k, v)| (k.as_str(), v.trim()))
            .collect(),
        None => HashMap::new(),
    };

    let sensors = SENSORS
        .iter()
        .map(|sensor| SensorReport {
            name: sensor.name,
            state: sensor_state(sensor, &header, &values, last.is_some()),
        })
        .collect();

    Ok(StatusReport {
        path: path.to_path_buf(),
        rows,
        last_timestamp: values.get("timestamp_utc").map(|s| s.to_string()),
        sensors,
        pair_flag: values.get("pm25_pair_flag").and_then(|s| s.parse().ok()),
        suspect: values.get("pm25_suspect_sensor").and_then(|s| s.parse().ok()),
    })
}

fn sensor_state(
    sensor: &SensorColumns,
    header: &[String],
    values: &HashMap<&str, &str>,
    has_rows: bool,
) -> SensorState {
    if sensor.values.iter().any(|c| !header.iter().any(|h| h == c)) {
        return SensorState::NotIntegrated;
    }
    if !has_rows {
        return SensorState::NotConnected;
    }

    let present = sensor
        .values
        .iter()
        .any(|c| values.get(c).is_some_and(|v| is_present(v)));
    let status = values.get(sensor.status).copied().unwrap_or("");

    match status {
        "OK" | "ok" if present => SensorState::Recording,
        "NODATA" => SensorState::Disabled,
        "ERROR" => {
            let detail = match sensor.name {
                "so2" => values.get("so2_error").copied().unwrap_or("ERROR"),
                _ => "ERROR",
            };
            SensorState::Error(detail.to_string())
        }
        s if s.starts_with("error") => SensorState::Error(s.to_string()),
        "no_frame" => SensorState::NotConnected,
        // Older files have no status column for some sensors.
        _ if present => SensorState::Recording,
        _ => SensorState::NotConnected,
    }
}

/// Zero counts as present; blanks and NaN-like tokens do not.
fn is_present(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && !matches!(v.to_ascii_lowercase().as_str(), "na" | "nan" | "none" | "null")
}

/// Split one CSV line, honouring double-quoted fields.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}
