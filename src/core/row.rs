//! The output row and its fixed column layout.

use crate::core::agreement::AgreementResult;
use crate::sensors::{Climate, Gas, Particulate, Reading, TickReadings};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;

/// Column names in file order. Never reordered or narrowed; new columns go at the end.
pub const COLUMNS: [&str; 44] = [
    "timestamp_utc",
    "timestamp_local",
    "node_id",
    "temp_c",
    "rh_pct",
    "pressure_hpa",
    "voc_ohm",
    "bme_status",
    "pm1_cf1_pms1",
    "pm25_cf1_pms1",
    "pm10_cf1_pms1",
    "pm1_atm_pms1",
    "pm25_atm_pms1",
    "pm10_atm_pms1",
    "n_0_3_pms1",
    "n_0_5_pms1",
    "n_1_0_pms1",
    "n_2_5_pms1",
    "n_5_0_pms1",
    "n_10_pms1",
    "pms1_status",
    "pm1_cf1_pms2",
    "pm25_cf1_pms2",
    "pm10_cf1_pms2",
    "pm1_atm_pms2",
    "pm25_atm_pms2",
    "pm10_atm_pms2",
    "n_0_3_pms2",
    "n_0_5_pms2",
    "n_1_0_pms2",
    "n_2_5_pms2",
    "n_5_0_pms2",
    "n_10_pms2",
    "pms2_status",
    "pm25_pms_mean",
    "pm25_pms_rpd",
    "pm25_pair_flag",
    "pm25_suspect_sensor",
    "so2_ppm",
    "so2_raw",
    "so2_byte0",
    "so2_byte1",
    "so2_error",
    "so2_status",
];

/// Token for an absent categorical value.
pub const NODATA: &str = "NODATA";

/// Header line, newline terminated.
pub fn header_line() -> String {
    let mut line = COLUMNS.join(",");
    line.push('\n');
    line
}

/// One tick's worth of output.
#[derive(Debug, Clone)]
pub struct Row {
    pub timestamp_utc: DateTime<Utc>,
    pub timestamp_local: DateTime<Tz>,
    pub node_id: String,
    pub readings: TickReadings,
    pub agreement: AgreementResult,
}

impl Row {
    /// Calendar date in the node's zone; selects the daily file.
    pub fn local_date(&self) -> NaiveDate {
        self.timestamp_local.date_naive()
    }

    /// Rendered field values, one per entry of [`COLUMNS`].
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(COLUMNS.len());
        out.push(
            self.timestamp_utc
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        out.push(
            self.timestamp_local
                .to_rfc3339_opts(SecondsFormat::Millis, false),
        );
        out.push(self.node_id.clone());

        push_climate(&mut out, &self.readings.climate);
        push_particulate(&mut out, &self.readings.pms1);
        push_particulate(&mut out, &self.readings.pms2);

        out.push(num(self.agreement.mean()));
        out.push(num(self.agreement.rpd()));
        out.push(self.agreement.pair_flag().to_string());
        out.push(self.agreement.suspect().to_string());

        push_gas(&mut out, &self.readings.gas);
        out
    }

    /// The row as one CSV line, newline terminated.
    pub fn to_csv_line(&self) -> String {
        let mut line = self
            .fields()
            .iter()
            .map(|f| csv_field(f))
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        line
    }
}

fn num(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn int<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn push_climate(out: &mut Vec<String>, reading: &Reading<Climate>) {
    let c = reading.value();
    out.push(num(c.map(|c| c.temp_c)));
    out.push(num(c.map(|c| c.rh_pct)));
    out.push(num(c.map(|c| c.pressure_hpa)));
    out.push(num(c.map(|c| c.voc_ohm)));
    out.push(reading.status().to_string());
}

fn push_particulate(out: &mut Vec<String>, reading: &Reading<Particulate>) {
    let p = reading.value();
    let detail = p.and_then(|p| p.detail);
    for i in 0..3 {
        out.push(int(detail.map(|d| d.cf1[i])));
    }
    out.push(num(p.map(|p| p.pm1)));
    out.push(num(p.map(|p| p.pm25)));
    out.push(num(p.map(|p| p.pm10)));
    for i in 0..6 {
        out.push(int(detail.map(|d| d.counts[i])));
    }
    out.push(reading.status().to_string());
}

fn push_gas(out: &mut Vec<String>, reading: &Reading<Gas>) {
    let g = reading.value();
    out.push(num(g.map(|g| g.ppm)));
    out.push(int(g.map(|g| g.raw)));
    out.push(int(g.map(|g| g.byte0)));
    out.push(int(g.map(|g| g.byte1)));
    out.push(match reading {
        Reading::Valid(_) => "OK".to_string(),
        Reading::Failed(e) => e.code().to_string(),
        Reading::NoData => NODATA.to_string(),
    });
    out.push(reading.status().to_string());
}

/// Quote a field when it contains a separator, quote or line break.
pub fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\"")).into()
    } else {
        value.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agreement::AgreementEngine;
    use crate::config::AgreementConfig;
    use crate::sensors::{PmsDetail, SensorError};
    use chrono::TimeZone;

    fn stamp() -> (DateTime<Utc>, DateTime<Tz>) {
        let utc = Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap();
        (utc, utc.with_timezone(&chrono_tz::America::Chicago))
    }

    fn row(readings: TickReadings, agreement: AgreementResult) -> Row {
        let (utc, local) = stamp();
        Row {
            timestamp_utc: utc,
            timestamp_local: local,
            node_id: "node-a".into(),
            readings,
            agreement,
        }
    }

    fn empty_readings() -> TickReadings {
        TickReadings {
            climate: Reading::NoData,
            pms1: Reading::NoData,
            pms2: Reading::NoData,
            gas: Reading::NoData,
        }
    }

    fn field<'a>(fields: &'a [String], name: &str) -> &'a str {
        let idx = COLUMNS.iter().position(|c| *c == name).unwrap();
        &fields[idx]
    }

    #[test]
    fn test_column_count_constant_across_states() {
        let climate = Climate {
            temp_c: 21.5,
            rh_pct: 40.0,
            pressure_hpa: 1013.2,
            voc_ohm: 120000.0,
        };
        let mut detailed = Particulate::new(1.0, 2.0, 3.0);
        detailed.detail = Some(PmsDetail {
            cf1: [1, 2, 3],
            counts: [10, 20, 30, 40, 50, 60],
        });
        let gas = Gas {
            ppm: 0.5,
            raw: 5,
            byte0: 0,
            byte1: 5,
        };

        let climates = [
            Reading::Valid(climate),
            Reading::NoData,
            Reading::Failed(SensorError::Transient("io".into())),
        ];
        let particulates = [
            Reading::Valid(detailed),
            Reading::Valid(Particulate::new(4.0, 5.0, 6.0)),
            Reading::NoData,
            Reading::Failed(SensorError::NoFrame),
        ];
        let gases = [
            Reading::Valid(gas),
            Reading::NoData,
            Reading::Failed(SensorError::malformed("checksum", &[0xFF])),
        ];

        for c in &climates {
            for p1 in &particulates {
                for p2 in &particulates {
                    for g in &gases {
                        let readings = TickReadings {
                            climate: c.clone(),
                            pms1: p1.clone(),
                            pms2: p2.clone(),
                            gas: g.clone(),
                        };
                        let mut engine = AgreementEngine::new(AgreementConfig::default());
                        let agreement = engine.evaluate(&readings.pms1, &readings.pms2);
                        let fields = row(readings, agreement).fields();
                        assert_eq!(fields.len(), COLUMNS.len());
                    }
                }
            }
        }
    }

    #[test]
    fn test_unset_numeric_blank_and_categorical_nodata() {
        let fields = row(empty_readings(), AgreementResult::incomplete()).fields();

        assert_eq!(field(&fields, "temp_c"), "");
        assert_eq!(field(&fields, "pm25_atm_pms1"), "");
        assert_eq!(field(&fields, "pm25_pms_mean"), "");
        assert_eq!(field(&fields, "so2_raw"), "");
        assert_eq!(field(&fields, "bme_status"), "NODATA");
        assert_eq!(field(&fields, "pms2_status"), "NODATA");
        assert_eq!(field(&fields, "so2_error"), "NODATA");
        assert_eq!(field(&fields, "so2_status"), "NODATA");
        assert_eq!(field(&fields, "pm25_pair_flag"), "INCOMPLETE");
        assert_eq!(field(&fields, "pm25_suspect_sensor"), "OK");
    }

    #[test]
    fn test_failed_reading_renders_error_and_blanks() {
        let mut readings = empty_readings();
        readings.pms1 = Reading::Failed(SensorError::NoFrame);
        readings.gas = Reading::Failed(SensorError::Timeout {
            budget: std::time::Duration::from_millis(800),
        });
        let fields = row(readings, AgreementResult::incomplete()).fields();

        assert_eq!(field(&fields, "pms1_status"), "ERROR");
        assert_eq!(field(&fields, "pm10_atm_pms1"), "");
        assert_eq!(field(&fields, "so2_status"), "ERROR");
        assert_eq!(field(&fields, "so2_error"), "TIMEOUT");
        assert_eq!(field(&fields, "so2_ppm"), "");
    }

    #[test]
    fn test_timestamps_and_values() {
        let mut readings = empty_readings();
        readings.gas = Reading::Valid(Gas {
            ppm: 2.5,
            raw: 25,
            byte0: 0,
            byte1: 25,
        });
        readings.pms1 = Reading::Valid(Particulate::new(1.0, 10.0, 12.0));
        let fields = row(readings, AgreementResult::incomplete()).fields();

        assert_eq!(field(&fields, "timestamp_utc"), "2024-03-10T23:59:59.000Z");
        assert_eq!(
            field(&fields, "timestamp_local"),
            "2024-03-10T18:59:59.000-05:00"
        );
        assert_eq!(field(&fields, "node_id"), "node-a");
        assert_eq!(field(&fields, "pm25_atm_pms1"), "10");
        assert_eq!(field(&fields, "pm25_cf1_pms1"), "");
        assert_eq!(field(&fields, "so2_ppm"), "2.5");
        assert_eq!(field(&fields, "so2_byte1"), "25");
        assert_eq!(field(&fields, "so2_error"), "OK");
        assert_eq!(field(&fields, "so2_status"), "OK");
    }

    #[test]
    fn test_local_date_follows_zone() {
        let r = row(empty_readings(), AgreementResult::incomplete());
        assert_eq!(r.local_date(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(r.timestamp_utc.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    }

    #[test]
    fn test_csv_line_shape() {
        let line = row(empty_readings(), AgreementResult::incomplete()).to_csv_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.trim_end().split(',').count(), COLUMNS.len());
        assert_eq!(header_line().trim_end().split(',').count(), COLUMNS.len());
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("plain"), "plain");
    }
}
