//! Paired particulate agreement diagnostics.
//!
//! Two independent PM2.5 sensors are compared every tick. Agreement is
//! judged by relative percent difference (RPD); when they disagree, each
//! sensor's deviation from its own rolling baseline decides which one is
//! suspect. Raw values are never altered, only derived columns are produced.

use crate::config::AgreementConfig;
use crate::core::baseline::RollingBaseline;
use crate::sensors::{Particulate, Reading, ReadingStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of comparing the two particulate sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairFlag {
    Ok,
    LowPmOk,
    Mismatch,
    Pms1Bad,
    Pms2Bad,
    BothBad,
    Incomplete,
}

impl PairFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairFlag::Ok => "OK",
            PairFlag::LowPmOk => "LOW_PM_OK",
            PairFlag::Mismatch => "MISMATCH",
            PairFlag::Pms1Bad => "PMS1_BAD",
            PairFlag::Pms2Bad => "PMS2_BAD",
            PairFlag::BothBad => "BOTH_BAD",
            PairFlag::Incomplete => "INCOMPLETE",
        }
    }

    /// Flags that never carry a suspect sensor.
    pub fn is_clear(&self) -> bool {
        matches!(self, PairFlag::Ok | PairFlag::LowPmOk | PairFlag::Incomplete)
    }
}

impl fmt::Display for PairFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PairFlag {
    type Err = String;

    /// Parses the column token, including the per-sensor flags that older
    /// node software wrote when a sensor reported a bad status.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(PairFlag::Ok),
            "LOW_PM_OK" => Ok(PairFlag::LowPmOk),
            "MISMATCH" => Ok(PairFlag::Mismatch),
            "PMS1_BAD" => Ok(PairFlag::Pms1Bad),
            "PMS2_BAD" => Ok(PairFlag::Pms2Bad),
            "BOTH_BAD" => Ok(PairFlag::BothBad),
            "INCOMPLETE" => Ok(PairFlag::Incomplete),
            other => Err(format!("unknown pair flag {other:?}")),
        }
    }
}

/// Which sensor the diagnostics point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuspectSensor {
    Ok,
    Pms1,
    Pms2,
    Both,
}

impl SuspectSensor {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspectSensor::Ok => "OK",
            SuspectSensor::Pms1 => "PMS1",
            SuspectSensor::Pms2 => "PMS2",
            SuspectSensor::Both => "BOTH",
        }
    }
}

impl fmt::Display for SuspectSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuspectSensor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(SuspectSensor::Ok),
            "PMS1" => Ok(SuspectSensor::Pms1),
            "PMS2" => Ok(SuspectSensor::Pms2),
            "BOTH" => Ok(SuspectSensor::Both),
            other => Err(format!("unknown suspect sensor {other:?}")),
        }
    }
}

/// Derived agreement columns for one row.
///
/// Constructed only through the associated functions so that a clear flag
/// always comes with `suspect = OK`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgreementResult {
    mean: Option<f64>,
    rpd: Option<f64>,
    pair_flag: PairFlag,
    suspect: SuspectSensor,
}

impl AgreementResult {
    /// At least one reading missing or invalid.
    pub fn incomplete() -> Self {
        Self {
            mean: None,
            rpd: None,
            pair_flag: PairFlag::Incomplete,
            suspect: SuspectSensor::Ok,
        }
    }

    fn agreed(mean: f64, rpd: Option<f64>, pair_flag: PairFlag) -> Self {
        debug_assert!(pair_flag.is_clear());
        Self {
            mean: Some(mean),
            rpd,
            pair_flag,
            suspect: SuspectSensor::Ok,
        }
    }

    fn mismatch(mean: f64, rpd: f64, suspect: SuspectSensor) -> Self {
        debug_assert!(suspect != SuspectSensor::Ok);
        Self {
            mean: Some(mean),
            rpd: Some(rpd),
            pair_flag: PairFlag::Mismatch,
            suspect,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        self.mean
    }

    /// Relative percent difference, in percent.
    pub fn rpd(&self) -> Option<f64> {
        self.rpd
    }

    pub fn pair_flag(&self) -> PairFlag {
        self.pair_flag
    }

    pub fn suspect(&self) -> SuspectSensor {
        self.suspect
    }
}

/// `|a - b| / mean(a, b) * 100`; `None` when the mean is zero.
pub fn rpd(a: f64, b: f64) -> Option<f64> {
    let mean = (a + b) / 2.0;
    if mean <= 0.0 {
        return None;
    }
    Some((a - b).abs() / mean * 100.0)
}

/// PM2.5 value of a reading usable for comparison.
fn valid_pm25(reading: &Reading<Particulate>) -> Option<f64> {
    match reading {
        Reading::Valid(p) if p.pm25.is_finite() && p.pm25 >= 0.0 => Some(p.pm25),
        _ => None,
    }
}

/// Owns both particulate baselines and turns reading pairs into diagnostics.
#[derive(Debug, Clone)]
pub struct AgreementEngine {
    config: AgreementConfig,
    pms1: RollingBaseline,
    pms2: RollingBaseline,
}

impl AgreementEngine {
    pub fn new(config: AgreementConfig) -> Self {
        let capacity = config.baseline_capacity;
        Self {
            config,
            pms1: RollingBaseline::new(capacity),
            pms2: RollingBaseline::new(capacity),
        }
    }

    pub fn baseline_pms1(&self) -> &RollingBaseline {
        &self.pms1
    }

    pub fn baseline_pms2(&self) -> &RollingBaseline {
        &self.pms2
    }

    /// Compare one tick's readings, then fold every valid value into its baseline.
    ///
    /// Attribution compares each reading against the history *before* this
    /// tick, so a sudden jump is not partly absorbed into its own reference.
    pub fn evaluate(
        &mut self,
        pms1: &Reading<Particulate>,
        pms2: &Reading<Particulate>,
    ) -> AgreementResult {
        let v1 = valid_pm25(pms1);
        let v2 = valid_pm25(pms2);

        let result = match (v1, v2) {
            (Some(a), Some(b)) => self.compare(a, b),
            _ => {
                if (pms1.status() == ReadingStatus::Ok && v1.is_none())
                    || (pms2.status() == ReadingStatus::Ok && v2.is_none())
                {
                    tracing::debug!("particulate reading with unusable PM2.5 value");
                }
                AgreementResult::incomplete()
            }
        };

        if let Some(a) = v1 {
            self.pms1.push(a);
        }
        if let Some(b) = v2 {
            self.pms2.push(b);
        }
        result
    }

    fn compare(&self, a: f64, b: f64) -> AgreementResult {
        let mean = (a + b) / 2.0;
        let rpd = rpd(a, b);

        if mean < self.config.low_pm_threshold {
            return AgreementResult::agreed(mean, rpd, PairFlag::LowPmOk);
        }
        // Inputs are non-negative, so an undefined rpd means both read zero.
        let rpd = rpd.unwrap_or(0.0);
        if rpd <= self.config.rpd_threshold_pct {
            return AgreementResult::agreed(mean, Some(rpd), PairFlag::Ok);
        }

        AgreementResult::mismatch(mean, rpd, self.attribute(a, b))
    }

    fn attribute(&self, a: f64, b: f64) -> SuspectSensor {
        let floor = self.config.low_pm_threshold;
        let ratio = self.config.attribution_ratio;

        match (self.pms1.deviation(a, floor), self.pms2.deviation(b, floor)) {
            (Some(d1), Some(d2)) if d1 > d2 * ratio => SuspectSensor::Pms1,
            (Some(d1), Some(d2)) if d2 > d1 * ratio => SuspectSensor::Pms2,
            // No history on one side, or comparable deviations.
            _ => SuspectSensor::Both,
        }
    }
}
