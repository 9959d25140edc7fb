//! Core types for the Sleepwatch pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: vendor samples, feature rows, anomaly results and run results.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{DetectorError, ErrorKind};

/// Sleep tracker vendor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    #[default]
    Emfit,
    Oura,
    Eight,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Emfit => "emfit",
            Vendor::Oura => "oura",
            Vendor::Eight => "eight",
        }
    }

    /// Prefix used by vendor-scoped environment variables
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Vendor::Emfit => "EMFIT",
            Vendor::Oura => "OURA",
            Vendor::Eight => "EIGHT",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emfit" => Ok(Vendor::Emfit),
            "oura" => Ok(Vendor::Oura),
            "eight" | "eightsleep" | "eight_sleep" => Ok(Vendor::Eight),
            other => Err(DetectorError::Configuration(format!(
                "unsupported sleep tracker '{other}' (expected emfit, oura or eight)"
            ))),
        }
    }
}

/// A sleep tracking device resolved for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub display_name: String,
    pub vendor: Vendor,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, vendor: Vendor) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            vendor,
        }
    }
}

/// One night of vendor data mapped to the canonical schema.
///
/// Units: beats per minute, breaths per minute, minutes, vendor score (0-100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub date: NaiveDate,
    pub heart_rate: Option<f64>,
    pub respiratory_rate: Option<f64>,
    pub sleep_duration_minutes: Option<f64>,
    pub sleep_score: Option<f64>,
    /// Vendor-specific extras (toss and turn count, HRV, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, f64>,
}

impl RawSample {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            heart_rate: None,
            respiratory_rate: None,
            sleep_duration_minutes: None,
            sleep_score: None,
            extras: BTreeMap::new(),
        }
    }

    /// Value of a model metric, if the vendor reported it
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::HeartRate => self.heart_rate,
            Metric::RespiratoryRate => self.respiratory_rate,
            Metric::SleepDuration => self.sleep_duration_minutes,
            Metric::SleepScore => self.sleep_score,
        }
    }
}

/// Model metrics, in feature-column order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HeartRate,
    RespiratoryRate,
    SleepDuration,
    SleepScore,
}

impl Metric {
    /// Fixed column order of the feature matrix
    pub const ALL: [Metric; 4] = [
        Metric::HeartRate,
        Metric::RespiratoryRate,
        Metric::SleepDuration,
        Metric::SleepScore,
    ];

    pub fn index(&self) -> usize {
        match self {
            Metric::HeartRate => 0,
            Metric::RespiratoryRate => 1,
            Metric::SleepDuration => 2,
            Metric::SleepScore => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HeartRate => "hr",
            Metric::RespiratoryRate => "rr",
            Metric::SleepDuration => "sleep_duration",
            Metric::SleepScore => "sleep_score",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::HeartRate => "Heart rate (bpm)",
            Metric::RespiratoryRate => "Respiratory rate (breaths/min)",
            Metric::SleepDuration => "Sleep duration (min)",
            Metric::SleepScore => "Sleep score",
        }
    }
}

/// Number of feature columns
pub const FEATURE_COUNT: usize = Metric::ALL.len();

/// A cleaned, complete feature vector for one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub heart_rate: f64,
    pub respiratory_rate: f64,
    pub sleep_duration_minutes: f64,
    pub sleep_score: f64,
    /// True when the whole day was missing and was filled from window medians
    #[serde(default)]
    pub imputed: bool,
}

impl FeatureRow {
    pub fn from_values(date: NaiveDate, values: [f64; FEATURE_COUNT], imputed: bool) -> Self {
        Self {
            date,
            heart_rate: values[0],
            respiratory_rate: values[1],
            sleep_duration_minutes: values[2],
            sleep_score: values[3],
            imputed,
        }
    }

    /// Values in feature-column order
    pub fn values(&self) -> [f64; FEATURE_COUNT] {
        [
            self.heart_rate,
            self.respiratory_rate,
            self.sleep_duration_minutes,
            self.sleep_score,
        ]
    }

    pub fn get(&self, metric: Metric) -> f64 {
        self.values()[metric.index()]
    }
}

/// Why a date was marked anomalous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySource {
    /// Decision of the fitted model
    Model,
    /// Manual override for this date
    Forced,
}

/// Scoring outcome for one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub date: NaiveDate,
    /// Decision score; negative means anomalous, lower is more anomalous
    pub score: f64,
    pub is_anomaly: bool,
    pub source: AnomalySource,
    pub feature_values: FeatureRow,
}

/// Descriptive statistics of one metric over the window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Pipeline stage of a device run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ResolveDevice,
    Fetch,
    Preprocess,
    FitScore,
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolveDevice => "resolve_device",
            Stage::Fetch => "fetch",
            Stage::Preprocess => "preprocess",
            Stage::FitScore => "fit_score",
            Stage::Package => "package",
        };
        f.write_str(name)
    }
}

/// Successful outcome of one device run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRunResult {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Feature rows that reached the model
    pub rows: usize,
    pub summary: BTreeMap<Metric, MetricSummary>,
    /// Results for every scored date, ascending
    pub history: Vec<AnomalyResult>,
    /// Result for the most recent scored date
    pub latest: AnomalyResult,
    /// False when today's night was not available and `latest` is an earlier date
    pub latest_is_today: bool,
    pub flagged_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub notified: bool,
}

impl DeviceRunResult {
    /// Anomalous dates, most recent last
    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyResult> {
        self.history.iter().filter(|r| r.is_anomaly)
    }
}

/// Structured failure of one device run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl DeviceFailure {
    pub fn new(stage: Stage, error: &DetectorError) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one device run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceOutcome {
    Success(Box<DeviceRunResult>),
    Failure(DeviceFailure),
}

/// Report entry for one resolved device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device: DeviceDescriptor,
    pub outcome: DeviceOutcome,
}

impl DeviceReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DeviceOutcome::Success(_))
    }

    pub fn result(&self) -> Option<&DeviceRunResult> {
        match &self.outcome {
            DeviceOutcome::Success(result) => Some(result),
            DeviceOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&DeviceFailure> {
        match &self.outcome {
            DeviceOutcome::Success(_) => None,
            DeviceOutcome::Failure(failure) => Some(failure),
        }
    }
}

/// Cache counters for the current process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Immutable result of a whole run, handed to presentation and alerting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub vendor: Vendor,
    pub devices: Vec<DeviceReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.devices.iter().filter(|d| !d.is_success()).count()
    }

    pub fn successes(&self) -> usize {
        self.devices.iter().filter(|d| d.is_success()).count()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_parsing() {
        assert_eq!("Emfit".parse::<Vendor>().unwrap(), Vendor::Emfit);
        assert_eq!("eight_sleep".parse::<Vendor>().unwrap(), Vendor::Eight);
        assert!("fitbit".parse::<Vendor>().is_err());
    }

    #[test]
    fn test_feature_row_column_order() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let row = FeatureRow::from_values(date, [55.0, 14.0, 420.0, 80.0], false);
        for metric in Metric::ALL {
            assert_eq!(row.get(metric), row.values()[metric.index()]);
        }
        assert_eq!(row.get(Metric::SleepDuration), 420.0);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let failure = DeviceOutcome::Failure(DeviceFailure {
            stage: Stage::Fetch,
            kind: ErrorKind::Fetch,
            message: "boom".into(),
        });
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["stage"], "fetch");
    }
}
