//! Feature preprocessing
//!
//! Turns the raw nights of one device into a dense, date-ordered feature matrix:
//! - Samples are aligned to calendar dates and implausible fields dropped
//! - Missing days and fields are imputed from window medians
//! - Training values are clipped to each metric's percentile band
//!
//! Every step is deterministic; identical input yields identical output.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::PreprocessConfig;
use crate::error::DetectorError;
use crate::stats;
use crate::types::{FeatureRow, Metric, RawSample, FEATURE_COUNT};

/// Metric values of one date, `None` where missing or implausible
pub type PartialRow = [Option<f64>; FEATURE_COUNT];

/// Date-ordered feature matrix of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub rows: Vec<FeatureRow>,
    /// Row of the current day, `None` when today's night is not available
    pub today_index: Option<usize>,
    /// Whole days filled from medians
    pub imputed_days: usize,
    /// Individual fields filled from medians on otherwise present days
    pub imputed_fields: usize,
    /// Values moved onto a percentile bound
    pub clipped_values: usize,
}

impl FeatureMatrix {
    /// Rows used to fit the model: everything except today
    pub fn training_rows(&self) -> Vec<FeatureRow> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.today_index)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn today(&self) -> Option<&FeatureRow> {
        self.today_index.and_then(|i| self.rows.get(i))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Preprocessor for raw nightly samples
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Build the feature matrix for `window_start ..= today`.
    ///
    /// Dates before `today` are training days; a missing training day is
    /// imputed, a missing `today` is dropped.
    pub fn process(
        &self,
        samples: &[RawSample],
        window_start: NaiveDate,
        today: NaiveDate,
    ) -> Result<FeatureMatrix, DetectorError> {
        if window_start >= today {
            return Err(DetectorError::Configuration(format!(
                "window start {window_start} must precede {today}"
            )));
        }

        let observed = align_by_date(samples, window_start, today);
        let missing = check_gaps(&observed, window_start, today, self.config.max_missing_fraction)?;
        let medians = window_medians(&observed)?;
        let (mut rows, imputed_fields) = assemble_rows(&observed, &medians, window_start, today);
        let clipped_values = clip_rows(
            &mut rows,
            today,
            self.config.clip_low_percentile,
            self.config.clip_high_percentile,
        );
        let today_index = rows.iter().position(|r| r.date == today);

        debug!(
            rows = rows.len(),
            missing_days = missing,
            imputed_fields,
            clipped_values,
            has_today = today_index.is_some(),
            "preprocessed window"
        );

        Ok(FeatureMatrix {
            rows,
            today_index,
            imputed_days: missing,
            imputed_fields,
            clipped_values,
        })
    }
}

/// Whether a metric value can be used at all
fn plausible(metric: Metric, value: f64) -> bool {
    if !value.is_finite() {
        return false;
    }
    match metric {
        Metric::SleepScore => value >= 0.0,
        _ => value > 0.0,
    }
}

/// Index samples by date within the span, keeping the first sample per date
pub fn align_by_date(
    samples: &[RawSample],
    start: NaiveDate,
    end: NaiveDate,
) -> BTreeMap<NaiveDate, PartialRow> {
    let mut by_date = BTreeMap::new();
    for sample in samples {
        if sample.date < start || sample.date > end {
            continue;
        }
        by_date.entry(sample.date).or_insert_with(|| {
            let mut row: PartialRow = [None; FEATURE_COUNT];
            for metric in Metric::ALL {
                row[metric.index()] = sample.metric(metric).filter(|v| plausible(metric, *v));
            }
            row
        });
    }
    by_date
}

/// Count missing training days; fails when their share exceeds `max_fraction`
pub fn check_gaps(
    observed: &BTreeMap<NaiveDate, PartialRow>,
    start: NaiveDate,
    today: NaiveDate,
    max_fraction: f64,
) -> Result<usize, DetectorError> {
    let training_days = (today - start).num_days().max(0) as usize;
    let present = observed.keys().filter(|d| **d < today).count();
    let missing = training_days.saturating_sub(present);
    if training_days == 0 {
        return Ok(0);
    }

    let fraction = missing as f64 / training_days as f64;
    if fraction > max_fraction {
        return Err(DetectorError::InsufficientData(format!(
            "{missing} of {training_days} training days missing ({:.0}% > {:.0}% allowed)",
            fraction * 100.0,
            max_fraction * 100.0
        )));
    }
    Ok(missing)
}

/// Per-metric medians over all observed values of the span
pub fn window_medians(
    observed: &BTreeMap<NaiveDate, PartialRow>,
) -> Result<[f64; FEATURE_COUNT], DetectorError> {
    let mut medians = [0.0; FEATURE_COUNT];
    for metric in Metric::ALL {
        let values: Vec<f64> = observed
            .values()
            .filter_map(|row| row[metric.index()])
            .collect();
        medians[metric.index()] = stats::median(&values).ok_or_else(|| {
            DetectorError::InsufficientData(format!(
                "no {} values reported in the window",
                metric.as_str()
            ))
        })?;
    }
    Ok(medians)
}

/// Dense rows for every training day plus today when present.
///
/// Returns the rows and the number of individually imputed fields.
pub fn assemble_rows(
    observed: &BTreeMap<NaiveDate, PartialRow>,
    medians: &[f64; FEATURE_COUNT],
    start: NaiveDate,
    today: NaiveDate,
) -> (Vec<FeatureRow>, usize) {
    let mut rows = Vec::new();
    let mut imputed_fields = 0;

    for date in start.iter_days().take_while(|d| *d <= today) {
        match observed.get(&date) {
            Some(partial) => {
                let mut values = *medians;
                for (slot, value) in values.iter_mut().zip(partial) {
                    match value {
                        Some(v) => *slot = *v,
                        None => imputed_fields += 1,
                    }
                }
                rows.push(FeatureRow::from_values(date, values, false));
            }
            None if date < today => rows.push(FeatureRow::from_values(date, *medians, true)),
            None => {}
        }
    }
    (rows, imputed_fields)
}

/// Clamp training values of each metric to their `[low, high]` percentile band.
///
/// Bounds are linearly interpolated over the rows dated before `today`; the
/// row of `today` is scored as observed. Returns the number of values that moved.
pub fn clip_rows(rows: &mut [FeatureRow], today: NaiveDate, low: f64, high: f64) -> usize {
    let mut clipped = 0;
    for metric in Metric::ALL {
        let column: Vec<f64> = rows
            .iter()
            .filter(|r| r.date < today)
            .map(|r| r.values()[metric.index()])
            .collect();
        let (Some(lo), Some(hi)) = (
            stats::percentile_linear(&column, low),
            stats::percentile_linear(&column, high),
        ) else {
            continue;
        };

        for row in rows.iter_mut().filter(|r| r.date < today) {
            let mut values = row.values();
            let value = values[metric.index()];
            let bounded = value.clamp(lo, hi);
            if bounded != value {
                values[metric.index()] = bounded;
                *row = FeatureRow::from_values(row.date, values, row.imputed);
                clipped += 1;
            }
        }
    }
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 31).unwrap()
    }

    fn night(date: NaiveDate, hr: f64) -> RawSample {
        let mut s = RawSample::new(date);
        s.heart_rate = Some(hr);
        s.respiratory_rate = Some(14.0);
        s.sleep_duration_minutes = Some(420.0);
        s.sleep_score = Some(80.0);
        s
    }

    fn nights(days: i64) -> Vec<RawSample> {
        (0..=days)
            .map(|i| {
                let date = today() - Duration::days(days - i);
                night(date, 50.0 + (i % 10) as f64)
            })
            .collect()
    }

    #[test]
    fn test_complete_window() {
        let samples = nights(30);
        let matrix = Preprocessor::default()
            .process(&samples, today() - Duration::days(30), today())
            .unwrap();

        assert_eq!(matrix.len(), 31);
        assert_eq!(matrix.today_index, Some(30));
        assert_eq!(matrix.training_rows().len(), 30);
        assert_eq!(matrix.imputed_days, 0);
        assert!(matrix.rows.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn test_missing_days_imputed_with_median() {
        let mut samples = nights(10);
        samples.retain(|s| s.date != today() - Duration::days(4));
        let matrix = Preprocessor::default()
            .process(&samples, today() - Duration::days(10), today())
            .unwrap();

        assert_eq!(matrix.len(), 11);
        assert_eq!(matrix.imputed_days, 1);
        let filled = &matrix.rows[6];
        assert!(filled.imputed);
        let hrs: Vec<f64> = samples.iter().filter_map(|s| s.heart_rate).collect();
        assert_eq!(filled.heart_rate, stats::median(&hrs).unwrap());
    }

    #[test]
    fn test_missing_today_is_dropped() {
        let mut samples = nights(10);
        samples.pop();
        let matrix = Preprocessor::default()
            .process(&samples, today() - Duration::days(10), today())
            .unwrap();

        assert_eq!(matrix.len(), 10);
        assert_eq!(matrix.today_index, None);
        assert!(matrix.rows.iter().all(|r| r.date < today()));
    }

    #[test]
    fn test_gap_fraction_exceeded() {
        let samples: Vec<RawSample> = nights(20).into_iter().step_by(3).collect();
        let err = Preprocessor::default()
            .process(&samples, today() - Duration::days(20), today())
            .unwrap_err();
        assert!(matches!(err, DetectorError::InsufficientData(_)));
    }

    #[test]
    fn test_no_samples_is_insufficient() {
        let err = Preprocessor::default()
            .process(&[], today() - Duration::days(7), today())
            .unwrap_err();
        assert!(matches!(err, DetectorError::InsufficientData(_)));
    }

    #[test]
    fn test_metric_never_reported() {
        let mut samples = nights(10);
        for s in &mut samples {
            s.sleep_score = None;
        }
        let err = Preprocessor::default()
            .process(&samples, today() - Duration::days(10), today())
            .unwrap_err();
        assert!(err.to_string().contains("sleep_score"));
    }

    #[test]
    fn test_implausible_fields_imputed() {
        let mut samples = nights(10);
        samples[3].heart_rate = Some(0.0);
        samples[4].respiratory_rate = Some(f64::NAN);
        samples[5].sleep_score = Some(-1.0);
        let matrix = Preprocessor::default()
            .process(&samples, today() - Duration::days(10), today())
            .unwrap();

        assert_eq!(matrix.imputed_fields, 3);
        assert!(matrix.rows[3].heart_rate > 0.0);
        assert!(matrix.rows[4].respiratory_rate.is_finite());
        assert!(!matrix.rows[3].imputed);
    }

    #[test]
    fn test_clipping_bounds() {
        let start = today() - Duration::days(199);
        let mut samples: Vec<RawSample> = (0..200)
            .map(|i| night(start + Duration::days(i), 50.0 + (i % 20) as f64))
            .collect();
        samples[17].heart_rate = Some(400.0);
        samples[18].heart_rate = Some(1.0);

        let training: Vec<f64> = samples[..199].iter().filter_map(|s| s.heart_rate).collect();
        let lo = stats::percentile_linear(&training, 1.0).unwrap();
        let hi = stats::percentile_linear(&training, 99.0).unwrap();

        let matrix = Preprocessor::default()
            .process(&samples, start, today())
            .unwrap();

        assert!(matrix.clipped_values >= 2);
        for row in &matrix.rows {
            assert!(row.heart_rate >= lo && row.heart_rate <= hi);
        }
        assert_eq!(matrix.rows[17].heart_rate, hi);
        assert_eq!(matrix.rows[18].heart_rate, lo);
    }

    #[test]
    fn test_default_window_clips_training_spike_only() {
        let mut samples = nights(90);
        samples[17].heart_rate = Some(400.0);
        samples[90].heart_rate = Some(400.0);

        let matrix = Preprocessor::default()
            .process(&samples, today() - Duration::days(90), today())
            .unwrap();

        assert_eq!(matrix.len(), 91);
        assert_eq!(matrix.clipped_values, 1);
        let training: Vec<f64> = samples[..90].iter().filter_map(|s| s.heart_rate).collect();
        let hi = stats::percentile_linear(&training, 99.0).unwrap();
        assert!(hi < 400.0);
        assert_eq!(matrix.rows[17].heart_rate, hi);
        assert_eq!(matrix.today().unwrap().heart_rate, 400.0);
    }

    #[test]
    fn test_deterministic_output() {
        let mut samples = nights(40);
        samples.remove(7);
        samples[12].sleep_duration_minutes = None;
        let pre = Preprocessor::default();
        let a = pre.process(&samples, today() - Duration::days(40), today()).unwrap();
        let b = pre.process(&samples, today() - Duration::days(40), today()).unwrap();
        assert_eq!(a, b);
    }
}
