//! Descriptive statistics
//!
//! Small numeric helpers shared by preprocessing, scoring and packaging.
//! All functions ignore ordering of the input and never mutate it.

use crate::types::{FeatureRow, Metric, MetricSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arithmetic mean; `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator); 0 for fewer than two values
pub fn std_dev(values: &[f64]) -> f64 {
    let Some(m) = mean(values) else {
        return 0.0;
    };
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Median with the midpoint of the two central values for even lengths
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted = sorted(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Percentile `p` (0-100) using linear interpolation between closest ranks
pub fn percentile_linear(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted = sorted(values);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Mean, std, min and max of a non-empty slice
pub fn summarize(values: &[f64]) -> Option<MetricSummary> {
    let mean = mean(values)?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(MetricSummary {
        mean,
        std: std_dev(values),
        min,
        max,
    })
}

/// Values of one metric across rows
pub fn column(rows: &[FeatureRow], metric: Metric) -> Vec<f64> {
    rows.iter().map(|r| r.get(metric)).collect()
}

/// Per-metric summary over rows
pub fn summarize_rows(rows: &[FeatureRow]) -> BTreeMap<Metric, MetricSummary> {
    Metric::ALL
        .iter()
        .filter_map(|&metric| summarize(&column(rows, metric)).map(|s| (metric, s)))
        .collect()
}

/// Distribution context of one metric, handed to the explainer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricContext {
    pub mean: f64,
    pub std: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// Window-wide context surrounding an anomalous day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowContext {
    pub days: usize,
    pub metrics: BTreeMap<Metric, MetricContext>,
}

impl WindowContext {
    pub fn from_rows(rows: &[FeatureRow]) -> Self {
        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            let values = column(rows, metric);
            let (Some(mean), Some(p10), Some(p25), Some(p50), Some(p75), Some(p90)) = (
                mean(&values),
                percentile_linear(&values, 10.0),
                percentile_linear(&values, 25.0),
                percentile_linear(&values, 50.0),
                percentile_linear(&values, 75.0),
                percentile_linear(&values, 90.0),
            ) else {
                continue;
            };
            metrics.insert(
                metric,
                MetricContext {
                    mean,
                    std: std_dev(&values),
                    p10,
                    p25,
                    p50,
                    p75,
                    p90,
                },
            );
        }
        Self {
            days: rows.len(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_std_dev_is_sample_std() {
        // var = ((1-2.5)^2 + (2-2.5)^2 + (3-2.5)^2 + (4-2.5)^2) / 3 = 5/3
        let sd = std_dev(&[1.0, 2.0, 3.0, 4.0]);
        assert!((sd - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(std_dev(&[7.0]), 0.0);
    }

    #[test]
    fn test_percentile_linear_matches_interpolation() {
        let values: Vec<f64> = (1..=5).map(f64::from).collect();
        assert_eq!(percentile_linear(&values, 50.0), Some(3.0));
        assert_eq!(percentile_linear(&values, 25.0), Some(2.0));
        assert!((percentile_linear(&values, 10.0).unwrap() - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_summarize() {
        let s = summarize(&[2.0, 4.0, 6.0]).unwrap();
        assert_eq!(s.mean, 4.0);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 6.0);
        assert!((s.std - 2.0).abs() < 1e-12);
    }
}
