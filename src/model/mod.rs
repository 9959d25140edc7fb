//! Anomaly model
//!
//! Fits an isolation forest on the training rows of one device and turns raw
//! scores into decision scores: the offset is the `contamination` percentile of
//! the training scores, so a negative decision score marks an anomaly. The
//! model is refit on every run and never persisted.

mod forest;

pub use forest::{average_path_length, IsolationForest, Point, MAX_SAMPLES};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::DetectorError;
use crate::preprocess::FeatureMatrix;
use crate::stats;
use crate::types::{AnomalyResult, AnomalySource, FeatureRow, Metric};

/// Model factory holding the hyperparameters
#[derive(Debug, Clone, Default)]
pub struct AnomalyModel {
    config: ModelConfig,
}

/// Forest plus the threshold calibrated on its training rows
#[derive(Debug, Clone)]
pub struct TrainedModel {
    forest: IsolationForest,
    offset: f64,
    training_rows: usize,
}

impl AnomalyModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Fit on `rows`
    pub fn fit(&self, rows: &[FeatureRow]) -> Result<TrainedModel, DetectorError> {
        let min_rows = self.config.min_training_rows.max(2);
        if rows.len() < min_rows {
            return Err(DetectorError::InsufficientData(format!(
                "{} training rows available, at least {min_rows} required",
                rows.len()
            )));
        }

        let varying = Metric::ALL.iter().any(|&metric| {
            let column = stats::column(rows, metric);
            column.iter().any(|v| *v != column[0])
        });
        if !varying {
            return Err(DetectorError::Model(
                "every metric is constant across the training window".to_string(),
            ));
        }

        let points: Vec<Point> = rows.iter().map(FeatureRow::values).collect();
        let forest = IsolationForest::fit(&points, self.config.n_estimators, self.config.seed)?;
        let training_scores = forest.score_samples(&points);
        let offset = stats::percentile_linear(&training_scores, self.config.contamination * 100.0)
            .ok_or_else(|| DetectorError::Model("no training scores".to_string()))?;

        debug!(
            rows = rows.len(),
            trees = forest.n_trees(),
            sample_size = forest.sample_size(),
            offset,
            "fitted isolation forest"
        );

        Ok(TrainedModel {
            forest,
            offset,
            training_rows: rows.len(),
        })
    }

    /// Fit on the training rows of `matrix` and score every row.
    ///
    /// `forced` marks one date anomalous regardless of its score.
    pub fn fit_score(
        &self,
        matrix: &FeatureMatrix,
        forced: Option<NaiveDate>,
    ) -> Result<Vec<AnomalyResult>, DetectorError> {
        let trained = self.fit(&matrix.training_rows())?;
        let mut results = trained.evaluate(&matrix.rows);

        if let Some(date) = forced {
            if !apply_forced_outlier(&mut results, date) {
                warn!(%date, "forced outlier date is outside the scored range");
            }
        }
        Ok(results)
    }
}

impl TrainedModel {
    /// Decision scores; negative means anomalous, lower is more anomalous
    pub fn score(&self, rows: &[FeatureRow]) -> Vec<f64> {
        rows.iter()
            .map(|row| self.forest.score_sample(&row.values()) - self.offset)
            .collect()
    }

    /// Score rows into model-sourced results
    pub fn evaluate(&self, rows: &[FeatureRow]) -> Vec<AnomalyResult> {
        rows.iter()
            .zip(self.score(rows))
            .map(|(row, score)| AnomalyResult {
                date: row.date,
                score,
                is_anomaly: score < 0.0,
                source: AnomalySource::Model,
                feature_values: row.clone(),
            })
            .collect()
    }

    /// Raw-score threshold calibrated from the contamination rate
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn training_rows(&self) -> usize {
        self.training_rows
    }
}

/// Mark the result for `date` anomalous; returns false if no result has that date
pub fn apply_forced_outlier(results: &mut [AnomalyResult], date: NaiveDate) -> bool {
    match results.iter_mut().find(|r| r.date == date) {
        Some(result) => {
            result.is_anomaly = true;
            result.source = AnomalySource::Forced;
            true
        }
        None => false,
    }
}
