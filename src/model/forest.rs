//! Isolation forest
//!
//! Random axis-aligned partitioning trees over sub-samples of the training
//! rows. Anomalies need fewer splits to isolate, so a short mean path length
//! means an unusual row. The forest is grown from one seeded `StdRng`, which
//! makes a fit fully reproducible.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::error::DetectorError;
use crate::types::FEATURE_COUNT;

/// Largest sub-sample drawn for one tree
pub const MAX_SAMPLES: usize = 256;

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// One feature vector
pub type Point = [f64; FEATURE_COUNT];

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn path_length(&self, point: &Point) -> f64 {
        let mut node = self;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*feature] < *threshold {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Fitted isolation forest
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Grow `n_trees` trees over `data`
    pub fn fit(data: &[Point], n_trees: usize, seed: u64) -> Result<Self, DetectorError> {
        if data.len() < 2 {
            return Err(DetectorError::Model(format!(
                "isolation forest needs at least 2 rows, got {}",
                data.len()
            )));
        }
        if n_trees == 0 {
            return Err(DetectorError::Model("n_estimators must be positive".to_string()));
        }
        if data.iter().flatten().any(|v| !v.is_finite()) {
            return Err(DetectorError::Model("training data contains non-finite values".to_string()));
        }

        let sample_size = data.len().min(MAX_SAMPLES);
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..n_trees)
            .map(|_| {
                let sample = index::sample(&mut rng, data.len(), sample_size).into_vec();
                grow(data, sample, 0, height_limit, &mut rng)
            })
            .collect();

        Ok(Self { trees, sample_size })
    }

    /// Raw anomaly score in `[-1, 0)`; lower is more anomalous
    pub fn score_sample(&self, point: &Point) -> f64 {
        let mean_depth =
            self.trees.iter().map(|t| t.path_length(point)).sum::<f64>() / self.trees.len() as f64;
        -(2f64.powf(-mean_depth / average_path_length(self.sample_size)))
    }

    pub fn score_samples(&self, points: &[Point]) -> Vec<f64> {
        points.iter().map(|p| self.score_sample(p)).collect()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }
}

fn grow(data: &[Point], rows: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    // Only features that still vary inside this node can split it
    let candidates: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
        .filter_map(|feature| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                (lo.min(data[r][feature]), hi.max(data[r][feature]))
            });
            (lo < hi).then_some((feature, lo, hi))
        })
        .collect();
    if candidates.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) =
        rows.into_iter().partition(|&r| data[r][feature] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(data, left, depth + 1, limit, rng)),
        right: Box::new(grow(data, right, depth + 1, limit, rng)),
    }
}

/// Average path length of an unsuccessful binary-search-tree lookup among `n` items
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
