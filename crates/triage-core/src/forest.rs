//! Isolation-forest scorer with a standard scaler.
//!
//! The ecosystem has no maintained isolation-forest crate, so the scorer is
//! built here: a forest of random binary partitions over the (scaled) value
//! axis, where short average path lengths mark isolated points. Scores
//! follow the usual convention: `predict` returns +1 for normal and -1 for
//! anomalous, `score_sample` returns a value in [-1, 0] where lower means
//! more anomalous.
//!
//! Fitting is deterministic under a fixed seed so that two workers trained
//! on the same rows produce the same artifact.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reported in detection results and stored as the model name of anomaly
/// rows.
pub const MODEL_VERSION: &str = "if_v1";

const N_ESTIMATORS: usize = 100;
const SUBSAMPLE: usize = 256;
const CONTAMINATION: f64 = 0.1;
const FIT_SEED: u64 = 42;

const BOOTSTRAP_SAMPLES: usize = 1000;
const BOOTSTRAP_MEAN: f64 = 50.0;
const BOOTSTRAP_STD: f64 = 10.0;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Artifact codec failures.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact encode failed: {0}")]
    Encode(String),
    #[error("artifact decode failed: {0}")]
    Decode(String),
}

/// Zero-mean unit-variance scaling of the single input feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: f64,
    std: f64,
}

impl Default for StandardScaler {
    fn default() -> Self {
        Self { mean: 0.0, std: 1.0 }
    }
}

impl StandardScaler {
    pub fn fit(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        Self {
            mean,
            // A constant feature would otherwise divide by zero.
            std: if std > 0.0 { std } else { 1.0 },
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }
}

/// One node of an isolation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// The fitted forest: trees plus the decision offset derived from the
/// contamination quantile of the training scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    offset: f64,
}

impl IsolationForest {
    /// Fit on already-scaled values. Deterministic: the RNG is seeded.
    pub fn fit(values: &[f64]) -> Self {
        let mut rng = StdRng::seed_from_u64(FIT_SEED);
        let sample_size = values.len().min(SUBSAMPLE).max(1);
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..N_ESTIMATORS)
            .map(|_| {
                let sample: Vec<f64> = values
                    .choose_multiple(&mut rng, sample_size)
                    .copied()
                    .collect();
                build_node(&sample, 0, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            offset: 0.0,
        };

        // Offset at the contamination quantile of the training scores:
        // the lowest `CONTAMINATION` share of scores falls below it and is
        // classified anomalous.
        let mut train_scores: Vec<f64> = values.iter().map(|v| forest.score_sample(*v)).collect();
        train_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((CONTAMINATION * train_scores.len() as f64) as usize)
            .min(train_scores.len().saturating_sub(1));
        forest.offset = train_scores.get(idx).copied().unwrap_or(-0.5);

        forest
    }

    /// Anomaly score of a scaled value, in [-1, 0]; lower is more anomalous.
    pub fn score_sample(&self, value: f64) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, value, 0.0))
            .sum();
        let avg_path = total / self.trees.len() as f64;

        let expected = average_path_length(self.sample_size);
        if expected <= 0.0 {
            return -0.5;
        }
        -(2f64.powf(-avg_path / expected))
    }

    /// +1 for normal, -1 for anomalous.
    pub fn predict(&self, value: f64) -> i8 {
        if self.score_sample(value) < self.offset {
            -1
        } else {
            1
        }
    }
}

fn build_node(values: &[f64], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    if values.len() <= 1 || depth >= max_depth {
        return Node::Leaf {
            size: values.len().max(1),
        };
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max - min).is_finite() || max - min < f64::EPSILON {
        return Node::Leaf { size: values.len() };
    }

    let threshold = rng.gen_range(min..max);
    let (left, right): (Vec<f64>, Vec<f64>) =
        values.iter().copied().partition(|v| *v < threshold);

    Node::Split {
        threshold,
        left: Box::new(build_node(&left, depth + 1, max_depth, rng)),
        right: Box::new(build_node(&right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, value: f64, depth: f64) -> f64 {
    match node {
        Node::Leaf { size } => depth + average_path_length(*size),
        Node::Split {
            threshold,
            left,
            right,
        } => {
            if value < *threshold {
                path_length(left, value, depth + 1.0)
            } else {
                path_length(right, value, depth + 1.0)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Outcome of scoring one metric value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Detection {
    Scored {
        is_anomaly: bool,
        anomaly_score: f64,
        model_version: String,
    },
    Rejected {
        is_anomaly: bool,
        error: String,
    },
}

impl Detection {
    pub fn rejected(error: impl Into<String>) -> Self {
        Detection::Rejected {
            is_anomaly: false,
            error: error.into(),
        }
    }

    pub fn is_anomaly(&self) -> bool {
        matches!(self, Detection::Scored { is_anomaly: true, .. })
    }
}

/// The serialized model state: scorer, scaler and the fitted flag. One of
/// these lives on disk and is replaced wholesale by each retrain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
    pub fitted: bool,
}

impl ModelArtifact {
    /// Fit from raw metric values. Non-finite inputs are zeroed before the
    /// scaler sees them.
    pub fn fit(values: &[f64]) -> Self {
        let clean: Vec<f64> = values
            .iter()
            .map(|v| if v.is_finite() { *v } else { 0.0 })
            .collect();

        let scaler = StandardScaler::fit(&clean);
        let scaled: Vec<f64> = clean.iter().map(|v| scaler.transform(*v)).collect();
        let forest = IsolationForest::fit(&scaled);

        Self {
            scaler,
            forest,
            fitted: true,
        }
    }

    /// Cold-start fit on a fixed-seed Gaussian so scoring works before any
    /// real training data exists.
    pub fn bootstrap() -> Self {
        let normal = Normal::new(BOOTSTRAP_MEAN, BOOTSTRAP_STD)
            .expect("bootstrap distribution parameters are valid");
        let mut rng = StdRng::seed_from_u64(FIT_SEED);
        let samples: Vec<f64> = (0..BOOTSTRAP_SAMPLES)
            .map(|_| normal.sample(&mut rng))
            .collect();
        Self::fit(&samples)
    }

    /// Score one finite value. Callers coerce and validate the raw input
    /// first; this only scales and scores.
    pub fn detect(&self, value: f64) -> Detection {
        if !self.fitted {
            // An unfitted model treats everything as normal.
            return Detection::Scored {
                is_anomaly: false,
                anomaly_score: 0.0,
                model_version: MODEL_VERSION.to_string(),
            };
        }

        let scaled = self.scaler.transform(value);
        let prediction = self.forest.predict(scaled);
        let score = self.forest.score_sample(scaled);

        Detection::Scored {
            is_anomaly: prediction == -1,
            anomaly_score: score,
            model_version: MODEL_VERSION.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        bincode::serialize(self).map_err(|e| ArtifactError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        bincode::deserialize(bytes).map_err(|e| ArtifactError::Decode(e.to_string()))
    }
}
