//! Model training
//!
//! Ridge regression over the outcome corpus, solved through the normal equations.
//! Training is cooperatively cancellable: the trainer polls its [`CancelToken`]
//! while accumulating and before solving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::utils::types::TimestampMs;

use super::params::ModelParameters;

/// Rows accumulated between cancellation checks
const CANCEL_CHECK_ROWS: usize = 256;

/// One training row: model inputs and the realized unit-horizon return
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub inputs: Vec<f64>,
    pub target: f64,
    pub timestamp: TimestampMs,
}

/// Cancellation ticket for one training run
#[derive(Debug, Clone)]
pub struct CancelToken {
    epoch: u64,
    latest: Arc<AtomicU64>,
}

impl CancelToken {
    pub fn new(epoch: u64, latest: Arc<AtomicU64>) -> Self {
        Self { epoch, latest }
    }

    /// Token that is never cancelled
    pub fn never() -> Self {
        Self {
            epoch: 0,
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_cancelled(&self) -> bool {
        self.latest.load(Ordering::SeqCst) != self.epoch
    }

    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::TrainingCancelled {
                epoch: self.epoch,
                reason: "superseded by a newer run".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Fits model parameters to a training slice
pub trait ModelTrainer: Send + Sync {
    fn fit(&self, samples: &[TrainingSample], cancel: &CancelToken) -> EngineResult<ModelParameters>;

    fn name(&self) -> &str;
}

/// Ridge regression trainer; the bias term is not penalized
pub struct RidgeTrainer {
    lambda: f64,
}

impl RidgeTrainer {
    pub fn new(lambda: f64) -> Self {
        Self { lambda }
    }
}

impl ModelTrainer for RidgeTrainer {
    fn fit(&self, samples: &[TrainingSample], cancel: &CancelToken) -> EngineResult<ModelParameters> {
        let dim = samples.first().map(|s| s.inputs.len()).unwrap_or(0);
        if dim == 0 || dim % 2 == 0 {
            return Err(training_error(format!("invalid input dimension {}", dim)));
        }

        let mut xtx = vec![vec![0.0; dim]; dim];
        let mut xty = vec![0.0; dim];

        for (n, sample) in samples.iter().enumerate() {
            if n % CANCEL_CHECK_ROWS == 0 {
                cancel.check()?;
            }
            if sample.inputs.len() != dim {
                return Err(training_error("inconsistent input dimension"));
            }
            for i in 0..dim {
                let xi = sample.inputs[i];
                xty[i] += xi * sample.target;
                for j in i..dim {
                    xtx[i][j] += xi * sample.inputs[j];
                }
            }
        }
        for i in 0..dim {
            for j in 0..i {
                xtx[i][j] = xtx[j][i];
            }
            if i > 0 {
                xtx[i][i] += self.lambda * samples.len() as f64;
            }
        }

        cancel.check()?;
        let weights = solve(xtx, xty).ok_or_else(|| training_error("singular normal equations"))?;

        let parameters = ModelParameters {
            arity: (dim - 1) / 2,
            weights,
            residual_std: 0.0,
        };
        let mse = mean_squared_error(&parameters, samples);
        Ok(ModelParameters {
            residual_std: mse.sqrt(),
            ..parameters
        })
    }

    fn name(&self) -> &str {
        "ridge"
    }
}

/// Held-out score: negative mean squared error, higher is better
pub fn validation_score(parameters: &ModelParameters, samples: &[TrainingSample]) -> f64 {
    -mean_squared_error(parameters, samples)
}

pub fn mean_squared_error(parameters: &ModelParameters, samples: &[TrainingSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples
        .iter()
        .map(|s| (s.target - parameters.predict_row(&s.inputs)).powi(2))
        .sum::<f64>()
        / samples.len() as f64
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

fn training_error(reason: impl Into<String>) -> EngineError {
    EngineError::InsufficientData {
        symbol: "training".to_string(),
        reason: reason.into(),
    }
}
