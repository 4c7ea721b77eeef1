//! Model parameters and versions

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::utils::types::{FeatureVector, TimestampMs};

/// Linear factor model over `[1, last features, window mean features]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Feature vector arity the model was trained for
    pub arity: usize,
    /// Weights, `1 + 2 * arity` long, bias first
    pub weights: Vec<f64>,
    /// Residual standard deviation per base horizon
    pub residual_std: f64,
}

impl ModelParameters {
    pub fn zeros(arity: usize, residual_std: f64) -> Self {
        Self {
            arity,
            weights: vec![0.0; input_dim(arity)],
            residual_std,
        }
    }

    pub fn input_dim(&self) -> usize {
        input_dim(self.arity)
    }

    /// Build the model input row for a window of feature vectors
    pub fn input_row(&self, sequence: &[FeatureVector]) -> EngineResult<Vec<f64>> {
        build_input_row(self.arity, sequence)
    }

    /// Unit-horizon prediction for an input row
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.weights.iter().zip(row).map(|(w, x)| w * x).sum()
    }
}

pub fn input_dim(arity: usize) -> usize {
    1 + 2 * arity
}

pub fn build_input_row(arity: usize, sequence: &[FeatureVector]) -> EngineResult<Vec<f64>> {
    let last = sequence.last().ok_or_else(|| EngineError::InsufficientData {
        symbol: String::new(),
        reason: "empty feature sequence".to_string(),
    })?;

    if let Some(bad) = sequence
        .iter()
        .find(|fv| fv.arity() != arity || fv.symbol != last.symbol)
    {
        return Err(EngineError::InsufficientData {
            symbol: last.symbol.clone(),
            reason: format!(
                "sequence element at {} has arity {} (expected {}) for {}",
                bad.timestamp,
                bad.arity(),
                arity,
                bad.symbol
            ),
        });
    }

    let mut row = Vec::with_capacity(input_dim(arity));
    row.push(1.0);
    row.extend_from_slice(&last.features);

    let n = sequence.len() as f64;
    for slot in 0..arity {
        let sum: f64 = sequence.iter().map(|fv| fv.features[slot]).sum();
        row.push(sum / n);
    }
    Ok(row)
}

/// Timestamps of the samples a version was trained on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingWindow {
    pub start: TimestampMs,
    pub end: TimestampMs,
    pub samples: usize,
}

/// Immutable, addressable parameter snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: u64,
    pub parameters: ModelParameters,
    pub training_window: Option<TrainingWindow>,
    /// Held-out score at promotion time (negative MSE); `None` for the prior
    pub validation_score: Option<f64>,
    pub created_at: TimestampMs,
    pub trainer: String,
}

impl ModelVersion {
    /// Zero-weight prior used to bootstrap the loop
    pub fn prior(arity: usize, uncertainty: f64, created_at: TimestampMs) -> Self {
        Self {
            id: 0,
            parameters: ModelParameters::zeros(arity, uncertainty),
            training_window: None,
            validation_score: None,
            created_at,
            trainer: "prior".to_string(),
        }
    }
}
