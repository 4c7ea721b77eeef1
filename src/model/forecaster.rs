//! Forecast Model
//!
//! Serves exactly one active [`ModelVersion`] and keeps a bounded FIFO window of
//! recent feature vectors per symbol.
//!
//! The active version lives behind an `ArcSwapOption`: `load_version` publishes a
//! complete snapshot in one pointer swap and every prediction loads the pointer
//! once, so a prediction sees either the old or the new parameters in full.

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::utils::types::{FeatureVector, ForecastRecord, Symbol};

use super::params::ModelVersion;
use super::registry::ModelRegistry;

/// Namespace for deterministic forecast ids
const FORECAST_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_52c4_9e0b_4d1d_8a55_3c7e_b0f2_9d41);

pub struct ForecastModel {
    config: ModelConfig,
    arity: usize,
    active: ArcSwapOption<ModelVersion>,
    windows: DashMap<Symbol, VecDeque<FeatureVector>>,
    registry: Arc<ModelRegistry>,
}

impl ForecastModel {
    pub fn new(config: ModelConfig, arity: usize, registry: Arc<ModelRegistry>) -> Self {
        Self {
            config,
            arity,
            active: ArcSwapOption::empty(),
            windows: DashMap::new(),
            registry,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Atomically replace the active version, returning the previous one
    pub fn load_version(&self, version: Arc<ModelVersion>) -> EngineResult<Option<Arc<ModelVersion>>> {
        if version.parameters.arity != self.arity {
            return Err(EngineError::InsufficientData {
                symbol: String::new(),
                reason: format!(
                    "version v{} has arity {} (expected {})",
                    version.id, version.parameters.arity, self.arity
                ),
            });
        }
        let id = version.id;
        let previous = self.active.swap(Some(version));
        info!(
            "Active model version: v{} -> v{}",
            previous.as_ref().map(|v| v.id.to_string()).unwrap_or_else(|| "none".to_string()),
            id
        );
        Ok(previous)
    }

    pub fn active_version(&self) -> Option<Arc<ModelVersion>> {
        self.active.load_full()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Push a vector into its symbol window.
    ///
    /// Returns false for duplicate or out-of-order deliveries (timestamp not newer
    /// than the newest stored vector), which are dropped.
    pub fn observe(&self, vector: FeatureVector) -> bool {
        if vector.arity() != self.arity {
            warn!(
                "{}: dropping vector with arity {} (expected {})",
                vector.symbol,
                vector.arity(),
                self.arity
            );
            return false;
        }

        let mut window = self.windows.entry(vector.symbol.clone()).or_default();
        if let Some(last) = window.back() {
            if vector.timestamp <= last.timestamp {
                debug!(
                    "{}: duplicate/out-of-order vector at {} (newest {})",
                    vector.symbol, vector.timestamp, last.timestamp
                );
                return false;
            }
        }
        window.push_back(vector);
        while window.len() > self.config.window_capacity {
            window.pop_front();
        }
        true
    }

    pub fn window(&self, symbol: &str) -> Vec<FeatureVector> {
        self.windows
            .get(symbol)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Predict over the stored window for `symbol`
    pub fn predict_symbol(&self, symbol: &str, horizon_ms: i64) -> EngineResult<ForecastRecord> {
        let sequence = self.window(symbol);
        if sequence.is_empty() {
            return Err(EngineError::InsufficientData {
                symbol: symbol.to_string(),
                reason: "no observations in window".to_string(),
            });
        }
        self.predict(&sequence, horizon_ms)
    }

    /// Deterministic forecast for a feature sequence (oldest first)
    pub fn predict(&self, sequence: &[FeatureVector], horizon_ms: i64) -> EngineResult<ForecastRecord> {
        let version = self.active.load_full().ok_or_else(|| EngineError::ModelUnavailable {
            fallback_available: !self.registry.is_empty(),
        })?;
        predict_with(&version, &self.config, sequence, horizon_ms)
    }
}

/// Forecast using one fixed version snapshot
pub fn predict_with(
    version: &ModelVersion,
    config: &ModelConfig,
    sequence: &[FeatureVector],
    horizon_ms: i64,
) -> EngineResult<ForecastRecord> {
    let row = version.parameters.input_row(sequence)?;
    // input_row rejects empty sequences
    let last = &sequence[sequence.len() - 1];

    if horizon_ms <= 0 {
        return Err(EngineError::InsufficientData {
            symbol: last.symbol.clone(),
            reason: format!("non-positive horizon {}ms", horizon_ms),
        });
    }

    let horizon_scale = horizon_ms as f64 / config.base_horizon_ms as f64;
    let predicted_return = version.parameters.predict_row(&row) * horizon_scale;
    let uncertainty = (version.parameters.residual_std * horizon_scale.sqrt()).max(config.min_uncertainty);

    if !predicted_return.is_finite() || !uncertainty.is_finite() {
        return Err(EngineError::InsufficientData {
            symbol: last.symbol.clone(),
            reason: "non-finite forecast".to_string(),
        });
    }

    let key = format!("{}:{}:{}:{}", last.symbol, last.timestamp, horizon_ms, version.id);
    Ok(ForecastRecord {
        id: Uuid::new_v5(&FORECAST_NAMESPACE, key.as_bytes()),
        symbol: last.symbol.clone(),
        issued_at: last.timestamp,
        horizon_ms,
        predicted_return,
        uncertainty,
        model_version: version.id,
        inputs: row,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::ModelParameters;

    fn fv(ts: i64, x: f64) -> FeatureVector {
        FeatureVector { symbol: "SOL".to_string(), timestamp: ts, features: vec![x, 0.5] }
    }

    fn version(id: u64, w: f64) -> Arc<ModelVersion> {
        Arc::new(ModelVersion {
            id,
            parameters: ModelParameters { arity: 2, weights: vec![0.0, w, 0.0, 0.0, 0.0], residual_std: 0.01 },
            training_window: None,
            validation_score: None,
            created_at: 0,
            trainer: "test".to_string(),
        })
    }

    fn config(capacity: usize) -> ModelConfig {
        ModelConfig { window_capacity: capacity, base_horizon_ms: 1_000, ..ModelConfig::default() }
    }

    #[test]
    fn test_no_version_is_unavailable() {
        let model = ForecastModel::new(config(4), 2, Arc::new(ModelRegistry::new()));
        let err = model.predict(&[fv(1, 0.1)], 1_000).unwrap_err();
        assert_eq!(err, EngineError::ModelUnavailable { fallback_available: false });
    }

    #[test]
    fn test_prediction_scales_with_horizon() {
        let model = ForecastModel::new(config(4), 2, Arc::new(ModelRegistry::new()));
        model.load_version(version(1, 2.0)).unwrap();
        let f = model.predict(&[fv(1, 0.1)], 4_000).unwrap();
        assert!((f.predicted_return - 0.8).abs() < 1e-12);
        assert!((f.uncertainty - 0.02).abs() < 1e-12);
        assert_eq!(f.model_version, 1);
        assert_eq!(f.issued_at, 1);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let model = ForecastModel::new(config(4), 2, Arc::new(ModelRegistry::new()));
        model.load_version(version(1, 2.0)).unwrap();
        let seq = vec![fv(1, 0.1), fv(2, -0.3)];
        assert_eq!(model.predict(&seq, 1_000).unwrap(), model.predict(&seq, 1_000).unwrap());
    }

    #[test]
    fn test_window_is_fifo_and_drops_duplicates() {
        let model = ForecastModel::new(config(2), 2, Arc::new(ModelRegistry::new()));
        assert!(model.observe(fv(1, 0.1)));
        assert!(model.observe(fv(2, 0.2)));
        assert!(!model.observe(fv(2, 0.2)));
        assert!(!model.observe(fv(1, 0.9)));
        assert!(model.observe(fv(3, 0.3)));
        let ts: Vec<i64> = model.window("SOL").iter().map(|v| v.timestamp).collect();
        assert_eq!(ts, vec![2, 3]);
    }

    #[test]
    fn test_load_rejects_wrong_arity() {
        let model = ForecastModel::new(config(2), 3, Arc::new(ModelRegistry::new()));
        assert!(model.load_version(version(1, 1.0)).is_err());
        assert!(model.active_version().is_none());
    }
}
