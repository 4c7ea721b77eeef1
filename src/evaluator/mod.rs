//! Outcome Evaluator
//!
//! Labels matured forecasts with their realized error. Evaluation is pure: the
//! record's timestamp is the forecast's maturity, not the wall clock, so evaluating
//! the same forecast twice yields identical records.

use crate::config::EvaluatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::utils::types::{ForecastRecord, OutcomeRecord, TimestampMs};

pub struct OutcomeEvaluator {
    epsilon: f64,
}

impl OutcomeEvaluator {
    pub fn new(config: &EvaluatorConfig) -> Self {
        Self { epsilon: config.epsilon }
    }

    pub fn evaluate(
        &self,
        forecast: &ForecastRecord,
        realized_return: f64,
        now: TimestampMs,
    ) -> EngineResult<OutcomeRecord> {
        let matures_at = forecast.matures_at();
        if now < matures_at {
            return Err(EngineError::HorizonNotElapsed {
                forecast_id: forecast.id,
                remaining_ms: matures_at - now,
            });
        }
        if !realized_return.is_finite() {
            return Err(EngineError::InsufficientData {
                symbol: forecast.symbol.clone(),
                reason: "non-finite realized return".to_string(),
            });
        }

        let signed_error = realized_return - forecast.predicted_return;
        let normalized_error = signed_error / forecast.uncertainty.max(self.epsilon);

        Ok(OutcomeRecord {
            forecast_id: forecast.id,
            symbol: forecast.symbol.clone(),
            model_version: forecast.model_version,
            horizon_ms: forecast.horizon_ms,
            realized_return,
            predicted_return: forecast.predicted_return,
            signed_error,
            abs_error: signed_error.abs(),
            normalized_error,
            inputs: forecast.inputs.clone(),
            timestamp: matures_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn forecast(uncertainty: f64) -> ForecastRecord {
        ForecastRecord {
            id: Uuid::new_v4(),
            symbol: "BTC".to_string(),
            issued_at: 1_000,
            horizon_ms: 500,
            predicted_return: 0.01,
            uncertainty,
            model_version: 2,
            inputs: vec![1.0],
        }
    }

    #[test]
    fn test_early_evaluation_rejected() {
        let evaluator = OutcomeEvaluator::new(&EvaluatorConfig::default());
        let err = evaluator.evaluate(&forecast(0.01), 0.02, 1_499).unwrap_err();
        assert!(matches!(err, EngineError::HorizonNotElapsed { remaining_ms: 1, .. }));
    }

    #[test]
    fn test_errors_computed() {
        let evaluator = OutcomeEvaluator::new(&EvaluatorConfig::default());
        let outcome = evaluator.evaluate(&forecast(0.02), 0.03, 1_500).unwrap();
        assert!((outcome.signed_error - 0.02).abs() < 1e-12);
        assert!((outcome.normalized_error - 1.0).abs() < 1e-9);
        assert_eq!(outcome.timestamp, 1_500);
    }

    #[test]
    fn test_zero_uncertainty_uses_epsilon() {
        let evaluator = OutcomeEvaluator::new(&EvaluatorConfig { epsilon: 0.5 });
        let outcome = evaluator.evaluate(&forecast(0.0), 0.51, 2_000).unwrap();
        assert!((outcome.normalized_error - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let evaluator = OutcomeEvaluator::new(&EvaluatorConfig::default());
        let f = forecast(0.01);
        let first = evaluator.evaluate(&f, -0.02, 1_600).unwrap();
        let second = evaluator.evaluate(&f, -0.02, 9_999).unwrap();
        assert_eq!(first, second);
    }
}
