//! Adaptive Learning Controller
//!
//! Closes the loop from realized outcomes back into the forecast model:
//! - Cadence trigger: enough new outcomes since the last attempt
//! - Degradation trigger: rolling |normalized error| above threshold for N
//!   consecutive evaluations (hysteresis)
//! - Chronological train/holdout split; the candidate is scored on the holdout only
//! - Promotion only if the candidate is not worse than the active version on the
//!   same holdout by more than the tolerance
//! - Cooperative cancellation of superseded runs
//!
//! The buffer lock is held only to append or to take a snapshot. Fitting happens
//! outside it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::trainer::validation_score;
use crate::model::{
    CancelToken, ForecastModel, ModelTrainer, ModelVersion, TrainingSample, TrainingWindow,
};
use crate::utils::types::{OutcomeRecord, TimestampMs};

use super::buffer::TrainingBuffer;

/// Smallest snapshot that can be split into train and holdout slices
const MIN_SPLIT_SAMPLES: usize = 4;

/// Why a retrain was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainTrigger {
    Cadence,
    Degradation,
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq)]
pub struct LearningStatus {
    pub buffered: usize,
    pub since_last_attempt: usize,
    pub consecutive_degraded: u32,
    pub rolling_abs_error: Option<f64>,
}

struct LearningState {
    buffer: TrainingBuffer,
    since_last_attempt: usize,
    consecutive_degraded: u32,
}

pub struct LearningController {
    config: LearningConfig,
    base_horizon_ms: i64,
    state: Mutex<LearningState>,
    latest_epoch: Arc<AtomicU64>,
    promote_lock: Mutex<()>,
    model: Arc<ForecastModel>,
    trainer: Arc<dyn ModelTrainer>,
}

impl LearningController {
    pub fn new(
        config: LearningConfig,
        base_horizon_ms: i64,
        model: Arc<ForecastModel>,
        trainer: Arc<dyn ModelTrainer>,
    ) -> Self {
        let buffer = TrainingBuffer::new(config.buffer_capacity);
        Self {
            config,
            base_horizon_ms,
            state: Mutex::new(LearningState {
                buffer,
                since_last_attempt: 0,
                consecutive_degraded: 0,
            }),
            latest_epoch: Arc::new(AtomicU64::new(0)),
            promote_lock: Mutex::new(()),
            model,
            trainer,
        }
    }

    /// Buffer an outcome. Returns false if the forecast was already recorded.
    pub fn on_outcome(&self, outcome: OutcomeRecord) -> bool {
        let mut state = self.state.lock();
        let id = outcome.forecast_id;
        if !state.buffer.push(outcome) {
            debug!("Duplicate outcome for forecast {} ignored", id);
            return false;
        }
        state.since_last_attempt += 1;
        true
    }

    pub fn status(&self) -> LearningStatus {
        let state = self.state.lock();
        LearningStatus {
            buffered: state.buffer.len(),
            since_last_attempt: state.since_last_attempt,
            consecutive_degraded: state.consecutive_degraded,
            rolling_abs_error: state.buffer.rolling_abs_error(self.config.error_window),
        }
    }

    /// Cancel every training run currently in flight
    pub fn cancel_inflight(&self) {
        let epoch = self.latest_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Cancelled in-flight training runs (epoch now {})", epoch);
    }

    /// One evaluation of the retrain policy.
    ///
    /// `Ok(None)` when nothing triggered, `Ok(Some(v))` when `v` was promoted,
    /// `ValidationRegression` when the candidate was discarded and
    /// `TrainingCancelled` when the run went stale.
    pub fn maybe_retrain(&self, now: TimestampMs) -> EngineResult<Option<Arc<ModelVersion>>> {
        let Some((trigger, snapshot, token)) = self.take_snapshot() else {
            return Ok(None);
        };
        let base = self.model.active_version();
        info!(
            "Retrain triggered ({:?}): {} samples, epoch {}, active v{}",
            trigger,
            snapshot.len(),
            token.epoch(),
            base.as_ref().map(|v| v.id.to_string()).unwrap_or_else(|| "none".to_string())
        );

        let dim = crate::model::params::input_dim(self.model.arity());
        let samples: Vec<TrainingSample> = snapshot
            .iter()
            .filter(|r| r.inputs.len() == dim && r.horizon_ms > 0)
            .map(|r| TrainingSample {
                inputs: r.inputs.clone(),
                target: r.realized_return * self.base_horizon_ms as f64 / r.horizon_ms as f64,
                timestamp: r.timestamp,
            })
            .collect();
        if samples.len() < MIN_SPLIT_SAMPLES {
            debug!("Only {} usable samples, skipping retrain", samples.len());
            return Ok(None);
        }

        let holdout_len = ((samples.len() as f64 * self.config.holdout_fraction).round() as usize)
            .clamp(1, samples.len() - 2);
        let (train, holdout) = samples.split_at(samples.len() - holdout_len);

        let candidate_id = self.model.registry().reserve_id();
        let parameters = self.trainer.fit(train, &token)?;
        token.check()?;

        let candidate_score = validation_score(&parameters, holdout);
        if let Some(active) = &base {
            let active_score = validation_score(&active.parameters, holdout);
            if candidate_score < active_score - self.config.tolerance {
                warn!(
                    "Candidate v{} discarded: holdout score {:.8} vs active v{} {:.8}",
                    candidate_id, candidate_score, active.id, active_score
                );
                return Err(EngineError::ValidationRegression {
                    candidate: candidate_id,
                    candidate_score,
                    active_score,
                    tolerance: self.config.tolerance,
                });
            }
        }

        let version = ModelVersion {
            id: candidate_id,
            parameters,
            training_window: Some(TrainingWindow {
                start: train.first().map(|s| s.timestamp).unwrap_or_default(),
                end: train.last().map(|s| s.timestamp).unwrap_or_default(),
                samples: train.len(),
            }),
            validation_score: Some(candidate_score),
            created_at: now,
            trainer: self.trainer.name().to_string(),
        };

        let _guard = self.promote_lock.lock();
        token.check()?;
        let current = self.model.active_version().map(|v| v.id);
        if current != base.as_ref().map(|v| v.id) {
            return Err(EngineError::TrainingCancelled {
                epoch: token.epoch(),
                reason: format!(
                    "active version changed from {:?} to {:?} during training",
                    base.as_ref().map(|v| v.id),
                    current
                ),
            });
        }

        let promoted = self
            .model
            .registry()
            .append(version)
            .ok_or_else(|| EngineError::TrainingCancelled {
                epoch: token.epoch(),
                reason: format!("registry already holds a newer version than v{}", candidate_id),
            })?;
        self.model.load_version(promoted.clone())?;
        info!(
            "Promoted v{} (holdout score {:.8}, {} training samples)",
            promoted.id,
            candidate_score,
            train.len()
        );
        Ok(Some(promoted))
    }

    /// Evaluate triggers and, if one fires, snapshot the buffer and open a new epoch
    fn take_snapshot(&self) -> Option<(RetrainTrigger, Vec<OutcomeRecord>, CancelToken)> {
        let mut state = self.state.lock();

        match state.buffer.rolling_abs_error(self.config.error_window) {
            Some(err) if err > self.config.degradation_threshold => state.consecutive_degraded += 1,
            _ => state.consecutive_degraded = 0,
        }

        let trigger = if state.consecutive_degraded >= self.config.hysteresis_evaluations {
            RetrainTrigger::Degradation
        } else if state.since_last_attempt >= self.config.min_samples
            && state.buffer.len() >= self.config.min_samples
        {
            RetrainTrigger::Cadence
        } else {
            return None;
        };

        if state.buffer.len() < MIN_SPLIT_SAMPLES {
            return None;
        }

        state.since_last_attempt = 0;
        state.consecutive_degraded = 0;
        let snapshot = state.buffer.snapshot();
        drop(state);

        let epoch = self.latest_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Some((trigger, snapshot, CancelToken::new(epoch, self.latest_epoch.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::{ModelParameters, ModelRegistry, RidgeTrainer};
    use std::sync::Barrier;
    use uuid::Uuid;

    const ARITY: usize = 1;

    fn outcome(i: usize, realized: f64, normalized_error: f64) -> OutcomeRecord {
        let x = ((i as f64) * 0.7).sin();
        let y = ((i as f64) * 0.3).cos();
        OutcomeRecord {
            forecast_id: Uuid::new_v4(),
            symbol: "X".to_string(),
            model_version: 0,
            horizon_ms: 1_000,
            realized_return: realized,
            predicted_return: 0.0,
            signed_error: realized,
            abs_error: realized.abs(),
            normalized_error,
            inputs: vec![1.0, x, y],
            timestamp: i as i64,
        }
    }

    fn linear_outcome(i: usize) -> OutcomeRecord {
        let mut o = outcome(i, 0.0, 5.0);
        o.realized_return = 0.05 * o.inputs[1] - 0.02 * o.inputs[2];
        o
    }

    fn model_with_prior() -> Arc<ForecastModel> {
        let registry = Arc::new(ModelRegistry::new());
        let config = ModelConfig { base_horizon_ms: 1_000, ..ModelConfig::default() };
        let model = Arc::new(ForecastModel::new(config, ARITY, registry.clone()));
        let prior = registry.append(ModelVersion::prior(ARITY, 0.01, 0)).unwrap();
        model.load_version(prior).unwrap();
        model
    }

    fn learning_config(min_samples: usize) -> LearningConfig {
        LearningConfig {
            buffer_capacity: 1_000,
            min_samples,
            error_window: 20,
            degradation_threshold: 2.0,
            hysteresis_evaluations: 10,
            holdout_fraction: 0.2,
            tolerance: 1e-6,
            ridge_lambda: 1e-6,
        }
    }

    /// Trainer returning fixed parameters
    struct FixedTrainer(ModelParameters);

    impl ModelTrainer for FixedTrainer {
        fn fit(&self, _: &[TrainingSample], _: &CancelToken) -> EngineResult<ModelParameters> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    /// Trainer that parks until the test releases it
    struct GatedTrainer {
        started: Arc<Barrier>,
        resume: Arc<Barrier>,
    }

    impl ModelTrainer for GatedTrainer {
        fn fit(&self, samples: &[TrainingSample], cancel: &CancelToken) -> EngineResult<ModelParameters> {
            self.started.wait();
            self.resume.wait();
            cancel.check()?;
            RidgeTrainer::new(0.0).fit(samples, cancel)
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[test]
    fn test_duplicate_outcomes_not_buffered_twice() {
        let controller = LearningController::new(
            learning_config(50),
            1_000,
            model_with_prior(),
            Arc::new(RidgeTrainer::new(1e-6)),
        );
        let o = linear_outcome(1);
        assert!(controller.on_outcome(o.clone()));
        assert!(!controller.on_outcome(o));
        assert_eq!(controller.status().buffered, 1);
        assert_eq!(controller.status().since_last_attempt, 1);
    }

    #[test]
    fn test_cadence_trigger_promotes_better_model() {
        let model = model_with_prior();
        let controller = LearningController::new(
            learning_config(50),
            1_000,
            model.clone(),
            Arc::new(RidgeTrainer::new(1e-6)),
        );
        for i in 0..49 {
            controller.on_outcome(linear_outcome(i));
        }
        assert_eq!(controller.maybe_retrain(10).unwrap(), None);

        controller.on_outcome(linear_outcome(49));
        let promoted = controller.maybe_retrain(10).unwrap().expect("promotion");
        assert_eq!(promoted.id, 1);
        assert_eq!(model.active_version().unwrap().id, 1);
        assert_eq!(promoted.training_window.unwrap().samples, 40);
        assert!(promoted.validation_score.unwrap() > -1e-8);

        // Counter reset: the next evaluation does not retrain again
        assert_eq!(controller.maybe_retrain(11).unwrap(), None);
    }

    #[test]
    fn test_degradation_requires_consecutive_evaluations() {
        let controller = LearningController::new(
            learning_config(500),
            1_000,
            model_with_prior(),
            Arc::new(RidgeTrainer::new(1e-6)),
        );
        for i in 0..50 {
            controller.on_outcome(linear_outcome(i));
        }
        for _ in 0..9 {
            assert_eq!(controller.maybe_retrain(0).unwrap(), None);
        }
        assert_eq!(controller.status().consecutive_degraded, 9);
        assert!(controller.maybe_retrain(0).unwrap().is_some());
    }

    #[test]
    fn test_noise_below_threshold_resets_hysteresis() {
        let controller = LearningController::new(
            learning_config(500),
            1_000,
            model_with_prior(),
            Arc::new(RidgeTrainer::new(1e-6)),
        );
        for i in 0..20 {
            controller.on_outcome(outcome(i, 0.0, 5.0));
        }
        for _ in 0..5 {
            controller.maybe_retrain(0).unwrap();
        }
        for i in 20..40 {
            controller.on_outcome(outcome(i, 0.0, 0.1));
        }
        assert_eq!(controller.maybe_retrain(0).unwrap(), None);
        assert_eq!(controller.status().consecutive_degraded, 0);
    }

    #[test]
    fn test_regressing_candidate_discarded() {
        let model = model_with_prior();
        let bad = ModelParameters { arity: ARITY, weights: vec![1.0, 10.0, 10.0], residual_std: 0.0 };
        let controller = LearningController::new(
            learning_config(50),
            1_000,
            model.clone(),
            Arc::new(FixedTrainer(bad)),
        );
        for i in 0..50 {
            controller.on_outcome(outcome(i, 0.0, 5.0));
        }
        let err = controller.maybe_retrain(0).unwrap_err();
        assert!(matches!(err, EngineError::ValidationRegression { .. }));
        assert_eq!(model.active_version().unwrap().id, 0);
        assert_eq!(model.registry().len(), 1);
    }

    #[test]
    fn test_cancel_discards_inflight_run() {
        let model = model_with_prior();
        let started = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        let controller = Arc::new(LearningController::new(
            learning_config(50),
            1_000,
            model.clone(),
            Arc::new(GatedTrainer { started: started.clone(), resume: resume.clone() }),
        ));
        for i in 0..50 {
            controller.on_outcome(linear_outcome(i));
        }

        let worker = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.maybe_retrain(0))
        };
        started.wait();
        controller.cancel_inflight();
        resume.wait();

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(EngineError::TrainingCancelled { .. })));
        assert_eq!(model.active_version().unwrap().id, 0);
    }

    #[test]
    fn test_stale_run_does_not_overwrite_fresher_version() {
        let model = model_with_prior();
        let started = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        let controller = Arc::new(LearningController::new(
            learning_config(50),
            1_000,
            model.clone(),
            Arc::new(GatedTrainer { started: started.clone(), resume: resume.clone() }),
        ));
        for i in 0..50 {
            controller.on_outcome(linear_outcome(i));
        }

        let worker = {
            let controller = controller.clone();
            std::thread::spawn(move || controller.maybe_retrain(0))
        };
        started.wait();
        let mut fresher = ModelVersion::prior(ARITY, 0.01, 5);
        fresher.id = 7;
        let fresher = model.registry().append(fresher).unwrap();
        model.load_version(fresher).unwrap();
        resume.wait();

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(EngineError::TrainingCancelled { .. })));
        assert_eq!(model.active_version().unwrap().id, 7);
    }
}
