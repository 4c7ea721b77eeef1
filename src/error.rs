//! Engine error taxonomy
//!
//! Component-local errors are never fatal to the pipeline. Each variant maps to a
//! [`FailureClass`] that the resilience supervisor uses to drive health transitions.

use thiserror::Error;

use crate::utils::types::{ComponentId, Symbol};

/// Errors raised by the strategy engine components
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("stale data for {symbol}: observation is {age_ms}ms old (limit {limit_ms}ms)")]
    StaleData {
        symbol: Symbol,
        age_ms: i64,
        limit_ms: i64,
    },

    #[error("insufficient data for {symbol}: {reason}")]
    InsufficientData { symbol: Symbol, reason: String },

    #[error("no servable model version (fallback available: {fallback_available})")]
    ModelUnavailable { fallback_available: bool },

    #[error("horizon not elapsed for forecast {forecast_id}: {remaining_ms}ms remaining")]
    HorizonNotElapsed {
        forecast_id: uuid::Uuid,
        remaining_ms: i64,
    },

    #[error("candidate v{candidate} rejected: score {candidate_score:.6} vs active {active_score:.6} (tolerance {tolerance})")]
    ValidationRegression {
        candidate: u64,
        candidate_score: f64,
        active_score: f64,
        tolerance: f64,
    },

    #[error("training run {epoch} cancelled: {reason}")]
    TrainingCancelled { epoch: u64, reason: String },

    #[error("{component} timed out after {timeout_ms}ms")]
    Timeout {
        component: ComponentId,
        timeout_ms: u64,
    },

    #[error("{component} failed: {message}")]
    Collaborator {
        component: ComponentId,
        message: String,
    },

    #[error("unknown forecast {0}")]
    UnknownForecast(uuid::Uuid),
}

/// How a failure feeds the health state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Counted against the sliding failure window
    Transient,
    /// Quarantines the component immediately
    Fatal,
    /// Caller misuse or a normal learning outcome; health is untouched
    Ignored,
}

impl EngineError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::StaleData { .. }
            | Self::InsufficientData { .. }
            | Self::Timeout { .. }
            | Self::Collaborator { .. } => FailureClass::Transient,
            Self::ModelUnavailable { fallback_available } => {
                if *fallback_available {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            Self::HorizonNotElapsed { .. }
            | Self::ValidationRegression { .. }
            | Self::TrainingCancelled { .. }
            | Self::UnknownForecast(_) => FailureClass::Ignored,
        }
    }

    /// Short label used for metrics and transition causes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StaleData { .. } => "stale_data",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::HorizonNotElapsed { .. } => "horizon_not_elapsed",
            Self::ValidationRegression { .. } => "validation_regression",
            Self::TrainingCancelled { .. } => "training_cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Collaborator { .. } => "collaborator",
            Self::UnknownForecast(_) => "unknown_forecast",
        }
    }

    pub fn collaborator(component: ComponentId, err: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            component,
            message: err.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_unavailable_class_depends_on_fallback() {
        let with = EngineError::ModelUnavailable { fallback_available: true };
        let without = EngineError::ModelUnavailable { fallback_available: false };
        assert_eq!(with.class(), FailureClass::Transient);
        assert_eq!(without.class(), FailureClass::Fatal);
    }

    #[test]
    fn test_misuse_is_ignored() {
        let err = EngineError::HorizonNotElapsed {
            forecast_id: uuid::Uuid::nil(),
            remaining_ms: 10,
        };
        assert_eq!(err.class(), FailureClass::Ignored);
        assert_eq!(err.kind(), "horizon_not_elapsed");
    }
}
