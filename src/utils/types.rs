//! Common types used throughout the engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Symbol identifier
pub type Symbol = String;

/// Millisecond unix timestamp
pub type TimestampMs = i64;

/// Raw market observation for one symbol, as delivered by the data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketObservation {
    /// Source timestamp (ms)
    pub timestamp: TimestampMs,
    /// Last traded price
    pub price: f64,
    /// Previous reference price (e.g. prior bar close)
    pub reference_price: f64,
    /// Traded volume over the bar
    pub volume: f64,
    /// Reference volume (e.g. rolling average)
    pub reference_volume: f64,
}

/// Sentiment reading from one named source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentReading {
    /// Source timestamp (ms)
    pub timestamp: TimestampMs,
    /// Signed sentiment score in [-1, 1]
    pub score: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// Heterogeneous inputs for one symbol at one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInputs {
    pub symbol: Symbol,
    pub market: MarketObservation,
    /// Sentiment readings keyed by source name
    #[serde(default)]
    pub sentiment: HashMap<String, SentimentReading>,
}

/// Fixed-arity feature vector for one symbol at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub symbol: Symbol,
    pub timestamp: TimestampMs,
    pub features: Vec<f64>,
}

impl FeatureVector {
    pub fn arity(&self) -> usize {
        self.features.len()
    }
}

/// Immutable forecast issued by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub id: Uuid,
    pub symbol: Symbol,
    pub issued_at: TimestampMs,
    pub horizon_ms: i64,
    /// Expected log return over the horizon
    pub predicted_return: f64,
    /// Standard deviation of the forecast (non-negative)
    pub uncertainty: f64,
    pub model_version: u64,
    /// Model input row the forecast was computed from
    pub inputs: Vec<f64>,
}

impl ForecastRecord {
    pub fn matures_at(&self) -> TimestampMs {
        self.issued_at + self.horizon_ms
    }
}

/// Current position for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: Symbol,
    /// Signed size (positive = long)
    pub size: f64,
    /// Average entry price of the open size
    pub cost_basis: f64,
    /// |size| * risk weight
    pub risk_consumed: f64,
    pub updated_at: TimestampMs,
}

impl PositionState {
    pub fn flat(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            size: 0.0,
            cost_basis: 0.0,
            risk_consumed: 0.0,
            updated_at: 0,
        }
    }
}

/// What the policy wants done with a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaAction {
    Adjust,
    Hold,
}

/// Position change intent handed to the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDelta {
    pub symbol: Symbol,
    pub forecast_id: Option<Uuid>,
    pub action: DeltaAction,
    /// Signed size change
    pub delta: f64,
    /// Size after the delta is filled
    pub target_size: f64,
    /// |delta| * risk weight
    pub risk_cost: f64,
    /// Price the decision was made at
    pub reference_price: f64,
    pub reason: String,
}

impl PositionDelta {
    pub fn hold(position: &PositionState, reason: impl Into<String>) -> Self {
        Self {
            symbol: position.symbol.clone(),
            forecast_id: None,
            action: DeltaAction::Hold,
            delta: 0.0,
            target_size: position.size,
            risk_cost: 0.0,
            reference_price: 0.0,
            reason: reason.into(),
        }
    }

    pub fn is_hold(&self) -> bool {
        self.action == DeltaAction::Hold
    }
}

/// Fill confirmation returned by the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillConfirmation {
    pub symbol: Symbol,
    /// Signed filled size
    pub size: f64,
    pub price: f64,
    pub timestamp: TimestampMs,
}

/// Realized outcome of a forecast, created once its horizon elapsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub forecast_id: Uuid,
    pub symbol: Symbol,
    pub model_version: u64,
    pub horizon_ms: i64,
    pub realized_return: f64,
    pub predicted_return: f64,
    pub signed_error: f64,
    pub abs_error: f64,
    pub normalized_error: f64,
    /// Model input row of the originating forecast
    pub inputs: Vec<f64>,
    pub timestamp: TimestampMs,
}

/// Monitored component identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentId {
    MarketData(Symbol),
    Sentiment(String),
    ForecastModel,
    DecisionPolicy,
    OutcomeEvaluator,
    LearningController,
    Execution,
    Persistence,
}

impl ComponentId {
    pub fn market_data(symbol: impl Into<Symbol>) -> Self {
        Self::MarketData(symbol.into())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::MarketData(symbol) => write!(f, "market_data:{}", symbol),
            ComponentId::Sentiment(source) => write!(f, "sentiment:{}", source),
            ComponentId::ForecastModel => write!(f, "forecast_model"),
            ComponentId::DecisionPolicy => write!(f, "decision_policy"),
            ComponentId::OutcomeEvaluator => write!(f, "outcome_evaluator"),
            ComponentId::LearningController => write!(f, "learning_controller"),
            ComponentId::Execution => write!(f, "execution"),
            ComponentId::Persistence => write!(f, "persistence"),
        }
    }
}

/// Per-component health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Quarantined,
    Recovering,
}

impl HealthState {
    pub fn code(&self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Recovering => 2,
            HealthState::Quarantined => 3,
        }
    }

    /// Outputs of a component in this state may feed decisions
    pub fn is_trusted(&self) -> bool {
        !matches!(self, HealthState::Quarantined | HealthState::Recovering)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Degraded => write!(f, "DEGRADED"),
            HealthState::Quarantined => write!(f, "QUARANTINED"),
            HealthState::Recovering => write!(f, "RECOVERING"),
        }
    }
}
