//! Adaptive Strategy Engine Library
//!
//! Closed-loop trading decision core: features, forecasts, risk-bounded
//! decisions, outcome evaluation, online retraining and self-healing supervision.

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod features;
pub mod learning;
pub mod model;
pub mod persistence;
pub mod policy;
pub mod position;
pub mod supervisor;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use config::AppConfig;
pub use engine::event_bus::{Event, EventBus};
pub use engine::{Collaborators, EngineHealth, StepReport, StrategyEngine};
pub use error::{EngineError, EngineResult, FailureClass};
pub use supervisor::ResilienceSupervisor;
