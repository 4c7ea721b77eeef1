//! Forecast Model Module
//!
//! Versioned, deterministic forecasting:
//! - Parameter snapshots and immutable model versions
//! - Append-only version registry
//! - Atomic active-version swap with per-symbol feature windows
//! - Cancellable ridge-regression training

pub mod forecaster;
pub mod params;
pub mod registry;
pub mod trainer;

pub use forecaster::ForecastModel;
pub use params::{ModelParameters, ModelVersion, TrainingWindow};
pub use registry::ModelRegistry;
pub use trainer::{CancelToken, ModelTrainer, RidgeTrainer, TrainingSample};
