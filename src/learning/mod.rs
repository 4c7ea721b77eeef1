//! Adaptive learning
//!
//! Outcome buffering, retrain triggers and guarded promotion of new model versions.

pub mod buffer;
pub mod controller;

pub use buffer::TrainingBuffer;
pub use controller::{LearningController, LearningStatus, RetrainTrigger};
