//! Feature Module
//!
//! Turns raw market and sentiment observations into model-ready feature vectors.

pub mod aggregator;

pub use aggregator::FeatureAggregator;
