//! Configuration module
//!
//! Handles loading and validation of the engine configuration. Every threshold is
//! supplied externally and checked at startup; an invalid value is the only error
//! that stops the process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Upper bound for the recovery backoff, so retry timestamps stay in range
pub const MAX_BACKOFF_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_yaml(&content)?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.features;
        anyhow::ensure!(f.staleness_ms > 0, "staleness_ms must be positive");
        anyhow::ensure!(
            !f.sentiment_sources.is_empty(),
            "at least one sentiment source must be configured"
        );
        anyhow::ensure!(
            f.max_missing_sources < f.sentiment_sources.len(),
            "max_missing_sources must be smaller than the number of sentiment sources"
        );
        anyhow::ensure!(
            (-1.0..=1.0).contains(&f.neutral_score),
            "neutral_score must be between -1 and 1"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&f.neutral_confidence),
            "neutral_confidence must be between 0 and 1"
        );

        let m = &self.model;
        anyhow::ensure!(m.window_capacity >= 1, "window_capacity must be at least 1");
        anyhow::ensure!(m.base_horizon_ms > 0, "base_horizon_ms must be positive");
        anyhow::ensure!(m.default_horizon_ms > 0, "default_horizon_ms must be positive");
        anyhow::ensure!(m.min_uncertainty > 0.0, "min_uncertainty must be positive");
        anyhow::ensure!(
            m.prior_uncertainty >= m.min_uncertainty,
            "prior_uncertainty must be at least min_uncertainty"
        );

        let p = &self.policy;
        anyhow::ensure!(p.risk_budget > 0.0, "risk_budget must be positive");
        anyhow::ensure!(p.max_position > 0.0, "max_position must be positive");
        anyhow::ensure!(p.sizing_scale > 0.0, "sizing_scale must be positive");
        anyhow::ensure!(p.default_risk_weight > 0.0, "default_risk_weight must be positive");
        anyhow::ensure!(
            p.risk_weights.values().all(|w| *w > 0.0 && w.is_finite()),
            "risk_weights must be positive"
        );
        anyhow::ensure!(p.min_trade_size >= 0.0, "min_trade_size must not be negative");
        anyhow::ensure!(p.epsilon > 0.0, "policy epsilon must be positive");

        anyhow::ensure!(self.evaluator.epsilon > 0.0, "evaluator epsilon must be positive");

        let l = &self.learning;
        anyhow::ensure!(l.min_samples >= 2, "min_samples must be at least 2");
        anyhow::ensure!(
            l.buffer_capacity >= l.min_samples,
            "buffer_capacity must be at least min_samples"
        );
        anyhow::ensure!(l.error_window >= 1, "error_window must be at least 1");
        anyhow::ensure!(
            l.degradation_threshold > 0.0,
            "degradation_threshold must be positive"
        );
        anyhow::ensure!(
            l.hysteresis_evaluations >= 1,
            "hysteresis_evaluations must be at least 1"
        );
        anyhow::ensure!(
            l.holdout_fraction > 0.0 && l.holdout_fraction < 1.0,
            "holdout_fraction must be between 0 and 1"
        );
        anyhow::ensure!(l.tolerance >= 0.0, "tolerance must not be negative");
        anyhow::ensure!(l.ridge_lambda >= 0.0, "ridge_lambda must not be negative");

        let s = &self.supervisor;
        anyhow::ensure!(s.failure_window_ms > 0, "failure_window_ms must be positive");
        anyhow::ensure!(s.degrade_threshold >= 1, "degrade_threshold must be at least 1");
        anyhow::ensure!(
            s.quarantine_threshold > s.degrade_threshold,
            "quarantine_threshold must exceed degrade_threshold"
        );
        anyhow::ensure!(s.backoff_initial_ms > 0, "backoff_initial_ms must be positive");
        anyhow::ensure!(
            s.backoff_initial_ms <= s.backoff_max_ms,
            "backoff_initial_ms must not exceed backoff_max_ms"
        );
        anyhow::ensure!(
            s.backoff_max_ms <= MAX_BACKOFF_MS,
            "backoff_max_ms must not exceed {} (one week)",
            MAX_BACKOFF_MS
        );
        anyhow::ensure!(s.probe_successes >= 1, "probe_successes must be at least 1");
        anyhow::ensure!(s.call_timeout_ms > 0, "call_timeout_ms must be positive");

        anyhow::ensure!(
            matches!(self.storage.backend.as_str(), "memory" | "jsonl"),
            "storage backend must be 'memory' or 'jsonl'"
        );
        Ok(())
    }

    /// Default config with the metrics exporter disabled
    pub fn default_for_test() -> Self {
        let mut config = Self::default();
        config.telemetry.enable_metrics = false;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Maximum age of a market observation (ms)
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,
    /// Sentiment sources, in feature-slot order
    #[serde(default = "default_sentiment_sources")]
    pub sentiment_sources: Vec<String>,
    /// Number of missing sources filled with the neutral prior
    #[serde(default = "default_max_missing_sources")]
    pub max_missing_sources: usize,
    #[serde(default)]
    pub neutral_score: f64,
    #[serde(default)]
    pub neutral_confidence: f64,
}

fn default_staleness_ms() -> i64 { 60_000 }
fn default_sentiment_sources() -> Vec<String> { vec!["news".to_string(), "social".to_string()] }
fn default_max_missing_sources() -> usize { 1 }

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            staleness_ms: default_staleness_ms(),
            sentiment_sources: default_sentiment_sources(),
            max_missing_sources: default_max_missing_sources(),
            neutral_score: 0.0,
            neutral_confidence: 0.0,
        }
    }
}

impl FeatureConfig {
    /// Feature vector arity implied by this configuration
    pub fn arity(&self) -> usize {
        2 + 2 * self.sentiment_sources.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Sliding window length per symbol
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Horizon the model's unit prediction refers to (ms)
    #[serde(default = "default_base_horizon_ms")]
    pub base_horizon_ms: i64,
    /// Horizon used by the engine loop (ms)
    #[serde(default = "default_horizon_ms")]
    pub default_horizon_ms: i64,
    #[serde(default = "default_min_uncertainty")]
    pub min_uncertainty: f64,
    /// Uncertainty of the bootstrap prior
    #[serde(default = "default_prior_uncertainty")]
    pub prior_uncertainty: f64,
    /// Install a zero-weight prior when no trained version exists
    #[serde(default = "default_true")]
    pub bootstrap_prior: bool,
}

fn default_window_capacity() -> usize { 32 }
fn default_base_horizon_ms() -> i64 { 60_000 }
fn default_horizon_ms() -> i64 { 300_000 }
fn default_min_uncertainty() -> f64 { 1e-4 }
fn default_prior_uncertainty() -> f64 { 0.02 }
fn default_true() -> bool { true }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            base_horizon_ms: default_base_horizon_ms(),
            default_horizon_ms: default_horizon_ms(),
            min_uncertainty: default_min_uncertainty(),
            prior_uncertainty: default_prior_uncertainty(),
            bootstrap_prior: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum absolute position per symbol
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    /// Portfolio-wide budget for sum of |delta * weight| per decision batch
    #[serde(default = "default_risk_budget")]
    pub risk_budget: f64,
    /// Per-symbol risk weights
    #[serde(default)]
    pub risk_weights: HashMap<String, f64>,
    #[serde(default = "default_risk_weight")]
    pub default_risk_weight: f64,
    /// Target size per unit of return/uncertainty
    #[serde(default = "default_sizing_scale")]
    pub sizing_scale: f64,
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_max_position() -> f64 { 100.0 }
fn default_risk_budget() -> f64 { 250.0 }
fn default_risk_weight() -> f64 { 1.0 }
fn default_sizing_scale() -> f64 { 50.0 }
fn default_min_trade_size() -> f64 { 0.01 }
fn default_epsilon() -> f64 { 1e-6 }

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_position: default_max_position(),
            risk_budget: default_risk_budget(),
            risk_weights: HashMap::new(),
            default_risk_weight: default_risk_weight(),
            sizing_scale: default_sizing_scale(),
            min_trade_size: default_min_trade_size(),
            epsilon: default_epsilon(),
        }
    }
}

impl PolicyConfig {
    pub fn risk_weight(&self, symbol: &str) -> f64 {
        self.risk_weights
            .get(symbol)
            .copied()
            .unwrap_or(self.default_risk_weight)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Floor for uncertainty when normalizing errors
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { epsilon: default_epsilon() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// New outcomes required before a cadence-triggered retrain
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Outcomes in the rolling |normalized error| mean
    #[serde(default = "default_error_window")]
    pub error_window: usize,
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: f64,
    /// Consecutive evaluations above threshold before a degradation retrain
    #[serde(default = "default_hysteresis_evaluations")]
    pub hysteresis_evaluations: u32,
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    /// Allowed validation score drop versus the active version
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_ridge_lambda")]
    pub ridge_lambda: f64,
}

fn default_buffer_capacity() -> usize { 2_000 }
fn default_min_samples() -> usize { 50 }
fn default_error_window() -> usize { 20 }
fn default_degradation_threshold() -> f64 { 2.0 }
fn default_hysteresis_evaluations() -> u32 { 10 }
fn default_holdout_fraction() -> f64 { 0.2 }
fn default_tolerance() -> f64 { 1e-5 }
fn default_ridge_lambda() -> f64 { 1e-3 }

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            min_samples: default_min_samples(),
            error_window: default_error_window(),
            degradation_threshold: default_degradation_threshold(),
            hysteresis_evaluations: default_hysteresis_evaluations(),
            holdout_fraction: default_holdout_fraction(),
            tolerance: default_tolerance(),
            ridge_lambda: default_ridge_lambda(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Sliding window for failure counting (ms)
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: i64,
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Consecutive successful probes needed to leave Recovering
    #[serde(default = "default_probe_successes")]
    pub probe_successes: u32,
    /// Timeout for collaborator calls (ms)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_failure_window_ms() -> i64 { 60_000 }
fn default_degrade_threshold() -> u32 { 3 }
fn default_quarantine_threshold() -> u32 { 6 }
fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_probe_successes() -> u32 { 3 }
fn default_call_timeout_ms() -> u64 { 2_000 }
fn default_history_limit() -> usize { 100 }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_window_ms: default_failure_window_ms(),
            degrade_threshold: default_degrade_threshold(),
            quarantine_threshold: default_quarantine_threshold(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            probe_successes: default_probe_successes(),
            call_timeout_ms: default_call_timeout_ms(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Observations between retrain evaluations
    #[serde(default = "default_retrain_interval_ticks")]
    pub retrain_interval_ticks: u64,
    /// Observations between supervisor recovery passes
    #[serde(default = "default_supervise_interval_ticks")]
    pub supervise_interval_ticks: u64,
    /// Event bus capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_retrain_interval_ticks() -> u64 { 25 }
fn default_supervise_interval_ticks() -> u64 { 1 }
fn default_event_capacity() -> usize { 1024 }

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retrain_interval_ticks: default_retrain_interval_ticks(),
            supervise_interval_ticks: default_supervise_interval_ticks(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "jsonl"
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Directory for jsonl logs
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_backend() -> String { "memory".to_string() }
fn default_storage_path() -> String { "data".to_string() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_alerts: bool,
    pub alert_webhook: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
            metrics_port: default_metrics_port(),
            enable_metrics: true,
            enable_alerts: false,
            alert_webhook: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
policy:
  risk_budget: 10.0
  risk_weights:
    BTC: 2.0
supervisor:
  degrade_threshold: 2
  quarantine_threshold: 4
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policy.risk_budget, 10.0);
        assert_eq!(config.policy.risk_weight("BTC"), 2.0);
        assert_eq!(config.policy.risk_weight("ETH"), 1.0);
        assert_eq!(config.supervisor.degrade_threshold, 2);
        assert_eq!(config.features.arity(), 6);
    }

    #[test]
    fn test_unbounded_backoff_rejected() {
        let yaml = format!("supervisor:\n  backoff_max_ms: {}\n", u64::MAX);
        assert!(AppConfig::from_yaml(&yaml).is_err());

        let yaml = format!("supervisor:\n  backoff_max_ms: {}\n", MAX_BACKOFF_MS);
        assert_eq!(AppConfig::from_yaml(&yaml).unwrap().supervisor.backoff_max_ms, MAX_BACKOFF_MS);
    }

    #[test]
    fn test_negative_risk_budget_rejected() {
        let yaml = "policy:\n  risk_budget: -1.0\n";
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("risk_budget"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.supervisor.quarantine_threshold = config.supervisor.degrade_threshold;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.learning.holdout_fraction = 1.0;
        assert!(config.validate().is_err());
    }
}
