//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::utils::types::{ComponentId, HealthState};

const HEALTH_GAUGE_HELP: &str = "Component health (0 healthy, 1 degraded, 2 recovering, 3 quarantined)";

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Forecast metrics
    describe_counter!("ase_forecasts_total", "Forecasts issued");
    describe_counter!("ase_forecast_failures_total", "Forecast attempts that failed");
    describe_histogram!("ase_predict_latency_us", "Forecast latency");

    // Decision metrics
    describe_counter!("ase_intents_total", "Position-change intents emitted");
    describe_counter!("ase_holds_total", "Hold decisions");
    describe_counter!("ase_fills_total", "Confirmed fills applied");
    describe_counter!("ase_execution_failures_total", "Intents the venue failed to fill");
    describe_gauge!("ase_total_risk", "Risk consumed across all positions");
    describe_gauge!("ase_realized_pnl", "Realized P&L");

    // Learning metrics
    describe_counter!("ase_outcomes_total", "Outcomes recorded");
    describe_histogram!("ase_normalized_error_abs", "|normalized error| of recorded outcomes");
    describe_counter!("ase_retrain_attempts_total", "Retrain runs started");
    describe_counter!("ase_promotions_total", "Candidate versions promoted");
    describe_counter!("ase_rejections_total", "Candidate versions discarded");
    describe_gauge!("ase_active_model_version", "Active model version id");

    // Health metrics
    describe_gauge!("ase_component_health", HEALTH_GAUGE_HELP);
    describe_counter!("ase_component_failures_total", "Failures recorded per component");
}

pub fn record_forecast(latency_us: u64) {
    counter!("ase_forecasts_total").increment(1);
    histogram!("ase_predict_latency_us").record(latency_us as f64);
}

pub fn record_forecast_failure() {
    counter!("ase_forecast_failures_total").increment(1);
}

pub fn record_decisions(intents: usize, holds: usize) {
    counter!("ase_intents_total").increment(intents as u64);
    counter!("ase_holds_total").increment(holds as u64);
}

pub fn record_fill(total_risk: f64, realized_pnl: f64) {
    counter!("ase_fills_total").increment(1);
    gauge!("ase_total_risk").set(total_risk);
    gauge!("ase_realized_pnl").set(realized_pnl);
}

pub fn record_execution_failure() {
    counter!("ase_execution_failures_total").increment(1);
}

pub fn record_outcome(normalized_error: f64) {
    counter!("ase_outcomes_total").increment(1);
    histogram!("ase_normalized_error_abs").record(normalized_error.abs());
}

pub fn record_retrain_attempt() {
    counter!("ase_retrain_attempts_total").increment(1);
}

pub fn record_promotion(version: u64) {
    counter!("ase_promotions_total").increment(1);
    gauge!("ase_active_model_version").set(version as f64);
}

pub fn record_rejection() {
    counter!("ase_rejections_total").increment(1);
}

pub fn record_active_version(version: u64) {
    gauge!("ase_active_model_version").set(version as f64);
}

pub fn record_health(component: &ComponentId, state: HealthState) {
    gauge!("ase_component_health", "component" => component.to_string()).set(state.code() as f64);
}

pub fn record_component_failure(component: &ComponentId) {
    counter!("ase_component_failures_total", "component" => component.to_string()).increment(1);
}
