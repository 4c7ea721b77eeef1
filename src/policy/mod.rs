//! Decision Policy
//!
//! Converts forecasts into bounded position-change intents:
//! - Size scales with predicted return over uncertainty
//! - Per-symbol exposure cap
//! - Portfolio-wide budget on sum of |delta * risk weight| per batch
//! - Hold when the forecast is missing or its inputs are quarantined
//!
//! Everything here is a pure function of its arguments. Intents are returned to the
//! caller; nothing in this module talks to execution.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::config::PolicyConfig;
use crate::utils::helpers::clamp;
use crate::utils::types::{DeltaAction, ForecastRecord, HealthState, PositionDelta, PositionState};

/// Limits applied to a single decision
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_position: f64,
    /// Budget still available to this decision
    pub remaining_budget: f64,
    pub risk_weight: f64,
    pub sizing_scale: f64,
    pub min_trade_size: f64,
    pub epsilon: f64,
}

impl RiskLimits {
    pub fn for_symbol(config: &PolicyConfig, symbol: &str, remaining_budget: f64) -> Self {
        Self {
            max_position: config.max_position,
            remaining_budget,
            risk_weight: config.risk_weight(symbol),
            sizing_scale: config.sizing_scale,
            min_trade_size: config.min_trade_size,
            epsilon: config.epsilon,
        }
    }
}

/// Decide the position change for one symbol
pub fn decide(forecast: &ForecastRecord, position: &PositionState, limits: &RiskLimits) -> PositionDelta {
    if forecast.symbol != position.symbol {
        return PositionDelta::hold(position, "forecast/position symbol mismatch");
    }
    if !(limits.risk_weight > 0.0) {
        return PositionDelta::hold(position, "invalid risk weight");
    }

    let conviction = forecast.predicted_return / forecast.uncertainty.max(limits.epsilon);
    let target = clamp(
        limits.sizing_scale * conviction,
        -limits.max_position,
        limits.max_position,
    );

    let mut delta = target - position.size;
    let mut reason = format!(
        "conviction {:.3} (return {:.6}, uncertainty {:.6})",
        conviction, forecast.predicted_return, forecast.uncertainty
    );

    let remaining = limits.remaining_budget.max(0.0);
    let max_delta = remaining / limits.risk_weight;
    if delta.abs() > max_delta {
        delta = delta.signum() * max_delta;
        reason.push_str(", budget-clamped");
    }

    if !delta.is_finite() || delta.abs() < limits.min_trade_size || delta == 0.0 {
        let mut hold = PositionDelta::hold(position, format!("below min trade size: {}", reason));
        hold.forecast_id = Some(forecast.id);
        return hold;
    }

    PositionDelta {
        symbol: position.symbol.clone(),
        forecast_id: Some(forecast.id),
        action: DeltaAction::Adjust,
        delta,
        target_size: position.size + delta,
        risk_cost: (delta.abs() * limits.risk_weight).min(remaining),
        reference_price: 0.0,
        reason,
    }
}

/// One symbol competing for the shared budget
#[derive(Debug, Clone)]
pub struct Candidate {
    pub forecast: Option<ForecastRecord>,
    pub position: PositionState,
    /// Worst health among the components feeding this forecast
    pub input_health: HealthState,
}

/// Decide a batch of symbols against one shared risk budget.
///
/// Budget goes to lower uncertainty first, then larger |predicted return|, then
/// symbol order. Returned intents are in allocation order with holds last. A symbol
/// appearing twice is decided once.
pub fn decide_portfolio(candidates: &[Candidate], config: &PolicyConfig) -> Vec<PositionDelta> {
    let mut holds = Vec::new();
    let mut ranked: Vec<(&ForecastRecord, &PositionState)> = Vec::new();

    for candidate in candidates {
        match &candidate.forecast {
            _ if !candidate.input_health.is_trusted() => holds.push(PositionDelta::hold(
                &candidate.position,
                format!("inputs {}", candidate.input_health),
            )),
            None => holds.push(PositionDelta::hold(&candidate.position, "no forecast")),
            Some(forecast) => ranked.push((forecast, &candidate.position)),
        }
    }

    ranked.sort_by(|(a, _), (b, _)| priority(a, b));

    let mut seen = HashSet::new();
    let mut remaining = config.risk_budget;
    let mut decisions = Vec::with_capacity(candidates.len());
    for (forecast, position) in ranked {
        if !seen.insert(position.symbol.clone()) {
            continue;
        }
        let limits = RiskLimits::for_symbol(config, &position.symbol, remaining);
        let decision = decide(forecast, position, &limits);
        remaining = (remaining - decision.risk_cost).max(0.0);
        decisions.push(decision);
    }

    holds.retain(|h| seen.insert(h.symbol.clone()));
    decisions.extend(holds);
    decisions
}

fn priority(a: &ForecastRecord, b: &ForecastRecord) -> Ordering {
    a.uncertainty
        .partial_cmp(&b.uncertainty)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.predicted_return
                .abs()
                .partial_cmp(&a.predicted_return.abs())
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.symbol.cmp(&b.symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn forecast(symbol: &str, predicted: f64, uncertainty: f64) -> ForecastRecord {
        ForecastRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            issued_at: 0,
            horizon_ms: 60_000,
            predicted_return: predicted,
            uncertainty,
            model_version: 1,
            inputs: vec![],
        }
    }

    fn config(budget: f64) -> PolicyConfig {
        PolicyConfig {
            max_position: 10.0,
            risk_budget: budget,
            sizing_scale: 1.0,
            min_trade_size: 0.01,
            ..PolicyConfig::default()
        }
    }

    fn candidate(f: ForecastRecord) -> Candidate {
        Candidate {
            position: PositionState::flat(f.symbol.clone()),
            forecast: Some(f),
            input_health: HealthState::Healthy,
        }
    }

    #[test]
    fn test_size_scales_inversely_with_uncertainty() {
        let limits = RiskLimits::for_symbol(&config(1_000.0), "A", 1_000.0);
        let flat = PositionState::flat("A");
        let confident = decide(&forecast("A", 0.01, 0.005), &flat, &limits);
        let unsure = decide(&forecast("A", 0.01, 0.01), &flat, &limits);
        assert!((confident.delta - 2.0).abs() < 1e-12);
        assert!((unsure.delta - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_exposure_cap() {
        let limits = RiskLimits::for_symbol(&config(1_000.0), "A", 1_000.0);
        let d = decide(&forecast("A", -1.0, 0.01), &PositionState::flat("A"), &limits);
        assert_eq!(d.target_size, -10.0);
    }

    #[test]
    fn test_budget_clamps_delta() {
        let limits = RiskLimits::for_symbol(&config(3.0), "A", 3.0);
        let d = decide(&forecast("A", 0.1, 0.01), &PositionState::flat("A"), &limits);
        assert_eq!(d.delta, 3.0);
        assert!(d.reason.contains("budget-clamped"));
    }

    #[test]
    fn test_unchanged_target_holds() {
        let limits = RiskLimits::for_symbol(&config(100.0), "A", 100.0);
        let mut position = PositionState::flat("A");
        position.size = 2.0;
        let d = decide(&forecast("A", 0.02, 0.01), &position, &limits);
        assert!(d.is_hold());
    }

    #[test]
    fn test_tie_break_prefers_lower_uncertainty_then_return() {
        let decisions = decide_portfolio(
            &[
                candidate(forecast("HIGH_UNC", 0.5, 0.02)),
                candidate(forecast("SMALL", 0.05, 0.01)),
                candidate(forecast("BIG", 0.08, 0.01)),
            ],
            &config(10.0),
        );
        let order: Vec<&str> = decisions.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(order, vec!["BIG", "SMALL", "HIGH_UNC"]);
        // BIG takes 8, SMALL gets the remaining 2, nothing left for HIGH_UNC
        assert!((decisions[0].delta - 8.0).abs() < 1e-9);
        assert!((decisions[1].delta - 2.0).abs() < 1e-9);
        assert!(decisions[2].is_hold());
    }

    #[test]
    fn test_quarantined_inputs_hold() {
        let mut c = candidate(forecast("A", 0.1, 0.01));
        c.input_health = HealthState::Quarantined;
        let decisions = decide_portfolio(&[c], &config(10.0));
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].is_hold());
        assert_eq!(decisions[0].delta, 0.0);
    }

    #[test]
    fn test_duplicate_symbol_decided_once() {
        let decisions = decide_portfolio(
            &[candidate(forecast("A", 0.05, 0.01)), candidate(forecast("A", 0.05, 0.01))],
            &config(100.0),
        );
        assert_eq!(decisions.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_batch_never_exceeds_budget(
            budget in 0.1f64..100.0,
            entries in prop::collection::vec((-0.2f64..0.2, 0.0001f64..0.1, -20.0f64..20.0), 1..12),
        ) {
            let cfg = config(budget);
            let candidates: Vec<Candidate> = entries
                .iter()
                .enumerate()
                .map(|(i, (ret, unc, size))| {
                    let f = forecast(&format!("S{}", i), *ret, *unc);
                    let mut position = PositionState::flat(f.symbol.clone());
                    position.size = *size;
                    Candidate { forecast: Some(f), position, input_health: HealthState::Healthy }
                })
                .collect();

            let decisions = decide_portfolio(&candidates, &cfg);
            let spent: f64 = decisions
                .iter()
                .map(|d| d.delta.abs() * cfg.risk_weight(&d.symbol))
                .sum();
            prop_assert!(spent <= budget * (1.0 + 1e-9));
            for d in &decisions {
                prop_assert!(d.target_size.abs() <= cfg.max_position + 20.0);
            }
        }
    }
}
