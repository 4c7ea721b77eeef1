//! Position Management Module
//!
//! Single source of truth for current positions:
//! - Per-symbol state, one lock per symbol so fills on the same symbol are
//!   applied in order while different symbols proceed independently
//! - Cost basis and realized P&L tracking
//! - Only confirmed fills mutate state

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::utils::types::{FillConfirmation, PositionState, Symbol};

/// Fill applied to a position
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedFill {
    pub before: PositionState,
    pub after: PositionState,
    pub realized_pnl: f64,
}

/// Position book
pub struct PositionBook {
    positions: DashMap<Symbol, Arc<Mutex<PositionState>>>,
    realized_pnl: Mutex<f64>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
            realized_pnl: Mutex::new(0.0),
        }
    }

    fn slot(&self, symbol: &str) -> Arc<Mutex<PositionState>> {
        self.positions
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PositionState::flat(symbol))))
            .clone()
    }

    /// Current state for a symbol (flat if never traded)
    pub fn get(&self, symbol: &str) -> PositionState {
        self.positions
            .get(symbol)
            .map(|slot| slot.lock().clone())
            .unwrap_or_else(|| PositionState::flat(symbol))
    }

    /// Apply a confirmed fill; `risk_weight` prices the resulting exposure
    pub fn apply_fill(&self, fill: &FillConfirmation, risk_weight: f64) -> AppliedFill {
        let slot = self.slot(&fill.symbol);
        let mut position = slot.lock();
        let before = position.clone();

        let old_size = position.size;
        let new_size = old_size + fill.size;
        let mut realized = 0.0;

        if old_size == 0.0 || old_size.signum() == fill.size.signum() {
            // Opening or adding
            let notional = old_size.abs() * position.cost_basis + fill.size.abs() * fill.price;
            position.cost_basis = if new_size != 0.0 { notional / new_size.abs() } else { 0.0 };
        } else {
            // Reducing, closing or flipping
            let closed = fill.size.abs().min(old_size.abs());
            realized = closed * (fill.price - position.cost_basis) * old_size.signum();
            if new_size == 0.0 {
                position.cost_basis = 0.0;
            } else if new_size.signum() != old_size.signum() {
                position.cost_basis = fill.price;
            }
        }

        position.size = new_size;
        position.risk_consumed = new_size.abs() * risk_weight;
        position.updated_at = position.updated_at.max(fill.timestamp);

        if realized != 0.0 {
            *self.realized_pnl.lock() += realized;
            info!("{}: realized P&L {:.4}", fill.symbol, realized);
        }
        debug!(
            "{}: fill {:+.4} @ {:.4}, size {:.4} -> {:.4}",
            fill.symbol, fill.size, fill.price, old_size, new_size
        );

        AppliedFill {
            before,
            after: position.clone(),
            realized_pnl: realized,
        }
    }

    pub fn all(&self) -> Vec<PositionState> {
        let mut all: Vec<PositionState> = self
            .positions
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    pub fn total_risk(&self) -> f64 {
        self.positions
            .iter()
            .map(|entry| entry.value().lock().risk_consumed)
            .sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        *self.realized_pnl.lock()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}
