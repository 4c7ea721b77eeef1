//! External collaborators: execution venue and market data source

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::utils::types::{ComponentId, FillConfirmation, PositionDelta};
use crate::utils::Clock;

/// Turns position-change intents into confirmed fills
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn execute(&self, intent: &PositionDelta) -> EngineResult<FillConfirmation>;

    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Market data subscription control
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Re-establish the subscription for `symbol`
    async fn resubscribe(&self, symbol: &str) -> EngineResult<()>;
}

/// Fills every intent in full at its reference price
pub struct PaperExecution {
    clock: Arc<dyn Clock>,
    fills: AtomicU64,
}

impl PaperExecution {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            fills: AtomicU64::new(0),
        }
    }

    pub fn fill_count(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExecutionVenue for PaperExecution {
    async fn execute(&self, intent: &PositionDelta) -> EngineResult<FillConfirmation> {
        if intent.is_hold() {
            return Err(EngineError::collaborator(ComponentId::Execution, "hold intents are not executable"));
        }
        if !(intent.reference_price.is_finite() && intent.reference_price > 0.0) {
            return Err(EngineError::collaborator(
                ComponentId::Execution,
                format!("{}: no reference price", intent.symbol),
            ));
        }

        let fill = FillConfirmation {
            symbol: intent.symbol.clone(),
            size: intent.delta,
            price: intent.reference_price,
            timestamp: self.clock.now_millis(),
        };
        let n = self.fills.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "[PAPER] fill #{} {} {:+.4} @ {:.4}",
            n, fill.symbol, fill.size, fill.price
        );
        Ok(fill)
    }
}

/// Data source for pre-recorded input; there is no live subscription to restore
#[derive(Debug, Default)]
pub struct ReplaySource;

#[async_trait]
impl DataSource for ReplaySource {
    async fn resubscribe(&self, symbol: &str) -> EngineResult<()> {
        info!("Replay source: resubscribe requested for {}", symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::{DeltaAction, PositionState};
    use crate::utils::ManualClock;

    fn intent(delta: f64, price: f64) -> PositionDelta {
        PositionDelta {
            symbol: "BTC".to_string(),
            forecast_id: None,
            action: DeltaAction::Adjust,
            delta,
            target_size: delta,
            risk_cost: delta.abs(),
            reference_price: price,
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_paper_fill_at_reference_price() {
        let venue = PaperExecution::new(Arc::new(ManualClock::new(42)));
        let fill = venue.execute(&intent(-1.5, 100.0)).await.unwrap();
        assert_eq!(fill.size, -1.5);
        assert_eq!(fill.price, 100.0);
        assert_eq!(fill.timestamp, 42);
        assert_eq!(venue.fill_count(), 1);
    }

    #[tokio::test]
    async fn test_paper_rejects_hold_and_unpriced() {
        let venue = PaperExecution::new(Arc::new(ManualClock::new(0)));
        assert!(venue.execute(&PositionDelta::hold(&PositionState::flat("BTC"), "x")).await.is_err());
        assert!(venue.execute(&intent(1.0, 0.0)).await.is_err());
        assert_eq!(venue.fill_count(), 0);
    }
}
