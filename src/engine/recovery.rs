//! Recovery actions for supervised components

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::model::ForecastModel;
use crate::persistence::Persistence;
use crate::supervisor::RecoveryHandler;
use crate::utils::types::{ComponentId, Symbol, TimestampMs};
use crate::utils::Clock;

use super::venue::{DataSource, ExecutionVenue};

/// Reloads the last-known-good version into the forecast model
pub struct ModelRecovery {
    model: Arc<ForecastModel>,
    store: Arc<dyn Persistence>,
}

impl ModelRecovery {
    pub fn new(model: Arc<ForecastModel>, store: Arc<dyn Persistence>) -> Self {
        Self { model, store }
    }
}

#[async_trait]
impl RecoveryHandler for ModelRecovery {
    async fn recover(&self, component: &ComponentId) -> EngineResult<()> {
        let version = match self.model.registry().last_known_good() {
            Some(version) => version,
            None => {
                let stored = self
                    .store
                    .last_known_good()
                    .await?
                    .ok_or_else(|| EngineError::ModelUnavailable { fallback_available: false })?;
                self.model
                    .registry()
                    .append(stored)
                    .ok_or_else(|| EngineError::collaborator(component.clone(), "stored version rejected by registry"))?
            }
        };
        info!("{}: reloading last-known-good v{}", component, version.id);
        self.model.load_version(version)?;
        Ok(())
    }

    async fn probe(&self, _component: &ComponentId) -> EngineResult<()> {
        match self.model.active_version() {
            Some(_) => Ok(()),
            None => Err(EngineError::ModelUnavailable {
                fallback_available: !self.model.registry().is_empty(),
            }),
        }
    }
}

/// Resubscribes a market data feed; probes pass once fresh data arrives
pub struct FeedRecovery {
    source: Arc<dyn DataSource>,
    symbol: Symbol,
    last_seen: Arc<DashMap<Symbol, TimestampMs>>,
    clock: Arc<dyn Clock>,
    staleness_ms: i64,
}

impl FeedRecovery {
    pub fn new(
        source: Arc<dyn DataSource>,
        symbol: Symbol,
        last_seen: Arc<DashMap<Symbol, TimestampMs>>,
        clock: Arc<dyn Clock>,
        staleness_ms: i64,
    ) -> Self {
        Self { source, symbol, last_seen, clock, staleness_ms }
    }
}

#[async_trait]
impl RecoveryHandler for FeedRecovery {
    async fn recover(&self, _component: &ComponentId) -> EngineResult<()> {
        self.source.resubscribe(&self.symbol).await
    }

    async fn probe(&self, component: &ComponentId) -> EngineResult<()> {
        let now = self.clock.now_millis();
        let last = self.last_seen.get(&self.symbol).map(|t| *t);
        match last {
            Some(ts) if now - ts <= self.staleness_ms => Ok(()),
            Some(ts) => Err(EngineError::StaleData {
                symbol: self.symbol.clone(),
                age_ms: now - ts,
                limit_ms: self.staleness_ms,
            }),
            None => Err(EngineError::collaborator(component.clone(), "no data received yet")),
        }
    }
}

/// Probes the persistence backend
pub struct StoreRecovery {
    store: Arc<dyn Persistence>,
}

impl StoreRecovery {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryHandler for StoreRecovery {
    async fn recover(&self, _component: &ComponentId) -> EngineResult<()> {
        self.store.health_check().await
    }

    async fn probe(&self, _component: &ComponentId) -> EngineResult<()> {
        self.store.health_check().await
    }
}

/// Probes the execution venue
pub struct VenueRecovery {
    venue: Arc<dyn ExecutionVenue>,
}

impl VenueRecovery {
    pub fn new(venue: Arc<dyn ExecutionVenue>) -> Self {
        Self { venue }
    }
}

#[async_trait]
impl RecoveryHandler for VenueRecovery {
    async fn recover(&self, _component: &ComponentId) -> EngineResult<()> {
        self.venue.health_check().await
    }

    async fn probe(&self, _component: &ComponentId) -> EngineResult<()> {
        self.venue.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::{ModelRegistry, ModelVersion};
    use crate::persistence::MemoryStore;
    use crate::utils::ManualClock;

    #[tokio::test]
    async fn test_model_recovery_reloads_stored_version() {
        let model = Arc::new(ForecastModel::new(ModelConfig::default(), 2, Arc::new(ModelRegistry::new())));
        let store = Arc::new(MemoryStore::new());
        let mut stored = ModelVersion::prior(2, 0.01, 0);
        stored.id = 4;
        store.append_version(&stored).await.unwrap();

        let handler = ModelRecovery::new(model.clone(), store);
        assert!(handler.probe(&ComponentId::ForecastModel).await.is_err());
        handler.recover(&ComponentId::ForecastModel).await.unwrap();
        assert_eq!(model.active_version().unwrap().id, 4);
        assert!(handler.probe(&ComponentId::ForecastModel).await.is_ok());
    }

    #[tokio::test]
    async fn test_model_recovery_without_any_version_fails() {
        let model = Arc::new(ForecastModel::new(ModelConfig::default(), 2, Arc::new(ModelRegistry::new())));
        let handler = ModelRecovery::new(model, Arc::new(MemoryStore::new()));
        let err = handler.recover(&ComponentId::ForecastModel).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable { fallback_available: false }));
    }

    #[tokio::test]
    async fn test_feed_probe_requires_fresh_data() {
        let clock = Arc::new(ManualClock::new(100_000));
        let last_seen = Arc::new(DashMap::new());
        let handler = FeedRecovery::new(
            Arc::new(super::super::venue::ReplaySource),
            "BTC".to_string(),
            last_seen.clone(),
            clock.clone(),
            60_000,
        );
        let feed = ComponentId::market_data("BTC");
        assert!(handler.probe(&feed).await.is_err());
        last_seen.insert("BTC".to_string(), 10_000);
        assert!(matches!(handler.probe(&feed).await, Err(EngineError::StaleData { .. })));
        last_seen.insert("BTC".to_string(), 99_000);
        assert!(handler.probe(&feed).await.is_ok());
    }
}
