//! Strategy Engine
//!
//! Wires the pipeline together:
//! observation -> features -> forecast -> decision -> execution -> outcome -> learning,
//! with every component reporting into the resilience supervisor.
//!
//! The engine owns no global state. Collaborators (store, venue, data source,
//! trainer) are injected at construction.

pub mod event_bus;
pub mod recovery;
pub mod venue;

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::evaluator::OutcomeEvaluator;
use crate::features::FeatureAggregator;
use crate::learning::{LearningController, LearningStatus};
use crate::model::{ForecastModel, ModelRegistry, ModelTrainer, ModelVersion, RidgeTrainer};
use crate::persistence::Persistence;
use crate::policy::{decide_portfolio, Candidate};
use crate::position::{AppliedFill, PositionBook};
use crate::supervisor::{ComponentStatus, HealthTransition, ResilienceSupervisor};
use crate::telemetry::metrics;
use crate::utils::helpers::elapsed_us;
use crate::utils::types::{
    ComponentId, ForecastRecord, HealthState, OutcomeRecord, PositionDelta, PositionState, RawInputs, Symbol,
    TimestampMs,
};
use crate::utils::Clock;

use event_bus::{Event, EventBus};
use recovery::{FeedRecovery, ModelRecovery, StoreRecovery, VenueRecovery};
use venue::{DataSource, ExecutionVenue};

/// Injected collaborators
pub struct Collaborators {
    pub store: Arc<dyn Persistence>,
    pub venue: Arc<dyn ExecutionVenue>,
    pub source: Arc<dyn DataSource>,
    /// Defaults to ridge regression with the configured lambda
    pub trainer: Option<Arc<dyn ModelTrainer>>,
}

/// Latest accepted data for a symbol
#[derive(Debug, Clone)]
struct SymbolState {
    price: f64,
    observed_at: TimestampMs,
    forecast: Option<ForecastRecord>,
}

/// Open forecast waiting for its horizon
#[derive(Debug, Clone)]
struct PendingForecast {
    forecast: ForecastRecord,
    entry_price: f64,
}

/// Result of one driver step
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub forecast: Option<ForecastRecord>,
    pub intents: Vec<PositionDelta>,
    pub fills: Vec<AppliedFill>,
    pub outcomes: Vec<OutcomeRecord>,
    pub promoted: Option<u64>,
}

/// Observable engine state
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub components: Vec<ComponentStatus>,
    pub active_version: Option<u64>,
    pub registered_versions: usize,
    pub buffered_outcomes: usize,
    pub pending_forecasts: usize,
    pub positions: Vec<PositionState>,
    pub realized_pnl: f64,
}

pub struct StrategyEngine {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    aggregator: FeatureAggregator,
    model: Arc<ForecastModel>,
    evaluator: OutcomeEvaluator,
    learner: Arc<LearningController>,
    supervisor: Arc<ResilienceSupervisor>,
    positions: PositionBook,
    store: Arc<dyn Persistence>,
    venue: Arc<dyn ExecutionVenue>,
    source: Arc<dyn DataSource>,
    bus: Arc<EventBus>,
    symbols: DashMap<Symbol, SymbolState>,
    pending: DashMap<Uuid, PendingForecast>,
    last_seen: Arc<DashMap<Symbol, TimestampMs>>,
    ticks: AtomicU64,
}

impl StrategyEngine {
    pub fn new(config: AppConfig, clock: Arc<dyn Clock>, parts: Collaborators) -> Self {
        let aggregator = FeatureAggregator::new(config.features.clone());
        let registry = Arc::new(ModelRegistry::new());
        let model = Arc::new(ForecastModel::new(config.model.clone(), aggregator.arity(), registry));
        let trainer = parts
            .trainer
            .unwrap_or_else(|| Arc::new(RidgeTrainer::new(config.learning.ridge_lambda)));
        let learner = Arc::new(LearningController::new(
            config.learning.clone(),
            config.model.base_horizon_ms,
            model.clone(),
            trainer,
        ));
        let bus = Arc::new(EventBus::new(config.runtime.event_capacity));
        let supervisor = Arc::new(ResilienceSupervisor::new(
            config.supervisor.clone(),
            clock.clone(),
            Some(bus.clone()),
        ));

        let engine = Self {
            evaluator: OutcomeEvaluator::new(&config.evaluator),
            aggregator,
            model,
            learner,
            supervisor,
            positions: PositionBook::new(),
            store: parts.store,
            venue: parts.venue,
            source: parts.source,
            bus,
            symbols: DashMap::new(),
            pending: DashMap::new(),
            last_seen: Arc::new(DashMap::new()),
            ticks: AtomicU64::new(0),
            clock,
            config,
        };
        engine.register_components();
        engine
    }

    fn register_components(&self) {
        let sup = &self.supervisor;
        sup.register(
            ComponentId::ForecastModel,
            Some(Arc::new(ModelRecovery::new(self.model.clone(), self.store.clone()))),
        );
        sup.register(ComponentId::Persistence, Some(Arc::new(StoreRecovery::new(self.store.clone()))));
        sup.register(ComponentId::Execution, Some(Arc::new(VenueRecovery::new(self.venue.clone()))));
        sup.register(ComponentId::LearningController, None);
        sup.register(ComponentId::DecisionPolicy, None);
        sup.register(ComponentId::OutcomeEvaluator, None);
        for source in self.aggregator.sources() {
            sup.register(ComponentId::Sentiment(source.clone()), None);
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn model(&self) -> &Arc<ForecastModel> {
        &self.model
    }

    pub fn supervisor(&self) -> &Arc<ResilienceSupervisor> {
        &self.supervisor
    }

    pub fn learner(&self) -> &Arc<LearningController> {
        &self.learner
    }

    pub fn position(&self, symbol: &str) -> PositionState {
        self.positions.get(symbol)
    }

    /// Restore the last-known-good version and warm the training buffer
    pub async fn start(&self) -> EngineResult<Option<u64>> {
        let persistence = ComponentId::Persistence;
        let stored = self
            .supervisor
            .guard(persistence.clone(), self.store.last_known_good())
            .await
            .unwrap_or_else(|e| {
                warn!("Could not read last-known-good version: {}", e);
                None
            });

        let restored = match stored {
            Some(version) => self.model.registry().append(version),
            None if self.config.model.bootstrap_prior => {
                let prior = ModelVersion::prior(
                    self.aggregator.arity(),
                    self.config.model.prior_uncertainty,
                    self.clock.now_millis(),
                );
                if let Err(e) = self.supervisor.guard(persistence.clone(), self.store.append_version(&prior)).await {
                    warn!("Could not persist bootstrap prior: {}", e);
                }
                info!("No stored model version, bootstrapping zero-weight prior");
                self.model.registry().append(prior)
            }
            None => None,
        };

        let active = match restored {
            Some(version) => {
                let id = version.id;
                self.model.load_version(version)?;
                metrics::record_active_version(id);
                Some(id)
            }
            None => {
                warn!("Starting without a model version; forecasts unavailable until one is promoted");
                None
            }
        };

        let capacity = self.config.learning.buffer_capacity;
        match self.supervisor.guard(persistence, self.store.recent_outcomes(capacity)).await {
            Ok(outcomes) => {
                let warmed = outcomes.into_iter().filter(|o| self.learner.on_outcome(o.clone())).count();
                if warmed > 0 {
                    info!("Restored {} outcomes into the training buffer", warmed);
                }
            }
            Err(e) => warn!("Could not restore outcomes: {}", e),
        }

        Ok(active)
    }

    /// Ingest one tick of raw inputs and issue a forecast for its symbol.
    ///
    /// `Ok(None)` when the tick was a duplicate or out-of-order delivery.
    pub async fn on_observation(&self, raw: RawInputs) -> EngineResult<Option<ForecastRecord>> {
        let now = self.clock.now_millis();
        let symbol = raw.symbol.clone();
        let feed = ComponentId::market_data(symbol.clone());
        self.ensure_feed(&symbol);

        let missing = self.aggregator.missing_sources(&raw, now);
        for source in self.aggregator.sources() {
            let component = ComponentId::Sentiment(source.clone());
            if missing.contains(&source.as_str()) {
                self.supervisor.record_failure(
                    &component,
                    &EngineError::InsufficientData {
                        symbol: symbol.clone(),
                        reason: format!("no usable {} reading", source),
                    },
                );
            } else {
                self.supervisor.record_success(&component);
            }
        }

        if let Err(e) = self.aggregator.check_market(&symbol, &raw, now) {
            debug!("{}: market data rejected: {}", symbol, e);
            self.supervisor.record_failure(&feed, &e);
            // No forecast stands on rejected data
            self.symbols
                .entry(symbol.clone())
                .and_modify(|s| s.forecast = None)
                .or_insert(SymbolState {
                    price: 0.0,
                    observed_at: raw.market.timestamp,
                    forecast: None,
                });
            return Err(e);
        }
        self.supervisor.record_success(&feed);
        self.last_seen
            .entry(symbol.clone())
            .and_modify(|t| *t = (*t).max(raw.market.timestamp))
            .or_insert(raw.market.timestamp);

        let vector = match self.aggregator.aggregate(&symbol, &raw, now) {
            Ok(vector) => vector,
            Err(e) => {
                // Sentiment gap: already charged to the sources above. The price is
                // still good for settlement, but no forecast is issued on this tick.
                debug!("{}: observation rejected: {}", symbol, e);
                let fresh = SymbolState {
                    price: raw.market.price,
                    observed_at: raw.market.timestamp,
                    forecast: None,
                };
                self.symbols
                    .entry(symbol.clone())
                    .and_modify(|s| {
                        if fresh.observed_at > s.observed_at {
                            *s = fresh.clone();
                        } else {
                            s.forecast = None;
                        }
                    })
                    .or_insert_with(|| fresh.clone());
                return Err(e);
            }
        };

        if !self.model.observe(vector) {
            return Ok(None);
        }
        self.symbols.insert(
            symbol.clone(),
            SymbolState {
                price: raw.market.price,
                observed_at: raw.market.timestamp,
                forecast: None,
            },
        );

        let started = Instant::now();
        let forecast = match self.model.predict_symbol(&symbol, self.config.model.default_horizon_ms) {
            Ok(forecast) => forecast,
            Err(e) => {
                metrics::record_forecast_failure();
                self.supervisor.record_failure(&ComponentId::ForecastModel, &e);
                return Err(e);
            }
        };
        metrics::record_forecast(elapsed_us(started));
        self.supervisor.record_success(&ComponentId::ForecastModel);

        if let Some(mut state) = self.symbols.get_mut(&symbol) {
            state.forecast = Some(forecast.clone());
        }
        self.pending.insert(
            forecast.id,
            PendingForecast {
                forecast: forecast.clone(),
                entry_price: raw.market.price,
            },
        );

        if let Err(e) = self
            .supervisor
            .guard(ComponentId::Persistence, self.store.append_forecast(&forecast))
            .await
        {
            warn!("Forecast {} not persisted: {}", forecast.id, e);
        }
        self.bus.publish(Event::ForecastIssued {
            forecast_id: forecast.id,
            symbol: symbol.clone(),
            predicted_return: forecast.predicted_return,
            uncertainty: forecast.uncertainty,
            model_version: forecast.model_version,
        });
        debug!(
            "{}: forecast {:+.6} ± {:.6} (v{})",
            symbol, forecast.predicted_return, forecast.uncertainty, forecast.model_version
        );

        Ok(Some(forecast))
    }

    fn ensure_feed(&self, symbol: &str) {
        if self.symbols.contains_key(symbol) {
            return;
        }
        let component = ComponentId::market_data(symbol);
        if self.supervisor.component_status(&component).is_some() {
            return;
        }
        let handler = FeedRecovery::new(
            self.source.clone(),
            symbol.to_string(),
            self.last_seen.clone(),
            self.clock.clone(),
            self.config.features.staleness_ms,
        );
        self.supervisor.register(component, Some(Arc::new(handler)));
    }

    /// Decide position changes for every known symbol against one shared budget
    pub fn rebalance(&self) -> Vec<PositionDelta> {
        let now = self.clock.now_millis();
        let mut entries: Vec<(Symbol, SymbolState)> = self
            .symbols
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let candidates: Vec<Candidate> = entries
            .iter()
            .map(|(symbol, state)| {
                let feed = ComponentId::market_data(symbol.clone());
                let input_health = self.supervisor.worst_of([&feed, &ComponentId::ForecastModel]);
                let fresh = now - state.observed_at <= self.config.features.staleness_ms;
                Candidate {
                    forecast: state.forecast.clone().filter(|_| fresh),
                    position: self.positions.get(symbol),
                    input_health,
                }
            })
            .collect();

        let mut decisions = decide_portfolio(&candidates, &self.config.policy);
        for decision in &mut decisions {
            if let Some(state) = self.symbols.get(&decision.symbol) {
                decision.reference_price = state.price;
            }
        }

        let holds = decisions.iter().filter(|d| d.is_hold()).count();
        metrics::record_decisions(decisions.len() - holds, holds);
        self.supervisor.record_success(&ComponentId::DecisionPolicy);
        decisions
    }

    /// Send intents to the venue and apply confirmed fills
    pub async fn execute(&self, intents: &[PositionDelta]) -> Vec<AppliedFill> {
        let execution = ComponentId::Execution;
        let mut applied = Vec::new();
        for intent in intents.iter().filter(|i| !i.is_hold()) {
            if !self.supervisor.status(&execution).is_trusted() {
                debug!("Execution {}: skipping {}", self.supervisor.status(&execution), intent.symbol);
                continue;
            }
            self.bus.publish(Event::IntentEmitted {
                symbol: intent.symbol.clone(),
                delta: intent.delta,
                reason: intent.reason.clone(),
            });

            let fill = match self.supervisor.guard(execution.clone(), self.venue.execute(intent)).await {
                Ok(fill) => fill,
                Err(e) => {
                    metrics::record_execution_failure();
                    warn!("{}: intent {:+.4} not filled: {}", intent.symbol, intent.delta, e);
                    continue;
                }
            };
            if fill.symbol != intent.symbol {
                error!("Venue confirmed {} for an intent on {}; ignoring fill", fill.symbol, intent.symbol);
                continue;
            }

            let result = self
                .positions
                .apply_fill(&fill, self.config.policy.risk_weight(&fill.symbol));
            metrics::record_fill(self.positions.total_risk(), self.positions.realized_pnl());
            self.bus.publish(Event::FillApplied {
                symbol: fill.symbol.clone(),
                size: fill.size,
                price: fill.price,
                realized_pnl: result.realized_pnl,
            });
            applied.push(result);
        }
        applied
    }

    /// Close every pending forecast whose horizon elapsed, at the first price seen
    /// at or after maturity. Forecasts stay pending until such a price arrives.
    pub async fn settle(&self) -> Vec<OutcomeRecord> {
        let now = self.clock.now_millis();
        let mut matured: Vec<PendingForecast> = self
            .pending
            .iter()
            .filter(|p| p.forecast.matures_at() <= now)
            .map(|p| p.value().clone())
            .collect();
        matured.sort_by_key(|p| (p.forecast.matures_at(), p.forecast.symbol.clone()));

        let mut outcomes = Vec::new();
        for pending in matured {
            // Realize only on a price observed at or after maturity
            let matures_at = pending.forecast.matures_at();
            let price = self
                .symbols
                .get(&pending.forecast.symbol)
                .filter(|s| s.observed_at >= matures_at)
                .map(|s| s.price);
            let Some(price) = price.filter(|p| *p > 0.0) else {
                continue;
            };
            let realized = (price / pending.entry_price).ln();
            match self.record_realized(&pending.forecast, realized).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!("Forecast {} could not be settled: {}", pending.forecast.id, e);
                    self.pending.remove(&pending.forecast.id);
                }
            }
        }
        outcomes
    }

    /// Label a forecast with its realized return and feed it to learning.
    ///
    /// Safe to call more than once for the same forecast: the record is identical
    /// and is buffered and persisted only the first time.
    pub async fn record_realized(&self, forecast: &ForecastRecord, realized_return: f64) -> EngineResult<OutcomeRecord> {
        let now = self.clock.now_millis();
        let outcome = match self.evaluator.evaluate(forecast, realized_return, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.supervisor.record_failure(&ComponentId::OutcomeEvaluator, &e);
                return Err(e);
            }
        };
        self.pending.remove(&forecast.id);

        if !self.learner.on_outcome(outcome.clone()) {
            return Ok(outcome);
        }
        metrics::record_outcome(outcome.normalized_error);
        self.supervisor.record_success(&ComponentId::OutcomeEvaluator);
        if let Err(e) = self
            .supervisor
            .guard(ComponentId::Persistence, self.store.append_outcome(&outcome))
            .await
        {
            warn!("Outcome for {} not persisted: {}", outcome.forecast_id, e);
        }
        self.bus.publish(Event::OutcomeRecorded {
            forecast_id: outcome.forecast_id,
            symbol: outcome.symbol.clone(),
            normalized_error: outcome.normalized_error,
        });
        Ok(outcome)
    }

    /// Evaluate the retrain policy off the async runtime and persist any promotion
    pub async fn retrain(&self) -> EngineResult<Option<Arc<ModelVersion>>> {
        let learner = self.learner.clone();
        let now = self.clock.now_millis();
        let component = ComponentId::LearningController;

        let result = tokio::task::spawn_blocking(move || learner.maybe_retrain(now))
            .await
            .map_err(|e| EngineError::collaborator(component.clone(), e))?;

        match result {
            Ok(Some(version)) => {
                metrics::record_retrain_attempt();
                metrics::record_promotion(version.id);
                self.supervisor.record_success(&component);
                if let Err(e) = self
                    .supervisor
                    .guard(ComponentId::Persistence, self.store.append_version(&version))
                    .await
                {
                    error!("Promoted v{} not persisted: {}", version.id, e);
                }
                self.bus.publish(Event::ModelPromoted {
                    version: version.id,
                    validation_score: version.validation_score,
                });
                Ok(Some(version))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                metrics::record_retrain_attempt();
                if matches!(e, EngineError::ValidationRegression { .. } | EngineError::TrainingCancelled { .. }) {
                    metrics::record_rejection();
                    info!("Retrain discarded: {}", e);
                    self.bus.publish(Event::CandidateRejected { reason: e.to_string() });
                } else {
                    warn!("Retrain failed: {}", e);
                }
                self.supervisor.record_failure(&component, &e);
                Err(e)
            }
        }
    }

    /// Run the supervisor's recovery pass
    pub async fn supervise(&self) -> Vec<HealthTransition> {
        self.supervisor.run_recovery().await
    }

    pub fn health(&self) -> EngineHealth {
        let LearningStatus { buffered, .. } = self.learner.status();
        EngineHealth {
            components: self.supervisor.snapshot(),
            active_version: self.model.active_version().map(|v| v.id),
            registered_versions: self.model.registry().len(),
            buffered_outcomes: buffered,
            pending_forecasts: self.pending.len(),
            positions: self.positions.all(),
            realized_pnl: self.positions.realized_pnl(),
        }
    }

    pub fn component_health(&self, component: &ComponentId) -> HealthState {
        self.supervisor.status(component)
    }

    /// One driver iteration: ingest, settle, decide, execute and run periodic work
    pub async fn step(&self, raw: RawInputs) -> StepReport {
        let mut report = StepReport::default();
        match self.on_observation(raw).await {
            Ok(forecast) => report.forecast = forecast,
            Err(e) => debug!("Observation produced no forecast: {}", e),
        }

        report.outcomes = self.settle().await;
        report.intents = self.rebalance();
        report.fills = self.execute(&report.intents).await;

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let runtime = &self.config.runtime;
        if runtime.retrain_interval_ticks > 0 && tick % runtime.retrain_interval_ticks == 0 {
            if let Ok(Some(version)) = self.retrain().await {
                report.promoted = Some(version.id);
            }
        }
        if runtime.supervise_interval_ticks > 0 && tick % runtime.supervise_interval_ticks == 0 {
            self.supervise().await;
        }
        report
    }

    /// Cancel in-flight training and close the store
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.learner.cancel_inflight();
        self.store.close().await?;
        info!(
            "Engine stopped: {} positions, realized P&L {:.4}",
            self.positions.all().len(),
            self.positions.realized_pnl()
        );
        Ok(())
    }
}
