//! Resilience Supervisor
//!
//! Tracks health per component and drives the quarantine/recovery cycle:
//! - Transient failures counted in a sliding window step Healthy -> Degraded -> Quarantined
//! - Fatal failures quarantine immediately
//! - Quarantined components are retried with capped exponential backoff
//! - Recovering components return to Healthy after consecutive successful probes
//! - Collaborator futures run under a timeout through [`ResilienceSupervisor::guard`]

pub mod state_machine;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::engine::event_bus::{Event, EventBus};
use crate::error::{EngineError, EngineResult, FailureClass};
use crate::telemetry::metrics;
use crate::utils::helpers::backoff_delay_ms;
use crate::utils::types::{ComponentId, HealthState, TimestampMs};
use crate::utils::Clock;

pub use state_machine::{HealthStateMachine, HealthTransition};

/// Recovery action and health probe for a quarantined component
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Restore the component (reload a model, resubscribe a feed, ...)
    async fn recover(&self, component: &ComponentId) -> EngineResult<()>;

    /// Check the component is serving again
    async fn probe(&self, component: &ComponentId) -> EngineResult<()>;
}

/// Point-in-time view of one component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub component: ComponentId,
    pub state: HealthState,
    pub since: TimestampMs,
    pub failures_in_window: usize,
    pub consecutive_successes: u32,
    pub recovery_attempts: u32,
    pub next_attempt_at: Option<TimestampMs>,
    pub last_error: Option<String>,
}

struct ComponentHealth {
    machine: HealthStateMachine,
    failures: VecDeque<TimestampMs>,
    consecutive_successes: u32,
    recovery_attempts: u32,
    next_attempt_at: Option<TimestampMs>,
    last_error: Option<String>,
}

impl ComponentHealth {
    fn new(component: ComponentId, now: TimestampMs, history_limit: usize) -> Self {
        Self {
            machine: HealthStateMachine::new(component, now, history_limit),
            failures: VecDeque::new(),
            consecutive_successes: 0,
            recovery_attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    fn prune(&mut self, now: TimestampMs, window_ms: i64) {
        while let Some(&oldest) = self.failures.front() {
            if now - oldest > window_ms {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn state(&self) -> HealthState {
        self.machine.current_state()
    }
}

pub struct ResilienceSupervisor {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    components: DashMap<ComponentId, ComponentHealth>,
    handlers: RwLock<HashMap<ComponentId, Arc<dyn RecoveryHandler>>>,
    bus: Option<Arc<EventBus>>,
}

impl ResilienceSupervisor {
    pub fn new(config: SupervisorConfig, clock: Arc<dyn Clock>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            config,
            clock,
            components: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Start tracking a component; optionally with its recovery handler
    pub fn register(&self, component: ComponentId, handler: Option<Arc<dyn RecoveryHandler>>) {
        let now = self.clock.now_millis();
        let history_limit = self.config.history_limit;
        self.components
            .entry(component.clone())
            .or_insert_with(|| ComponentHealth::new(component.clone(), now, history_limit));
        metrics::record_health(&component, HealthState::Healthy);
        if let Some(handler) = handler {
            self.handlers.write().insert(component, handler);
        }
    }

    pub fn status(&self, component: &ComponentId) -> HealthState {
        self.components
            .get(component)
            .map(|h| h.state())
            .unwrap_or(HealthState::Healthy)
    }

    /// Worst state among `components`; untracked components count as healthy
    pub fn worst_of<'a>(&self, components: impl IntoIterator<Item = &'a ComponentId>) -> HealthState {
        components
            .into_iter()
            .map(|c| self.status(c))
            .max_by_key(|s| s.code())
            .unwrap_or(HealthState::Healthy)
    }

    pub fn component_status(&self, component: &ComponentId) -> Option<ComponentStatus> {
        let now = self.clock.now_millis();
        self.components.get(component).map(|h| {
            let failures_in_window = h.failures.iter().filter(|&&t| now - t <= self.config.failure_window_ms).count();
            ComponentStatus {
                component: component.clone(),
                state: h.state(),
                since: h.machine.entered_at(),
                failures_in_window,
                consecutive_successes: h.consecutive_successes,
                recovery_attempts: h.recovery_attempts,
                next_attempt_at: h.next_attempt_at,
                last_error: h.last_error.clone(),
            }
        })
    }

    pub fn snapshot(&self) -> Vec<ComponentStatus> {
        let mut ids: Vec<ComponentId> = self.components.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.component_status(id)).collect()
    }

    pub fn history(&self, component: &ComponentId) -> Vec<HealthTransition> {
        self.components
            .get(component)
            .map(|h| h.machine.history())
            .unwrap_or_default()
    }

    /// Feed a failure into the component's health
    pub fn record_failure(&self, component: &ComponentId, error: &EngineError) -> Option<HealthTransition> {
        let class = error.class();
        if class == FailureClass::Ignored {
            debug!("{}: {} does not affect health", component, error.kind());
            return None;
        }

        let now = self.clock.now_millis();
        metrics::record_component_failure(component);
        let transition = {
            let mut health = self.entry(component, now);
            health.prune(now, self.config.failure_window_ms);
            health.failures.push_back(now);
            health.consecutive_successes = 0;
            health.last_error = Some(error.to_string());
            let failures = health.failures.len() as u32;
            let cause = format!("{} ({} failures in window)", error, failures);

            match (class, health.state()) {
                (_, HealthState::Quarantined) => None,
                (FailureClass::Fatal, _) | (_, HealthState::Recovering) => {
                    self.quarantine(&mut *health, cause, now)
                }
                (_, HealthState::Healthy) if failures >= self.config.degrade_threshold => {
                    health.machine.transition_to_with_reason(HealthState::Degraded, cause, now)
                }
                (_, HealthState::Degraded) if failures >= self.config.quarantine_threshold => {
                    self.quarantine(&mut *health, cause, now)
                }
                _ => None,
            }
        };
        self.publish(transition)
    }

    /// Feed a successful operation into the component's health
    pub fn record_success(&self, component: &ComponentId) -> Option<HealthTransition> {
        let now = self.clock.now_millis();
        let transition = {
            let mut health = self.entry(component, now);
            health.prune(now, self.config.failure_window_ms);
            health.consecutive_successes = health.consecutive_successes.saturating_add(1);
            let enough = health.consecutive_successes >= self.config.probe_successes;

            match health.state() {
                HealthState::Degraded
                    if enough && (health.failures.len() as u32) < self.config.degrade_threshold =>
                {
                    let cause = format!("{} consecutive successes", health.consecutive_successes);
                    self.mark_healthy(&mut *health, cause, now)
                }
                HealthState::Recovering if enough => {
                    let cause = format!("{} consecutive successful probes", health.consecutive_successes);
                    self.mark_healthy(&mut *health, cause, now)
                }
                _ => None,
            }
        };
        self.publish(transition)
    }

    /// Record the outcome of an operation on `component`
    pub fn observe<T>(&self, component: &ComponentId, result: &EngineResult<T>) -> Option<HealthTransition> {
        match result {
            Ok(_) => self.record_success(component),
            Err(e) => self.record_failure(component, e),
        }
    }

    /// Await a collaborator future under the configured timeout and record the result
    pub async fn guard<T, F>(&self, component: ComponentId, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        self.guard_with_timeout(component, timeout, fut).await
    }

    pub async fn guard_with_timeout<T, F>(&self, component: ComponentId, timeout: Duration, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                component: component.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        self.observe(&component, &result);
        result
    }

    /// Advance recovery: start due attempts and probe components in Recovering
    pub async fn run_recovery(&self) -> Vec<HealthTransition> {
        let now = self.clock.now_millis();
        let mut transitions = Vec::new();

        let mut due = Vec::new();
        let mut recovering = Vec::new();
        for entry in self.components.iter() {
            match entry.state() {
                HealthState::Quarantined if entry.next_attempt_at.map_or(true, |t| t <= now) => {
                    due.push(entry.key().clone())
                }
                HealthState::Recovering => recovering.push(entry.key().clone()),
                _ => {}
            }
        }

        for component in due {
            let started = self.with_health(&component, now, |sup, health| {
                health.recovery_attempts += 1;
                health.consecutive_successes = 0;
                let cause = format!("recovery attempt {}", health.recovery_attempts);
                sup.transition(health, HealthState::Recovering, cause, now)
            });
            transitions.extend(started);

            let Some(handler) = self.handler(&component) else {
                debug!("{}: no recovery handler, waiting for live successes", component);
                recovering.push(component);
                continue;
            };
            let timeout = Duration::from_millis(self.config.call_timeout_ms);
            let result = match tokio::time::timeout(timeout, handler.recover(&component)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    component: component.clone(),
                    timeout_ms: self.config.call_timeout_ms,
                }),
            };
            match result {
                Ok(()) => {
                    info!("{}: recovery action completed", component);
                    recovering.push(component);
                }
                Err(e) => {
                    warn!("{}: recovery action failed: {}", component, e);
                    let back = self.with_health(&component, now, |sup, health| {
                        health.last_error = Some(e.to_string());
                        sup.quarantine(health, format!("recovery failed: {}", e), now)
                    });
                    transitions.extend(back);
                }
            }
        }

        // Probes are independent of each other; results are applied in order
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let probes = recovering.into_iter().filter_map(|component| {
            let handler = self.handler(&component)?;
            Some(async move {
                let result = match tokio::time::timeout(timeout, handler.probe(&component)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout {
                        component: component.clone(),
                        timeout_ms: self.config.call_timeout_ms,
                    }),
                };
                (component, result)
            })
        });
        for (component, result) in join_all(probes).await {
            let transition = match &result {
                Ok(()) => self.record_success(&component),
                Err(e) => {
                    warn!("{}: probe failed: {}", component, e);
                    self.record_failure(&component, e)
                }
            };
            transitions.extend(transition);
        }

        transitions
    }

    fn handler(&self, component: &ComponentId) -> Option<Arc<dyn RecoveryHandler>> {
        self.handlers.read().get(component).cloned()
    }

    fn entry(&self, component: &ComponentId, now: TimestampMs) -> dashmap::mapref::one::RefMut<'_, ComponentId, ComponentHealth> {
        let history_limit = self.config.history_limit;
        self.components
            .entry(component.clone())
            .or_insert_with(|| ComponentHealth::new(component.clone(), now, history_limit))
    }

    /// Mutate one component's health and publish the resulting transition
    fn with_health<F>(&self, component: &ComponentId, now: TimestampMs, f: F) -> Option<HealthTransition>
    where
        F: FnOnce(&Self, &mut ComponentHealth) -> Option<HealthTransition>,
    {
        let transition = {
            let mut health = self.entry(component, now);
            f(self, &mut *health)
        };
        self.publish(transition)
    }

    fn transition(
        &self,
        health: &mut ComponentHealth,
        target: HealthState,
        cause: String,
        now: TimestampMs,
    ) -> Option<HealthTransition> {
        health.machine.transition_to_with_reason(target, cause, now)
    }

    fn quarantine(&self, health: &mut ComponentHealth, cause: String, now: TimestampMs) -> Option<HealthTransition> {
        let delay = backoff_delay_ms(
            self.config.backoff_initial_ms,
            self.config.backoff_max_ms,
            health.recovery_attempts,
        );
        health.next_attempt_at = Some(now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX)));
        health.consecutive_successes = 0;
        self.transition(health, HealthState::Quarantined, format!("{}; retry in {}ms", cause, delay), now)
    }

    fn mark_healthy(&self, health: &mut ComponentHealth, cause: String, now: TimestampMs) -> Option<HealthTransition> {
        let transition = self.transition(health, HealthState::Healthy, cause, now);
        if transition.is_some() {
            health.failures.clear();
            health.recovery_attempts = 0;
            health.next_attempt_at = None;
            health.consecutive_successes = 0;
        }
        transition
    }

    fn publish(&self, transition: Option<HealthTransition>) -> Option<HealthTransition> {
        if let Some(t) = &transition {
            metrics::record_health(&t.component, t.to);
            if let Some(bus) = &self.bus {
                bus.publish(Event::Health(t.clone()));
            }
        }
        transition
    }
}
