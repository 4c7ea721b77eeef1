//! Component Health State Machine
//!
//! Lifecycle of a single supervised component:
//! - Healthy: operating normally
//! - Degraded: repeated transient failures, output still used
//! - Quarantined: output ignored, waiting for the next recovery attempt
//! - Recovering: recovery action taken, being probed

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::utils::types::{ComponentId, HealthState, TimestampMs};

/// Health transition record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub component: ComponentId,
    pub from: HealthState,
    pub to: HealthState,
    pub timestamp: TimestampMs,
    pub cause: String,
}

/// Health state machine for one component
#[derive(Debug)]
pub struct HealthStateMachine {
    component: ComponentId,
    current: HealthState,
    entered_at: TimestampMs,
    history: VecDeque<HealthTransition>,
    max_history: usize,
}

impl HealthStateMachine {
    pub fn new(component: ComponentId, now: TimestampMs, max_history: usize) -> Self {
        Self {
            component,
            current: HealthState::Healthy,
            entered_at: now,
            history: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn current_state(&self) -> HealthState {
        self.current
    }

    pub fn entered_at(&self) -> TimestampMs {
        self.entered_at
    }

    /// Check if transition is valid
    ///
    /// Healthy -> Quarantined is structurally allowed; callers only take it for
    /// fatal failures.
    pub fn can_transition_to(&self, target: HealthState) -> bool {
        use HealthState::*;

        matches!(
            (self.current, target),
            (Healthy, Degraded)
                | (Healthy, Quarantined)
                | (Degraded, Healthy)
                | (Degraded, Quarantined)
                | (Quarantined, Recovering)
                | (Recovering, Healthy)
                | (Recovering, Quarantined)
        )
    }

    /// Transition with a cause; returns the recorded transition if it was valid
    pub fn transition_to_with_reason(
        &mut self,
        target: HealthState,
        cause: impl Into<String>,
        now: TimestampMs,
    ) -> Option<HealthTransition> {
        if !self.can_transition_to(target) {
            warn!(
                "Invalid health transition for {}: {} -> {}",
                self.component, self.current, target
            );
            return None;
        }

        let transition = HealthTransition {
            component: self.component.clone(),
            from: self.current,
            to: target,
            timestamp: now,
            cause: cause.into(),
        };

        if target == HealthState::Healthy {
            info!(
                "{}: {} -> {} ({})",
                self.component, transition.from, target, transition.cause
            );
        } else {
            warn!(
                "{}: {} -> {} ({})",
                self.component, transition.from, target, transition.cause
            );
        }

        self.current = target;
        self.entered_at = now;

        self.history.push_back(transition.clone());
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }

        Some(transition)
    }

    pub fn history(&self) -> Vec<HealthTransition> {
        self.history.iter().cloned().collect()
    }
}
