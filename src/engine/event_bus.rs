//! Event Bus for Internal Communication
//!
//! Broadcast channel carrying engine events (forecasts, intents, fills, outcomes,
//! model promotions, health transitions) to decoupled consumers such as the
//! alert manager.

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::supervisor::HealthTransition;

/// Events broadcast by the engine
#[derive(Debug, Clone)]
pub enum Event {
    ForecastIssued {
        forecast_id: Uuid,
        symbol: String,
        predicted_return: f64,
        uncertainty: f64,
        model_version: u64,
    },

    IntentEmitted {
        symbol: String,
        delta: f64,
        reason: String,
    },

    FillApplied {
        symbol: String,
        size: f64,
        price: f64,
        realized_pnl: f64,
    },

    OutcomeRecorded {
        forecast_id: Uuid,
        symbol: String,
        normalized_error: f64,
    },

    ModelPromoted {
        version: u64,
        validation_score: Option<f64>,
    },

    CandidateRejected {
        reason: String,
    },

    Health(HealthTransition),
}

/// Event bus for broadcasting events to multiple subscribers
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        match self.sender.send(event) {
            Ok(count) => {
                debug!("Event sent to {} receivers", count);
            }
            Err(_) => {
                // No receivers during startup/shutdown
                debug!("No event receivers");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Named receiver that tolerates lag
pub struct EventProcessor {
    receiver: broadcast::Receiver<Event>,
    name: String,
}

impl EventProcessor {
    pub fn new(bus: &EventBus, name: &str) -> Self {
        Self {
            receiver: bus.subscribe(),
            name: name.to_string(),
        }
    }

    /// Next event; skips over lost messages, `None` once the bus is gone
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Event processor '{}' lagged by {} messages", self.name, count);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for processor '{}'", self.name);
                    return None;
                }
            }
        }
    }
}

pub fn spawn_event_handler<F, Fut>(
    bus: &EventBus,
    name: &str,
    mut handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Event) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut processor = EventProcessor::new(bus, name);
    let name = name.to_string();

    tokio::spawn(async move {
        debug!("Event handler '{}' started", name);
        while let Some(event) = processor.next().await {
            handler(event).await;
        }
        debug!("Event handler '{}' stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_pubsub() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.publish(Event::ModelPromoted { version: 7, validation_score: Some(-0.5) });

        match receiver.recv().await.unwrap() {
            Event::ModelPromoted { version, .. } => assert_eq!(version, 7),
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lagging_processor_keeps_going() {
        let bus = EventBus::new(2);
        let mut processor = EventProcessor::new(&bus, "slow");
        for t in 0..5 {
            bus.publish(Event::ModelPromoted { version: t, validation_score: None });
        }
        match processor.next().await.unwrap() {
            Event::ModelPromoted { version, .. } => assert_eq!(version, 3),
            other => panic!("Wrong event type: {:?}", other),
        }
    }
}
