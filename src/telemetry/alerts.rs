//! Alert management for notifications
//!
//! Health transitions and rejected candidates arriving on the event bus become
//! alerts: logged locally and, when a webhook is configured, posted to it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::TelemetryConfig;
use crate::engine::event_bus::{spawn_event_handler, Event, EventBus};
use crate::supervisor::HealthTransition;
use crate::utils::types::HealthState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn emoji(&self) -> &str {
        match self {
            AlertLevel::Info => "ℹ️",
            AlertLevel::Warning => "⚠️",
            AlertLevel::Error => "❌",
            AlertLevel::Critical => "🚨",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Alert for a health transition; `None` for transitions not worth paging on
    pub fn for_transition(transition: &HealthTransition) -> Option<Self> {
        let level = match (transition.from, transition.to) {
            (_, HealthState::Quarantined) => AlertLevel::Critical,
            (_, HealthState::Degraded) => AlertLevel::Warning,
            (HealthState::Recovering, HealthState::Healthy) => AlertLevel::Info,
            _ => return None,
        };
        let alert = Self::new(
            level,
            format!("{} {}", transition.component, transition.to),
            format!("{} -> {}: {}", transition.from, transition.to, transition.cause),
        );
        Some(alert.with_details(serde_json::to_value(transition).unwrap_or_default()))
    }
}

pub struct AlertManager {
    enabled: bool,
    webhook_url: Option<String>,
    http_client: reqwest::Client,
}

impl AlertManager {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            enabled: config.enable_alerts,
            webhook_url: config.alert_webhook.clone(),
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn send(&self, alert: Alert) {
        if !self.enabled {
            return;
        }

        match alert.level {
            AlertLevel::Info => info!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Warning => warn!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Error => error!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Critical => error!("[CRITICAL] {}: {}", alert.title, alert.message),
        }

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.send_webhook(url, &alert).await {
                warn!("Failed to send webhook alert: {}", e);
            }
        }
    }

    async fn send_webhook(&self, url: &str, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "text": format!("{} *{}*\n{}", alert.level.emoji(), alert.title, alert.message),
            "details": alert.details,
        });

        self.http_client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Forward alert-worthy bus events to this manager until the bus closes
    pub fn spawn(self: Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        spawn_event_handler(bus, "alerts", move |event| {
            let manager = self.clone();
            async move {
                let alert = match &event {
                    Event::Health(transition) => Alert::for_transition(transition),
                    Event::CandidateRejected { reason } => {
                        Some(Alert::new(AlertLevel::Info, "Candidate model rejected", reason.clone()))
                    }
                    _ => None,
                };
                if let Some(alert) = alert {
                    manager.send(alert).await;
                }
            }
        })
    }
}
