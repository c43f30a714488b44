//! Operational alerts for problems that need a human but must not stop the pipeline

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    pub title: String,
    pub message: String,
    /// Diagnostic key/value context (project, slug, attempts, ...).
    pub context: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            context,
            raised_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Delivery problems are logged, never returned.
    async fn alert(&self, alert: Alert);
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, alert: Alert) {
        error!(title = %alert.title, context = %alert.context, "ALERT: {}", alert.message);
    }
}

/// Logs alerts and also posts them as JSON to a chat/incident webhook
#[derive(Clone)]
pub struct WebhookAlertSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn alert(&self, alert: Alert) {
        LogAlertSink.alert(alert.clone()).await;

        let body = serde_json::json!({
            "text": format!("{}: {}", alert.title, alert.message),
            "alert": alert,
        });
        match self.http.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!("Alert webhook answered {}", response.status()),
            Err(e) => warn!("Could not deliver alert: {}", e),
        }
    }
}
