//! HTTP webhook channel
//!
//! POSTs `{"group": ..., "message": ...}` to a gateway that forwards the
//! message to the chat group. The gateway answers `{"ok": bool, "error": ...}`.

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::notification::channel::{NotificationChannel, SendResult};

/// Webhook channel settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Gateway endpoint, e.g. `http://localhost:9080/send`
    pub url: String,
    /// Bearer token; empty means no auth header
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9080/send".to_string(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    group: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Channel backed by a blocking HTTP client
#[derive(Debug)]
pub struct WebhookChannel {
    client: Client,
    config: WebhookConfig,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            bail!("webhook url is required");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }
}

impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(&self, destination: &str, body: &str) -> Result<SendResult> {
        let mut request = self
            .client
            .post(&self.config.url)
            .json(&WebhookPayload {
                group: destination,
                message: body,
            });
        if !self.config.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.token));
        }

        let response = request.send().context("HTTP request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Ok(SendResult::Failed(format!("gateway returned {}", status)));
        }

        let parsed: WebhookResponse = response
            .json()
            .context("Failed to parse gateway response")?;
        debug!(group = %destination, ok = parsed.ok, "Webhook response");

        if parsed.ok {
            Ok(SendResult::Sent)
        } else {
            Ok(SendResult::Failed(
                parsed.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }
}
