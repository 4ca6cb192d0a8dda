//! Channel builder - turns channel settings into a concrete channel

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use super::channel::NotificationChannel;
use super::channels::{LogChannel, WebhookChannel, WebhookConfig};
use crate::config::ChannelSettings;

pub struct ChannelBuilder {
    settings: ChannelSettings,
    dry_run: bool,
}

impl ChannelBuilder {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            settings,
            dry_run: false,
        }
    }

    /// Force the log channel regardless of settings
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn build(self) -> Result<Arc<dyn NotificationChannel>> {
        if self.dry_run {
            info!(channel = "log", "Dry run, messages will only be logged");
            return Ok(Arc::new(LogChannel::new()));
        }

        match self.settings {
            ChannelSettings::Log => {
                info!(channel = "log", "Using log channel");
                Ok(Arc::new(LogChannel::new()))
            }
            ChannelSettings::Webhook {
                url,
                token,
                timeout_secs,
            } => {
                info!(channel = "webhook", url = %url, "Using webhook channel");
                let channel = WebhookChannel::new(WebhookConfig {
                    url,
                    token,
                    timeout_secs,
                })?;
                Ok(Arc::new(channel))
            }
        }
    }
}
