//! Dry-run channel: logs each message and reports it as delivered

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use crate::notification::channel::{NotificationChannel, SendResult};
use crate::notification::formatter::preview;

/// Channel that only writes to the log
pub struct LogChannel {
    delivered: AtomicUsize,
}

impl LogChannel {
    pub fn new() -> Self {
        Self {
            delivered: AtomicUsize::new(0),
        }
    }

    /// Messages "delivered" so far
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, destination: &str, body: &str) -> Result<SendResult> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        info!(
            channel = "log",
            group = %destination,
            lines = body.lines().count(),
            preview = %preview(body, 120),
            "[DRY-RUN] Would send message"
        );
        Ok(SendResult::Sent)
    }
}
