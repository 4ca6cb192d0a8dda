//! Notification channel trait

use anyhow::Result;

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// Delivered
    Sent,
    /// Channel answered but refused the message
    Failed(String),
}

impl SendResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

/// Something that can deliver a rendered message to a named group.
///
/// `send` is synchronous and may fail either with `Err` (transport error) or
/// `Ok(SendResult::Failed)` (the channel rejected the message). The sender
/// treats both as a failed attempt.
pub trait NotificationChannel: Send + Sync {
    /// Channel name for logs
    fn name(&self) -> &str;

    /// Deliver `body` to the group `destination`
    fn send(&self, destination: &str, body: &str) -> Result<SendResult>;
}
