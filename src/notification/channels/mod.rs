//! Channel implementations

pub mod log;
pub mod webhook;

pub use log::LogChannel;
pub use webhook::{WebhookChannel, WebhookConfig};
