//! Dispatch priority
//!
//! Lower value is more urgent. The queue drains all priority 1 messages
//! before any priority 2 message, first-in first-out within a tier.

use serde::{Deserialize, Serialize};

/// Message priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Instant alarm types (CSL Fault by default)
    Instant = 1,
    /// Everything else
    Normal = 2,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Instant => "INSTANT",
            Priority::Normal => "NORMAL",
        }
    }

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn for_type(is_instant: bool) -> Self {
        if is_instant {
            Priority::Instant
        } else {
            Priority::Normal
        }
    }
}
