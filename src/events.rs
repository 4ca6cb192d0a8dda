//! Pipeline events
//!
//! Components publish [`PipelineEvent`]s on an [`EventBus`]. Listeners run on
//! the publishing thread; a UI layer must hand events over to its own thread.
//! A panicking listener is logged and does not affect the others.

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info, warn};

use crate::alarm::Destination;
use crate::notification::Priority;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    SourcePolled {
        source: String,
        rows: usize,
        alarms: usize,
        new: usize,
    },
    SourceFailed {
        source: String,
        error: String,
    },
    CycleCompleted {
        sources_ok: usize,
        sources_failed: usize,
        new_alarms: usize,
        baseline_updated: bool,
    },
    InstantTriggered {
        destination: Destination,
        alarm_type: String,
        alarms: usize,
    },
    BatchFlushed {
        alarm_type: String,
        alarms: usize,
        reason: String,
    },
    MessageQueued {
        group: String,
        alarm_type: String,
        priority: Priority,
        sequence: u64,
    },
    MessageSent {
        group: String,
        alarm_type: String,
        attempts: u32,
    },
    DeliveryFailed {
        group: String,
        alarm_type: String,
        attempts: u32,
        error: String,
    },
    SenderPaused {
        group: String,
        alarm_type: String,
    },
    SenderResumed,
}

/// Receives every published event
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Fan-out of events to subscribed listeners
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn publish(&self, event: PipelineEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                warn!(?event, "Event listener panicked");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Logs every event through `tracing`
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::SourcePolled {
                source,
                rows,
                alarms,
                new,
            } => info!(source = %source, rows, alarms, new, "Source polled"),
            PipelineEvent::SourceFailed { source, error } => {
                warn!(source = %source, error = %error, "Source poll failed")
            }
            PipelineEvent::CycleCompleted {
                sources_ok,
                sources_failed,
                new_alarms,
                baseline_updated,
            } => info!(
                sources_ok,
                sources_failed,
                new_alarms,
                baseline_updated,
                "Poll cycle completed"
            ),
            PipelineEvent::InstantTriggered {
                destination,
                alarm_type,
                alarms,
            } => info!(
                destination = %destination,
                alarm_type = %alarm_type,
                alarms,
                "Instant alarm send"
            ),
            PipelineEvent::BatchFlushed {
                alarm_type,
                alarms,
                reason,
            } => info!(alarm_type = %alarm_type, alarms, reason = %reason, "Batch flushed"),
            PipelineEvent::MessageQueued {
                group,
                alarm_type,
                priority,
                sequence,
            } => info!(
                group = %group,
                alarm_type = %alarm_type,
                priority = %priority,
                sequence,
                "Message queued"
            ),
            PipelineEvent::MessageSent {
                group,
                alarm_type,
                attempts,
            } => info!(group = %group, alarm_type = %alarm_type, attempts, "Message sent"),
            PipelineEvent::DeliveryFailed {
                group,
                alarm_type,
                attempts,
                error,
            } => error!(
                group = %group,
                alarm_type = %alarm_type,
                attempts,
                error = %error,
                "Message delivery failed"
            ),
            PipelineEvent::SenderPaused { group, alarm_type } => warn!(
                group = %group,
                alarm_type = %alarm_type,
                "Sender paused, waiting for operator acknowledgment"
            ),
            PipelineEvent::SenderResumed => info!("Sender resumed"),
        }
    }
}
