//! Single consumer of the dispatch queue
//!
//! The sender pops one message at a time, calls the channel, retries with a
//! fixed backoff and, once retries are exhausted, hands the failure to an
//! [`OperatorGate`]. A blocking gate pauses the sender until a human
//! acknowledges the failure.

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::channel::{NotificationChannel, SendResult};
use super::formatter::preview;
use super::journal::{DispatchJournal, DispatchRecord, Outcome};
use super::queue::{DispatchQueue, QueuedMessage, SentHistory, SentRecord};
use crate::config::SenderSettings;
use crate::events::{EventBus, PipelineEvent};
use crate::shutdown::Shutdown;

const PREVIEW_CHARS: usize = 80;
/// Granularity of the acknowledgment wait
const ACK_POLL: Duration = Duration::from_secs(1);

/// A message that could not be delivered
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub message: QueuedMessage,
    pub attempts: u32,
    pub error: String,
}

/// Escalation point for undeliverable messages
pub trait OperatorGate: Send + Sync {
    /// Whether [`await_acknowledgment`](Self::await_acknowledgment) pauses the sender
    fn is_blocking(&self) -> bool {
        true
    }

    /// Called after retries are exhausted. Returns once the failure has been
    /// acknowledged or a stop was requested.
    fn await_acknowledgment(&self, failure: &DeliveryFailure, shutdown: &Shutdown);
}

/// Pauses the sender until [`ManualAckGate::acknowledge`] is called
#[derive(Default)]
pub struct ManualAckGate {
    pending: Mutex<Option<DeliveryFailure>>,
    acknowledged: Condvar,
}

impl ManualAckGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release a paused sender. Returns `false` if nothing was waiting.
    pub fn acknowledge(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let released = pending.take().is_some();
        drop(pending);
        if released {
            self.acknowledged.notify_all();
        }
        released
    }

    /// Failure currently waiting for acknowledgment
    pub fn pending(&self) -> Option<DeliveryFailure> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OperatorGate for ManualAckGate {
    fn await_acknowledgment(&self, failure: &DeliveryFailure, shutdown: &Shutdown) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = Some(failure.clone());
        error!(
            group = %failure.message.destination,
            alarm_type = %failure.message.alarm_type,
            attempts = failure.attempts,
            error = %failure.error,
            "Delivery failed, waiting for operator acknowledgment"
        );

        while pending.is_some() {
            if shutdown.is_requested() {
                *pending = None;
                return;
            }
            let (guard, _) = self
                .acknowledged
                .wait_timeout(pending, ACK_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
        info!(group = %failure.message.destination, "Failure acknowledged");
    }
}

/// Logs the failure and lets the sender continue
pub struct LogAndContinueGate;

impl OperatorGate for LogAndContinueGate {
    fn is_blocking(&self) -> bool {
        false
    }

    fn await_acknowledgment(&self, failure: &DeliveryFailure, _shutdown: &Shutdown) {
        error!(
            group = %failure.message.destination,
            alarm_type = %failure.message.alarm_type,
            attempts = failure.attempts,
            error = %failure.error,
            "Message undeliverable, continuing"
        );
    }
}

pub struct Sender {
    queue: Arc<DispatchQueue>,
    channel: Arc<dyn NotificationChannel>,
    gate: Arc<dyn OperatorGate>,
    history: Arc<SentHistory>,
    events: Arc<EventBus>,
    journal: Option<Arc<DispatchJournal>>,
    settings: SenderSettings,
    sent: AtomicUsize,
    failed: AtomicUsize,
}

impl Sender {
    pub fn new(
        queue: Arc<DispatchQueue>,
        channel: Arc<dyn NotificationChannel>,
        gate: Arc<dyn OperatorGate>,
        events: Arc<EventBus>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            queue,
            channel,
            gate,
            history: Arc::new(SentHistory::new(settings.history_size)),
            events,
            journal: None,
            settings,
            sent: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn with_journal(mut self, journal: Arc<DispatchJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn history(&self) -> Arc<SentHistory> {
        self.history.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Sender loop. Returns when a stop is requested; a message already
    /// dequeued is finished first.
    pub fn run(&self, shutdown: &Shutdown) {
        info!(channel = %self.channel.name(), "Sender started");
        while !shutdown.is_requested() {
            if self.run_once(shutdown) {
                shutdown.sleep(Duration::from_millis(self.settings.inter_message_delay_ms));
            }
        }
        info!(
            sent = self.sent_count(),
            failed = self.failed_count(),
            pending = self.queue.len(),
            "Sender stopped"
        );
    }

    /// Wait for one message and deliver it. Returns `false` on timeout.
    pub fn run_once(&self, shutdown: &Shutdown) -> bool {
        let timeout = Duration::from_millis(self.settings.dequeue_timeout_ms);
        match self.queue.dequeue_timeout(timeout) {
            Some(message) => {
                self.deliver(message, shutdown);
                true
            }
            None => false,
        }
    }

    /// Send with retries. Returns whether the message was delivered.
    pub fn deliver(&self, message: QueuedMessage, shutdown: &Shutdown) -> bool {
        let max_attempts = self.settings.max_retries + 1;
        let backoff = Duration::from_millis(self.settings.retry_backoff_ms);
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < max_attempts {
            attempts += 1;
            match self.channel.send(&message.destination, &message.body) {
                Ok(SendResult::Sent) => {
                    self.record_success(&message, attempts);
                    return true;
                }
                Ok(SendResult::Failed(reason)) => last_error = reason,
                Err(e) => last_error = format!("{:#}", e),
            }

            if attempts < max_attempts {
                warn!(
                    group = %message.destination,
                    attempt = attempts,
                    error = %last_error,
                    "Send failed, retrying"
                );
                if !shutdown.sleep(backoff) {
                    debug!(group = %message.destination, "Stop requested during retry backoff");
                    break;
                }
            }
        }

        self.record_failure(message, attempts, last_error, shutdown);
        false
    }

    fn record_success(&self, message: &QueuedMessage, attempts: u32) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let sent_at = Utc::now();
        self.history.push(SentRecord {
            destination: message.destination.clone(),
            alarm_type: message.alarm_type.clone(),
            preview: preview(&message.body, PREVIEW_CHARS),
            sent_at,
            attempts,
        });
        self.journal(message, Outcome::Sent, attempts, None);
        self.events.publish(PipelineEvent::MessageSent {
            group: message.destination.clone(),
            alarm_type: message.alarm_type.clone(),
            attempts,
        });
    }

    fn record_failure(
        &self,
        message: QueuedMessage,
        attempts: u32,
        error: String,
        shutdown: &Shutdown,
    ) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.journal(&message, Outcome::Failed, attempts, Some(error.clone()));
        self.events.publish(PipelineEvent::DeliveryFailed {
            group: message.destination.clone(),
            alarm_type: message.alarm_type.clone(),
            attempts,
            error: error.clone(),
        });

        if shutdown.is_requested() {
            warn!(group = %message.destination, "Message left undelivered at shutdown");
            return;
        }

        let blocking = self.gate.is_blocking();
        if blocking {
            self.events.publish(PipelineEvent::SenderPaused {
                group: message.destination.clone(),
                alarm_type: message.alarm_type.clone(),
            });
        }
        let failure = DeliveryFailure {
            message,
            attempts,
            error,
        };
        self.gate.await_acknowledgment(&failure, shutdown);
        if blocking {
            self.events.publish(PipelineEvent::SenderResumed);
        }
    }

    fn journal(&self, message: &QueuedMessage, outcome: Outcome, attempts: u32, error: Option<String>) {
        let Some(journal) = &self.journal else {
            return;
        };
        let record = DispatchRecord {
            ts: Utc::now(),
            destination: message.destination.clone(),
            alarm_type: message.alarm_type.clone(),
            priority: message.priority,
            outcome,
            attempts,
            preview: preview(&message.body, PREVIEW_CHARS),
            error,
        };
        if let Err(e) = journal.append(&record) {
            warn!(path = %journal.path().display(), error = %e, "Failed to write dispatch journal");
        }
    }
}
