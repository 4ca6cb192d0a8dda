//! Alarm dispatcher - orders, renders and enqueues alarm batches

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

use super::orderer::{sort_alarms, Batch, DispatchOrderer, RenderedBatch};
use super::queue::DispatchQueue;
use crate::alarm::Alarm;
use crate::config::Settings;
use crate::events::{EventBus, PipelineEvent};
use crate::instant::InstantTrigger;

/// Running totals of enqueued alarms
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    /// Alarms handed to the queue
    pub total_dispatched: usize,
    pub messages_enqueued: usize,
    /// Enqueue attempts rejected by a full queue
    pub messages_rejected: usize,
    /// Keyed by destination id
    pub by_destination: BTreeMap<String, usize>,
    pub by_alarm_type: BTreeMap<String, usize>,
    /// Keyed by `MBU` / `B2S` / `OMO`
    pub by_kind: BTreeMap<String, usize>,
    pub last_dispatch: Option<NaiveDateTime>,
}

impl DispatchStats {
    fn record(&mut self, batch: &RenderedBatch, now: NaiveDateTime) {
        let count = batch.alarm_count;
        self.total_dispatched += count;
        self.messages_enqueued += 1;
        *self
            .by_destination
            .entry(batch.destination.id.clone())
            .or_default() += count;
        *self
            .by_alarm_type
            .entry(batch.alarm_type.clone())
            .or_default() += count;
        *self
            .by_kind
            .entry(batch.destination.kind.as_str().to_string())
            .or_default() += count;
        self.last_dispatch = Some(now);
    }
}

pub struct AlarmDispatcher {
    settings: Arc<Settings>,
    orderer: DispatchOrderer,
    queue: Arc<DispatchQueue>,
    events: Arc<EventBus>,
    stats: Mutex<DispatchStats>,
}

impl AlarmDispatcher {
    pub fn new(settings: Arc<Settings>, queue: Arc<DispatchQueue>, events: Arc<EventBus>) -> Self {
        Self {
            orderer: DispatchOrderer::new(settings.clone()),
            settings,
            queue,
            events,
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    pub fn orderer(&self) -> &DispatchOrderer {
        &self.orderer
    }

    /// Order alarms into batches and enqueue one message per batch.
    /// Returns the number of messages enqueued.
    pub fn dispatch_alarms(&self, alarms: &[Alarm], now: NaiveDateTime) -> usize {
        if alarms.is_empty() {
            return 0;
        }
        self.orderer
            .order_batches(alarms)
            .iter()
            .filter(|batch| self.enqueue(&self.orderer.render(batch), now))
            .count()
    }

    /// Send an instant trigger straight to its destination.
    ///
    /// Suppression rules still apply. Returns whether a message was enqueued.
    pub fn dispatch_instant(&self, trigger: &InstantTrigger, now: NaiveDateTime) -> bool {
        let destination = &trigger.destination;
        if trigger.alarms.is_empty() || self.orderer.is_suppressed(destination, &trigger.alarm_type) {
            debug!(
                destination = %destination,
                alarm_type = %trigger.alarm_type,
                "Instant send suppressed"
            );
            return false;
        }
        let Some(group) = self.settings.group_for(destination.kind, &destination.id) else {
            debug!(destination = %destination, "No group configured for instant destination");
            return false;
        };

        let mut alarms = trigger.alarms.clone();
        sort_alarms(&mut alarms);
        let batch = Batch {
            destination: destination.clone(),
            group: group.to_string(),
            alarm_type: trigger.alarm_type.clone(),
            alarms,
            is_toggle: false,
        };
        self.enqueue(&self.orderer.render(&batch), now)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn enqueue(&self, batch: &RenderedBatch, now: NaiveDateTime) -> bool {
        match self
            .queue
            .enqueue(&batch.group, &batch.body, &batch.alarm_type, batch.priority)
        {
            Ok(sequence) => {
                self.stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(batch, now);
                self.events.publish(PipelineEvent::MessageQueued {
                    group: batch.group.clone(),
                    alarm_type: batch.alarm_type.clone(),
                    priority: batch.priority,
                    sequence,
                });
                true
            }
            Err(e) => {
                self.stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .messages_rejected += 1;
                error!(
                    group = %batch.group,
                    alarm_type = %batch.alarm_type,
                    alarms = batch.alarm_count,
                    error = %e,
                    "Failed to enqueue message"
                );
                false
            }
        }
    }
}
