//! Deterministic batch ordering
//!
//! Alarm types go out in a fixed operational order; within each type,
//! destinations follow the configured MBU list, then B2S companies, then OMO
//! companies. The same alarm set always yields the same batch sequence, no
//! matter in which order the alarms arrived.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use super::formatter::render_batch;
use super::priority::Priority;
use crate::alarm::{Alarm, Destination, DestinationKind, TOGGLE_TYPE};
use crate::config::Settings;

/// Types not listed here follow in lexicographic order.
pub const CANONICAL_TYPE_ORDER: &[&str] = &[
    "CSL Fault",
    "RF Unit Maintenance Link Failure",
    "AC Main Failure",
    "Battery High Temp",
    "Genset Running",
    "Low Voltage",
    "System on Battery",
    TOGGLE_TYPE,
    "Cell Unavailable",
];

/// Alarms for one (destination, type) pair
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub destination: Destination,
    /// Channel group name for the destination
    pub group: String,
    pub alarm_type: String,
    pub alarms: Vec<Alarm>,
    pub is_toggle: bool,
}

/// Batch ready for the queue
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBatch {
    pub group: String,
    pub destination: Destination,
    pub alarm_type: String,
    pub body: String,
    pub priority: Priority,
    pub alarm_count: usize,
}

pub struct DispatchOrderer {
    settings: Arc<Settings>,
}

impl DispatchOrderer {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Configured destinations: MBUs, then B2S companies, then OMO companies
    pub fn destination_order(&self) -> Vec<Destination> {
        DestinationKind::ALL
            .iter()
            .flat_map(|kind| {
                self.settings
                    .groups(*kind)
                    .iter()
                    .map(move |g| Destination::new(*kind, g.id.clone()))
            })
            .collect()
    }

    /// Canonical types first, then any other type present, sorted
    pub fn type_order(&self, alarms: &[Alarm]) -> Vec<String> {
        let extra: BTreeSet<&str> = alarms
            .iter()
            .filter(|a| !a.is_toggle)
            .map(|a| a.alarm_type.as_str())
            .filter(|t| !CANONICAL_TYPE_ORDER.contains(t))
            .collect();

        CANONICAL_TYPE_ORDER
            .iter()
            .copied()
            .chain(extra)
            .map(str::to_string)
            .collect()
    }

    /// Group alarms into ordered batches, applying suppression rules.
    pub fn order_batches(&self, alarms: &[Alarm]) -> Vec<Batch> {
        let destinations = self.destination_order();
        let mut batches = Vec::new();

        for alarm_type in self.type_order(alarms) {
            let is_toggle = alarm_type == TOGGLE_TYPE;
            for destination in &destinations {
                let mut selected: Vec<Alarm> = alarms
                    .iter()
                    .filter(|a| a.batch_type() == alarm_type)
                    .filter(|a| {
                        a.destination().is_some_and(|d| {
                            d.kind == destination.kind && d.id.eq_ignore_ascii_case(&destination.id)
                        })
                    })
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    continue;
                }
                if self.is_suppressed(destination, &alarm_type) {
                    debug!(
                        destination = %destination,
                        alarm_type = %alarm_type,
                        count = selected.len(),
                        "Batch suppressed"
                    );
                    continue;
                }

                sort_alarms(&mut selected);
                let Some(group) = self.settings.group_for(destination.kind, &destination.id) else {
                    continue;
                };
                batches.push(Batch {
                    destination: destination.clone(),
                    group: group.to_string(),
                    alarm_type: alarm_type.clone(),
                    alarms: selected,
                    is_toggle,
                });
            }
        }
        batches
    }

    /// Disabled in the send-control table, or a toggle batch for an MBU that
    /// skips toggles
    pub fn is_suppressed(&self, destination: &Destination, alarm_type: &str) -> bool {
        if alarm_type == TOGGLE_TYPE
            && destination.kind == DestinationKind::Mbu
            && self.settings.skips_toggles(&destination.id)
        {
            return true;
        }
        self.settings
            .send_control
            .is_disabled(destination.kind, &destination.id, alarm_type)
    }

    /// Render a batch with its destination class template
    pub fn render(&self, batch: &Batch) -> RenderedBatch {
        let template = self
            .settings
            .template(batch.destination.kind, batch.is_toggle);
        RenderedBatch {
            group: batch.group.clone(),
            destination: batch.destination.clone(),
            alarm_type: batch.alarm_type.clone(),
            body: render_batch(template, &batch.alarms, &batch.destination),
            priority: Priority::for_type(self.settings.is_instant(&batch.alarm_type)),
            alarm_count: batch.alarms.len(),
        }
    }
}

/// Stable order inside a batch: oldest first
pub fn sort_alarms(alarms: &mut [Alarm]) {
    alarms.sort_by(|a, b| {
        (a.timestamp, &a.site_code, &a.id).cmp(&(b.timestamp, &b.site_code, &b.id))
    });
}
