//! New-site detection for instant alarm types
//!
//! Instant types (CSL Fault by default) are announced as soon as a site shows
//! up that was not in the previous full poll cycle. The announcement carries
//! every currently active alarm of that type for the destination, not just
//! the new one.
//!
//! The baseline is only replaced when every source of the cycle was polled
//! successfully, so one source timing out never looks like its alarms cleared.
//! A partial cycle still adds what it saw, so nothing is announced twice.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::alarm::{Alarm, Destination};

/// Identity of an instant alarm occurrence across cycles
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteEntry {
    pub site_code: String,
    pub timestamp_raw: String,
}

impl SiteEntry {
    fn of(alarm: &Alarm) -> Self {
        Self {
            site_code: alarm.site_code.clone(),
            timestamp_raw: alarm.timestamp_raw.clone(),
        }
    }
}

/// Immediate send request for one destination
#[derive(Debug, Clone, PartialEq)]
pub struct InstantTrigger {
    pub destination: Destination,
    pub alarm_type: String,
    pub alarms: Vec<Alarm>,
}

#[derive(Default)]
struct DiffState {
    /// Entries per alarm type from the last fully successful cycle, plus
    /// anything seen by partial cycles since. `None` before the first cycle.
    baseline: Option<HashMap<String, HashSet<SiteEntry>>>,
    /// Entries seen so far this cycle
    current: HashMap<String, HashSet<SiteEntry>>,
    /// Active alarms seen so far this cycle, per type
    active: HashMap<String, Vec<Alarm>>,
    /// (destination, type) pairs already announced this cycle
    triggered: HashSet<(Destination, String)>,
}

/// Per-cycle diff of instant alarm sites against the previous cycle
pub struct InstantDiffTracker {
    instant_types: Vec<String>,
    state: Mutex<DiffState>,
}

impl InstantDiffTracker {
    pub fn new(instant_types: Vec<String>) -> Self {
        Self {
            instant_types,
            state: Mutex::new(DiffState::default()),
        }
    }

    pub fn is_instant(&self, alarm_type: &str) -> bool {
        self.instant_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(alarm_type))
    }

    /// Start a poll cycle: forget this cycle's entries and trigger marks.
    pub fn begin_cycle(&self) {
        let mut state = self.lock();
        state.current.clear();
        state.active.clear();
        state.triggered.clear();
    }

    /// Feed one source's alarms. Returns the immediate sends this source's
    /// new sites cause, at most one per (destination, type) per cycle.
    pub fn observe(&self, alarms: &[Alarm]) -> Vec<InstantTrigger> {
        let mut state = self.lock();
        let mut fresh: Vec<(Destination, String)> = Vec::new();

        for alarm in alarms
            .iter()
            .filter(|a| !a.is_toggle && self.is_instant(&a.alarm_type))
        {
            let entry = SiteEntry::of(alarm);
            if !state
                .current
                .entry(alarm.alarm_type.clone())
                .or_default()
                .insert(entry.clone())
            {
                continue;
            }
            state
                .active
                .entry(alarm.alarm_type.clone())
                .or_default()
                .push(alarm.clone());

            let is_new = match &state.baseline {
                None => true,
                Some(baseline) => !baseline
                    .get(&alarm.alarm_type)
                    .is_some_and(|entries| entries.contains(&entry)),
            };
            if !is_new {
                continue;
            }

            for destination in alarm.instant_destinations() {
                let key = (destination, alarm.alarm_type.clone());
                if !state.triggered.contains(&key) && !fresh.contains(&key) {
                    fresh.push(key);
                }
            }
        }

        // Assemble after the whole batch is recorded so every trigger carries
        // all active alarms this source reported.
        let mut triggers = Vec::with_capacity(fresh.len());
        for (destination, alarm_type) in fresh {
            let mut active: Vec<Alarm> = state
                .active
                .get(&alarm_type)
                .map(|list| {
                    list.iter()
                        .filter(|a| a.instant_destinations().contains(&destination))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            active.sort_by(|a, b| {
                (a.timestamp, &a.site_code, &a.id).cmp(&(b.timestamp, &b.site_code, &b.id))
            });
            debug!(
                destination = %destination,
                alarm_type = %alarm_type,
                alarms = active.len(),
                "Instant alarm triggered"
            );
            state
                .triggered
                .insert((destination.clone(), alarm_type.clone()));
            triggers.push(InstantTrigger {
                destination,
                alarm_type,
                alarms: active,
            });
        }
        triggers
    }

    /// Close the cycle. The baseline becomes this cycle's entries only when
    /// every source succeeded; otherwise this cycle's entries are merged in
    /// and nothing is removed. Returns whether the baseline was replaced.
    pub fn finish_cycle(&self, all_sources_ok: bool) -> bool {
        let mut state = self.lock();
        let current = std::mem::take(&mut state.current);
        state.triggered.clear();
        if all_sources_ok {
            state.baseline = Some(current);
            return true;
        }

        debug!("Source failure this cycle, merging into previous instant baseline");
        let baseline = state.baseline.get_or_insert_with(HashMap::new);
        for (alarm_type, entries) in current {
            baseline.entry(alarm_type).or_default().extend(entries);
        }
        false
    }

    /// Copy of the committed baseline
    pub fn baseline(&self) -> Option<HashMap<String, HashSet<SiteEntry>>> {
        self.lock().baseline.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DiffState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
