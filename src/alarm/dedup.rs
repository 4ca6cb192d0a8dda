//! Seen-alarm cache
//!
//! Remembers alarm ids with the time they were first seen. An id stays known
//! for the TTL (24 hours by default); expired ids are purged at most once per
//! purge interval so a busy poll loop does not rescan the map every cycle.

use chrono::{Duration, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::Alarm;

#[derive(Default)]
struct DedupState {
    /// alarm id -> first seen
    seen: HashMap<String, NaiveDateTime>,
    last_purge: Option<NaiveDateTime>,
}

/// Thread-safe TTL cache of alarm ids
pub struct DeduplicationCache {
    state: Mutex<DedupState>,
    ttl: Duration,
    purge_interval: Duration,
}

impl DeduplicationCache {
    /// Cache with a 24 hour TTL, purged at most hourly
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DedupState::default()),
            ttl: Duration::hours(24),
            purge_interval: Duration::hours(1),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// `true` if the alarm id has not been seen (or has expired and been purged)
    pub fn is_new(&self, alarm: &Alarm) -> bool {
        !self.lock().seen.contains_key(&alarm.id)
    }

    /// Record the alarm. The first-seen time of a known id is kept.
    pub fn mark_seen(&self, alarm: &Alarm, now: NaiveDateTime) {
        self.lock().seen.entry(alarm.id.clone()).or_insert(now);
    }

    /// Keep only alarms not seen before, marking them seen in the same step.
    pub fn filter_new(&self, alarms: Vec<Alarm>, now: NaiveDateTime) -> Vec<Alarm> {
        let mut state = self.lock();
        alarms
            .into_iter()
            .filter(|alarm| {
                if state.seen.contains_key(&alarm.id) {
                    return false;
                }
                state.seen.insert(alarm.id.clone(), now);
                true
            })
            .collect()
    }

    /// Drop every id first seen more than the TTL before `now`.
    /// Returns how many were removed.
    pub fn purge_expired(&self, now: NaiveDateTime) -> usize {
        let mut state = self.lock();
        let before = state.seen.len();
        let ttl = self.ttl;
        state.seen.retain(|_, first_seen| now - *first_seen <= ttl);
        state.last_purge = Some(now);
        let removed = before - state.seen.len();
        if removed > 0 {
            debug!(removed, remaining = state.seen.len(), "Purged expired alarm ids");
        }
        removed
    }

    /// Purge only if the last purge was at least one purge interval ago.
    pub fn maybe_purge(&self, now: NaiveDateTime) -> Option<usize> {
        let due = match self.lock().last_purge {
            Some(last) => now - last >= self.purge_interval,
            None => true,
        };
        due.then(|| self.purge_expired(now))
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().seen.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::test_support::alarm;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 11)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_new_then_seen() {
        let cache = DeduplicationCache::new();
        let a = alarm("Low Voltage", "LHR1459", "C1-LHR-01");

        assert!(cache.is_new(&a));
        cache.mark_seen(&a, t0());
        assert!(!cache.is_new(&a));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_filter_new_is_idempotent() {
        let cache = DeduplicationCache::new();
        let alarms = vec![
            alarm("Low Voltage", "LHR1459", "C1-LHR-01"),
            alarm("CSL Fault", "LHR1460", "C1-LHR-02"),
        ];

        let first = cache.filter_new(alarms.clone(), t0());
        let second = cache.filter_new(alarms, t0() + Duration::seconds(30));

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
    }

    #[test]
    fn test_ttl_purge() {
        // Given: an alarm seen at T
        let cache = DeduplicationCache::new();
        let a = alarm("Low Voltage", "LHR1459", "C1-LHR-01");
        cache.mark_seen(&a, t0());

        // When: purging at T+23h, the id survives
        cache.purge_expired(t0() + Duration::hours(23));
        assert!(!cache.is_new(&a));

        // Then: purging at T+25h removes it
        assert_eq!(cache.purge_expired(t0() + Duration::hours(25)), 1);
        assert!(cache.is_new(&a));
    }

    #[test]
    fn test_mark_seen_keeps_first_seen_time() {
        let cache = DeduplicationCache::new();
        let a = alarm("Low Voltage", "LHR1459", "C1-LHR-01");
        cache.mark_seen(&a, t0());
        cache.mark_seen(&a, t0() + Duration::hours(20));

        cache.purge_expired(t0() + Duration::hours(25));

        assert!(cache.is_new(&a));
    }

    #[test]
    fn test_maybe_purge_runs_at_most_hourly() {
        let cache = DeduplicationCache::new();

        assert!(cache.maybe_purge(t0()).is_some());
        assert!(cache.maybe_purge(t0() + Duration::minutes(59)).is_none());
        assert!(cache.maybe_purge(t0() + Duration::minutes(60)).is_some());
    }
}
