//! Per alarm type batching
//!
//! Each alarm type has a policy:
//! - real time: never buffered, handed straight back to the caller
//! - fixed delay: flushed once the oldest buffered alarm is N minutes old
//! - clock aligned: flushed at fixed minutes of the hour (e.g. `[0, 30]`),
//!   at most once per `"YYYY-MM-DD HH:MM"` bucket
//!
//! Buffers are swapped out on flush, so alarms added while a flush is being
//! dispatched start a fresh batch.

use chrono::{Duration, NaiveDateTime, Timelike};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::alarm::Alarm;
use crate::config::Settings;

/// How an alarm type is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulePolicy {
    RealTime,
    FixedDelay { minutes: u64 },
    ClockAligned { minutes: Vec<u32> },
}

impl SchedulePolicy {
    /// A minute list wins over the delay table; a delay of 0 is real time.
    pub fn resolve(settings: &Settings, alarm_type: &str) -> Self {
        if let Some(minutes) = settings.flush_minutes(alarm_type) {
            return SchedulePolicy::ClockAligned {
                minutes: minutes.to_vec(),
            };
        }
        match settings.timing_minutes(alarm_type) {
            0 => SchedulePolicy::RealTime,
            minutes => SchedulePolicy::FixedDelay { minutes },
        }
    }

    pub fn is_real_time(&self) -> bool {
        matches!(self, SchedulePolicy::RealTime)
    }
}

/// Result of adding an alarm
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Real-time type: send now
    Immediate(Alarm),
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushReason {
    Delay,
    Clock { bucket: String },
    Forced,
}

/// Alarms released from one type's buffer
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    pub alarm_type: String,
    pub alarms: Vec<Alarm>,
    pub reason: FlushReason,
}

#[derive(Debug, Default)]
struct ScheduledBuffer {
    alarms: Vec<Alarm>,
    batch_start: Option<NaiveDateTime>,
    sent_bucket_keys: HashSet<String>,
}

impl ScheduledBuffer {
    fn take(&mut self) -> Vec<Alarm> {
        self.batch_start = None;
        std::mem::take(&mut self.alarms)
    }
}

/// Timer state for every batched alarm type
pub struct BatchScheduler {
    settings: Arc<Settings>,
    buffers: Mutex<HashMap<String, ScheduledBuffer>>,
}

impl BatchScheduler {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy_for(&self, alarm_type: &str) -> SchedulePolicy {
        SchedulePolicy::resolve(&self.settings, alarm_type)
    }

    /// Buffer an alarm under its type, or hand it back if the type is real time.
    pub fn add(&self, alarm: Alarm, now: NaiveDateTime) -> Admission {
        if self.policy_for(&alarm.alarm_type).is_real_time() {
            return Admission::Immediate(alarm);
        }

        let mut buffers = self.lock();
        let buffer = buffers.entry(alarm.alarm_type.clone()).or_default();
        if buffer.alarms.is_empty() {
            buffer.batch_start = Some(now);
        }
        buffer.alarms.push(alarm);
        Admission::Buffered
    }

    /// Add many alarms; returns the real-time ones.
    pub fn add_all(&self, alarms: Vec<Alarm>, now: NaiveDateTime) -> Vec<Alarm> {
        alarms
            .into_iter()
            .filter_map(|alarm| match self.add(alarm, now) {
                Admission::Immediate(alarm) => Some(alarm),
                Admission::Buffered => None,
            })
            .collect()
    }

    /// Advance every type's timer to `now` and return the batches that are due.
    pub fn tick(&self, now: NaiveDateTime) -> Vec<FlushedBatch> {
        let mut buffers = self.lock();
        let current_hour = now.format("%Y-%m-%d %H").to_string();
        let bucket = now.format("%Y-%m-%d %H:%M").to_string();

        let mut types: Vec<String> = buffers.keys().cloned().collect();
        types.sort();

        let mut flushed = Vec::new();
        for alarm_type in types {
            let policy = self.policy_for(&alarm_type);
            let Some(buffer) = buffers.get_mut(&alarm_type) else {
                continue;
            };

            buffer
                .sent_bucket_keys
                .retain(|key| key.starts_with(&current_hour));

            if buffer.alarms.is_empty() {
                continue;
            }
            let start = match buffer.batch_start {
                Some(start) => start,
                None => {
                    warn!(alarm_type = %alarm_type, "Buffer had no batch start, resetting to now");
                    buffer.batch_start = Some(now);
                    now
                }
            };

            let reason = match &policy {
                SchedulePolicy::RealTime => Some(FlushReason::Forced),
                SchedulePolicy::FixedDelay { minutes } => {
                    (now - start >= delay(*minutes)).then_some(FlushReason::Delay)
                }
                SchedulePolicy::ClockAligned { minutes } => {
                    let due = minutes.contains(&now.minute())
                        && !buffer.sent_bucket_keys.contains(&bucket);
                    due.then(|| FlushReason::Clock {
                        bucket: bucket.clone(),
                    })
                }
            };

            if let Some(reason) = reason {
                if let FlushReason::Clock { bucket } = &reason {
                    buffer.sent_bucket_keys.insert(bucket.clone());
                }
                let alarms = buffer.take();
                debug!(alarm_type = %alarm_type, count = alarms.len(), ?reason, "Flushing batch");
                flushed.push(FlushedBatch {
                    alarm_type,
                    alarms,
                    reason,
                });
            }
        }
        flushed
    }

    /// Flush every non-empty buffer regardless of policy.
    pub fn force_flush(&self) -> Vec<FlushedBatch> {
        let mut buffers = self.lock();
        let mut types: Vec<String> = buffers
            .iter()
            .filter(|(_, b)| !b.alarms.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();

        types
            .into_iter()
            .filter_map(|alarm_type| {
                let alarms = buffers.get_mut(&alarm_type)?.take();
                Some(FlushedBatch {
                    alarm_type,
                    alarms,
                    reason: FlushReason::Forced,
                })
            })
            .collect()
    }

    /// Flush a single type (case-insensitive). `None` if nothing is pending.
    pub fn force_flush_type(&self, alarm_type: &str) -> Option<FlushedBatch> {
        let mut buffers = self.lock();
        let (key, buffer) = buffers
            .iter_mut()
            .find(|(t, b)| t.eq_ignore_ascii_case(alarm_type) && !b.alarms.is_empty())?;
        Some(FlushedBatch {
            alarm_type: key.clone(),
            alarms: buffer.take(),
            reason: FlushReason::Forced,
        })
    }

    /// Buffered alarm count per type (non-empty buffers only)
    pub fn pending_counts(&self) -> BTreeMap<String, usize> {
        self.lock()
            .iter()
            .filter(|(_, b)| !b.alarms.is_empty())
            .map(|(t, b)| (t.clone(), b.alarms.len()))
            .collect()
    }

    /// When each non-empty buffer will next flush if nothing is forced
    pub fn next_flush_times(&self, now: NaiveDateTime) -> BTreeMap<String, NaiveDateTime> {
        let buffers = self.lock();
        let mut out = BTreeMap::new();
        for (alarm_type, buffer) in buffers.iter().filter(|(_, b)| !b.alarms.is_empty()) {
            let next = match self.policy_for(alarm_type) {
                SchedulePolicy::RealTime => Some(now),
                SchedulePolicy::FixedDelay { minutes } => buffer
                    .batch_start
                    .unwrap_or(now)
                    .checked_add_signed(delay(minutes)),
                SchedulePolicy::ClockAligned { minutes } => {
                    next_clock_time(now, &minutes, &buffer.sent_bucket_keys)
                }
            };
            if let Some(next) = next {
                out.insert(alarm_type.clone(), next);
            }
        }
        out
    }

    /// Drop every buffered alarm and bucket record.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScheduledBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_clock_time(
    now: NaiveDateTime,
    minutes: &[u32],
    sent: &HashSet<String>,
) -> Option<NaiveDateTime> {
    let hour_start = now.with_minute(0)?.with_second(0)?.with_nanosecond(0)?;
    let this_hour = minutes.iter().find_map(|m| {
        let at = hour_start + Duration::minutes(*m as i64);
        let key = at.format("%Y-%m-%d %H:%M").to_string();
        (*m >= now.minute() && !sent.contains(&key)).then_some(at)
    });
    this_hour.or_else(|| {
        minutes
            .first()
            .map(|m| hour_start + Duration::hours(1) + Duration::minutes(*m as i64))
    })
}

/// Fixed-delay window; saturates instead of overflowing for huge settings.
fn delay(minutes: u64) -> Duration {
    i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::test_support::alarm;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 11)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn scheduler_with(f: impl FnOnce(&mut Settings)) -> BatchScheduler {
        let mut settings = Settings::default();
        f(&mut settings);
        settings.validate().unwrap();
        BatchScheduler::new(Arc::new(settings))
    }

    #[test]
    fn test_policy_resolution() {
        let scheduler = scheduler_with(|s| {
            s.hourly_minute_map
                .insert("cell_unavailable".to_string(), vec![0, 30]);
        });
        assert_eq!(scheduler.policy_for("CSL Fault"), SchedulePolicy::RealTime);
        assert_eq!(
            scheduler.policy_for("Low Voltage"),
            SchedulePolicy::FixedDelay { minutes: 30 }
        );
        assert_eq!(
            scheduler.policy_for("Cell Unavailable"),
            SchedulePolicy::ClockAligned {
                minutes: vec![0, 30]
            }
        );
    }

    #[test]
    fn test_real_time_bypasses_buffer() {
        let scheduler = scheduler_with(|_| {});
        let csl = alarm("CSL Fault", "LHR0001", "C1-LHR-01");

        assert_eq!(scheduler.add(csl.clone(), at(5, 0, 0)), Admission::Immediate(csl));
        assert!(scheduler.pending_counts().is_empty());
    }

    #[test]
    fn test_fixed_delay_flushes_after_window() {
        let scheduler = scheduler_with(|_| {});
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(5, 0, 0));
        scheduler.add(alarm("Low Voltage", "LHR0002", "C1-LHR-01"), at(5, 10, 0));

        assert!(scheduler.tick(at(5, 29, 59)).is_empty());

        let flushed = scheduler.tick(at(5, 30, 0));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].alarm_type, "Low Voltage");
        assert_eq!(flushed[0].alarms.len(), 2);
        assert_eq!(flushed[0].reason, FlushReason::Delay);

        // A new alarm starts a new window
        scheduler.add(alarm("Low Voltage", "LHR0003", "C1-LHR-01"), at(5, 31, 0));
        assert!(scheduler.tick(at(5, 45, 0)).is_empty());
        assert_eq!(scheduler.tick(at(6, 1, 0)).len(), 1);
    }

    #[test]
    fn test_huge_delay_never_flushes_and_spares_other_types() {
        // Unvalidated settings can still carry an out of range delay
        let mut settings = Settings::default();
        settings.timing.insert("ac_main_failure".to_string(), 1 << 60);
        settings.timing.insert("low_voltage".to_string(), u64::MAX);
        let scheduler = BatchScheduler::new(Arc::new(settings));

        scheduler.add(alarm("AC Main Failure", "LHR0001", "C1-LHR-01"), at(5, 0, 0));
        scheduler.add(alarm("Low Voltage", "LHR0002", "C1-LHR-01"), at(5, 0, 0));
        scheduler.add(alarm("System On Battery", "LHR0003", "C1-LHR-01"), at(5, 0, 0));

        let flushed = scheduler.tick(at(5, 30, 0));

        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].alarm_type, "System On Battery");
        assert!(!scheduler
            .next_flush_times(at(5, 30, 0))
            .contains_key("Low Voltage"));
    }

    #[test]
    fn test_clock_bucket_flushes_once() {
        // Given: a clock-aligned policy on minutes [0, 30]
        let scheduler = scheduler_with(|s| {
            s.hourly_minute_map
                .insert("low_voltage".to_string(), vec![0, 30]);
        });
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(4, 50, 0));

        // When: two ticks land in minute 0 of the same hour
        let first = scheduler.tick(at(5, 0, 0));
        scheduler.add(alarm("Low Voltage", "LHR0002", "C1-LHR-01"), at(5, 0, 1));
        let second = scheduler.tick(at(5, 0, 2));

        // Then: only the first flushes
        assert_eq!(first.len(), 1);
        assert_eq!(
            first[0].reason,
            FlushReason::Clock {
                bucket: "2025-12-11 05:00".to_string()
            }
        );
        assert!(second.is_empty());

        // The held alarm goes out at the next configured minute
        assert!(scheduler.tick(at(5, 15, 0)).is_empty());
        assert_eq!(scheduler.tick(at(5, 30, 0)).len(), 1);
    }

    #[test]
    fn test_clock_keys_pruned_each_hour() {
        let scheduler = scheduler_with(|s| {
            s.hourly_minute_map.insert("low_voltage".to_string(), vec![0]);
        });
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(4, 59, 0));
        assert_eq!(scheduler.tick(at(5, 0, 0)).len(), 1);

        scheduler.add(alarm("Low Voltage", "LHR0002", "C1-LHR-01"), at(5, 20, 0));
        assert_eq!(scheduler.tick(at(6, 0, 0)).len(), 1);
    }

    #[test]
    fn test_force_flush_ignores_policy() {
        let scheduler = scheduler_with(|_| {});
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(5, 0, 0));
        scheduler.add(alarm("AC Main Failure", "LHR0002", "C1-LHR-01"), at(5, 0, 0));

        let flushed = scheduler.force_flush();

        let types: Vec<_> = flushed.iter().map(|b| b.alarm_type.as_str()).collect();
        assert_eq!(types, vec!["AC Main Failure", "Low Voltage"]);
        assert!(flushed.iter().all(|b| b.reason == FlushReason::Forced));
        assert!(scheduler.pending_counts().is_empty());
        assert!(scheduler.force_flush().is_empty());
    }

    #[test]
    fn test_force_flush_type() {
        let scheduler = scheduler_with(|_| {});
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(5, 0, 0));
        scheduler.add(alarm("AC Main Failure", "LHR0002", "C1-LHR-01"), at(5, 0, 0));

        let batch = scheduler.force_flush_type("low voltage").unwrap();

        assert_eq!(batch.alarm_type, "Low Voltage");
        assert!(scheduler.force_flush_type("Low Voltage").is_none());
        assert_eq!(scheduler.pending_counts().get("AC Main Failure"), Some(&1));
    }

    #[test]
    fn test_next_flush_times() {
        let scheduler = scheduler_with(|s| {
            s.hourly_minute_map
                .insert("cell_unavailable".to_string(), vec![15, 45]);
        });
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(5, 10, 0));
        scheduler.add(alarm("Cell Unavailable", "LHR0002", "C1-LHR-01"), at(5, 10, 0));

        let next = scheduler.next_flush_times(at(5, 20, 0));

        assert_eq!(next["Low Voltage"], at(5, 40, 0));
        assert_eq!(next["Cell Unavailable"], at(5, 45, 0));

        let later = scheduler.next_flush_times(at(5, 50, 0));
        assert_eq!(later["Cell Unavailable"], at(6, 15, 0));
    }

    #[test]
    fn test_clear() {
        let scheduler = scheduler_with(|_| {});
        scheduler.add(alarm("Low Voltage", "LHR0001", "C1-LHR-01"), at(5, 0, 0));
        scheduler.clear();
        assert!(scheduler.pending_counts().is_empty());
    }
}
