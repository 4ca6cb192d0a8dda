//! End-to-end tests for the poll / schedule / dispatch pipeline

use alarm_relay::notification::Priority;
use alarm_relay::{
    AlarmSource, EventListener, LogAndContinueGate, NotificationChannel, OperatorCommand, Pipeline,
    PipelineEvent, RawRow, SendResult, Settings, Shutdown, SiteRecord, StaticDirectory,
};
use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const CSL_SOURCE: &str = "CSL Fault";
const ALL_SOURCE: &str = "All Alarms";

/// In-memory snapshots per source; sources can be switched to fail
#[derive(Default)]
struct MockSource {
    rows: Mutex<HashMap<String, Vec<RawRow>>>,
    failing: Mutex<HashSet<String>>,
}

impl MockSource {
    fn set(&self, source: &str, lines: &[&str]) {
        let rows = lines.iter().filter_map(|l| RawRow::from_line(l)).collect();
        self.rows.lock().unwrap().insert(source.to_string(), rows);
    }

    fn fail(&self, source: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(source.to_string());
        } else {
            set.remove(source);
        }
    }
}

impl AlarmSource for MockSource {
    fn fetch_current_alarms(&self, source_id: &str) -> Result<Vec<RawRow>> {
        if self.failing.lock().unwrap().contains(source_id) {
            bail!("export for {} timed out", source_id);
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records every delivered (group, body) pair
#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, destination: &str, body: &str) -> Result<SendResult> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), body.to_string()));
        Ok(SendResult::Sent)
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<PipelineEvent>>,
}

impl EventListener for EventLog {
    fn on_event(&self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct Harness {
    pipeline: Arc<Pipeline>,
    source: Arc<MockSource>,
    channel: Arc<RecordingChannel>,
    events: Arc<EventLog>,
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.sources = vec![CSL_SOURCE.to_string(), ALL_SOURCE.to_string()];
    settings.poll_interval_secs = 1;
    settings.sender.max_retries = 1;
    settings.sender.retry_backoff_ms = 1;
    settings.sender.inter_message_delay_ms = 0;
    settings.sender.dequeue_timeout_ms = 20;
    settings.sender.operator_ack = false;
    settings
}

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_site("LHR1459", SiteRecord::for_mbu("C1-LHR-01"))
        .with_site("LHR6931", SiteRecord::for_mbu("C1-LHR-01"))
        .with_site("LHR0002", SiteRecord::for_mbu("C1-LHR-02"))
        .with_site(
            "LHR9147",
            SiteRecord::for_mbu("C1-LHR-04")
                .with_b2s("Edotco")
                .with_ring_id("LHR60")
                .with_destination_id("e.coPK000506PU"),
        )
}

fn harness_with(settings: Settings) -> Harness {
    let source = Arc::new(MockSource::default());
    let channel = Arc::new(RecordingChannel::default());
    let events = Arc::new(EventLog::default());
    let pipeline = Pipeline::builder(settings)
        .with_source(source.clone())
        .with_directory(Arc::new(directory()))
        .with_channel(channel.clone())
        .with_gate(Arc::new(LogAndContinueGate))
        .with_listener(events.clone())
        .build()
        .unwrap();
    Harness {
        pipeline: Arc::new(pipeline),
        source,
        channel,
        events,
    }
}

fn harness() -> Harness {
    harness_with(test_settings())
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 12, 11)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// Drain the queue through the sender on this thread
fn drain(h: &Harness) {
    let shutdown = Shutdown::new();
    while !h.pipeline.queue_snapshot().is_empty() {
        h.pipeline.sender().run_once(&shutdown);
    }
}

const LOW_VOLTAGE_ROW: &str =
    "-\tMajor\tLow Voltage\t12-11-2025 05:20:03\tLTE_LHR1459__S_Eden_Value_Homes_MDLH4515";
const TOGGLE_ROW: &str =
    "Toggle alarm\t-\tMajor\tLow Voltage\t12-11-2025 05:20:03\tLTE_LHR6931__S_Model_Town";
const CSL_ROW: &str =
    "-\tCritical\tCSL Fault\t12-11-2025 02:43:32\tLTE_LHR9147__S_RajputPark";
const CSL_ROW_2: &str =
    "-\tCritical\tCSL Fault\t12-11-2025 02:50:10\tLTE_LHR0002__S_Shadman";

#[test]
fn test_low_voltage_row_is_buffered() {
    // Given: a single Low Voltage row for a C1-LHR-01 site
    let h = harness();
    h.source.set(ALL_SOURCE, &[LOW_VOLTAGE_ROW]);

    // When: one poll cycle runs
    let report = h.pipeline.poll_cycle(at(5, 21));

    // Then: the alarm waits in the Low Voltage buffer, nothing is queued yet
    assert_eq!(report.alarms, 1);
    assert_eq!(report.new_alarms, 1);
    assert_eq!(report.instant_messages, 0);
    assert_eq!(
        h.pipeline.pending_counts().get("Low Voltage"),
        Some(&1)
    );
    assert!(h.pipeline.queue_snapshot().is_empty());
    assert_eq!(
        h.pipeline.next_flush_times(at(5, 21)).get("Low Voltage"),
        Some(&(at(5, 21) + ChronoDuration::minutes(30)))
    );
}

#[test]
fn test_fixed_delay_flush_after_window() {
    let h = harness();
    h.source.set(ALL_SOURCE, &[LOW_VOLTAGE_ROW]);
    h.pipeline.poll_cycle(at(5, 21));

    assert_eq!(h.pipeline.tick(at(5, 50)), 0);
    assert_eq!(h.pipeline.tick(at(5, 51)), 1);

    let queued = h.pipeline.queue_snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].destination, "C1-LHR-MBU-01");
    assert_eq!(queued[0].priority, Priority::Normal);
    assert_eq!(
        queued[0].body,
        "Low Voltage\t12-11-2025 05:20:03\tLHR1459__S_Eden_Value_Homes_MDLH4515"
    );
    assert!(h.pipeline.pending_counts().is_empty());
}

#[test]
fn test_repeated_poll_does_not_requeue() {
    let h = harness();
    h.source.set(ALL_SOURCE, &[LOW_VOLTAGE_ROW]);

    let first = h.pipeline.poll_cycle(at(5, 21));
    let second = h.pipeline.poll_cycle(at(5, 22));

    assert_eq!(first.new_alarms, 1);
    assert_eq!(second.new_alarms, 0);
    assert_eq!(h.pipeline.pending_counts().get("Low Voltage"), Some(&1));
    assert_eq!(h.pipeline.dedup_len(), 1);
}

#[test]
fn test_toggle_row_goes_to_toggle_batch() {
    let h = harness();
    h.source.set(ALL_SOURCE, &[TOGGLE_ROW]);
    h.pipeline.poll_cycle(at(5, 21));

    assert_eq!(h.pipeline.force_flush(at(5, 22)), 1);

    let queued = h.pipeline.queue_snapshot();
    assert_eq!(queued[0].alarm_type, "Toggle");
    assert!(queued[0].body.starts_with("Toggle alarm\tMajor\tLow Voltage\t"));
}

#[test]
fn test_toggle_row_skipped_for_toggle_free_mbu() {
    // Given: LHR9147 belongs to C1-LHR-04, which never receives toggles
    let h = harness();
    h.source.set(
        ALL_SOURCE,
        &["Toggle alarm\t-\tMajor\tLow Voltage\t12-11-2025 05:20:03\tLTE_LHR9147__S_RajputPark"],
    );
    h.pipeline.poll_cycle(at(5, 21));

    // When: the buffer is flushed
    let queued = h.pipeline.force_flush(at(5, 22));

    // Then: the toggle batch is suppressed
    assert_eq!(queued, 0);
    assert!(h.pipeline.queue_snapshot().is_empty());
}

#[test]
fn test_instant_first_cycle_sends_to_mbu_and_company() {
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);

    let report = h.pipeline.poll_cycle(at(3, 0));

    // C1-LHR-04 and its B2S company both hear about it
    assert_eq!(report.instant_messages, 2);
    assert!(report.baseline_updated);
    let queued = h.pipeline.queue_snapshot();
    assert!(queued.iter().all(|m| m.priority == Priority::Instant));
    let groups: Vec<&str> = queued.iter().map(|m| m.destination.as_str()).collect();
    assert_eq!(groups, vec!["MBU C1-LHR-04", "Jazz~edotco C1 & C4"]);
    assert_eq!(
        queued[1].body,
        "C1-LHR-04\tLHR60\tCSL Fault\tLHR9147__S_RajputPark\t12-11-2025 02:43:32\te.coPK000506PU"
    );
    // Real-time instant types are not buffered a second time
    assert!(h.pipeline.pending_counts().is_empty());
}

#[test]
fn test_instant_unchanged_sites_send_nothing() {
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);
    h.pipeline.poll_cycle(at(3, 0));
    h.pipeline.clear_queue();

    let report = h.pipeline.poll_cycle(at(3, 1));

    assert_eq!(report.instant_messages, 0);
    assert!(h.pipeline.queue_snapshot().is_empty());
}

#[test]
fn test_instant_new_site_resends_active_set() {
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);
    h.pipeline.poll_cycle(at(3, 0));
    h.pipeline.clear_queue();

    // A second MBU gets a CSL fault; C1-LHR-04 is unchanged
    h.source.set(CSL_SOURCE, &[CSL_ROW, CSL_ROW_2]);
    let report = h.pipeline.poll_cycle(at(3, 1));

    assert_eq!(report.instant_messages, 1);
    let queued = h.pipeline.queue_snapshot();
    assert_eq!(queued[0].destination, "MBU C1-LHR-02");
    assert!(queued[0].body.contains("LHR0002__S_Shadman"));
}

#[test]
fn test_source_failure_keeps_baseline() {
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);
    h.source.fail(ALL_SOURCE, true);

    let first = h.pipeline.poll_cycle(at(3, 0));
    assert_eq!(first.sources_failed, 1);
    assert!(!first.baseline_updated);
    assert_eq!(first.instant_messages, 2);
    h.pipeline.clear_queue();

    // The partial cycle's sites carry over, so recovery announces nothing
    h.source.fail(ALL_SOURCE, false);
    let second = h.pipeline.poll_cycle(at(3, 1));
    assert!(second.baseline_updated);
    assert_eq!(second.instant_messages, 0);

    let events = h.events.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::SourceFailed { source, .. } if source == ALL_SOURCE
    )));
}

#[test]
fn test_source_down_announces_instant_alarm_once() {
    // Given: one CSL alarm and a source that never comes back
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);
    h.source.fail(ALL_SOURCE, true);

    // When: five cycles run
    let sent: usize = (0..5)
        .map(|i| h.pipeline.poll_cycle(at(3, i)).instant_messages)
        .sum();

    // Then: only the first cycle announced it, to the MBU and the B2S company
    assert_eq!(sent, 2);
    assert_eq!(h.pipeline.queue_snapshot().len(), 2);
}

#[test]
fn test_instant_messages_jump_the_queue() {
    let h = harness();
    h.source.set(ALL_SOURCE, &[LOW_VOLTAGE_ROW]);
    h.pipeline.poll_cycle(at(5, 21));
    h.pipeline.force_flush(at(5, 22));

    h.source.set(CSL_SOURCE, &[CSL_ROW]);
    h.pipeline.poll_cycle(at(5, 23));
    drain(&h);

    let groups: Vec<String> = h.channel.sent().into_iter().map(|(g, _)| g).collect();
    assert_eq!(
        groups,
        vec!["MBU C1-LHR-04", "Jazz~edotco C1 & C4", "C1-LHR-MBU-01"]
    );
    assert_eq!(h.pipeline.sent_history().len(), 3);
}

#[test]
fn test_clock_aligned_bucket_sends_once() {
    let mut settings = test_settings();
    settings
        .hourly_minute_map
        .insert("low_voltage".to_string(), vec![0, 30]);
    let h = harness_with(settings);
    h.source.set(ALL_SOURCE, &[LOW_VOLTAGE_ROW]);
    h.pipeline.poll_cycle(at(5, 21));

    assert_eq!(h.pipeline.tick(at(5, 29)), 0);
    assert_eq!(h.pipeline.tick(at(5, 30)), 1);

    // A second alarm in the same minute waits for the next bucket
    h.source.set(
        ALL_SOURCE,
        &[
            LOW_VOLTAGE_ROW,
            "-\tMajor\tLow Voltage\t12-11-2025 05:29:00\tLTE_LHR0002__S_Shadman",
        ],
    );
    h.pipeline.poll_cycle(at(5, 30));
    assert_eq!(h.pipeline.tick(at(5, 30)), 0);
    assert_eq!(h.pipeline.tick(at(6, 0)), 1);
}

#[test]
fn test_stats_track_destinations() {
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);
    h.pipeline.poll_cycle(at(3, 0));

    let stats = h.pipeline.stats();
    assert_eq!(stats.total_dispatched, 2);
    assert_eq!(stats.by_kind.get("MBU"), Some(&1));
    assert_eq!(stats.by_kind.get("B2S"), Some(&1));
    assert_eq!(stats.by_destination.get("Edotco"), Some(&1));
}

#[test]
fn test_start_and_stop_threads() {
    let h = harness();
    h.source.set(CSL_SOURCE, &[CSL_ROW]);

    let handle = h.pipeline.start().unwrap();

    let started = Instant::now();
    while h.channel.sent().len() < 2 {
        assert!(started.elapsed() < Duration::from_secs(5), "no delivery");
        thread::sleep(Duration::from_millis(10));
    }

    assert!(handle.stop(Duration::from_secs(5)));
    assert!(h.events.events.lock().unwrap().iter().any(|e| matches!(
        e,
        PipelineEvent::MessageSent { .. }
    )));
}

#[test]
fn test_builder_requires_source() {
    let result = Pipeline::builder(test_settings())
        .with_directory(Arc::new(directory()))
        .build();
    assert!(result.is_err());
}

#[test]
fn test_operator_flush_commands() {
    let h = harness();
    h.source.set(ALL_SOURCE, &[LOW_VOLTAGE_ROW]);
    h.pipeline.poll_cycle(at(5, 21));

    let status = OperatorCommand::parse("status")
        .unwrap()
        .execute(&h.pipeline, None, at(5, 22));
    assert!(status.contains("Low Voltage 1"));

    let reply = OperatorCommand::parse("flush AC Main Failure")
        .unwrap()
        .execute(&h.pipeline, None, at(5, 22));
    assert_eq!(reply, "Nothing buffered for AC Main Failure");
    assert!(h.pipeline.queue_snapshot().is_empty());

    OperatorCommand::parse("flush low voltage")
        .unwrap()
        .execute(&h.pipeline, None, at(5, 22));
    assert_eq!(h.pipeline.queue_snapshot().len(), 1);
    assert!(h.pipeline.pending_counts().is_empty());
}
