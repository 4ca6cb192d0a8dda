//! Application root: wires the components together and runs the three loops
//!
//! ```text
//! AlarmSource -> AlarmIngestor -> DeduplicationCache -> BatchScheduler
//!                      |                                     |
//!                      +-> InstantDiffTracker ---------------+-> AlarmDispatcher
//!                                                                  |
//!                                  NotificationChannel <- Sender <- DispatchQueue
//! ```
//!
//! The poll loop runs once per configured interval, the tick loop once per
//! second, and the sender loop drains the queue. Each component guards its
//! own state; the pipeline never holds one component's lock while calling
//! into another.

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::alarm::{AlarmIngestor, DeduplicationCache};
use crate::config::Settings;
use crate::events::{EventBus, EventListener, PipelineEvent, TracingListener};
use crate::instant::InstantDiffTracker;
use crate::notification::{
    AlarmDispatcher, ChannelBuilder, DispatchJournal, DispatchQueue, DispatchStats,
    LogAndContinueGate, ManualAckGate, NotificationChannel, OperatorGate, QueuedMessage, Sender,
    SentRecord,
};
use crate::scheduler::{BatchScheduler, FlushReason};
use crate::shutdown::Shutdown;
use crate::source::{AlarmSource, Directory};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub rows: usize,
    pub alarms: usize,
    /// Alarms not seen before
    pub new_alarms: usize,
    pub instant_messages: usize,
    /// Messages for real-time types enqueued during the cycle
    pub immediate_messages: usize,
    pub baseline_updated: bool,
}

pub struct PipelineBuilder {
    settings: Settings,
    source: Option<Arc<dyn AlarmSource>>,
    directory: Option<Arc<dyn Directory>>,
    channel: Option<Arc<dyn NotificationChannel>>,
    gate: Option<Arc<dyn OperatorGate>>,
    journal: Option<Arc<DispatchJournal>>,
    listeners: Vec<Arc<dyn EventListener>>,
    dry_run: bool,
}

impl PipelineBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            source: None,
            directory: None,
            channel: None,
            gate: None,
            journal: None,
            listeners: Vec::new(),
            dry_run: false,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn AlarmSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Override the channel built from settings
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn OperatorGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Override the journal configured by `journal` / `journal_path`
    pub fn with_journal(mut self, journal: Arc<DispatchJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let mut settings = self.settings;
        settings.validate().context("Invalid settings")?;
        let Some(source) = self.source else {
            bail!("an alarm source is required");
        };
        let Some(directory) = self.directory else {
            bail!("a site directory is required");
        };

        let channel = match self.channel {
            Some(channel) => channel,
            None => ChannelBuilder::new(settings.channel.clone())
                .dry_run(self.dry_run)
                .build()?,
        };
        let gate: Arc<dyn OperatorGate> = match self.gate {
            Some(gate) => gate,
            None if settings.sender.operator_ack => Arc::new(ManualAckGate::new()),
            None => Arc::new(LogAndContinueGate),
        };
        let journal = self
            .journal
            .or_else(|| DispatchJournal::from_settings(&settings).map(Arc::new));

        let events = Arc::new(EventBus::new());
        events.subscribe(Arc::new(TracingListener));
        for listener in self.listeners {
            events.subscribe(listener);
        }

        let settings = Arc::new(settings);
        let queue = Arc::new(DispatchQueue::new(settings.sender.queue_capacity));
        let mut sender = Sender::new(
            queue.clone(),
            channel.clone(),
            gate,
            events.clone(),
            settings.sender.clone(),
        );
        if let Some(journal) = journal {
            info!(path = %journal.path().display(), "Dispatch journal enabled");
            sender = sender.with_journal(journal);
        }

        let dedup = DeduplicationCache::new()
            .with_ttl(ChronoDuration::hours(settings.dedup_ttl_hours))
            .with_purge_interval(ChronoDuration::minutes(settings.purge_interval_minutes));

        info!(
            channel = %channel.name(),
            sources = settings.sources.len(),
            instant_types = ?settings.instant_alarms,
            "Pipeline built"
        );

        Ok(Pipeline {
            ingestor: AlarmIngestor::new(settings.clone(), directory),
            tracker: InstantDiffTracker::new(settings.instant_alarms.clone()),
            scheduler: BatchScheduler::new(settings.clone()),
            dispatcher: AlarmDispatcher::new(settings.clone(), queue.clone(), events.clone()),
            sender: Arc::new(sender),
            settings,
            source,
            dedup,
            queue,
            events,
        })
    }
}

pub struct Pipeline {
    settings: Arc<Settings>,
    source: Arc<dyn AlarmSource>,
    ingestor: AlarmIngestor,
    dedup: DeduplicationCache,
    tracker: InstantDiffTracker,
    scheduler: BatchScheduler,
    dispatcher: AlarmDispatcher,
    queue: Arc<DispatchQueue>,
    sender: Arc<Sender>,
    events: Arc<EventBus>,
}

impl Pipeline {
    pub fn builder(settings: Settings) -> PipelineBuilder {
        PipelineBuilder::new(settings)
    }

    /// Poll every source once.
    ///
    /// A failing source is logged and skipped; the instant baseline is only
    /// replaced when every source succeeded, and only grows otherwise.
    pub fn poll_cycle(&self, now: NaiveDateTime) -> CycleReport {
        let mut report = CycleReport::default();
        self.tracker.begin_cycle();

        for source_id in &self.settings.sources {
            let rows = match self.source.fetch_current_alarms(source_id) {
                Ok(rows) => rows,
                Err(e) => {
                    report.sources_failed += 1;
                    self.events.publish(PipelineEvent::SourceFailed {
                        source: source_id.clone(),
                        error: format!("{:#}", e),
                    });
                    continue;
                }
            };
            report.sources_ok += 1;
            report.rows += rows.len();

            let alarms = self.ingestor.parse(&rows, now);
            let alarm_count = alarms.len();
            report.alarms += alarm_count;

            for trigger in self.tracker.observe(&alarms) {
                self.events.publish(PipelineEvent::InstantTriggered {
                    destination: trigger.destination.clone(),
                    alarm_type: trigger.alarm_type.clone(),
                    alarms: trigger.alarms.len(),
                });
                if self.dispatcher.dispatch_instant(&trigger, now) {
                    report.instant_messages += 1;
                }
            }

            let fresh = self.dedup.filter_new(alarms, now);
            let new_count = fresh.len();
            report.new_alarms += new_count;

            // Real-time instant types were already announced by the diff
            let routed = fresh
                .into_iter()
                .filter(|a| {
                    a.is_toggle
                        || !(self.tracker.is_instant(&a.alarm_type)
                            && self.scheduler.policy_for(&a.alarm_type).is_real_time())
                })
                .collect();
            let immediate = self.scheduler.add_all(routed, now);
            report.immediate_messages += self.dispatcher.dispatch_alarms(&immediate, now);

            self.events.publish(PipelineEvent::SourcePolled {
                source: source_id.clone(),
                rows: rows.len(),
                alarms: alarm_count,
                new: new_count,
            });
        }

        report.baseline_updated = self.tracker.finish_cycle(report.sources_failed == 0);
        if let Some(removed) = self.dedup.maybe_purge(now) {
            debug!(removed, remaining = self.dedup.len(), "Dedup purge");
        }

        self.events.publish(PipelineEvent::CycleCompleted {
            sources_ok: report.sources_ok,
            sources_failed: report.sources_failed,
            new_alarms: report.new_alarms,
            baseline_updated: report.baseline_updated,
        });
        report
    }

    /// Advance the scheduler and dispatch whatever is due.
    /// Returns the number of messages enqueued.
    pub fn tick(&self, now: NaiveDateTime) -> usize {
        self.scheduler
            .tick(now)
            .into_iter()
            .map(|batch| {
                let reason = match &batch.reason {
                    FlushReason::Delay => "delay".to_string(),
                    FlushReason::Clock { bucket } => format!("clock {}", bucket),
                    FlushReason::Forced => "forced".to_string(),
                };
                self.events.publish(PipelineEvent::BatchFlushed {
                    alarm_type: batch.alarm_type.clone(),
                    alarms: batch.alarms.len(),
                    reason,
                });
                self.dispatcher.dispatch_alarms(&batch.alarms, now)
            })
            .sum()
    }

    /// Flush every buffer now. Returns the number of messages enqueued.
    pub fn force_flush(&self, now: NaiveDateTime) -> usize {
        self.scheduler
            .force_flush()
            .into_iter()
            .map(|batch| {
                self.events.publish(PipelineEvent::BatchFlushed {
                    alarm_type: batch.alarm_type.clone(),
                    alarms: batch.alarms.len(),
                    reason: "forced".to_string(),
                });
                self.dispatcher.dispatch_alarms(&batch.alarms, now)
            })
            .sum()
    }

    /// Flush one alarm type now
    pub fn force_flush_type(&self, alarm_type: &str, now: NaiveDateTime) -> usize {
        let Some(batch) = self.scheduler.force_flush_type(alarm_type) else {
            return 0;
        };
        self.events.publish(PipelineEvent::BatchFlushed {
            alarm_type: batch.alarm_type.clone(),
            alarms: batch.alarms.len(),
            reason: "forced".to_string(),
        });
        self.dispatcher.dispatch_alarms(&batch.alarms, now)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    /// Pending messages in dispatch order
    pub fn queue_snapshot(&self) -> Vec<QueuedMessage> {
        self.queue.snapshot()
    }

    /// Drop every pending message
    pub fn clear_queue(&self) -> usize {
        let removed = self.queue.clear();
        if removed > 0 {
            warn!(removed, "Dispatch queue cleared");
        }
        removed
    }

    pub fn sent_history(&self) -> Vec<SentRecord> {
        self.sender.history().snapshot()
    }

    pub fn pending_counts(&self) -> BTreeMap<String, usize> {
        self.scheduler.pending_counts()
    }

    pub fn next_flush_times(&self, now: NaiveDateTime) -> BTreeMap<String, NaiveDateTime> {
        self.scheduler.next_flush_times(now)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Known alarm ids
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    /// Spawn the poll, tick and sender threads.
    pub fn start(self: &Arc<Self>) -> Result<PipelineHandle> {
        let shutdown = Shutdown::new();
        let mut threads = Vec::with_capacity(3);

        let poll_interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        threads.push(spawn_loop("poll", self.clone(), shutdown.clone(), move |p, s| {
            let report = p.poll_cycle(Local::now().naive_local());
            debug!(?report, "Poll cycle report");
            s.sleep(poll_interval);
        })?);

        threads.push(spawn_loop("tick", self.clone(), shutdown.clone(), |p, s| {
            p.tick(Local::now().naive_local());
            s.sleep(TICK_INTERVAL);
        })?);

        let sender = self.sender.clone();
        let sender_shutdown = shutdown.clone();
        threads.push(
            thread::Builder::new()
                .name("sender".to_string())
                .spawn(move || {
                    while !sender_shutdown.is_requested() {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            sender.run(&sender_shutdown)
                        }));
                        if result.is_err() {
                            error!("Sender loop panicked, restarting");
                        }
                    }
                })
                .context("Failed to spawn sender thread")?,
        );

        info!(
            poll_interval_secs = poll_interval.as_secs(),
            "Pipeline started"
        );
        Ok(PipelineHandle {
            shutdown,
            queue: self.queue.clone(),
            threads,
        })
    }
}

/// Run `step` until stopped. A panicking iteration is logged and the loop
/// continues.
fn spawn_loop<F>(
    name: &str,
    pipeline: Arc<Pipeline>,
    shutdown: Shutdown,
    step: F,
) -> Result<JoinHandle<()>>
where
    F: Fn(&Pipeline, &Shutdown) + Send + 'static,
{
    let label = name.to_string();
    thread::Builder::new()
        .name(label.clone())
        .spawn(move || {
            while !shutdown.is_requested() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| step(&pipeline, &shutdown)));
                if result.is_err() {
                    error!(thread = %label, "Loop iteration panicked");
                    shutdown.sleep(TICK_INTERVAL);
                }
            }
            debug!(thread = %label, "Loop stopped");
        })
        .with_context(|| format!("Failed to spawn {} thread", name))
}

/// Running pipeline threads
pub struct PipelineHandle {
    shutdown: Shutdown,
    queue: Arc<DispatchQueue>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Request a stop and wait up to `timeout` for every loop to exit.
    /// Returns `false` if a thread was still running at the deadline.
    pub fn stop(self, timeout: Duration) -> bool {
        self.shutdown.request();
        self.queue.wake();

        let deadline = Instant::now() + timeout;
        while self.threads.iter().any(|t| !t.is_finished()) {
            if Instant::now() >= deadline {
                warn!("Pipeline threads did not stop in time");
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("Pipeline thread panicked during shutdown");
            }
        }
        info!("Pipeline stopped");
        true
    }
}
