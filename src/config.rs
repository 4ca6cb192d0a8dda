//! Relay settings
//!
//! Settings are read from `~/.config/alarm-relay/config.json`. Every field has
//! a default, so a partial file only overrides what it names and a missing
//! file runs the relay with the built-in tables.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::alarm::DestinationKind;

/// Longest batch delay a type may be configured with (one week)
pub const MAX_DELAY_MINUTES: u64 = 7 * 24 * 60;

/// Upper bound for `dedup_ttl_hours` (one year)
const MAX_DEDUP_TTL_HOURS: i64 = 365 * 24;

/// Type names that all describe a running generator.
const GENSET_ALIASES: &[&str] = &[
    "genset_running",
    "genset_operation",
    "dg_running",
    "dg_operation",
    "generator_running",
    "diesel_generator_running",
];

/// Maps a destination id (MBU code or company name) to a channel group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMapping {
    pub id: String,
    pub group: String,
}

impl GroupMapping {
    pub fn new(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
        }
    }
}

/// Message templates per destination class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFormats {
    pub mbu: String,
    pub toggle: String,
    pub b2s: String,
    pub omo: String,
}

impl Default for MessageFormats {
    fn default() -> Self {
        Self {
            mbu: "{alarm_type}\t{timestamp}\t{site_name}".to_string(),
            toggle: "Toggle alarm\t{severity}\t{alarm_type}\t{timestamp}\t{site_name}".to_string(),
            b2s: "{mbu}\t{ring_id}\t{alarm_type}\t{site_name}\t{timestamp}\t{b2s_id}".to_string(),
            omo: "{mbu}\t{ring_id}\t{alarm_type}\t{site_name}\t{timestamp}\t{b2s_id}".to_string(),
        }
    }
}

/// Per-destination lists of alarm types that must not be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendControl {
    #[serde(rename = "MBU")]
    pub mbu: BTreeMap<String, Vec<String>>,
    #[serde(rename = "B2S")]
    pub b2s: BTreeMap<String, Vec<String>>,
    #[serde(rename = "OMO")]
    pub omo: BTreeMap<String, Vec<String>>,
}

impl SendControl {
    /// Whether `alarm_type` is switched off for this destination.
    /// Type names compare case-insensitively.
    pub fn is_disabled(&self, kind: DestinationKind, id: &str, alarm_type: &str) -> bool {
        let table = match kind {
            DestinationKind::Mbu => &self.mbu,
            DestinationKind::B2s => &self.b2s,
            DestinationKind::Omo => &self.omo,
        };
        table
            .get(id)
            .map(|types| types.iter().any(|t| t.eq_ignore_ascii_case(alarm_type)))
            .unwrap_or(false)
    }
}

/// Delivery channel selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelSettings {
    /// Log every message instead of delivering it
    Log,
    /// POST each message to an HTTP gateway
    Webhook {
        url: String,
        #[serde(default)]
        token: String,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
}

fn default_webhook_timeout() -> u64 {
    30
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings::Log
    }
}

/// Dispatch queue and sender tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    /// Attempts after the first failed send
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Pause after each delivery so the channel is not flooded
    pub inter_message_delay_ms: u64,
    pub dequeue_timeout_ms: u64,
    pub queue_capacity: usize,
    /// Size of the recently-sent ring buffer
    pub history_size: usize,
    /// Pause the sender until an operator acknowledges an undeliverable message
    pub operator_ack: bool,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 3000,
            inter_message_delay_ms: 2000,
            dequeue_timeout_ms: 1000,
            queue_capacity: 1000,
            history_size: 50,
            operator_ack: true,
        }
    }
}

/// Top-level relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub poll_interval_secs: u64,
    /// Alarm source ids polled on every cycle
    pub sources: Vec<String>,
    /// Batch delay in minutes per normalized alarm type. `0` means real time.
    pub timing: BTreeMap<String, u64>,
    pub default_timing_minutes: u64,
    /// Minute-of-hour flush lists per normalized alarm type. Overrides `timing`.
    pub hourly_minute_map: BTreeMap<String, Vec<u32>>,
    pub mbu_groups: Vec<GroupMapping>,
    pub b2s_groups: Vec<GroupMapping>,
    pub omo_groups: Vec<GroupMapping>,
    pub message_formats: MessageFormats,
    pub send_control: SendControl,
    /// MBUs that never receive toggle batches
    pub skip_toggle_mbus: Vec<String>,
    /// Alarm types sent as soon as a new site appears
    pub instant_alarms: Vec<String>,
    /// Alarm names containing any of these (case-insensitive) are ignored
    pub skip_alarm_patterns: Vec<String>,
    pub ignored_sites: Vec<String>,
    pub dedup_ttl_hours: i64,
    pub purge_interval_minutes: i64,
    pub sender: SenderSettings,
    pub channel: ChannelSettings,
    /// Keep a JSONL log of every delivery outcome
    pub journal: bool,
    /// Journal location; setting it also turns the journal on
    pub journal_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let timing = [
            ("csl_fault", 0),
            ("rf_unit_maintenance_link_failure", 30),
            ("cell_unavailable", 30),
            ("low_voltage", 30),
            ("ac_main_failure", 60),
            ("system_on_battery", 30),
            ("battery_high_temp", 30),
            ("genset_running", 60),
            ("mains_failure", 60),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            poll_interval_secs: 30,
            sources: ["CSL Fault", "All Alarms", "RF Unit", "NodeB Cell"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timing,
            default_timing_minutes: 30,
            hourly_minute_map: BTreeMap::new(),
            mbu_groups: vec![
                GroupMapping::new("C1-LHR-01", "C1-LHR-MBU-01"),
                GroupMapping::new("C1-LHR-02", "MBU C1-LHR-02"),
                GroupMapping::new("C1-LHR-03", "C1-LHR-03"),
                GroupMapping::new("C1-LHR-04", "MBU C1-LHR-04"),
                GroupMapping::new("C1-LHR-05", "MBU C1 LHR-05"),
                GroupMapping::new("C1-LHR-06", "MBU C1-LHR-06 Hotline"),
                GroupMapping::new("C1-LHR-07", "MBU-C1-LHR-07"),
                GroupMapping::new("C1-LHR-08", "MBU C1-LHR-08 Hotline"),
            ],
            b2s_groups: vec![
                GroupMapping::new("ATL", "JAZZ ATL CA-LHR-C1"),
                GroupMapping::new("Edotco", "Jazz~edotco C1 & C4"),
                GroupMapping::new("Enfrashare", "Jazz Enfrashare MPL C1"),
                GroupMapping::new("Tawal", "TAWAL - Jazz (Central-A)"),
            ],
            omo_groups: vec![
                GroupMapping::new("Zong", "MPL JAZZ & CMPAK"),
                GroupMapping::new("Ufone", "Ufone Jazz Sites Huawei Group"),
                GroupMapping::new("Telenor", "TP JAZZ Shared Sites C1"),
            ],
            message_formats: MessageFormats::default(),
            send_control: SendControl::default(),
            skip_toggle_mbus: vec!["C1-LHR-04".to_string(), "C1-LHR-05".to_string()],
            instant_alarms: vec!["CSL Fault".to_string()],
            skip_alarm_patterns: vec!["local cell unusable".to_string()],
            ignored_sites: Vec::new(),
            dedup_ttl_hours: 24,
            purge_interval_minutes: 60,
            sender: SenderSettings::default(),
            channel: ChannelSettings::default(),
            journal: false,
            journal_path: None,
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("alarm-relay")
            .join("config.json")
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Settings file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        if content.trim().is_empty() {
            warn!(path = %path.display(), "Settings file is empty, using defaults");
            return Ok(Self::default());
        }

        let mut settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Normalize minute lists and reject values the pipeline cannot run with.
    pub fn validate(&mut self) -> Result<()> {
        if self.sender.queue_capacity == 0 {
            bail!("sender.queue_capacity must be greater than zero");
        }
        if self.sender.history_size == 0 {
            bail!("sender.history_size must be greater than zero");
        }
        if !(1..=MAX_DEDUP_TTL_HOURS).contains(&self.dedup_ttl_hours) {
            bail!(
                "dedup_ttl_hours must be between 1 and {}, got {}",
                MAX_DEDUP_TTL_HOURS,
                self.dedup_ttl_hours
            );
        }
        if !(1..=self.dedup_ttl_hours * 60).contains(&self.purge_interval_minutes) {
            bail!(
                "purge_interval_minutes must be between 1 and the dedup TTL, got {}",
                self.purge_interval_minutes
            );
        }
        if self.default_timing_minutes > MAX_DELAY_MINUTES {
            bail!(
                "default_timing_minutes must be at most {}, got {}",
                MAX_DELAY_MINUTES,
                self.default_timing_minutes
            );
        }
        if let Some((alarm_type, minutes)) =
            self.timing.iter().find(|(_, m)| **m > MAX_DELAY_MINUTES)
        {
            bail!(
                "timing for {} must be at most {} minutes, got {}",
                alarm_type,
                MAX_DELAY_MINUTES,
                minutes
            );
        }

        let mut cleaned = BTreeMap::new();
        for (alarm_type, minutes) in std::mem::take(&mut self.hourly_minute_map) {
            let mut minutes: Vec<u32> = minutes.into_iter().filter(|m| *m <= 59).collect();
            minutes.sort_unstable();
            minutes.dedup();
            if minutes.is_empty() {
                warn!(alarm_type = %alarm_type, "Dropping empty minute list");
                continue;
            }
            cleaned.insert(normalize_type_key(&alarm_type), minutes);
        }
        self.hourly_minute_map = cleaned;

        self.timing = std::mem::take(&mut self.timing)
            .into_iter()
            .map(|(k, v)| (normalize_type_key(&k), v))
            .collect();
        Ok(())
    }

    /// Batch delay for an alarm type, in minutes
    pub fn timing_minutes(&self, alarm_type: &str) -> u64 {
        self.timing
            .get(&normalize_type_key(alarm_type))
            .copied()
            .unwrap_or(self.default_timing_minutes)
    }

    /// Clock-aligned flush minutes for an alarm type, if configured
    pub fn flush_minutes(&self, alarm_type: &str) -> Option<&[u32]> {
        self.hourly_minute_map
            .get(&normalize_type_key(alarm_type))
            .map(|m| m.as_slice())
            .filter(|m| !m.is_empty())
    }

    pub fn is_instant(&self, alarm_type: &str) -> bool {
        self.instant_alarms
            .iter()
            .any(|t| t.eq_ignore_ascii_case(alarm_type))
    }

    pub fn is_ignored_site(&self, site_code: &str) -> bool {
        self.ignored_sites
            .iter()
            .any(|s| s.eq_ignore_ascii_case(site_code))
    }

    pub fn skips_toggles(&self, mbu: &str) -> bool {
        self.skip_toggle_mbus
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mbu))
    }

    /// Configured groups for a destination class, in configured order
    pub fn groups(&self, kind: DestinationKind) -> &[GroupMapping] {
        match kind {
            DestinationKind::Mbu => &self.mbu_groups,
            DestinationKind::B2s => &self.b2s_groups,
            DestinationKind::Omo => &self.omo_groups,
        }
    }

    /// Channel group for a destination id
    pub fn group_for(&self, kind: DestinationKind, id: &str) -> Option<&str> {
        self.groups(kind)
            .iter()
            .find(|g| g.id.eq_ignore_ascii_case(id))
            .map(|g| g.group.as_str())
    }

    pub fn template(&self, kind: DestinationKind, toggle: bool) -> &str {
        match kind {
            DestinationKind::Mbu if toggle => &self.message_formats.toggle,
            DestinationKind::Mbu => &self.message_formats.mbu,
            DestinationKind::B2s => &self.message_formats.b2s,
            DestinationKind::Omo => &self.message_formats.omo,
        }
    }
}

/// Normalize an alarm type name to a settings key:
/// `"Genset Running"` becomes `genset_running`, generator aliases collapse
/// into `genset_running`.
pub fn normalize_type_key(alarm_type: &str) -> String {
    let key = alarm_type.trim().to_lowercase().replace([' ', '-'], "_");
    if GENSET_ALIASES.contains(&key.as_str()) {
        return "genset_running".to_string();
    }
    key
}
