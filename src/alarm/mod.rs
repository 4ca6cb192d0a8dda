//! Alarm records and their normalization from raw source rows

pub mod dedup;
pub mod ingest;
pub mod site_code;

pub use dedup::DeduplicationCache;
pub use ingest::AlarmIngestor;
pub use site_code::SiteInfo;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Synthetic alarm type that collects every toggle alarm for a destination
pub const TOGGLE_TYPE: &str = "Toggle";

/// Coarse alarm classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmCategory {
    CslFault,
    RfUnit,
    CellUnavailable,
    PowerAlarm,
    Other,
}

impl AlarmCategory {
    /// Case-insensitive keyword match on the alarm type name
    pub fn classify(alarm_type: &str) -> Self {
        let lower = alarm_type.to_lowercase();
        if lower.contains("csl") {
            AlarmCategory::CslFault
        } else if lower.contains("rf unit") {
            AlarmCategory::RfUnit
        } else if lower.contains("cell unavailable") {
            AlarmCategory::CellUnavailable
        } else if ["voltage", "battery", "ac main", "mains", "genset"]
            .iter()
            .any(|k| lower.contains(k))
        {
            AlarmCategory::PowerAlarm
        } else {
            AlarmCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmCategory::CslFault => "csl_fault",
            AlarmCategory::RfUnit => "rf_unit",
            AlarmCategory::CellUnavailable => "cell_unavailable",
            AlarmCategory::PowerAlarm => "power_alarm",
            AlarmCategory::Other => "other",
        }
    }
}

/// Destination class. The derived order is the dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DestinationKind {
    Mbu,
    B2s,
    Omo,
}

impl DestinationKind {
    pub const ALL: [DestinationKind; 3] =
        [DestinationKind::Mbu, DestinationKind::B2s, DestinationKind::Omo];

    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Mbu => "MBU",
            DestinationKind::B2s => "B2S",
            DestinationKind::Omo => "OMO",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A notification target: an MBU or a B2S / OMO company
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub id: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn mbu(id: impl Into<String>) -> Self {
        Self::new(DestinationKind::Mbu, id)
    }

    pub fn b2s(id: impl Into<String>) -> Self {
        Self::new(DestinationKind::B2s, id)
    }

    pub fn omo(id: impl Into<String>) -> Self {
        Self::new(DestinationKind::Omo, id)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// One row of an alarm source snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub severity: String,
    pub alarm_name: String,
    pub timestamp_text: String,
    pub source_text: String,
    /// Row was exported with a leading `Toggle alarm` column
    #[serde(default)]
    pub is_toggle: bool,
    /// Original text, kept for templates and audit
    #[serde(default)]
    pub raw_line: String,
}

impl RawRow {
    pub fn new(
        severity: impl Into<String>,
        alarm_name: impl Into<String>,
        timestamp_text: impl Into<String>,
        source_text: impl Into<String>,
    ) -> Self {
        let mut row = Self {
            severity: severity.into(),
            alarm_name: alarm_name.into(),
            timestamp_text: timestamp_text.into(),
            source_text: source_text.into(),
            is_toggle: false,
            raw_line: String::new(),
        };
        row.raw_line = [
            row.severity.as_str(),
            &row.alarm_name,
            &row.timestamp_text,
            &row.source_text,
        ]
        .join("\t");
        row
    }

    pub fn with_toggle(mut self, is_toggle: bool) -> Self {
        self.is_toggle = is_toggle;
        self
    }

    /// Parse a tab-separated export line.
    ///
    /// ```text
    /// [Toggle alarm|-]\t<severity>\t<alarm name>\t<timestamp>\t<source>
    /// ```
    ///
    /// Returns `None` for lines with fewer than four fields or an empty
    /// alarm name or source.
    pub fn from_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let mut parts: Vec<&str> = trimmed.split('\t').map(str::trim).collect();
        let mut is_toggle = false;
        if parts
            .first()
            .is_some_and(|p| p.eq_ignore_ascii_case("toggle alarm"))
        {
            is_toggle = true;
            parts.remove(0);
        }
        if parts.first() == Some(&"-") {
            parts.remove(0);
        }

        if parts.len() < 4 || parts[1].is_empty() || parts[3].is_empty() {
            return None;
        }

        Some(Self {
            severity: parts[0].to_string(),
            alarm_name: parts[1].to_string(),
            timestamp_text: parts[2].to_string(),
            source_text: parts[3].to_string(),
            is_toggle,
            raw_line: trimmed.to_string(),
        })
    }
}

/// A normalized alarm. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub alarm_type: String,
    pub severity: String,
    pub timestamp: NaiveDateTime,
    /// Timestamp as reported by the source; used for display and identity
    pub timestamp_raw: String,
    pub site_code: String,
    pub site_name: String,
    pub category: AlarmCategory,
    pub is_toggle: bool,
    /// Owning MBU from the site directory (may be empty)
    pub mbu: String,
    pub b2s_company: Option<String>,
    pub omo_company: Option<String>,
    pub ring_id: Option<String>,
    /// Secondary id (B2S / OMO site id)
    pub destination_id: Option<String>,
    pub cell_info: Option<String>,
    pub raw_line: String,
}

impl Alarm {
    /// The single destination this alarm is batched to: its MBU when known,
    /// otherwise its B2S company, otherwise its OMO company.
    pub fn destination(&self) -> Option<Destination> {
        if !self.mbu.is_empty() {
            Some(Destination::mbu(&self.mbu))
        } else {
            self.company_destination()
        }
    }

    /// Infrastructure company sharing the site, if any
    pub fn company_destination(&self) -> Option<Destination> {
        match (&self.b2s_company, &self.omo_company) {
            (Some(company), _) => Some(Destination::b2s(company)),
            (None, Some(company)) => Some(Destination::omo(company)),
            (None, None) => None,
        }
    }

    /// Every destination that should hear about this alarm immediately
    pub fn instant_destinations(&self) -> Vec<Destination> {
        let mut out = Vec::with_capacity(2);
        if !self.mbu.is_empty() {
            out.push(Destination::mbu(&self.mbu));
        }
        if let Some(company) = self.company_destination() {
            out.push(company);
        }
        out
    }

    /// Batch type: toggle alarms all go to the synthetic `Toggle` batch
    pub fn batch_type(&self) -> &str {
        if self.is_toggle {
            TOGGLE_TYPE
        } else {
            &self.alarm_type
        }
    }
}

/// Stable alarm identity: the same (type, site, timestamp, row index) always
/// hashes to the same 16 hex characters.
pub fn alarm_id(alarm_type: &str, site_code: &str, timestamp_raw: &str, index: usize) -> String {
    let source = format!("{}_{}_{}_{}", alarm_type, site_code, timestamp_raw, index);
    let digest = Sha256::digest(source.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}
