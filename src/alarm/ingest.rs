//! Raw row normalization
//!
//! Turns one poll's rows into [`Alarm`] records. Rows that cannot be tied to
//! a known site are dropped, never reported as errors.

use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{alarm_id, site_code, Alarm, AlarmCategory, RawRow};
use crate::config::Settings;
use crate::source::Directory;

/// Accepted timestamp layouts, tried in order
const TIMESTAMP_FORMATS: &[&str] = &[
    "%m-%d-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

/// Stateless alarm parser
pub struct AlarmIngestor {
    settings: Arc<Settings>,
    directory: Arc<dyn Directory>,
}

impl AlarmIngestor {
    pub fn new(settings: Arc<Settings>, directory: Arc<dyn Directory>) -> Self {
        Self {
            settings,
            directory,
        }
    }

    /// Normalize a poll's rows. Each row's position in `rows` is part of its id.
    pub fn parse(&self, rows: &[RawRow], scan_time: NaiveDateTime) -> Vec<Alarm> {
        rows.iter()
            .enumerate()
            .filter_map(|(index, row)| self.parse_row(row, index, scan_time))
            .collect()
    }

    /// Parse export lines directly, keeping each line's position as its index.
    pub fn parse_lines<S: AsRef<str>>(&self, lines: &[S], scan_time: NaiveDateTime) -> Vec<Alarm> {
        lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                let row = RawRow::from_line(line.as_ref())?;
                self.parse_row(&row, index, scan_time)
            })
            .collect()
    }

    fn parse_row(&self, row: &RawRow, index: usize, scan_time: NaiveDateTime) -> Option<Alarm> {
        let alarm_type = row.alarm_name.trim();
        if alarm_type.is_empty() {
            return None;
        }
        if self.should_skip(alarm_type) {
            debug!(alarm_type = %alarm_type, "Skipping ignored alarm type");
            return None;
        }

        let Some(site) = site_code::extract(&row.source_text) else {
            debug!(source = %row.source_text, "No site code in alarm source");
            return None;
        };
        if self.settings.is_ignored_site(&site.site_code) {
            debug!(site = %site.site_code, "Skipping ignored site");
            return None;
        }
        let Some(record) = self.directory.lookup(&site.site_code) else {
            debug!(site = %site.site_code, "Site not found in directory");
            return None;
        };

        let timestamp_raw = row.timestamp_text.trim().to_string();
        let timestamp = parse_timestamp(&timestamp_raw).unwrap_or_else(|| {
            warn!(timestamp = %timestamp_raw, "Unparsable alarm timestamp, using scan time");
            scan_time
        });

        // B2S and OMO are exclusive; B2S wins when master data names both.
        let omo_company = if record.b2s_company.is_some() {
            None
        } else {
            record.omo_company
        };

        let alarm = Alarm {
            id: alarm_id(alarm_type, &site.site_code, &timestamp_raw, index),
            alarm_type: alarm_type.to_string(),
            severity: row.severity.trim().to_string(),
            timestamp,
            timestamp_raw,
            site_code: site.site_code,
            site_name: site.full_name,
            category: AlarmCategory::classify(alarm_type),
            is_toggle: row.is_toggle,
            mbu: record.mbu,
            b2s_company: record.b2s_company,
            omo_company,
            ring_id: record.ring_id,
            destination_id: record.destination_id,
            cell_info: site.cell_info,
            raw_line: row.raw_line.clone(),
        };

        if alarm.destination().is_none() {
            debug!(site = %alarm.site_code, "Site has no MBU or company, dropping alarm");
            return None;
        }
        Some(alarm)
    }

    fn should_skip(&self, alarm_type: &str) -> bool {
        let lower = alarm_type.to_lowercase();
        self.settings
            .skip_alarm_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    }
}

/// Parse a source timestamp with the first matching layout
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}
