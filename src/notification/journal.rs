//! Dispatch journal - local JSONL record of every delivery outcome

use anyhow::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::priority::Priority;
use crate::config::Settings;

const MAX_RECORDS: usize = 200;
const KEEP_AFTER_CLEANUP: usize = 100;
const CLEANUP_CHECK_INTERVAL: usize = 10;
/// Rough average line size used to estimate the record count
const ESTIMATED_LINE_BYTES: u64 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Sent,
    Failed,
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub ts: DateTime<Utc>,
    /// Channel group name
    pub destination: String,
    pub alarm_type: String,
    pub priority: Priority,
    pub outcome: Outcome,
    pub attempts: u32,
    /// First line of the body
    pub preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct DispatchJournal {
    path: PathBuf,
    writes: AtomicUsize,
}

impl DispatchJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Journal configured by `settings`, at `journal_path` or the default
    /// location. `None` when journaling is off.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        match &settings.journal_path {
            Some(path) => Some(Self::new(path)),
            None if settings.journal => Some(Self::new(Self::default_path())),
            None => None,
        }
    }

    /// `~/.config/alarm-relay/dispatch.jsonl`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("alarm-relay")
            .join("dispatch.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record under an exclusive file lock
    pub fn append(&self, record: &DispatchRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.unlock()?;

        self.maybe_cleanup();
        Ok(())
    }

    /// Last `n` records, oldest first. Unreadable lines are skipped.
    pub fn read_recent(&self, n: usize) -> Vec<DispatchRecord> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };
        let records = read_records(BufReader::new(file));
        let start = records.len().saturating_sub(n);
        let mut recent = records[start..].to_vec();
        recent.sort_by_key(|r| r.ts);
        recent
    }

    fn maybe_cleanup(&self) {
        let count = self.writes.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_CHECK_INTERVAL != 0 {
            return;
        }
        if let Ok(metadata) = fs::metadata(&self.path) {
            let estimated = (metadata.len() / ESTIMATED_LINE_BYTES) as usize;
            if estimated > MAX_RECORDS {
                if let Err(e) = self.cleanup() {
                    tracing::warn!(path = %self.path.display(), error = %e, "Journal cleanup failed");
                }
            }
        }
    }

    /// Keep only the most recent records
    fn cleanup(&self) -> Result<()> {
        let file = File::open(&self.path)?;
        file.lock_exclusive()?;

        let records = read_records(BufReader::new(&file));
        if records.len() <= MAX_RECORDS {
            file.unlock()?;
            return Ok(());
        }

        let start = records.len().saturating_sub(KEEP_AFTER_CLEANUP);
        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp = File::create(&temp_path)?;
            for record in &records[start..] {
                writeln!(temp, "{}", serde_json::to_string(record)?)?;
            }
        }
        fs::rename(&temp_path, &self.path)?;

        file.unlock()?;
        Ok(())
    }
}

fn read_records(reader: impl BufRead) -> Vec<DispatchRecord> {
    reader
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(destination: &str, outcome: Outcome) -> DispatchRecord {
        DispatchRecord {
            ts: Utc::now(),
            destination: destination.to_string(),
            alarm_type: "Low Voltage".to_string(),
            priority: Priority::Normal,
            outcome,
            attempts: 1,
            preview: "Low Voltage\t12-11-2025 05:20:03\tLHR1459__S_Test".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        assert!(DispatchJournal::from_settings(&settings).is_none());

        settings.journal = true;
        let journal = DispatchJournal::from_settings(&settings).unwrap();
        assert_eq!(journal.path(), DispatchJournal::default_path());

        settings.journal_path = Some(PathBuf::from("/var/log/relay/dispatch.jsonl"));
        let journal = DispatchJournal::from_settings(&settings).unwrap();
        assert_eq!(journal.path(), Path::new("/var/log/relay/dispatch.jsonl"));
    }

    #[test]
    fn test_read_recent_missing_file() {
        let dir = TempDir::new().unwrap();
        let journal = DispatchJournal::new(dir.path().join("none.jsonl"));
        assert!(journal.read_recent(10).is_empty());
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let journal = DispatchJournal::new(dir.path().join("nested").join("dispatch.jsonl"));

        journal.append(&record("G1", Outcome::Sent)).unwrap();
        journal.append(&record("G2", Outcome::Failed)).unwrap();

        let recent = journal.read_recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].destination, "G2");
        assert_eq!(recent[1].outcome, Outcome::Failed);
    }

    #[test]
    fn test_read_recent_limits_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatch.jsonl");
        let journal = DispatchJournal::new(&path);
        journal.append(&record("G1", Outcome::Sent)).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();
        journal.append(&record("G2", Outcome::Sent)).unwrap();
        journal.append(&record("G3", Outcome::Sent)).unwrap();

        let recent = journal.read_recent(2);
        let names: Vec<&str> = recent.iter().map(|r| r.destination.as_str()).collect();
        assert_eq!(names, vec!["G2", "G3"]);
    }

    #[test]
    fn test_cleanup_keeps_recent() {
        let dir = TempDir::new().unwrap();
        let journal = DispatchJournal::new(dir.path().join("dispatch.jsonl"));
        for i in 0..(MAX_RECORDS + 20) {
            journal.append(&record(&format!("G{}", i), Outcome::Sent)).unwrap();
        }

        journal.cleanup().unwrap();

        // Periodic cleanup already trimmed during the appends
        let all = journal.read_recent(usize::MAX);
        assert!(all.len() >= KEEP_AFTER_CLEANUP);
        assert!(all.len() < MAX_RECORDS);
        assert_ne!(all[0].destination, "G0");
        assert_eq!(
            all.last().unwrap().destination,
            format!("G{}", MAX_RECORDS + 19)
        );
    }
}
