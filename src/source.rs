//! Collaborators that feed the pipeline: alarm snapshots and site master data

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::alarm::site_code;
use crate::alarm::RawRow;

/// Provides the full current snapshot of active alarms for a source.
///
/// A row missing from a snapshot means the alarm cleared.
pub trait AlarmSource: Send + Sync {
    fn fetch_current_alarms(&self, source_id: &str) -> Result<Vec<RawRow>>;
}

/// Site master data lookup
pub trait Directory: Send + Sync {
    fn lookup(&self, site_code: &str) -> Option<SiteRecord>;
}

/// Ownership and routing details for one site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteRecord {
    pub mbu: String,
    pub b2s_company: Option<String>,
    pub omo_company: Option<String>,
    pub ring_id: Option<String>,
    pub destination_id: Option<String>,
}

impl SiteRecord {
    pub fn for_mbu(mbu: impl Into<String>) -> Self {
        Self {
            mbu: mbu.into(),
            ..Default::default()
        }
    }

    pub fn with_b2s(mut self, company: impl Into<String>) -> Self {
        self.b2s_company = Some(company.into());
        self
    }

    pub fn with_omo(mut self, company: impl Into<String>) -> Self {
        self.omo_company = Some(company.into());
        self
    }

    pub fn with_ring_id(mut self, ring_id: impl Into<String>) -> Self {
        self.ring_id = Some(ring_id.into());
        self
    }

    pub fn with_destination_id(mut self, id: impl Into<String>) -> Self {
        self.destination_id = Some(id.into());
        self
    }
}

/// In-memory directory keyed by normalized site code
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    sites: HashMap<String, SiteRecord>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, code: &str, record: SiteRecord) -> Self {
        self.insert(code, record);
        self
    }

    /// Insert a site. Codes that are not `XXX0000` shaped are ignored.
    pub fn insert(&mut self, code: &str, record: SiteRecord) -> bool {
        match site_code::normalize(code) {
            Some(code) => {
                self.sites.insert(code, record);
                true
            }
            None => {
                debug!(code = %code, "Ignoring directory entry with invalid site code");
                false
            }
        }
    }

    /// Load a JSON object of `site code -> SiteRecord`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read site directory {}", path.display()))?;
        let raw: HashMap<String, SiteRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse site directory {}", path.display()))?;

        let mut directory = Self::new();
        for (code, record) in raw {
            directory.insert(&code, record);
        }
        info!(path = %path.display(), sites = directory.len(), "Loaded site directory");
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Directory for StaticDirectory {
    fn lookup(&self, code: &str) -> Option<SiteRecord> {
        site_code::normalize(code).and_then(|c| self.sites.get(&c).cloned())
    }
}

/// Reads snapshots exported as `<dir>/<source>.tsv`, one alarm per line.
///
/// `"All Alarms"` is read from `all_alarms.tsv`. A missing file is a failed
/// poll for that source.
#[derive(Debug, Clone)]
pub struct SnapshotDirSource {
    dir: PathBuf,
}

impl SnapshotDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source_id: &str) -> PathBuf {
        let slug = source_id.trim().to_lowercase().replace([' ', '-'], "_");
        self.dir.join(format!("{}.tsv", slug))
    }
}

impl AlarmSource for SnapshotDirSource {
    fn fetch_current_alarms(&self, source_id: &str) -> Result<Vec<RawRow>> {
        let path = self.path_for(source_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;

        let total = content.lines().filter(|l| !l.trim().is_empty()).count();
        let rows: Vec<RawRow> = content.lines().filter_map(RawRow::from_line).collect();
        if rows.len() < total {
            debug!(
                source = %source_id,
                skipped = total - rows.len(),
                "Skipped malformed snapshot rows"
            );
        }
        Ok(rows)
    }
}
