//! Past test results, kept as a small JSON file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::record::{format_decimal, SpeedTestRecord};

/// Entries kept on disk; the oldest are dropped first.
pub const MAX_HISTORY: usize = 50;

const HISTORY_FILE: &str = "history.json";
const LOG_FILE: &str = "speedrack.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub server: String,
    pub location: String,
}

impl From<&SpeedTestRecord> for HistoryEntry {
    fn from(record: &SpeedTestRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            download_mbps: record.download.mbps(),
            upload_mbps: record.upload.mbps(),
            latency_ms: record.latency_ms,
            server: record.server.name.clone(),
            location: record.server.location.clone(),
        }
    }
}

impl HistoryEntry {
    /// One line for listings, in local time.
    pub fn summary(&self, decimal_comma: bool) -> String {
        let when = self.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M");
        let mut line = format!(
            "{}  down {} Mbps  up {} Mbps  ping {} ms",
            when,
            format_decimal(self.download_mbps, decimal_comma),
            format_decimal(self.upload_mbps, decimal_comma),
            format_decimal(self.latency_ms, decimal_comma),
        );
        match (self.server.is_empty(), self.location.is_empty()) {
            (false, false) => line.push_str(&format!("  {} - {}", self.server, self.location)),
            (false, true) => line.push_str(&format!("  {}", self.server)),
            _ => {}
        }
        line
    }
}

/// The history file and its entries, oldest first.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl History {
    /// Reads `path`. A missing file is an empty history; an unreadable one is
    /// logged and replaced on the next save.
    pub fn load(path: &Path) -> Result<Self> {
        let mut history = Self {
            path: path.to_path_buf(),
            entries: Vec::new(),
        };
        if !path.exists() {
            return Ok(history);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read history file {}", path.display()))?;
        match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
            Ok(entries) => history.entries = entries,
            Err(err) => warn!("ignoring corrupt history file {}: {}", path.display(), err),
        }
        history.trim();
        Ok(history)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev().take(limit)
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        self.trim();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let serialized =
            serde_json::to_string_pretty(&self.entries).context("failed to encode history")?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write history file {}", self.path.display()))?;
        debug!("saved {} history entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    fn trim(&mut self) {
        if self.entries.len() > MAX_HISTORY {
            let excess = self.entries.len() - MAX_HISTORY;
            self.entries.drain(..excess);
        }
    }
}

/// Per-user data location for the history file.
pub fn default_history_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("speedrack").join(HISTORY_FILE))
}

/// Log file used while the terminal UI owns the screen.
pub fn default_log_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("speedrack").join(LOG_FILE))
}

fn data_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("XDG_DATA_HOME") {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        return env::var("APPDATA").ok().map(PathBuf::from);
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("share"))
}
