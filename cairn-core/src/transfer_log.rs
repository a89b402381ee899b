//! Transfer log
//!
//! One JSON file per import or export under `<node>/transfer-log/`, named by
//! time so a directory listing is already in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cid::{display_head, Cid};
use crate::error::Result;

const LOG_DIR: &str = "transfer-log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Import,
    Export,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Import => "import",
            Direction::Export => "export",
        }
    }
}

/// A completed or aborted transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLogEntry {
    pub direction: Direction,
    pub repo: String,
    pub head_before: Option<Cid>,
    pub head_after: Option<Cid>,
    pub bundles: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Directory of transfer log entries
pub struct TransferLog {
    log_dir: PathBuf,
}

impl TransferLog {
    pub fn new(node_path: &Path) -> Self {
        Self {
            log_dir: node_path.join(LOG_DIR),
        }
    }

    /// Write an entry; returns the file it landed in
    pub fn append(&self, entry: &TransferLogEntry) -> Result<PathBuf> {
        fs::create_dir_all(&self.log_dir)?;
        let stem = format!(
            "{:013}_{}",
            entry.timestamp.timestamp_millis(),
            entry.direction.as_str()
        );
        let mut path = self.log_dir.join(format!("{}.json", stem));
        let mut n = 1;
        while path.exists() {
            path = self.log_dir.join(format!("{}_{}.json", stem, n));
            n += 1;
        }
        fs::write(&path, serde_json::to_string_pretty(entry)?)?;
        Ok(path)
    }

    /// Every entry, oldest first; unreadable files are skipped
    pub fn all(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.log_dir)? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(data) = fs::read_to_string(&path) {
                    if let Ok(entry) = serde_json::from_str::<TransferLogEntry>(&data) {
                        entries.push(entry);
                    }
                }
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    pub fn for_repo(&self, repo: &str) -> Result<Vec<TransferLogEntry>> {
        Ok(self.all()?.into_iter().filter(|e| e.repo == repo).collect())
    }

    pub fn latest(&self, repo: &str) -> Result<Option<TransferLogEntry>> {
        Ok(self.for_repo(repo)?.pop())
    }
}

/// One-line rendering used by the CLI
pub fn format_entry(entry: &TransferLogEntry) -> String {
    let status = if entry.success { "OK" } else { "FAILED" };
    format!(
        "[{}] {} {} | {} -> {} | {} bundles, {} blocks, {} | {}ms | {}{}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        entry.direction.as_str(),
        entry.repo,
        display_head(&entry.head_before),
        display_head(&entry.head_after),
        entry.bundles,
        entry.blocks,
        format_size(entry.bytes),
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

/// Human-readable byte count in binary units, e.g. `2.0 KiB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut scaled = bytes as f64 / 1024.0;
    let mut unit = 0;
    while scaled >= 1024.0 && unit + 1 < UNITS.len() {
        scaled /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", scaled, UNITS[unit])
}
