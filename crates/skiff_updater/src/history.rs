//! Bounded update history.
//!
//! Append-only record of update attempts, truncated to the most recent 50.
//! Reads degrade to an empty list so reporting never blocks an update.

use crate::error::Result;
use crate::paths::StateDir;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from_version: Version,
    pub to_version: Version,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct UpdateHistory {
    path: PathBuf,
}

impl UpdateHistory {
    pub fn new(state_dir: &StateDir) -> Self {
        Self {
            path: state_dir.history_file(),
        }
    }

    /// All recorded entries, oldest first. Missing or corrupt files read as
    /// empty.
    pub fn entries(&self) -> Vec<UpdateHistoryEntry> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn record(&self, entry: UpdateHistoryEntry) -> Result<()> {
        let mut entries = self.entries();
        entries.push(entry);
        if entries.len() > HISTORY_LIMIT {
            let excess = entries.len() - HISTORY_LIMIT;
            entries.drain(..excess);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(to: &str, success: bool) -> UpdateHistoryEntry {
        UpdateHistoryEntry {
            timestamp: Utc::now(),
            from_version: Version::parse("1.0.0").unwrap(),
            to_version: Version::parse(to).unwrap(),
            success,
            error: if success {
                None
            } else {
                Some("install command failed".to_string())
            },
        }
    }

    #[test]
    fn records_and_reads_back() {
        let temp = TempDir::new().unwrap();
        let history = UpdateHistory::new(&StateDir::at(temp.path()));
        assert!(history.entries().is_empty());

        history.record(entry("1.1.0", true)).unwrap();
        history.record(entry("1.2.0", false)).unwrap();

        let entries = history.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert_eq!(entries[1].error.as_deref(), Some("install command failed"));
    }

    #[test]
    fn truncates_to_most_recent_fifty() {
        let temp = TempDir::new().unwrap();
        let history = UpdateHistory::new(&StateDir::at(temp.path()));
        for i in 0..60 {
            history.record(entry(&format!("1.{}.0", i), true)).unwrap();
        }
        let entries = history.entries();
        assert_eq!(entries.len(), HISTORY_LIMIT);
        // The oldest ten fell off the front.
        assert_eq!(entries[0].to_version, Version::parse("1.10.0").unwrap());
        assert_eq!(
            entries.last().unwrap().to_version,
            Version::parse("1.59.0").unwrap()
        );
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let dir = StateDir::at(temp.path());
        fs::create_dir_all(dir.root()).unwrap();
        fs::write(dir.history_file(), "not json").unwrap();
        let history = UpdateHistory::new(&dir);
        assert!(history.entries().is_empty());
    }
}
