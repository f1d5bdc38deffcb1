// src/config.rs
//
// =============================================================================
// PULSELAB: LAB CONFIGURATION (v 0.3 )
// =============================================================================
//
// Where the lab lives on disk and how patient it is.
// Everything has a default; a YAML file can override any subset.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfig {
    pub root: PathBuf,
    /// Periodic inbox rescan backing the filesystem notifier.
    pub poll_interval_ms: u64,
    /// A file must look the same twice, this far apart, before it is parsed.
    pub debounce_ms: u64,
    /// Upper bound on every device call except `connect()`.
    pub acquisition_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pause after pushing each dynamic step value.
    pub settle_ms: u64,
    /// Move finished descriptors to `archive/` instead of deleting them.
    pub archive_completed: bool,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            poll_interval_ms: 500,
            debounce_ms: 200,
            acquisition_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            settle_ms: 0,
            archive_completed: false,
        }
    }
}

impl LabConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        serde_yaml::from_str(&text).with_context(|| format!("Invalid config {:?}", path))
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("inbox")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn sequences_dir(&self) -> PathBuf {
        self.root.join("sequences")
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.root.join("rejected")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join("failed")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("journal.log")
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join("status.txt")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs = vec![
            self.inbox_dir(),
            self.results_dir(),
            self.sequences_dir(),
            self.rejected_dir(),
            self.failed_dir(),
        ];
        if self.archive_completed {
            dirs.push(self.archive_dir());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(())
    }
}
