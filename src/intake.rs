// src/intake.rs
//
// =============================================================================
// PULSELAB: JOB INTAKE (v 0.3 )
// =============================================================================
//
// The Mailroom.
//
// The inbox directory is only the doorbell. The queue is the in-memory FIFO
// below; a file is read once, and from then on the `JobDescriptor` is the
// truth.
//
// Responsibilities:
// 1. Notice new `.yaml`/`.yml` files (filesystem notifier + periodic rescan).
// 2. Debounce: parse only once size and mtime hold still.
// 3. Malformed files go to `rejected/`, never retried.
// 4. Hand out one job at a time, marking its file `<name>_running`.
// 5. Settle the file when the job ends: delete/archive on success,
//    `failed/` on failure.
// 6. A file named `cancel` is a request to cancel the in-flight job.
//
// Only this module writes to the inbox.

use crate::config::LabConfig;
use crate::core::JobDescriptor;
use crate::error::JobError;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const CANCEL_FILE: &str = "cancel";
pub const RUNNING_SUFFIX: &str = "_running";

// ============================================================================
// 1. TYPES
// ============================================================================

/// A parsed descriptor waiting for the runner.
#[derive(Debug)]
pub struct QueuedJob {
    pub descriptor: JobDescriptor,
    pub inbox_path: PathBuf,
}

/// A job handed to the runner; its file is now `<name>_running`.
#[derive(Debug)]
pub struct Dispatched {
    pub descriptor: JobDescriptor,
    pub running_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub accepted: Vec<(Uuid, PathBuf)>,
    pub rejected: Vec<(PathBuf, JobError)>,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Observation {
    len: u64,
    modified: Option<SystemTime>,
}

// ============================================================================
// 2. THE INTAKE
// ============================================================================

pub struct Intake {
    cfg: LabConfig,
    pending: HashMap<PathBuf, (Observation, Instant)>,
    queued: HashSet<PathBuf>,
    /// Rejected files that could not be moved out of the inbox, as they
    /// looked then. An edited file gets parsed again.
    stuck: HashMap<PathBuf, Observation>,
    backlog: VecDeque<QueuedJob>,
}

impl Intake {
    pub fn new(cfg: LabConfig) -> Self {
        Self {
            cfg,
            pending: HashMap::new(),
            queued: HashSet::new(),
            stuck: HashMap::new(),
            backlog: VecDeque::new(),
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Moves `*_running` leftovers from a previous crash to `failed/`.
    pub fn recover(&self) -> Result<Vec<PathBuf>> {
        let mut moved = Vec::new();
        for entry in fs::read_dir(self.cfg.inbox_dir())? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(original) = name.strip_suffix(RUNNING_SUFFIX) {
                let target = unique_target(&self.cfg.failed_dir(), original);
                fs::rename(&path, &target)
                    .with_context(|| format!("Failed to move stale {:?}", path))?;
                log::warn!("Found interrupted job file {:?}, moved to {:?}", path, target);
                moved.push(target);
            }
        }
        Ok(moved)
    }

    /// One pass over the inbox. Stable new files are parsed: good ones join
    /// the backlog, bad ones are moved to `rejected/`.
    pub fn scan(&mut self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let inbox = self.cfg.inbox_dir();

        let cancel = inbox.join(CANCEL_FILE);
        if cancel.exists() {
            fs::remove_file(&cancel).ok();
            report.cancel_requested = true;
        }

        let mut present = HashSet::new();
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&inbox).with_context(|| format!("Failed to list {:?}", inbox))? {
            let entry = entry?;
            let path = entry.path();
            if !is_descriptor(&path) || self.queued.contains(&path) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let obs = Observation {
                len: meta.len(),
                modified: meta.modified().ok(),
            };
            present.insert(path.clone());
            if self.stuck.get(&path) == Some(&obs) {
                continue;
            }
            candidates.push((path, obs));
        }
        // Forget files that vanished before they settled, or were removed by hand.
        self.pending.retain(|p, _| present.contains(p));
        self.stuck.retain(|p, _| present.contains(p));

        // Oldest name first keeps the FIFO deterministic within one pass.
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let now = Instant::now();
        for (path, obs) in candidates {
            match self.pending.get(&path) {
                Some((prev, since)) if *prev == obs && now.duration_since(*since) >= self.cfg.debounce() => {
                    self.pending.remove(&path);
                    self.admit(path, obs, &mut report);
                }
                Some((prev, _)) if *prev == obs => {}
                _ => {
                    self.pending.insert(path, (obs, now));
                }
            }
        }
        Ok(report)
    }

    fn admit(&mut self, path: PathBuf, obs: Observation, report: &mut ScanReport) {
        match JobDescriptor::from_file(&path) {
            Ok(descriptor) => {
                log::info!(
                    "📥 Queued job {} from {:?} (backlog: {})",
                    descriptor.short_id(),
                    path.file_name().unwrap_or_default(),
                    self.backlog.len() + 1
                );
                report.accepted.push((descriptor.id, path.clone()));
                self.queued.insert(path.clone());
                self.backlog.push_back(QueuedJob {
                    descriptor,
                    inbox_path: path,
                });
            }
            Err(err) => {
                log::error!("🚫 Rejected {:?}: {} ({})", path, err, err.kind());
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "descriptor".into());
                let target = unique_target(&self.cfg.rejected_dir(), &name);
                if let Err(e) = fs::rename(&path, &target) {
                    log::error!("Could not move {:?} aside, ignoring it until it changes: {}", path, e);
                    self.stuck.insert(path.clone(), obs);
                }
                report.rejected.push((path, err));
            }
        }
    }

    /// Next job in FIFO order. Its inbox file is renamed `<name>_running`.
    /// Entries whose file disappeared meanwhile are dropped.
    pub fn next_dispatch(&mut self) -> Option<Dispatched> {
        while let Some(job) = self.backlog.pop_front() {
            self.queued.remove(&job.inbox_path);
            let mut running = job.inbox_path.clone().into_os_string();
            running.push(RUNNING_SUFFIX);
            let running_path = PathBuf::from(running);
            match fs::rename(&job.inbox_path, &running_path) {
                Ok(()) => {
                    return Some(Dispatched {
                        descriptor: job.descriptor,
                        running_path,
                    })
                }
                Err(e) => log::warn!(
                    "Job {} withdrawn, {:?} is gone: {}",
                    job.descriptor.short_id(),
                    job.inbox_path,
                    e
                ),
            }
        }
        None
    }

    /// Puts a finished job's file where it belongs. Returns the new location.
    pub fn settle(&self, running_path: &Path, success: bool) -> Result<Option<PathBuf>> {
        let original = running_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(RUNNING_SUFFIX))
            .unwrap_or("descriptor.yaml")
            .to_string();

        if success && !self.cfg.archive_completed {
            fs::remove_file(running_path)
                .with_context(|| format!("Failed to remove {:?}", running_path))?;
            return Ok(None);
        }
        let dir = if success {
            self.cfg.archive_dir()
        } else {
            self.cfg.failed_dir()
        };
        fs::create_dir_all(&dir)?;
        let target = unique_target(&dir, &original);
        fs::rename(running_path, &target)
            .with_context(|| format!("Failed to move {:?} to {:?}", running_path, target))?;
        Ok(Some(target))
    }
}

fn is_descriptor(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// `dir/name`, or `dir/name.<n>` when taken.
fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{}.{}", name, n)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

// ============================================================================
// 3. THE DOORBELL (filesystem notifier)
// ============================================================================

/// Watches `dir` and rings `()` on any change. The periodic rescan is the
/// safety net for platforms or filesystems where events get lost.
pub fn doorbell(dir: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(16);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        // A full channel already holds a pending ring.
        Ok(_) => {
            let _ = tx.try_send(());
        }
        Err(e) => log::warn!("Inbox watcher error: {}", e),
    })
    .context("Failed to create inbox watcher")?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {:?}", dir))?;
    log::info!("👀 Watching inbox {:?}", dir);
    Ok((watcher, rx))
}
