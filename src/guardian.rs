// src/guardian.rs
//
// =============================================================================
// PULSELAB: LAB GUARDIAN (v 0.3 )
// =============================================================================
//
// The Front Desk.
//
// Responsibilities:
// 1. Owns the inbox (via `Intake`) and the single execution slot.
// 2. Dispatches one job at a time; the next waits until the runner reports back.
// 3. Keeps `status.txt` (busy/ready) and `journal.log` current.
// 4. Turns Ctrl-C / an inbox `cancel` file into a cancel request.
// 5. Survives every job failure: errors are job-fatal, never lab-fatal.
//
// Two tasks:
//   front desk (this loop)  --Dispatched-->  executor (owns the Runner)
//                           <--Finished----
// Each job runs in a task of its own under the executor. A panic there fails
// that job and the executor builds a fresh Runner.

use crate::config::LabConfig;
use crate::drivers::DriverRegistry;
use crate::error::{ErrorKind, JobError, JobFailure, Stage};
use crate::intake::{doorbell, Dispatched, Intake};
use crate::journal::{EntryKind, Journal};
use crate::runner::{CancelToken, JobOutcome, Runner, RunnerSettings};
use crate::storage::ResultStore;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

/// What the executor hands back for each job.
#[derive(Debug)]
pub struct Finished {
    pub job_id: Uuid,
    pub running_path: PathBuf,
    pub result: Result<JobOutcome, JobFailure>,
}

// ============================================================================
// 1. THE GUARDIAN
// ============================================================================

pub struct LabGuardian {
    cfg: LabConfig,
    intake: Intake,
    journal: Journal,
    cancel: CancelToken,
    kit: Workshop,
    jobs_tx: mpsc::Sender<Dispatched>,
    done_rx: mpsc::Receiver<Finished>,
    executor: JoinHandle<()>,
    /// The in-flight job and its `_running` file.
    busy: Option<(Uuid, PathBuf)>,
}

impl LabGuardian {
    /// Prepares the directory layout and starts the executor task.
    pub fn boot(cfg: LabConfig, registry: DriverRegistry) -> Result<Self> {
        cfg.ensure_dirs()?;
        let journal = Journal::open(cfg.journal_path())?;
        let store = ResultStore::new(cfg.results_dir())
            .with_context(|| format!("Failed to open result store {:?}", cfg.results_dir()))?;
        let cancel = CancelToken::new();
        let kit = Workshop {
            registry,
            store,
            settings: RunnerSettings::from(&cfg),
            cancel: cancel.clone(),
        };
        let (jobs_tx, done_rx, executor) = kit.clone().spawn();

        Ok(Self {
            intake: Intake::new(cfg.clone()),
            cfg,
            journal,
            cancel,
            kit,
            jobs_tx,
            done_rx,
            executor,
            busy: None,
        })
    }

    /// Runs until `shutdown` is raised. An in-flight job is cancelled at its
    /// next safe point and allowed to release its devices before we return.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        // Without a notifier the periodic rescan still finds everything.
        let (_watcher, mut bell) = match doorbell(&self.cfg.inbox_dir()) {
            Ok((w, rx)) => (Some(w), Some(rx)),
            Err(e) => {
                log::warn!("Inbox notifier unavailable, polling only: {:#}", e);
                (None, None)
            }
        };

        for stale in self.intake.recover()? {
            self.journal
                .note(EntryKind::Failed, None, format!("interrupted by restart: {:?}", stale));
        }
        self.journal.note(
            EntryKind::LabStarted,
            None,
            format!("root {:?}", self.cfg.root),
        );
        self.write_status();
        log::info!("🧪 Lab ready at {:?}", self.cfg.root);

        let mut cancel_sent = false;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                if self.busy.is_none() {
                    break;
                }
                if !cancel_sent {
                    log::warn!("🛑 Shutdown requested; cancelling the running job");
                    self.cancel.cancel();
                    cancel_sent = true;
                }
            }

            tokio::select! {
                done = self.done_rx.recv(), if self.busy.is_some() => {
                    match done {
                        Some(done) => self.finish(done),
                        None => self.executor_lost().await,
                    }
                    cancel_sent = false;
                }
                _ = ring(&mut bell) => {}
                _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
            }

            self.intake_pass();
            if !shutdown.load(Ordering::SeqCst) {
                self.dispatch().await;
            }
        }

        self.journal.note(EntryKind::LabStopped, None, "shutdown");
        log::info!("👋 Lab stopped ({} job(s) left queued)", self.intake.backlog_len());
        drop(self.jobs_tx);
        let _ = self.executor.await;
        Ok(())
    }

    fn intake_pass(&mut self) {
        let report = match self.intake.scan() {
            Ok(r) => r,
            Err(e) => {
                log::error!("Inbox scan failed: {:#}", e);
                return;
            }
        };

        if report.cancel_requested {
            match &self.busy {
                Some((id, _)) => {
                    log::warn!("🛑 Cancel requested for job {}", id);
                    self.cancel.cancel();
                }
                None => log::info!("Cancel requested but no job is running"),
            }
        }
        for (id, path) in &report.accepted {
            self.journal
                .note(EntryKind::Accepted, Some(*id), path.display().to_string());
        }
        for (path, err) in &report.rejected {
            self.journal.note(
                EntryKind::Rejected,
                None,
                format!("{}: {} ({})", path.display(), err, err.kind()),
            );
        }
    }

    async fn dispatch(&mut self) {
        if self.busy.is_some() {
            return;
        }
        let Some(job) = self.intake.next_dispatch() else {
            return;
        };

        let id = job.descriptor.id;
        self.journal.note(
            EntryKind::Started,
            Some(id),
            job.descriptor.experiment_type.clone(),
        );
        // Cleared here, never by the runner: a cancel arriving from now on
        // belongs to this job.
        self.cancel.reset();
        self.busy = Some((id, job.running_path.clone()));
        self.write_status();

        if let Err(mpsc::error::SendError(job)) = self.jobs_tx.send(job).await {
            // The executor is gone; the select picks this up as a lost job.
            log::error!("Executor refused job {}", job.descriptor.short_id());
        }
    }

    fn finish(&mut self, done: Finished) {
        let success = done.result.is_ok();
        match &done.result {
            Ok(outcome) => self.journal.note(
                EntryKind::Completed,
                Some(done.job_id),
                outcome.committed.data_path.display().to_string(),
            ),
            Err(failure) => {
                let kind = if failure.kind() == ErrorKind::Cancelled {
                    EntryKind::Cancelled
                } else {
                    EntryKind::Failed
                };
                self.journal
                    .note(kind, Some(done.job_id), failure.to_string());
            }
        }

        if let Err(e) = self.intake.settle(&done.running_path, success) {
            log::error!("Could not settle {:?}: {:#}", done.running_path, e);
        }
        self.busy = None;
        self.write_status();
    }

    /// The executor task ended under us. Fail whatever it held and start a
    /// new one.
    async fn executor_lost(&mut self) {
        log::error!("💀 Executor task died; restarting it");
        let (jobs_tx, done_rx, executor) = self.kit.clone().spawn();
        let old = std::mem::replace(&mut self.executor, executor);
        self.jobs_tx = jobs_tx;
        self.done_rx = done_rx;
        let reason = match old.await {
            Err(e) => panic_reason(e),
            Ok(()) => "executor stopped".to_string(),
        };

        if let Some((job_id, running_path)) = self.busy.clone() {
            self.finish(Finished {
                job_id,
                running_path,
                result: Err(JobFailure::new(job_id, Stage::Executor, JobError::Internal(reason))),
            });
        }
    }

    /// Best effort: the journal is the record, `status.txt` a convenience.
    fn write_status(&self) {
        let status = if self.busy.is_some() { "busy" } else { "ready" };
        if let Err(e) = std::fs::write(self.cfg.status_path(), status) {
            log::error!("Failed to write {:?}: {}", self.cfg.status_path(), e);
        }
    }
}

async fn ring(bell: &mut Option<mpsc::Receiver<()>>) {
    match bell {
        Some(rx) => {
            if rx.recv().await.is_none() {
                *bell = None;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// 2. THE EXECUTOR
// ============================================================================

/// Everything needed to build a runner, so a fresh one can replace a runner
/// lost to a panic.
#[derive(Clone)]
struct Workshop {
    registry: DriverRegistry,
    store: ResultStore,
    settings: RunnerSettings,
    cancel: CancelToken,
}

impl Workshop {
    fn runner(&self) -> Runner {
        Runner::new(self.registry.clone(), self.store.clone(), self.settings.clone())
            .with_cancel(self.cancel.clone())
    }

    /// Capacity 1: the front desk never has more than one job in flight anyway.
    fn spawn(self) -> (mpsc::Sender<Dispatched>, mpsc::Receiver<Finished>, JoinHandle<()>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let executor = tokio::spawn(execute_jobs(self, jobs_rx, done_tx));
        (jobs_tx, done_rx, executor)
    }
}

/// Strictly sequential: the next job is not received before the previous
/// one has been reported. Each job runs in its own task; a panic there
/// becomes that job's failure.
async fn execute_jobs(
    kit: Workshop,
    mut jobs: mpsc::Receiver<Dispatched>,
    done: mpsc::Sender<Finished>,
) {
    let mut runner = kit.runner();
    while let Some(job) = jobs.recv().await {
        let job_id = job.descriptor.id;
        let descriptor = job.descriptor;
        let task = tokio::spawn(async move {
            let result = runner.execute(&descriptor).await;
            (runner, result)
        });
        let result = match task.await {
            Ok((back, result)) => {
                runner = back;
                result
            }
            Err(e) => {
                let reason = panic_reason(e);
                log::error!("💥 Runner crashed on job {}: {}", job_id, reason);
                runner = kit.runner();
                Err(JobFailure::new(job_id, Stage::Executor, JobError::Internal(reason)))
            }
        };
        let finished = Finished {
            job_id,
            running_path: job.running_path,
            result,
        };
        if done.send(finished).await.is_err() {
            break;
        }
    }
}

fn panic_reason(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "runner panicked".to_string()),
        Err(e) => e.to_string(),
    }
}
