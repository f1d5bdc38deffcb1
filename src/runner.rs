// src/runner.rs
//
// =============================================================================
// PULSELAB: MEASUREMENT EXECUTION LOOP (v 0.3 )
// =============================================================================
//
// The Engine Room.
//
// Lifecycle of one job:
//   Idle -> Configuring -> Running(step, average) -> Aggregating -> Done
//                      \______________ any error ______________/-> Failed
//
// Responsibilities:
// 1. PLAN: resolve every driver, range and channel without touching hardware.
// 2. CONFIGURE: connect, configure, push static values, load the sequence.
// 3. RUN: for each step push the step's values, then per average:
//    arm -> trigger -> acquire (trigger always completes before acquire).
// 4. TEARDOWN: every device that saw `connect()` gets `release()`, on every path.
// 5. AGGREGATE + PERSIST. Partial raw data never reaches the disk.

use crate::aggregate::{aggregate, RawSampleBlock, ResultDataset};
use crate::config::LabConfig;
use crate::core::{DeviceSpec, JobDescriptor, Schedule};
use crate::drivers::{AuxiliarySource, DriverRegistry, Sensor, Synchroniser};
use crate::error::{DeviceError, DeviceResult, JobError, JobFailure, Stage};
use crate::sequence::SequenceProgram;
use crate::storage::{CommittedResult, DeviceSnapshot, ResultMetadata, ResultStore, SequenceSnapshot};
use crate::sweep::Sweep;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

// ============================================================================
// 1. STATE & CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Configuring,
    Running { step: usize, average: usize },
    Aggregating,
    Done,
    Failed,
}

/// Shared cancel flag. Honoured at the next (step, average) boundary, and
/// cuts short the pause before an average.
///
/// The runner never clears it. Whoever hands out a job resets it first, so a
/// request that lands before the job's first unit is still seen.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelFlag>);

#[derive(Debug, Default)]
struct CancelFlag {
    raised: AtomicBool,
    wake: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.raised.store(true, Ordering::SeqCst);
        self.0.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.raised.store(false, Ordering::SeqCst);
    }

    /// Resolves once `cancel()` has been called.
    pub async fn cancelled(&self) {
        loop {
            let woken = self.0.wake.notified();
            if self.is_cancelled() {
                return;
            }
            woken.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Bound on every device call after `connect()`, release included.
    pub acquisition_timeout: Duration,
    pub connect_timeout: Duration,
    pub settle: Duration,
    pub sequence_dir: PathBuf,
}

impl From<&LabConfig> for RunnerSettings {
    fn from(cfg: &LabConfig) -> Self {
        Self {
            acquisition_timeout: Duration::from_millis(cfg.acquisition_timeout_ms),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            settle: Duration::from_millis(cfg.settle_ms),
            sequence_dir: cfg.sequences_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dataset: ResultDataset,
    pub committed: CommittedResult,
}

// ============================================================================
// 2. THE PLAN (no I/O)
// ============================================================================

/// A source parameter with its channel settled.
#[derive(Debug, Clone)]
pub struct BoundParam {
    pub parameter: String,
    pub channel: String,
    pub schedule: Schedule,
}

pub struct PlannedSource {
    pub name: String,
    pub dynamic: bool,
    pub spec: DeviceSpec,
    pub params: Vec<BoundParam>,
    handle: Box<dyn AuxiliarySource>,
    connected: bool,
}

/// Every handle the job needs, built but not yet connected.
pub struct JobPlan {
    sensor: Box<dyn Sensor>,
    synchroniser: Box<dyn Synchroniser>,
    pub sources: Vec<PlannedSource>,
    pub sequence: Option<SequenceProgram>,
    sensor_connected: bool,
    synchroniser_connected: bool,
}

impl JobPlan {
    /// Releases everything that saw `connect()`. Safe to call twice.
    async fn release(&mut self, limit: Duration) {
        for src in self.sources.iter_mut().rev() {
            if src.connected {
                let_go(limit, &src.name, src.handle.release()).await;
                src.connected = false;
            }
        }
        if self.sensor_connected {
            let_go(limit, "sensor", self.sensor.release()).await;
            self.sensor_connected = false;
        }
        if self.synchroniser_connected {
            let_go(limit, "synchroniser", self.synchroniser.release()).await;
            self.synchroniser_connected = false;
        }
    }

    pub fn snapshots(&self, job: &JobDescriptor) -> Vec<DeviceSnapshot> {
        let mut out = vec![
            DeviceSnapshot {
                name: "sensor".into(),
                role: "sensor".into(),
                device_type: job.sensor.kind.clone(),
                address: None,
                settings: job
                    .sensor
                    .config
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, yaml_inline(v)))
                    .collect(),
            },
            DeviceSnapshot {
                name: "synchroniser".into(),
                role: "synchroniser".into(),
                device_type: job.synchroniser.kind.clone(),
                address: None,
                settings: job
                    .synchroniser
                    .channel_mapping
                    .iter()
                    .map(|(name, port)| format!("{} -> port {}", name, port))
                    .collect(),
            },
        ];
        for src in &self.sources {
            out.push(DeviceSnapshot {
                name: src.name.clone(),
                role: if src.dynamic { "dynamic" } else { "static" }.into(),
                device_type: src.spec.device_type.clone(),
                address: Some(src.spec.address.clone()),
                settings: src.params.iter().map(describe_param).collect(),
            });
        }
        out
    }
}

fn yaml_inline(v: &serde_yaml::Value) -> String {
    serde_yaml::to_string(v)
        .map(|s| s.trim().replace('\n', " "))
        .unwrap_or_else(|_| "?".into())
}

fn describe_param(p: &BoundParam) -> String {
    let what = match &p.schedule {
        Schedule::Fixed(v) => format!("{}", v),
        Schedule::Dynamic(Sweep::Range(r)) => {
            format!("{}..{} ({} steps, {:?})", r.start, r.stop, r.steps, r.rule)
        }
        Schedule::Dynamic(Sweep::List(values)) => format!("{:?}", values),
    };
    format!("{}@{} = {}", p.parameter, p.channel, what)
}

// ============================================================================
// 3. THE RUNNER
// ============================================================================

pub struct Runner {
    registry: DriverRegistry,
    store: ResultStore,
    settings: RunnerSettings,
    cancel: CancelToken,
    state: RunState,
    stage: Stage,
    history: Vec<RunState>,
}

impl Runner {
    pub fn new(registry: DriverRegistry, store: ResultStore, settings: RunnerSettings) -> Self {
        Self {
            registry,
            store,
            settings,
            cancel: CancelToken::new(),
            state: RunState::Idle,
            stage: Stage::Configuring,
            history: vec![RunState::Idle],
        }
    }

    /// Shares an outside cancel flag with this runner.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state the last job passed through, `Running` once per unit.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn transition(&mut self, next: RunState) {
        log::debug!("runner: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Resolves drivers, parameters and channels, and loads the sequence.
    /// Nothing here talks to hardware: driver constructors are I/O free.
    pub async fn plan(&self, job: &JobDescriptor) -> Result<JobPlan, JobError> {
        let steps = job.dynamic_steps();
        if steps.checked_mul(job.averages).is_none() {
            return Err(JobError::config(
                "data",
                format!("{} steps x {} averages is more units than can be counted", steps, job.averages),
            ));
        }

        let sensor = self
            .registry
            .sensor(&job.sensor)
            .map_err(|e| JobError::from_device("sensor", e))?;
        let synchroniser = self
            .registry
            .synchroniser(&job.synchroniser)
            .map_err(|e| JobError::from_device("synchroniser", e))?;

        let mut sources = Vec::new();
        let groups = [(true, &job.dynamic_devices), (false, &job.static_devices)];
        for (dynamic, devices) in groups {
            for (name, spec) in devices {
                let handle = self
                    .registry
                    .source(name, spec)
                    .map_err(|e| JobError::from_device(name, e))?;
                let resolved = spec.resolve_params(name, steps, dynamic)?;
                let intrinsic = handle.intrinsic_channels();

                let mut params = Vec::with_capacity(resolved.len());
                for p in resolved {
                    let channel = match p.channel {
                        Some(ch) => {
                            if !job.synchroniser.channel_mapping.contains_key(&ch)
                                && !intrinsic.contains(&ch)
                            {
                                return Err(JobError::config(
                                    name.as_str(),
                                    format!(
                                        "channel '{}' of '{}' is neither in the synchroniser channel_mapping nor a channel of {}",
                                        ch, p.parameter, spec.device_type
                                    ),
                                ));
                            }
                            ch
                        }
                        None => intrinsic.first().cloned().ok_or_else(|| {
                            JobError::config(
                                name.as_str(),
                                format!("'{}' names no channel and {} has no default", p.parameter, spec.device_type),
                            )
                        })?,
                    };
                    params.push(BoundParam {
                        parameter: p.parameter,
                        channel,
                        schedule: p.schedule,
                    });
                }

                sources.push(PlannedSource {
                    name: name.clone(),
                    dynamic,
                    spec: spec.clone(),
                    params,
                    handle,
                    connected: false,
                });
            }
        }

        let sequence = match &job.sequence {
            Some(seq) => Some(SequenceProgram::load(seq, &self.settings.sequence_dir).await?),
            None => None,
        };

        Ok(JobPlan {
            sensor,
            synchroniser,
            sources,
            sequence,
            sensor_connected: false,
            synchroniser_connected: false,
        })
    }

    /// Runs one job to a terminal state. Never panics on device trouble;
    /// every failure comes back as a `JobFailure` naming the stage.
    pub async fn execute(&mut self, job: &JobDescriptor) -> Result<JobOutcome, JobFailure> {
        let started_at = Utc::now();
        self.history.clear();
        self.state = RunState::Idle;
        self.stage = Stage::Configuring;
        self.history.push(RunState::Idle);

        log::info!(
            "▶️  Job {} ({}): {} steps x {} averages",
            job.short_id(),
            job.experiment_type,
            job.dynamic_steps(),
            job.averages
        );

        self.transition(RunState::Configuring);
        let mut plan = match self.plan(job).await {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(job, e)),
        };

        let acquired = self.drive(job, &mut plan).await;
        plan.release(self.device_timeout(job)).await;

        let blocks = match acquired {
            Ok(blocks) => blocks,
            // `blocks` died with the error: partial data is discarded here.
            Err(e) => return Err(self.fail(job, e)),
        };

        self.transition(RunState::Aggregating);
        self.stage = Stage::Aggregating;
        let dataset = match aggregate(&blocks, &job.data, job.averages) {
            Ok(d) => d,
            Err(e) => return Err(self.fail(job, e)),
        };
        drop(blocks);

        let stored = match dataset.stored(job.data.compress) {
            Ok(s) => s,
            Err(e) => return Err(self.fail(job, e)),
        };

        let finished_at = Utc::now();
        let mut metadata = ResultMetadata {
            job_id: job.id,
            experiment_type: job.experiment_type.clone(),
            measurement_status: "completed".into(),
            source_file: job.source.clone(),
            started_at,
            finished_at,
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".into()),
            pulselab_version: env!("CARGO_PKG_VERSION").to_string(),
            dynamic_steps: job.dynamic_steps(),
            averages: job.averages,
            compress: job.data.compress,
            sequence: plan.sequence.as_ref().map(|s| SequenceSnapshot {
                path: s.path.clone(),
                sha256: s.digest.clone(),
            }),
            devices: plan.snapshots(job),
            warnings: dataset.warnings.clone(),
            data_file: String::new(),
            data_sha256: String::new(),
            descriptor: job.document.clone(),
        };

        let key = ResultStore::result_key(&job.experiment_type, started_at, job.id);
        self.stage = Stage::Persisting;
        let committed = match self.store.commit(&key, &stored, &mut metadata) {
            Ok(c) => c,
            Err(e) => return Err(self.fail(job, e)),
        };

        self.transition(RunState::Done);
        log::info!(
            "🏁 Job {} done in {:.2}s -> {:?}",
            job.short_id(),
            (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
            committed.data_path
        );

        Ok(JobOutcome {
            job_id: job.id,
            started_at,
            finished_at,
            dataset,
            committed,
        })
    }

    fn device_timeout(&self, job: &JobDescriptor) -> Duration {
        job.acquisition_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.acquisition_timeout)
    }

    fn fail(&mut self, job: &JobDescriptor, error: JobError) -> JobFailure {
        self.transition(RunState::Failed);
        let failure = JobFailure::new(job.id, self.stage, error);
        log::error!("💥 Job {}: {}", job.short_id(), failure);
        failure
    }

    // ------------------------------------------------------------------------
    // Configuring + Running
    // ------------------------------------------------------------------------

    async fn drive(
        &mut self,
        job: &JobDescriptor,
        plan: &mut JobPlan,
    ) -> Result<Vec<RawSampleBlock>, JobError> {
        let timeout = self.device_timeout(job);
        self.configure(job, plan, timeout).await?;
        self.stage = Stage::Running;

        let steps = job.dynamic_steps();
        let averages = job.averages;
        let cancel = self.cancel.clone();

        // Grows with the units actually acquired.
        let mut blocks = Vec::new();
        for step in 0..steps {
            // Step values are pushed once, before any acquisition of the step.
            for src in plan.sources.iter_mut().filter(|s| s.dynamic) {
                for p in &src.params {
                    if let Schedule::Dynamic(sweep) = &p.schedule {
                        let value = sweep.value_at(step);
                        bounded(timeout, &src.name, src.handle.configure(&p.channel, &p.parameter, value))
                            .await
                            .map_err(|e| JobError::from_device_at(&src.name, step, 0, e))?;
                    }
                }
            }
            if !self.settings.settle.is_zero() {
                tokio::time::sleep(self.settings.settle).await;
            }

            for average in 0..averages {
                if cancel.is_cancelled() {
                    return Err(cancelled(job, step, average));
                }
                self.transition(RunState::Running { step, average });

                if let Some(pause) = job.sleep {
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = cancel.cancelled() => return Err(cancelled(job, step, average)),
                    }
                }

                bounded(timeout, "sensor", plan.sensor.arm())
                    .await
                    .map_err(|e| JobError::from_device_at("sensor", step, average, e))?;
                bounded(timeout, "synchroniser", plan.synchroniser.trigger())
                    .await
                    .map_err(|e| JobError::from_device_at("synchroniser", step, average, e))?;
                let frames = bounded(timeout, "sensor", plan.sensor.acquire())
                    .await
                    .map_err(|e| JobError::from_device_at("sensor", step, average, e))?;

                blocks.push(RawSampleBlock {
                    step,
                    average,
                    frames,
                });
            }
            log::debug!("Job {}: step {}/{} complete", job.short_id(), step + 1, steps);
        }
        Ok(blocks)
    }

    async fn configure(
        &mut self,
        job: &JobDescriptor,
        plan: &mut JobPlan,
        timeout: Duration,
    ) -> Result<(), JobError> {
        // Connect everything first: a missing device fails the job before
        // any configuration is sent.
        let reach = self.settings.connect_timeout;
        plan.synchroniser_connected = true;
        bounded(reach, "synchroniser", plan.synchroniser.connect())
            .await
            .map_err(|e| JobError::from_device("synchroniser", e))?;
        plan.sensor_connected = true;
        bounded(reach, "sensor", plan.sensor.connect())
            .await
            .map_err(|e| JobError::from_device("sensor", e))?;
        for src in plan.sources.iter_mut() {
            src.connected = true;
            bounded(reach, &src.name, src.handle.connect())
                .await
                .map_err(|e| JobError::from_device(&src.name, e))?;
        }

        bounded(timeout, "synchroniser", plan.synchroniser.configure(&job.synchroniser.config))
            .await
            .map_err(|e| JobError::from_device("synchroniser", e))?;
        bounded(
            timeout,
            "synchroniser",
            plan.synchroniser.set_channel_mapping(&job.synchroniser.channel_mapping),
        )
        .await
        .map_err(|e| JobError::from_device("synchroniser", e))?;
        bounded(timeout, "sensor", plan.sensor.configure(&job.sensor.config))
            .await
            .map_err(|e| JobError::from_device("sensor", e))?;

        // Fixed values: static devices plus the non-swept parameters of dynamic ones.
        for src in plan.sources.iter_mut() {
            for p in &src.params {
                if let Schedule::Fixed(value) = p.schedule {
                    bounded(timeout, &src.name, src.handle.configure(&p.channel, &p.parameter, value))
                        .await
                        .map_err(|e| JobError::from_device(&src.name, e))?;
                }
            }
        }

        match &plan.sequence {
            Some(program) => bounded(timeout, "synchroniser", plan.synchroniser.load_sequence(program))
                .await
                .map_err(|e| JobError::from_device("synchroniser", e))?,
            None => log::info!("Job {} has no sequence program; synchroniser keeps its own", job.short_id()),
        }
        Ok(())
    }
}

fn cancelled(job: &JobDescriptor, step: usize, average: usize) -> JobError {
    log::warn!("🛑 Job {} cancelled at step {}, average {}", job.short_id(), step, average);
    JobError::Cancelled { step, average }
}

/// A device call that must finish within `limit`. Every call the runner
/// makes goes through here.
async fn bounded<T>(
    limit: Duration,
    device: &str,
    call: impl Future<Output = DeviceResult<T>>,
) -> DeviceResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(res) => res,
        Err(_) => {
            log::warn!("⏱️  {} did not answer within {} ms", device, limit.as_millis());
            Err(DeviceError::Timeout(limit.as_millis() as u64))
        }
    }
}

/// `release()` with a deadline. A device stuck there is abandoned.
async fn let_go(limit: Duration, device: &str, release: impl Future<Output = ()>) {
    if tokio::time::timeout(limit, release).await.is_err() {
        log::warn!("⏱️  {} did not release within {} ms; abandoned", device, limit.as_millis());
    }
}
