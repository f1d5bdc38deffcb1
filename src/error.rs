// src/error.rs
//
// =============================================================================
// PULSELAB: ERROR TAXONOMY (v 0.3 )
// =============================================================================
//
// Every way a job can end badly.
//
// Policy:
// - Errors are job-fatal, never process-fatal.
// - Each failure names the job, the stage, and (where known) the device.
// - Nothing is retried here. Callers decide, and currently they never do.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// 1. DEVICE-LEVEL ERRORS (Reported by drivers)
// ============================================================================

/// What a driver can say went wrong.
/// The runner lifts these into `JobError` with device/stage context attached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("acquisition failed: {0}")]
    Acquisition(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

// ============================================================================
// 2. JOB-LEVEL ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum JobError {
    /// Malformed descriptor. The file is rejected, the system moves on.
    #[error("parse error in {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Unknown device type, invalid range, unresolved channel.
    /// Raised before any hardware is touched where possible.
    #[error("configuration error [{device}]: {reason}")]
    Config { device: String, reason: String },

    #[error("connection error [{device}]: {reason}")]
    Connection { device: String, reason: String },

    #[error("acquisition error [{device}] at step {step}, average {average}: {reason}")]
    Acquisition {
        device: String,
        step: usize,
        average: usize,
        reason: String,
    },

    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error("cancelled at step {step}, average {average}")]
    Cancelled { step: usize, average: usize },

    #[error("failed to persist result: {0}")]
    Persist(#[from] std::io::Error),

    /// The runner itself broke (a panic). The lab carries on.
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Parse { .. } => ErrorKind::Parse,
            JobError::Config { .. } => ErrorKind::Config,
            JobError::Connection { .. } => ErrorKind::Connection,
            JobError::Acquisition { .. } => ErrorKind::Acquisition,
            JobError::Aggregation(_) => ErrorKind::Aggregation,
            JobError::Cancelled { .. } => ErrorKind::Cancelled,
            JobError::Persist(_) => ErrorKind::Persist,
            JobError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn config(device: impl Into<String>, reason: impl Into<String>) -> Self {
        JobError::Config {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Lifts a driver error raised outside the acquisition loop.
    /// A device that stops answering there counts as lost.
    pub fn from_device(device: &str, err: DeviceError) -> Self {
        match err {
            DeviceError::Config(reason) => JobError::config(device, reason),
            DeviceError::Connection(reason) => JobError::Connection {
                device: device.to_string(),
                reason,
            },
            DeviceError::Timeout(ms) => JobError::Connection {
                device: device.to_string(),
                reason: format!("no answer within {} ms", ms),
            },
            // Outside the loop there is no (step, average); report it as 0/0.
            other => JobError::Acquisition {
                device: device.to_string(),
                step: 0,
                average: 0,
                reason: other.to_string(),
            },
        }
    }

    /// Lifts a driver error raised inside the (step, average) loop.
    pub fn from_device_at(device: &str, step: usize, average: usize, err: DeviceError) -> Self {
        match err {
            DeviceError::Config(reason) => JobError::config(device, reason),
            DeviceError::Connection(reason) => JobError::Connection {
                device: device.to_string(),
                reason,
            },
            other => JobError::Acquisition {
                device: device.to_string(),
                step,
                average,
                reason: other.to_string(),
            },
        }
    }
}

// ============================================================================
// 3. REPORTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Parse,
    Config,
    Connection,
    Acquisition,
    Aggregation,
    Cancelled,
    Persist,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Parse => "ParseError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Acquisition => "AcquisitionError",
            ErrorKind::Aggregation => "AggregationError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Persist => "PersistError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(s)
    }
}

/// Where in the lifecycle a job was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Configuring,
    Running,
    Aggregating,
    Persisting,
    /// The runner was lost mid-job; where exactly is unknown.
    Executor,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The user-visible failure record: job identity, error kind, stage.
#[derive(Debug)]
pub struct JobFailure {
    pub job_id: Uuid,
    pub stage: Stage,
    pub error: JobError,
}

impl JobFailure {
    pub fn new(job_id: Uuid, stage: Stage, error: JobError) -> Self {
        Self {
            job_id,
            stage,
            error,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} failed during {} ({}): {}",
            self.job_id, self.stage, self.error.kind(), self.error
        )
    }
}

impl std::error::Error for JobFailure {}
