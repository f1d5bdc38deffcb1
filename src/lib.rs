// src/lib.rs
//
// =============================================================================
// PULSELAB: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod aggregate;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod guardian;
pub mod intake;
pub mod journal;
pub mod runner;
pub mod sequence;
pub mod storage;
pub mod sweep;

// 2. Re-exports (The Public API)

pub use aggregate::{aggregate, Frames, RawSampleBlock, ResultDataset};
pub use config::LabConfig;
pub use core::{AveragingMode, DataSpec, JobDescriptor};
pub use drivers::{DriverRegistry, MockProbe};
pub use error::{DeviceError, ErrorKind, JobError, JobFailure, Stage};
pub use guardian::LabGuardian;
pub use runner::{CancelToken, JobOutcome, RunState, Runner, RunnerSettings};
pub use storage::ResultStore;
