// src/storage.rs
//
// =============================================================================
// PULSELAB: RESULT STORE (v 0.3 )
// =============================================================================
//
// The Vault.
//
// Responsibilities:
// 1. Atomic Renames: a dataset "appears" complete or not at all.
// 2. Fingerprints: every dataset is recorded with its SHA-256.
// 3. Metadata: descriptor snapshot, timings, host and device plan, as YAML.
// 4. Durability: explicit fsyncs before and after the rename.

use crate::aggregate::StoredDataset;
use crate::error::JobError;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ============================================================================
// 1. HASHING UTILITIES
// ============================================================================

/// SHA-256 of a file, streamed in 64 KiB chunks.
pub fn sha256_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("Failed to open for hashing: {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// 2. METADATA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub role: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// `parameter@channel = value` or `parameter@channel = start..stop (n)`.
    #[serde(default)]
    pub settings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub job_id: Uuid,
    pub experiment_type: String,
    pub measurement_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub host: String,
    pub pulselab_version: String,
    pub dynamic_steps: usize,
    pub averages: usize,
    pub compress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceSnapshot>,
    pub devices: Vec<DeviceSnapshot>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Filled in by `ResultStore::commit`.
    #[serde(default)]
    pub data_file: String,
    #[serde(default)]
    pub data_sha256: String,
    pub descriptor: serde_yaml::Value,
}

// ============================================================================
// 3. THE STORE
// ============================================================================

#[derive(Debug, Clone)]
pub struct CommittedResult {
    pub data_path: PathBuf,
    pub metadata_path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `<experiment>_<YYYYmmdd-HHMMSS>_<id8>`, safe as a file stem.
    pub fn result_key(experiment_type: &str, at: DateTime<Utc>, job_id: Uuid) -> String {
        let exp: String = experiment_type
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let id8: String = job_id.to_string().chars().take(8).collect();
        format!("{}_{}_{}", exp, at.format("%Y%m%d-%H%M%S"), id8)
    }

    /// Writes `<key>.bin` then `<key>.yaml`.
    ///
    /// Strategy:
    /// 1. Serialize to `<key>.bin.tmp`, fsync, rename.
    /// 2. Hash the committed file into the metadata.
    /// 3. Same temp/rename dance for the metadata.
    /// If step 3 fails the dataset is removed again: no orphan results.
    pub fn commit(
        &self,
        key: &str,
        dataset: &StoredDataset,
        metadata: &mut ResultMetadata,
    ) -> Result<CommittedResult, JobError> {
        let data_path = self.root.join(format!("{}.bin", key));
        let metadata_path = self.root.join(format!("{}.yaml", key));

        let bytes = bincode::serialize(dataset)
            .map_err(|e| JobError::Persist(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        write_atomic(&data_path, &bytes)?;

        metadata.data_file = format!("{}.bin", key);
        metadata.data_sha256 = sha256_bytes(&bytes);

        let meta_result = serde_yaml::to_string(metadata)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .and_then(|yaml| write_atomic(&metadata_path, yaml.as_bytes()));
        if let Err(e) = meta_result {
            fs::remove_file(&data_path).ok();
            return Err(JobError::Persist(e));
        }

        // Flush the directory entries so both files are visible after a crash.
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }

        Ok(CommittedResult {
            data_path,
            metadata_path,
            sha256: metadata.data_sha256.clone(),
        })
    }

    /// Reads a dataset written by `commit`.
    pub fn load_dataset(path: impl AsRef<Path>) -> anyhow::Result<StoredDataset> {
        let bytes = fs::read(path.as_ref())
            .with_context(|| format!("Failed to read dataset {:?}", path.as_ref()))?;
        bincode::deserialize(&bytes).context("Dataset is not a valid bincode container")
    }

    pub fn load_metadata(path: impl AsRef<Path>) -> anyhow::Result<ResultMetadata> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read metadata {:?}", path.as_ref()))?;
        serde_yaml::from_str(&text).context("Metadata is not valid YAML")
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let written = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if written.is_err() {
        fs::remove_file(&tmp).ok();
    }
    written
}
