// src/sequence.rs
//
// =============================================================================
// PULSELAB: SEQUENCE PROGRAMS (v 0.3 )
// =============================================================================
//
// The pulse sequence is authored elsewhere and is opaque to us.
// We locate it, fingerprint it, bundle it with the job's parameters and hand
// the bundle to the synchroniser. What the bytes mean is the driver's business.

use crate::core::{ConfigMap, SequenceRef};
use crate::error::JobError;
use crate::storage::sha256_bytes;

use std::path::{Path, PathBuf};

/// A loaded program, ready for `Synchroniser::load_sequence`.
#[derive(Debug, Clone)]
pub struct SequenceProgram {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub params: ConfigMap,
    /// SHA-256 of `bytes`, recorded in the result metadata.
    pub digest: String,
}

impl SequenceProgram {
    /// Resolves `seq.path` (relative paths against `sequence_dir`) and reads it.
    /// Any failure here is a configuration error: the job cannot be played.
    pub async fn load(seq: &SequenceRef, sequence_dir: &Path) -> Result<Self, JobError> {
        let path = if seq.path.is_absolute() {
            seq.path.clone()
        } else {
            sequence_dir.join(&seq.path)
        };

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            JobError::config("sequence", format!("cannot read program {:?}: {}", path, e))
        })?;
        if bytes.is_empty() {
            return Err(JobError::config(
                "sequence",
                format!("program {:?} is empty", path),
            ));
        }

        let digest = sha256_bytes(&bytes);
        log::debug!("Loaded sequence {:?} ({} bytes, sha256 {})", path, bytes.len(), &digest[..12]);

        Ok(Self {
            path,
            bytes,
            params: seq.params.clone(),
            digest,
        })
    }
}
