// src/journal.rs
//
// =============================================================================
// PULSELAB: JOB JOURNAL (v 0.3 )
// =============================================================================
//
// Append-only history of everything the lab did: which files were accepted
// or rejected, which jobs started, how each one ended.
//
// Frame layout (little endian):
//   [MAGIC "PLAB"][CRC32 of body][LEN][body = bincode(JournalRecord)]
//
// - A torn tail (crash mid-append) is ignored on read.
// - A damaged frame is skipped; the reader resyncs on the next MAGIC.

use anyhow::{Context, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MAGIC: u32 = 0x504C_4142; // "PLAB"
const HEADER_LEN: usize = 12;
const MAX_BODY: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    LabStarted,
    LabStopped,
    Accepted,
    Rejected,
    Started,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub ts_ms: i64,
    pub kind: EntryKind,
    pub job_id: Option<Uuid>,
    pub detail: String,
}

// ============================================================================
// 1. WRITER
// ============================================================================

pub struct Journal {
    path: PathBuf,
    out: BufWriter<File>,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {:?}", path))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, kind: EntryKind, job_id: Option<Uuid>, detail: impl Into<String>) -> Result<()> {
        let record = JournalRecord {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            job_id,
            detail: detail.into(),
        };
        let body = bincode::serialize(&record).context("Journal record serialization failed")?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|l| *l <= MAX_BODY)
            .with_context(|| format!("Journal record too large ({} bytes)", body.len()))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&MAGIC.to_le_bytes());
        frame.extend_from_slice(&crc(&body).to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);

        // One write per frame keeps a crash down to at most one torn tail.
        self.out.write_all(&frame)?;
        self.out.flush()?;
        self.out.get_ref().sync_data().ok();
        Ok(())
    }

    /// Logging wrapper for the orchestrator: a journal hiccup is never job-fatal.
    pub fn note(&mut self, kind: EntryKind, job_id: Option<Uuid>, detail: impl Into<String>) {
        if let Err(e) = self.append(kind, job_id, detail) {
            log::error!("Journal write failed ({:?}): {:#}", self.path, e);
        }
    }
}

fn crc(bytes: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(bytes);
    h.finalize()
}

// ============================================================================
// 2. READER
// ============================================================================

/// Everything readable in the journal, oldest first.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>> {
    let path = path.as_ref();
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read journal {:?}", path)),
    };
    Ok(decode_frames(&bytes))
}

/// Walks a byte buffer frame by frame, resyncing past damage.
pub fn decode_frames(bytes: &[u8]) -> Vec<JournalRecord> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos + HEADER_LEN <= bytes.len() {
        match decode_at(bytes, pos) {
            Frame::Record(rec, next) => {
                records.push(rec);
                pos = next;
            }
            Frame::Torn => break,
            Frame::Damaged => {
                log::warn!("Journal damaged at offset {}. Resyncing...", pos);
                match find_magic(bytes, pos + 1) {
                    Some(p) => pos = p,
                    None => break,
                }
            }
        }
    }
    records
}

enum Frame {
    Record(JournalRecord, usize),
    Torn,
    Damaged,
}

fn word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn decode_at(bytes: &[u8], pos: usize) -> Frame {
    if word(bytes, pos) != MAGIC {
        return Frame::Damaged;
    }
    let expected = word(bytes, pos + 4);
    let len = word(bytes, pos + 8);
    if len > MAX_BODY {
        return Frame::Damaged;
    }
    let start = pos + HEADER_LEN;
    let end = start + len as usize;
    if end > bytes.len() {
        // Either the tail was torn, or the length is garbage and a later
        // frame exists. Only the second case is worth a resync.
        return if find_magic(bytes, pos + 1).is_some() {
            Frame::Damaged
        } else {
            Frame::Torn
        };
    }
    let body = &bytes[start..end];
    if crc(body) != expected {
        return Frame::Damaged;
    }
    match bincode::deserialize::<JournalRecord>(body) {
        Ok(rec) => Frame::Record(rec, end),
        Err(_) => Frame::Damaged,
    }
}

fn find_magic(bytes: &[u8], from: usize) -> Option<usize> {
    let needle = MAGIC.to_le_bytes();
    bytes
        .get(from..)?
        .windows(4)
        .position(|w| w == needle)
        .map(|i| from + i)
}
