//! Checkpoints
//!
//! A checkpoint writes a `CheckpointBegin` record, forces the log and every
//! dirty page, then writes `CheckpointEnd` carrying the Active Transaction
//! Table and Dirty Page Table. Once that record is durable, a small JSON
//! marker (`wal.checkpoint`) is replaced atomically so recovery knows where
//! to start, and the log prefix nobody can need any more is dropped.
//!
//! The caller guarantees no page is modified while this runs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BasaltError, Result};
use crate::types::{Lsn, TxnId, SYSTEM_TXN};
use super::buffer::BufferPool;
use super::log::{AttEntry, LogBody};
use super::wal::{timestamp, WalManager};

/// Contents of `wal.checkpoint`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// LSN of the CheckpointBegin record; analysis starts here
    pub lsn: Lsn,
    /// LSN of the matching CheckpointEnd record
    pub end_lsn: Lsn,
    pub next_txn_id: TxnId,
    pub active_txns: Vec<TxnId>,
    pub durable_lsn: Lsn,
    pub timestamp: u64,
}

impl CheckpointMarker {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("wal.checkpoint")
    }

    /// Load the marker; a missing or unreadable marker means "scan everything"
    pub fn read(data_dir: &Path) -> Option<Self> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(s) => match serde_json::from_str(&s) {
                Ok(marker) => Some(marker),
                Err(e) => {
                    log::warn!("Failed to parse checkpoint file: {}", e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read checkpoint file '{}': {}", path.display(), e);
                None
            }
        }
    }

    /// Replace the marker atomically
    pub fn write(&self, data_dir: &Path) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(data_dir)?;
        tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::path(data_dir)).map_err(|e| BasaltError::Io(e.error))?;
        Ok(())
    }
}

/// What a checkpoint did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOutcome {
    pub begin_lsn: Lsn,
    pub end_lsn: Lsn,
    pub pages_flushed: usize,
    /// Records dropped from the head of the log
    pub records_truncated: usize,
}

/// Oldest LSN recovery may still read: the checkpoint itself, and every
/// record of a transaction that may have to be undone
pub fn truncation_point(begin_lsn: Lsn, min_rec_lsn: Option<Lsn>, att: &[AttEntry]) -> Lsn {
    att.iter()
        .filter_map(|e| e.first_lsn)
        .chain(min_rec_lsn)
        .fold(begin_lsn, Lsn::min)
}

/// Run a checkpoint over a quiesced engine. `active` is read after
/// CheckpointBegin is appended; no transaction may begin or log its commit
/// until the checkpoint returns.
pub fn run_checkpoint<F>(
    data_dir: &Path,
    wal: &WalManager,
    pool: &BufferPool,
    active: F,
    next_txn_id: TxnId,
) -> Result<CheckpointOutcome>
where
    F: FnOnce() -> Result<Vec<AttEntry>>,
{
    let begin = wal.append(SYSTEM_TXN, None, LogBody::CheckpointBegin)?;
    let att = active()?;
    wal.flush(begin.lsn)?;

    let pages_flushed = pool.flush_all()?;
    let dpt = pool.dirty_pages().snapshot();
    let min_rec_lsn = dpt.iter().map(|e| e.rec_lsn).min();
    let keep_from = truncation_point(begin.lsn, min_rec_lsn, &att);
    let active_txns: Vec<TxnId> = att.iter().map(|e| e.txn_id).collect();

    let end = wal.append(
        SYSTEM_TXN,
        Some(begin.lsn),
        LogBody::CheckpointEnd { att, dpt, next_txn_id },
    )?;
    wal.flush(end.lsn)?;

    let marker = CheckpointMarker {
        lsn: begin.lsn,
        end_lsn: end.lsn,
        next_txn_id,
        active_txns,
        durable_lsn: wal.durable_lsn(),
        timestamp: timestamp(),
    };
    marker.write(data_dir)?;

    let records_truncated = wal.truncate_before(keep_from)?;
    wal.reset_checkpoint_counter();

    log::info!(
        "Checkpoint complete at LSN {}: {} pages flushed, {} log records truncated",
        begin.lsn,
        pages_flushed,
        records_truncated
    );
    Ok(CheckpointOutcome {
        begin_lsn: begin.lsn,
        end_lsn: end.lsn,
        pages_flushed,
        records_truncated,
    })
}
