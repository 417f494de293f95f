//! WAL log record structures and the on-disk frame format
//!
//! Each record is stored as one frame:
//! ```text
//! +----------------+----------------+-------------------------+
//! | len: u32 (LE)  | crc32: u32 (LE)| bincode(LogRecord)      |
//! +----------------+----------------+-------------------------+
//! ```
//! A frame cut short by the end of the file is a torn tail (the crash hit
//! mid-write). A complete frame whose checksum does not match is corruption.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BasaltError, Result};
use crate::types::{Lsn, PageId, SlotId, TxnId, VersionImage};

const FRAME_HEADER: usize = 8;

/// A WAL log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Transaction ID
    pub txn_id: TxnId,
    /// This transaction's previous record
    pub prev_lsn: Option<Lsn>,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
    pub body: LogBody,
}

/// Status of a transaction in the Active Transaction Table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttStatus {
    /// R: running
    Running,
    /// C: commit record appended, not known durable
    Committing,
    /// U: must be rolled back
    Undo,
}

/// Active Transaction Table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttEntry {
    pub txn_id: TxnId,
    pub status: AttStatus,
    pub last_lsn: Option<Lsn>,
    /// Oldest record of the transaction; undo may reach back this far
    pub first_lsn: Option<Lsn>,
}

/// Dirty Page Table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DptEntry {
    pub page_id: PageId,
    pub rec_lsn: Lsn,
}

/// What a record says happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogBody {
    /// Transaction started
    Begin,
    /// A page slot changed from `before` to `after`
    Update {
        page_id: PageId,
        slot: SlotId,
        before: Option<VersionImage>,
        after: Option<VersionImage>,
    },
    /// Transaction committed (durable once flushed)
    Commit,
    /// Rollback started
    Abort,
    /// Compensation: `image` was written while undoing; redo-only
    Clr {
        page_id: PageId,
        slot: SlotId,
        image: Option<VersionImage>,
        /// Next record of the transaction still to undo
        undo_next_lsn: Option<Lsn>,
    },
    /// Rollback finished; the transaction is gone
    End,
    /// Start of a checkpoint; recovery's analysis begins here
    CheckpointBegin,
    /// Tables captured by the checkpoint
    CheckpointEnd {
        att: Vec<AttEntry>,
        dpt: Vec<DptEntry>,
        next_txn_id: TxnId,
    },
}

impl LogRecord {
    /// Page touched by this record, if it modifies one
    pub fn page_id(&self) -> Option<PageId> {
        match &self.body {
            LogBody::Update { page_id, .. } | LogBody::Clr { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    pub fn is_page_write(&self) -> bool {
        self.page_id().is_some()
    }

    /// Short record type name for logs and the CLI
    pub fn kind(&self) -> &'static str {
        match &self.body {
            LogBody::Begin => "BEGIN",
            LogBody::Update { .. } => "UPDATE",
            LogBody::Commit => "COMMIT",
            LogBody::Abort => "ABORT",
            LogBody::Clr { .. } => "CLR",
            LogBody::End => "END",
            LogBody::CheckpointBegin => "CKPT-BEGIN",
            LogBody::CheckpointEnd { .. } => "CKPT-END",
        }
    }
}

/// Encode one record as a checksummed frame
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of reading a whole log file
#[derive(Debug, Default)]
pub struct LogScan {
    /// Records in LSN order
    pub records: Vec<LogRecord>,
    /// Byte length of the well-formed prefix
    pub valid_len: u64,
    /// The file ended in the middle of a frame
    pub torn_tail: bool,
}

impl LogScan {
    pub fn last_lsn(&self) -> Lsn {
        self.records.last().map(|r| r.lsn).unwrap_or(0)
    }
}

/// Decode a buffer of frames
pub fn decode_frames(data: &[u8]) -> Result<LogScan> {
    let mut scan = LogScan::default();
    let mut offset = 0usize;

    while offset < data.len() {
        let last_good_lsn = scan.last_lsn();
        if data.len() - offset < FRAME_HEADER {
            scan.torn_tail = true;
            break;
        }
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let start = offset + FRAME_HEADER;
        if data.len() - start < len {
            scan.torn_tail = true;
            break;
        }
        let payload = &data[start..start + len];
        if crc32fast::hash(payload) != crc {
            return Err(BasaltError::CorruptLog {
                last_good_lsn,
                reason: format!("checksum mismatch in frame at byte {}", offset),
            });
        }
        let record: LogRecord = bincode::deserialize(payload).map_err(|e| {
            BasaltError::CorruptLog {
                last_good_lsn,
                reason: format!("undecodable frame at byte {}: {}", offset, e),
            }
        })?;
        if record.lsn <= last_good_lsn {
            return Err(BasaltError::CorruptLog {
                last_good_lsn,
                reason: format!("LSN {} does not follow {}", record.lsn, last_good_lsn),
            });
        }
        scan.records.push(record);
        offset = start + len;
        scan.valid_len = offset as u64;
    }

    Ok(scan)
}

/// Read every record from a log file. A missing file is an empty log.
pub fn read_log(path: &Path) -> Result<LogScan> {
    if !path.exists() {
        return Ok(LogScan::default());
    }
    let data = fs::read(path)?;
    decode_frames(&data)
}
