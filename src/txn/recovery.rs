//! ARIES crash recovery
//!
//! Three passes over the log, in order:
//!
//! 1. **Analysis** scans forward from the last checkpoint and rebuilds the
//!    Active Transaction Table and Dirty Page Table as of the crash.
//! 2. **Redo** repeats history from the earliest recLSN: every page write,
//!    losers included, is reapplied unless the page LSN shows the page
//!    already has it.
//! 3. **Undo** rolls back every loser, newest record first across all of
//!    them, writing a CLR per undone change. A CLR is never undone; its
//!    `undo_next_lsn` skips what it already compensated, so a crash during
//!    undo resumes where it stopped.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;

use crate::error::{BasaltError, Result};
use crate::types::{Lsn, PageId, TxnId, SYSTEM_TXN};
use super::checkpoint::CheckpointMarker;
use super::log::{AttEntry, AttStatus, LogBody, LogRecord, LogScan};
use super::version::VersionStore;
use super::wal::WalManager;

/// What a recovery run found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// CheckpointBegin LSN analysis started from
    pub checkpoint_lsn: Option<Lsn>,
    pub records_scanned: usize,
    /// The log ended in a partially written frame that was cut off
    pub torn_tail: bool,
    pub redo_start: Option<Lsn>,
    pub records_redone: usize,
    /// Transactions rolled back
    pub losers: Vec<TxnId>,
    pub clrs_written: usize,
    pub next_lsn: Lsn,
    pub next_txn_id: TxnId,
}

/// ATT and DPT as of the crash
#[derive(Debug, Default)]
pub struct Analysis {
    pub att: HashMap<TxnId, AttEntry>,
    pub dpt: HashMap<PageId, Lsn>,
    pub checkpoint_lsn: Option<Lsn>,
    pub max_txn_id: TxnId,
}

impl Analysis {
    pub fn redo_start(&self) -> Option<Lsn> {
        self.dpt.values().min().copied()
    }

    /// Transactions with no terminating record, oldest first
    pub fn losers(&self) -> Vec<TxnId> {
        let mut out: Vec<TxnId> = self.att.keys().copied().collect();
        out.sort_unstable();
        out
    }
}

/// Recovery state tracker
pub struct RecoveryManager {
    data_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn checkpoint_marker(&self) -> Option<CheckpointMarker> {
        CheckpointMarker::read(&self.data_dir)
    }

    /// Pass 1: rebuild the ATT and DPT
    pub fn analyze(&self, records: &[LogRecord], marker: Option<&CheckpointMarker>) -> Analysis {
        let mut analysis = Analysis::default();
        let mut ended: HashSet<TxnId> = HashSet::new();

        // Fall back to a full scan if the marked checkpoint is not in the log
        let start = marker
            .and_then(|m| records.iter().position(|r| r.lsn == m.lsn))
            .unwrap_or(0);
        if let Some(marker) = marker {
            if start > 0 || records.first().map(|r| r.lsn) == Some(marker.lsn) {
                analysis.checkpoint_lsn = Some(marker.lsn);
                log::info!("Found checkpoint at LSN {} - starting analysis there", marker.lsn);
            } else {
                log::warn!("Checkpoint LSN {} not in log, analysing from the start", marker.lsn);
            }
            analysis.max_txn_id = marker.next_txn_id.saturating_sub(1);
        }

        for record in &records[start..] {
            analysis.max_txn_id = analysis.max_txn_id.max(record.txn_id);
            let txn_id = record.txn_id;

            match &record.body {
                LogBody::Begin => {
                    analysis.att.insert(
                        txn_id,
                        AttEntry {
                            txn_id,
                            status: AttStatus::Running,
                            last_lsn: Some(record.lsn),
                            first_lsn: Some(record.lsn),
                        },
                    );
                }
                LogBody::Update { page_id, .. } | LogBody::Clr { page_id, .. } => {
                    analysis.dpt.entry(*page_id).or_insert(record.lsn);
                    if txn_id != SYSTEM_TXN {
                        let entry = analysis.att.entry(txn_id).or_insert(AttEntry {
                            txn_id,
                            status: AttStatus::Running,
                            last_lsn: None,
                            first_lsn: Some(record.lsn),
                        });
                        entry.last_lsn = Some(record.lsn);
                    }
                }
                LogBody::Abort => {
                    let entry = analysis.att.entry(txn_id).or_insert(AttEntry {
                        txn_id,
                        status: AttStatus::Undo,
                        last_lsn: None,
                        first_lsn: Some(record.lsn),
                    });
                    entry.status = AttStatus::Undo;
                    entry.last_lsn = Some(record.lsn);
                }
                LogBody::Commit | LogBody::End => {
                    analysis.att.remove(&txn_id);
                    ended.insert(txn_id);
                }
                LogBody::CheckpointBegin => {}
                LogBody::CheckpointEnd { att, dpt, next_txn_id } => {
                    analysis.max_txn_id = analysis.max_txn_id.max(next_txn_id.saturating_sub(1));
                    for saved in att {
                        // A commit record precedes every Committing entry
                        if ended.contains(&saved.txn_id) || saved.status == AttStatus::Committing {
                            continue;
                        }
                        let entry = analysis.att.entry(saved.txn_id).or_insert_with(|| saved.clone());
                        entry.first_lsn = match (entry.first_lsn, saved.first_lsn) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        if saved.status == AttStatus::Undo {
                            entry.status = AttStatus::Undo;
                        }
                    }
                    for saved in dpt {
                        let rec_lsn = analysis.dpt.entry(saved.page_id).or_insert(saved.rec_lsn);
                        *rec_lsn = (*rec_lsn).min(saved.rec_lsn);
                    }
                }
            }
        }

        log::info!(
            "Analysis: {} records, {} loser transactions, {} dirty pages",
            records.len() - start,
            analysis.att.len(),
            analysis.dpt.len()
        );
        analysis
    }

    /// Pass 2: repeat history
    pub fn redo(&self, records: &[LogRecord], analysis: &Analysis, store: &VersionStore) -> Result<usize> {
        let Some(start) = analysis.redo_start() else {
            return Ok(0);
        };
        let mut redone = 0;
        for record in records.iter().filter(|r| r.lsn >= start) {
            let Some(page_id) = record.page_id() else {
                continue;
            };
            match analysis.dpt.get(&page_id) {
                Some(rec_lsn) if record.lsn >= *rec_lsn => {}
                _ => continue,
            }
            if store.redo(record)? {
                redone += 1;
            }
        }
        log::info!("Redo from LSN {}: {} records reapplied", start, redone);
        Ok(redone)
    }

    /// Pass 3: roll back every loser. Returns the number of CLRs written.
    pub fn undo(
        &self,
        records: &[LogRecord],
        analysis: &Analysis,
        store: &VersionStore,
        wal: &WalManager,
    ) -> Result<usize> {
        let by_lsn: HashMap<Lsn, &LogRecord> = records.iter().map(|r| (r.lsn, r)).collect();
        let mut last_lsn: HashMap<TxnId, Option<Lsn>> = HashMap::new();
        let mut queue: BinaryHeap<(Lsn, TxnId)> = BinaryHeap::new();

        for txn_id in analysis.losers() {
            let entry = &analysis.att[&txn_id];
            let mut last = entry.last_lsn;
            if entry.status != AttStatus::Undo {
                let abort = wal.append(txn_id, last, LogBody::Abort)?;
                last = Some(abort.lsn);
            }
            last_lsn.insert(txn_id, last);
            match entry.last_lsn {
                Some(lsn) => queue.push((lsn, txn_id)),
                None => self.end_loser(wal, txn_id, last)?,
            }
        }

        let mut clrs = 0;
        while let Some((lsn, txn_id)) = queue.pop() {
            let record = by_lsn.get(&lsn).ok_or_else(|| BasaltError::CorruptLog {
                last_good_lsn: records.last().map(|r| r.lsn).unwrap_or(0),
                reason: format!("record {} of transaction {} missing from the log", lsn, txn_id),
            })?;

            let next = match &record.body {
                LogBody::Update { .. } => {
                    let prev = last_lsn.get(&txn_id).copied().flatten();
                    let clr = store.compensate(record, |body| wal.append(txn_id, prev, body))?;
                    last_lsn.insert(txn_id, Some(clr.lsn));
                    clrs += 1;
                    record.prev_lsn
                }
                LogBody::Clr { undo_next_lsn, .. } => *undo_next_lsn,
                LogBody::Begin => None,
                _ => record.prev_lsn,
            };

            match next {
                Some(next) => queue.push((next, txn_id)),
                None => {
                    let last = last_lsn.get(&txn_id).copied().flatten();
                    self.end_loser(wal, txn_id, last)?;
                }
            }
        }

        log::info!("Undo: {} losers rolled back, {} CLRs written", last_lsn.len(), clrs);
        Ok(clrs)
    }

    fn end_loser(&self, wal: &WalManager, txn_id: TxnId, last: Option<Lsn>) -> Result<()> {
        wal.append(txn_id, last, LogBody::End)?;
        log::info!("Undoing uncommitted transaction {} complete", txn_id);
        Ok(())
    }

    /// Run all three passes over `scan`. The caller has already discarded any
    /// torn tail and emptied the buffer pool.
    pub fn recover(&self, scan: &LogScan, store: &VersionStore, wal: &WalManager) -> Result<RecoveryReport> {
        log::info!("Starting recovery from WAL...");
        let marker = self.checkpoint_marker();
        let analysis = self.analyze(&scan.records, marker.as_ref());

        let next_lsn = scan
            .last_lsn()
            .max(marker.as_ref().map_or(0, |m| m.end_lsn))
            + 1;
        wal.reset(next_lsn)?;

        store.clear_index()?;
        let records_redone = self.redo(&scan.records, &analysis, store)?;
        store.rebuild_index()?;

        let losers = analysis.losers();
        let clrs_written = self.undo(&scan.records, &analysis, store, wal)?;
        wal.flush_all()?;

        let report = RecoveryReport {
            checkpoint_lsn: analysis.checkpoint_lsn,
            records_scanned: scan.records.len(),
            torn_tail: scan.torn_tail,
            redo_start: analysis.redo_start(),
            records_redone,
            losers,
            clrs_written,
            next_lsn: wal.last_lsn() + 1,
            next_txn_id: analysis.max_txn_id + 1,
        };
        log::info!(
            "Recovery complete. Next LSN: {}, Next TxnId: {}",
            report.next_lsn,
            report.next_txn_id
        );
        Ok(report)
    }
}
