//! Read/write dependency tracking for SERIALIZABLE transactions
//!
//! Snapshot isolation alone allows write skew: two transactions read an
//! overlapping set of rows and each writes a row the other read. Here every
//! serializable transaction reports its reads and writes. At commit an edge
//! `reader -> writer` is drawn between every pair of concurrent transactions
//! where the reader read a key the writer wrote; a cycle through the
//! committing transaction means no serial order explains what both saw, and
//! the committer is refused.
//!
//! Committed transactions are kept until no running transaction overlaps
//! them, since a later commit can still close a cycle through them.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::{BasaltError, Result};
use crate::types::{RowKey, TxnId};
use super::snapshot::Snapshot;

#[derive(Debug)]
struct SsiEntry {
    snapshot: Snapshot,
    reads: HashSet<RowKey>,
    writes: HashSet<RowKey>,
    committed: bool,
}

#[derive(Debug, Default)]
pub struct SsiTracker {
    entries: Mutex<HashMap<TxnId, SsiEntry>>,
}

/// Whether two transactions ran at the same time at some point
fn concurrent(a: (TxnId, &SsiEntry), b: (TxnId, &SsiEntry)) -> bool {
    let ((older, _), (_, younger)) = if a.0 < b.0 { (a, b) } else { (b, a) };
    younger.snapshot.active.contains(&older)
}

impl SsiTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<TxnId, SsiEntry>>> {
        self.entries.lock().map_err(|_| BasaltError::poisoned("ssi tracker"))
    }

    pub fn register(&self, txn_id: TxnId, snapshot: Snapshot) -> Result<()> {
        self.entries()?.insert(
            txn_id,
            SsiEntry {
                snapshot,
                reads: HashSet::new(),
                writes: HashSet::new(),
                committed: false,
            },
        );
        Ok(())
    }

    pub fn record_read(&self, txn_id: TxnId, key: &RowKey) -> Result<()> {
        if let Some(entry) = self.entries()?.get_mut(&txn_id) {
            entry.reads.insert(key.clone());
        }
        Ok(())
    }

    pub fn record_write(&self, txn_id: TxnId, key: &RowKey) -> Result<()> {
        if let Some(entry) = self.entries()?.get_mut(&txn_id) {
            entry.writes.insert(key.clone());
        }
        Ok(())
    }

    /// Refuse the commit of `txn_id` if it closes a dependency cycle;
    /// otherwise remember it as committed.
    pub fn check_commit(&self, txn_id: TxnId) -> Result<()> {
        let mut entries = self.entries()?;
        if !entries.contains_key(&txn_id) {
            return Ok(());
        }

        let mut edges: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
        for (&reader, r) in entries.iter() {
            for (&writer, w) in entries.iter() {
                if reader != writer
                    && concurrent((reader, r), (writer, w))
                    && !r.reads.is_disjoint(&w.writes)
                {
                    edges.entry(reader).or_default().push(writer);
                }
            }
        }

        if let Some(cycle) = cycle_through(txn_id, &edges) {
            log::debug!("Serialization cycle {:?}, refusing commit of {}", cycle, txn_id);
            return Err(BasaltError::SerializationFailure(format!(
                "read/write dependencies among transactions {:?} form a cycle",
                cycle
            )));
        }

        if let Some(entry) = entries.get_mut(&txn_id) {
            entry.committed = true;
        }
        Ok(())
    }

    /// Forget an aborted transaction
    pub fn remove(&self, txn_id: TxnId) -> Result<()> {
        self.entries()?.remove(&txn_id);
        Ok(())
    }

    /// Drop committed transactions that overlap no running one
    pub fn prune(&self) -> Result<usize> {
        let mut entries = self.entries()?;
        let removable: Vec<TxnId> = entries
            .iter()
            .filter(|(_, e)| e.committed)
            .filter(|&(&id, e)| {
                !entries
                    .iter()
                    .any(|(&other, o)| !o.committed && concurrent((id, e), (other, o)))
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &removable {
            entries.remove(id);
        }
        Ok(removable.len())
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// Path of a cycle starting and ending at `start`
fn cycle_through(start: TxnId, edges: &HashMap<TxnId, Vec<TxnId>>) -> Option<Vec<TxnId>> {
    let mut stack = vec![(start, vec![start])];
    let mut visited = HashSet::new();
    while let Some((node, path)) = stack.pop() {
        for &next in edges.get(&node).into_iter().flatten() {
            if next == start {
                return Some(path);
            }
            if visited.insert(next) {
                let mut extended = path.clone();
                extended.push(next);
                stack.push((next, extended));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn seat(id: u64) -> RowKey {
        RowKey::new("seats", id)
    }

    fn snapshot(owner: TxnId, active: &[TxnId]) -> Snapshot {
        Snapshot::new(owner, owner, active.iter().copied().collect::<BTreeSet<_>>())
    }

    fn write_skew(tracker: &SsiTracker) {
        tracker.register(1, snapshot(1, &[])).unwrap();
        tracker.register(2, snapshot(2, &[1])).unwrap();
        for txn in [1, 2] {
            tracker.record_read(txn, &seat(1)).unwrap();
            tracker.record_read(txn, &seat(2)).unwrap();
        }
        tracker.record_write(1, &seat(1)).unwrap();
        tracker.record_write(2, &seat(2)).unwrap();
    }

    #[test]
    fn test_write_skew_refused_for_one_side() {
        let tracker = SsiTracker::new();
        write_skew(&tracker);
        let first = tracker.check_commit(1);
        assert!(matches!(first, Err(BasaltError::SerializationFailure(_))));
        tracker.remove(1).unwrap();
        assert!(tracker.check_commit(2).is_ok());
    }

    #[test]
    fn test_cycle_closed_by_later_commit() {
        let tracker = SsiTracker::new();
        tracker.register(1, snapshot(1, &[])).unwrap();
        tracker.register(2, snapshot(2, &[1])).unwrap();
        tracker.record_read(1, &seat(2)).unwrap();
        tracker.record_read(2, &seat(1)).unwrap();
        tracker.record_write(1, &seat(1)).unwrap();
        // Txn 2 has not written yet, so 1 commits
        assert!(tracker.check_commit(1).is_ok());
        tracker.record_write(2, &seat(2)).unwrap();
        assert!(tracker.check_commit(2).is_err());
    }

    #[test]
    fn test_disjoint_transactions_commit() {
        let tracker = SsiTracker::new();
        tracker.register(1, snapshot(1, &[])).unwrap();
        tracker.register(2, snapshot(2, &[1])).unwrap();
        tracker.record_read(1, &seat(1)).unwrap();
        tracker.record_write(1, &seat(1)).unwrap();
        tracker.record_read(2, &seat(2)).unwrap();
        tracker.record_write(2, &seat(2)).unwrap();
        assert!(tracker.check_commit(1).is_ok());
        assert!(tracker.check_commit(2).is_ok());
    }

    #[test]
    fn test_serial_transactions_never_conflict() {
        let tracker = SsiTracker::new();
        write_skew(&tracker);
        // Txn 3 starts after 1 and 2 ended
        tracker.register(3, snapshot(3, &[])).unwrap();
        tracker.record_read(3, &seat(1)).unwrap();
        tracker.record_write(3, &seat(2)).unwrap();
        tracker.remove(1).unwrap();
        tracker.remove(2).unwrap();
        assert!(tracker.check_commit(3).is_ok());
    }

    #[test]
    fn test_prune_keeps_entries_overlapping_running_txns() {
        let tracker = SsiTracker::new();
        tracker.register(1, snapshot(1, &[])).unwrap();
        tracker.register(2, snapshot(2, &[1])).unwrap();
        tracker.check_commit(1).unwrap();
        assert_eq!(tracker.prune().unwrap(), 0);
        tracker.check_commit(2).unwrap();
        assert_eq!(tracker.prune().unwrap(), 2);
        assert_eq!(tracker.tracked(), 0);
    }
}
