//! Transaction contexts, handles, and the id allocator / status table

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::error::{BasaltError, Result};
use crate::types::{IsolationLevel, Lsn, RowKey, TxnId, TxnStatus, SYSTEM_TXN};
use super::log::{AttEntry, AttStatus, LogBody, LogRecord};
use super::snapshot::{Snapshot, StatusOracle};

/// What a caller holds for a running transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnHandle {
    pub id: TxnId,
    pub isolation: IsolationLevel,
}

/// In-memory transaction context
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxnId,
    pub isolation: IsolationLevel,
    pub status: TxnStatus,
    /// Snapshot taken at begin; reused by every statement above READ COMMITTED
    pub snapshot: Snapshot,
    /// LSN of the BEGIN record
    pub first_lsn: Option<Lsn>,
    /// Latest record written by this transaction (head of its prev_lsn chain)
    pub last_lsn: Option<Lsn>,
    /// Keys locked so far; all released at the end
    pub lock_set: BTreeSet<RowKey>,
    /// Page changes in the order applied, for rollback
    pub undo_log: Vec<LogRecord>,
    /// How often the caller already retried this unit of work
    pub retries: u32,
}

impl Transaction {
    pub fn new(id: TxnId, isolation: IsolationLevel, snapshot: Snapshot) -> Self {
        Self {
            id,
            isolation,
            status: TxnStatus::Active,
            snapshot,
            first_lsn: None,
            last_lsn: None,
            lock_set: BTreeSet::new(),
            undo_log: Vec::new(),
            retries: 0,
        }
    }

    pub fn handle(&self) -> TxnHandle {
        TxnHandle { id: self.id, isolation: self.isolation }
    }

    /// Note a record this transaction appended
    pub fn record(&mut self, record: &LogRecord) {
        self.first_lsn.get_or_insert(record.lsn);
        self.last_lsn = Some(record.lsn);
        if matches!(record.body, LogBody::Update { .. }) {
            self.undo_log.push(record.clone());
        }
    }

    pub fn has_writes(&self) -> bool {
        !self.undo_log.is_empty()
    }

    pub fn set_status(&mut self, next: TxnStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BasaltError::InvalidTransaction(format!(
                "Transaction {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Checkpoint view of this transaction
    pub fn att_entry(&self) -> AttEntry {
        let status = match self.status {
            TxnStatus::Committing | TxnStatus::Committed => AttStatus::Committing,
            TxnStatus::AbortPending | TxnStatus::Aborted => AttStatus::Undo,
            TxnStatus::Active => AttStatus::Running,
        };
        AttEntry {
            txn_id: self.id,
            status,
            last_lsn: self.last_lsn,
            first_lsn: self.first_lsn,
        }
    }
}

#[derive(Debug)]
struct TxnTableState {
    next_id: TxnId,
    /// Every id below `base` that has no entry finished and is treated as
    /// committed (aborted work below it has been physically undone)
    base: TxnId,
    statuses: HashMap<TxnId, TxnStatus>,
    active: BTreeSet<TxnId>,
    /// Oldest id each active transaction's snapshot may still need
    floors: HashMap<TxnId, TxnId>,
}

/// Transaction id allocator and status table
#[derive(Debug)]
pub struct TxnTable {
    state: RwLock<TxnTableState>,
}

impl Default for TxnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnTable {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TxnTableState {
                next_id: 1,
                base: 1,
                statuses: HashMap::new(),
                active: BTreeSet::new(),
                floors: HashMap::new(),
            }),
        }
    }

    /// Allocate an id and take its snapshot in one step
    pub fn begin(&self) -> Result<(TxnId, Snapshot)> {
        let mut state = self.state.write().map_err(|_| BasaltError::poisoned("txn table"))?;
        let id = state.next_id;
        state.next_id += 1;
        let snapshot = Snapshot::new(id, id, state.active.clone());
        state.statuses.insert(id, TxnStatus::Active);
        state.active.insert(id);
        state.floors.insert(id, snapshot.oldest_relevant());
        Ok((id, snapshot))
    }

    /// Fresh snapshot for one statement of `owner`, covering every commit so far
    pub fn statement_snapshot(&self, owner: TxnId) -> Result<Snapshot> {
        let state = self.state.read().map_err(|_| BasaltError::poisoned("txn table"))?;
        let mut active = state.active.clone();
        active.remove(&owner);
        Ok(Snapshot::new(owner, state.next_id - 1, active))
    }

    pub fn status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        if txn_id == SYSTEM_TXN {
            return Some(TxnStatus::Committed);
        }
        let state = self.state.read().ok()?;
        match state.statuses.get(&txn_id) {
            Some(status) => Some(*status),
            None if txn_id < state.base => Some(TxnStatus::Committed),
            None => None,
        }
    }

    pub fn set_status(&self, txn_id: TxnId, status: TxnStatus) -> Result<()> {
        let mut state = self.state.write().map_err(|_| BasaltError::poisoned("txn table"))?;
        state.statuses.insert(txn_id, status);
        Ok(())
    }

    /// Record the final status and leave the active set. Snapshots taken from
    /// now on see the outcome.
    pub fn finish(&self, txn_id: TxnId, status: TxnStatus) -> Result<()> {
        let mut state = self.state.write().map_err(|_| BasaltError::poisoned("txn table"))?;
        state.statuses.insert(txn_id, status);
        state.active.remove(&txn_id);
        state.floors.remove(&txn_id);
        Ok(())
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.state.read().map(|s| s.active.contains(&txn_id)).unwrap_or(false)
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        self.state.read().map(|s| s.active.iter().copied().collect()).unwrap_or_default()
    }

    pub fn next_id(&self) -> TxnId {
        self.state.read().map(|s| s.next_id).unwrap_or(1)
    }

    /// Every transaction below the horizon has finished, and every active
    /// snapshot sees all of their outcomes identically
    pub fn horizon(&self) -> TxnId {
        match self.state.read() {
            Ok(state) => state.floors.values().min().copied().unwrap_or(state.next_id),
            Err(_) => SYSTEM_TXN,
        }
    }

    /// Forget finished transactions below `horizon`
    pub fn prune(&self, horizon: TxnId) -> Result<usize> {
        let mut state = self.state.write().map_err(|_| BasaltError::poisoned("txn table"))?;
        let floor = state.active.iter().next().copied().unwrap_or(state.next_id);
        let new_base = horizon.min(floor).max(state.base);
        let before = state.statuses.len();
        state.statuses.retain(|id, _| *id >= new_base);
        state.base = new_base;
        Ok(before - state.statuses.len())
    }

    /// Start over after recovery: everything below `next_id` is settled
    pub fn reset(&self, next_id: TxnId) -> Result<()> {
        let mut state = self.state.write().map_err(|_| BasaltError::poisoned("txn table"))?;
        state.next_id = state.next_id.max(next_id).max(1);
        state.base = state.next_id;
        state.statuses.clear();
        state.active.clear();
        state.floors.clear();
        Ok(())
    }
}

impl StatusOracle for TxnTable {
    fn is_committed(&self, txn_id: TxnId) -> bool {
        self.status(txn_id) == Some(TxnStatus::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_snapshot_contains_other_active() {
        let table = TxnTable::new();
        let (a, _) = table.begin().unwrap();
        let (b, snap_b) = table.begin().unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(snap_b.start_id, 2);
        assert!(snap_b.active.contains(&a));
        assert!(!snap_b.active.contains(&b));
    }

    #[test]
    fn test_finish_makes_commit_visible_to_later_snapshots() {
        let table = TxnTable::new();
        let (a, _) = table.begin().unwrap();
        let (b, snap_b) = table.begin().unwrap();
        table.finish(a, TxnStatus::Committed).unwrap();
        assert!(table.is_committed(a));
        // b's snapshot still treats a as running
        assert!(!snap_b.sees_committed(a, &table));
        let fresh = table.statement_snapshot(b).unwrap();
        assert!(fresh.sees_committed(a, &table));
    }

    #[test]
    fn test_system_txn_is_always_committed() {
        let table = TxnTable::new();
        assert!(table.is_committed(SYSTEM_TXN));
    }

    #[test]
    fn test_horizon_tracks_oldest_snapshot_member() {
        let table = TxnTable::new();
        let (a, _) = table.begin().unwrap();
        let (b, _) = table.begin().unwrap();
        assert_eq!(table.horizon(), a);
        table.finish(a, TxnStatus::Committed).unwrap();
        // b's snapshot still lists a as active
        assert_eq!(table.horizon(), a);
        table.finish(b, TxnStatus::Committed).unwrap();
        assert_eq!(table.horizon(), 3);
    }

    #[test]
    fn test_prune_keeps_outcomes_answerable() {
        let table = TxnTable::new();
        let (a, _) = table.begin().unwrap();
        let (b, _) = table.begin().unwrap();
        table.finish(a, TxnStatus::Committed).unwrap();
        table.finish(b, TxnStatus::Aborted).unwrap();
        assert_eq!(table.prune(table.horizon()).unwrap(), 2);
        assert!(table.is_committed(a));
        assert_eq!(table.status(99), None);
    }

    #[test]
    fn test_reset_settles_everything_below() {
        let table = TxnTable::new();
        table.begin().unwrap();
        table.reset(10).unwrap();
        assert!(table.active_ids().is_empty());
        assert!(table.is_committed(9));
        let (id, snapshot) = table.begin().unwrap();
        assert_eq!(id, 10);
        assert!(snapshot.active.is_empty());
    }

    #[test]
    fn test_transaction_records_chain_and_undo_log() {
        let table = TxnTable::new();
        let (id, snapshot) = table.begin().unwrap();
        let mut txn = Transaction::new(id, IsolationLevel::RepeatableRead, snapshot);
        let begin = LogRecord { lsn: 4, txn_id: id, prev_lsn: None, timestamp: 0, body: LogBody::Begin };
        txn.record(&begin);
        assert_eq!(txn.first_lsn, Some(4));
        assert!(!txn.has_writes());
        assert!(txn.set_status(TxnStatus::Committed).is_err());
        txn.set_status(TxnStatus::Committing).unwrap();
        assert_eq!(txn.att_entry().status, AttStatus::Committing);
    }
}
