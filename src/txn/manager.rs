//! Transaction Manager for Basalt
//!
//! The process-wide context: owns the log, the buffer pool, the version
//! store, the lock table and the transaction tables, and is passed by
//! reference (usually in an `Arc`) to every caller.
//!
//! ## Lifecycle
//! 1. `open`: page store and WAL are opened; no transaction is admitted yet
//! 2. `recover`: ARIES analysis/redo/undo, then a checkpoint
//! 3. `begin` / `read` / `write` / `commit` / `abort` from any number of threads
//! 4. `shutdown`: flush the log and every dirty page
//!
//! ## Isolation
//! - READ COMMITTED: every statement reads a fresh snapshot
//! - REPEATABLE READ: one snapshot per transaction; a write to a row changed
//!   by a concurrent transaction fails (first updater wins)
//! - SERIALIZABLE: REPEATABLE READ plus read/write dependency tracking,
//!   checked at commit
//!
//! Reads never take locks. Writes take the row's exclusive lock, held until
//! the transaction ends.
//!
//! ## Errors
//! A conflict error from `write` or `commit` has already aborted the
//! transaction. A fatal error halts the engine: every later call fails with
//! [`BasaltError::Halted`].

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use bytes::Bytes;

use crate::error::{BasaltError, Result};
use crate::storage::{FilePageStore, PageStore};
use crate::types::{IsolationLevel, Lsn, RowKey, TxnId, TxnStatus, VersionId, VersionImage, SYSTEM_TXN};
use crate::Config;
use super::buffer::BufferPool;
use super::checkpoint::{run_checkpoint, CheckpointOutcome};
use super::lock::{LockManager, LockMode};
use super::log::{read_log, AttEntry, LogBody, LogRecord};
use super::recovery::{RecoveryManager, RecoveryReport};
use super::snapshot::Snapshot;
use super::ssi::SsiTracker;
use super::transaction::{Transaction, TxnHandle, TxnTable};
use super::version::{VacuumStats, VersionStore};
use super::wal::WalManager;

/// Kind of row write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// Engine lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Opened; `recover()` has not run yet
    NotRecovered,
    Ready,
    /// Stopped by a fatal error
    Halted(String),
    /// Cleanly shut down
    Closed,
}

/// A row change, resolved under the row lock
enum Change<'f> {
    Insert(Bytes),
    Update(Box<dyn FnOnce(&[u8]) -> Bytes + 'f>),
    Delete,
}

pub struct TransactionManager {
    config: Config,
    wal: Arc<WalManager>,
    pool: Arc<BufferPool>,
    versions: VersionStore,
    txns: TxnTable,
    locks: LockManager,
    ssi: SsiTracker,
    recovery: RecoveryManager,
    /// Running transactions (the ATT)
    active_txns: RwLock<HashMap<TxnId, Arc<Mutex<Transaction>>>>,
    state: RwLock<EngineState>,
    /// Page changes hold this shared; checkpoint and recovery take it exclusively
    gate: RwLock<()>,
    checkpointing: Mutex<()>,
    /// Vacuum locks rows as SYSTEM_TXN, so only one run may hold them
    vacuuming: Mutex<()>,
}

impl TransactionManager {
    /// Open the engine over `<data_dir>/pages`
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let store = FilePageStore::new(config.data_dir.clone())?;
        Self::open_with_store(config, Arc::new(store))
    }

    /// Open the engine over any page store. The log lives in `data_dir`.
    pub fn open_with_store(config: Config, store: Arc<dyn PageStore>) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let wal = Arc::new(WalManager::open(config.data_dir.join("wal.log"), config.wal.clone())?);
        let pool = Arc::new(BufferPool::new(store, Arc::clone(&wal), config.buffer_pool_pages));
        let versions = VersionStore::new(Arc::clone(&pool), config.page_count);

        Ok(Self {
            recovery: RecoveryManager::new(config.data_dir.clone()),
            locks: LockManager::new(config.lock.clone()),
            config,
            wal,
            pool,
            versions,
            txns: TxnTable::new(),
            ssi: SsiTracker::new(),
            active_txns: RwLock::new(HashMap::new()),
            state: RwLock::new(EngineState::NotRecovered),
            gate: RwLock::new(()),
            checkpointing: Mutex::new(()),
            vacuuming: Mutex::new(()),
        })
    }

    /// Open and recover
    pub fn start(config: Config) -> Result<Self> {
        let manager = Self::open(config)?;
        manager.recover()?;
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| EngineState::Halted("state lock poisoned".to_string()))
    }

    fn set_state(&self, next: EngineState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    fn check_ready(&self) -> Result<()> {
        match self.state() {
            EngineState::Ready => Ok(()),
            EngineState::NotRecovered => Err(BasaltError::InvalidState(
                "recover() must complete before transactions are admitted".to_string(),
            )),
            EngineState::Halted(reason) => Err(BasaltError::Halted(reason)),
            EngineState::Closed => Err(BasaltError::InvalidState("engine is shut down".to_string())),
        }
    }

    /// Latch the engine into the halted state on a fatal error
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !matches!(e, BasaltError::Halted(_)) {
                log::error!("Fatal error, halting engine: {}", e);
                self.set_state(EngineState::Halted(e.to_string()));
            }
        }
        result
    }

    fn page_gate(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate.read().map_err(|_| BasaltError::poisoned("page gate"))
    }

    fn txn(&self, id: TxnId) -> Result<Arc<Mutex<Transaction>>> {
        let txns = self.active_txns.read().map_err(|_| BasaltError::poisoned("active transactions"))?;
        txns.get(&id)
            .cloned()
            .ok_or_else(|| BasaltError::InvalidTransaction(format!("Transaction {} is not active", id)))
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.active_txns.read().map(|t| t.contains_key(&id)).unwrap_or(false)
    }

    pub fn active_transactions(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self
            .active_txns
            .read()
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Append a record for `txn`, chained onto its previous one
    fn log_for(&self, txn: &mut Transaction, body: LogBody) -> Result<LogRecord> {
        let record = self.wal.append(txn.id, txn.last_lsn, body)?;
        txn.record(&record);
        Ok(record)
    }

    // ===== Begin =====

    pub fn begin(&self, isolation: IsolationLevel) -> Result<TxnHandle> {
        self.begin_retry(isolation, 0)
    }

    /// Begin a transaction that repeats work which already failed `retries`
    /// times; the deadlock victim policy may take that into account
    pub fn begin_retry(&self, isolation: IsolationLevel, retries: u32) -> Result<TxnHandle> {
        self.check_ready()?;
        // A checkpoint sees a new transaction either whole or not at all
        let _gate = self.page_gate()?;
        let (id, snapshot) = self.txns.begin()?;
        let mut txn = Transaction::new(id, isolation, snapshot);
        txn.retries = retries;

        if let Err(e) = self.log_for(&mut txn, LogBody::Begin) {
            self.txns.finish(id, TxnStatus::Aborted)?;
            return self.observe(Err(e));
        }
        if retries > 0 {
            self.locks.set_retries(id, retries)?;
        }
        if isolation == IsolationLevel::Serializable {
            self.ssi.register(id, txn.snapshot.clone())?;
        }

        let handle = txn.handle();
        self.active_txns
            .write()
            .map_err(|_| BasaltError::poisoned("active transactions"))?
            .insert(id, Arc::new(Mutex::new(txn)));
        log::debug!("Began transaction {} ({})", id, isolation);
        Ok(handle)
    }

    // ===== Reads =====

    /// Snapshot for the next statement of `txn`
    fn statement_snapshot(&self, txn: &Transaction) -> Result<Snapshot> {
        if txn.isolation.uses_transaction_snapshot() {
            Ok(txn.snapshot.clone())
        } else {
            self.txns.statement_snapshot(txn.id)
        }
    }

    fn active_snapshot(&self, handle: &TxnHandle) -> Result<Snapshot> {
        let txn_arc = self.txn(handle.id)?;
        let txn = txn_arc.lock().map_err(|_| BasaltError::poisoned("transaction"))?;
        if txn.status != TxnStatus::Active {
            return Err(BasaltError::InvalidTransaction(format!(
                "Transaction {} is {:?}",
                txn.id, txn.status
            )));
        }
        self.statement_snapshot(&txn)
    }

    /// Payload of the version of `key` visible to the transaction
    pub fn read(&self, handle: &TxnHandle, key: &RowKey) -> Result<Bytes> {
        self.check_ready()?;
        let snapshot = self.active_snapshot(handle)?;
        if handle.isolation == IsolationLevel::Serializable {
            self.ssi.record_read(handle.id, key)?;
        }
        let visible = self.observe(self.versions.visible(key, &snapshot, &self.txns))?;
        match visible {
            Some((_, version)) => Ok(version.payload),
            None => Err(BasaltError::NotFound(key.clone())),
        }
    }

    /// Read under the row's exclusive lock (`SELECT ... FOR UPDATE`)
    pub fn read_for_update(&self, handle: &TxnHandle, key: &RowKey) -> Result<Bytes> {
        self.check_ready()?;
        self.lock_key(handle, key, LockMode::Exclusive)?;

        let result = (|| -> Result<Bytes> {
            let snapshot = self.active_snapshot(handle)?;
            let head = self.versions.head(key)?;
            if handle.isolation.uses_transaction_snapshot() {
                self.check_first_updater(&snapshot, key, head.as_ref().map(|(_, v)| v))?;
            }
            if handle.isolation == IsolationLevel::Serializable {
                self.ssi.record_read(handle.id, key)?;
            }
            self.versions
                .visible(key, &snapshot, &self.txns)?
                .map(|(_, v)| v.payload)
                .ok_or_else(|| BasaltError::NotFound(key.clone()))
        })();
        self.settle(handle, result)
    }

    /// Take a row lock; a conflict aborts the transaction
    fn lock_key(&self, handle: &TxnHandle, key: &RowKey, mode: LockMode) -> Result<()> {
        let txn_arc = self.txn(handle.id)?;
        match self.locks.acquire(handle.id, key, mode) {
            Ok(()) => {
                let mut txn = txn_arc.lock().map_err(|_| BasaltError::poisoned("transaction"))?;
                txn.lock_set.insert(key.clone());
                Ok(())
            }
            Err(e) => self.settle(handle, Err(e)),
        }
    }

    /// Abort on conflict errors, halt on fatal ones
    fn settle<T>(&self, handle: &TxnHandle, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if e.is_retryable() => {
                log::debug!("Transaction {} aborted: {}", handle.id, e);
                self.abort_txn(handle.id)?;
                Err(e)
            }
            other => self.observe(other),
        }
    }

    /// First-updater-wins: the newest version must not come from a
    /// transaction this snapshot cannot see
    fn check_first_updater(
        &self,
        snapshot: &Snapshot,
        key: &RowKey,
        head: Option<&VersionImage>,
    ) -> Result<()> {
        let Some(head) = head else {
            return Ok(());
        };
        let unseen = |txn: TxnId| txn != snapshot.owner && !snapshot.sees_committed(txn, &self.txns);
        if unseen(head.xmin) {
            return Err(BasaltError::SerializationFailure(format!(
                "{} was written by concurrent transaction {}",
                key, head.xmin
            )));
        }
        if let Some(xmax) = head.xmax.filter(|x| unseen(*x)) {
            return Err(BasaltError::SerializationFailure(format!(
                "{} was deleted by concurrent transaction {}",
                key, xmax
            )));
        }
        Ok(())
    }

    // ===== Writes =====

    /// Insert, update or delete one row
    pub fn write(&self, handle: &TxnHandle, key: &RowKey, op: WriteOp, payload: Option<Bytes>) -> Result<()> {
        let change = match (op, payload) {
            (WriteOp::Insert, Some(payload)) => Change::Insert(payload),
            (WriteOp::Update, Some(payload)) => Change::Update(Box::new(move |_: &[u8]| payload)),
            (WriteOp::Delete, _) => Change::Delete,
            (op, None) => {
                return Err(BasaltError::InvalidState(format!("{:?} of {} requires a payload", op, key)))
            }
        };
        self.write_change(handle, key, change).map(|_| ())
    }

    pub fn insert(&self, handle: &TxnHandle, key: &RowKey, payload: Bytes) -> Result<()> {
        self.write(handle, key, WriteOp::Insert, Some(payload))
    }

    pub fn update(&self, handle: &TxnHandle, key: &RowKey, payload: Bytes) -> Result<()> {
        self.write(handle, key, WriteOp::Update, Some(payload))
    }

    pub fn delete(&self, handle: &TxnHandle, key: &RowKey) -> Result<()> {
        self.write(handle, key, WriteOp::Delete, None)
    }

    /// Atomic read-modify-write: `f` sees the latest committed payload while
    /// the row's exclusive lock is held. Returns the new payload.
    pub fn update_with<F>(&self, handle: &TxnHandle, key: &RowKey, f: F) -> Result<Bytes>
    where
        F: FnOnce(&[u8]) -> Bytes,
    {
        self.write_change(handle, key, Change::Update(Box::new(f)))?
            .ok_or_else(|| BasaltError::Internal(format!("update of {} produced no payload", key)))
    }

    fn write_change(&self, handle: &TxnHandle, key: &RowKey, change: Change<'_>) -> Result<Option<Bytes>> {
        self.check_ready()?;
        self.lock_key(handle, key, LockMode::Exclusive)?;
        let result = self.apply_change(handle, key, change);
        self.settle(handle, result)
    }

    fn apply_change(&self, handle: &TxnHandle, key: &RowKey, change: Change<'_>) -> Result<Option<Bytes>> {
        let txn_arc = self.txn(handle.id)?;
        let _gate = self.page_gate()?;
        let mut txn = txn_arc.lock().map_err(|_| BasaltError::poisoned("transaction"))?;
        if txn.status != TxnStatus::Active {
            return Err(BasaltError::InvalidTransaction(format!(
                "Transaction {} is {:?}",
                txn.id, txn.status
            )));
        }

        // READ COMMITTED writes against the latest commit, taken after the lock
        let snapshot = self.statement_snapshot(&txn)?;
        let head = self.versions.head(key)?;
        if txn.isolation.uses_transaction_snapshot() {
            self.check_first_updater(&snapshot, key, head.as_ref().map(|(_, v)| v))?;
        }

        let written = match change {
            Change::Insert(payload) => {
                if let Some((_, current)) = &head {
                    if current.is_live() {
                        return Err(BasaltError::KeyConflict(key.clone()));
                    }
                }
                let version = VersionImage::new(key.clone(), payload.clone(), txn.id, head.map(|(id, _)| id));
                self.versions.insert_version(version, |body| self.log_for(&mut txn, body))?;
                Some(payload)
            }
            Change::Update(compute) => {
                let (target, current) = self.write_target(&snapshot, key, head.as_ref())?;
                let payload = compute(&current.payload);
                self.versions.stamp_xmax(target, txn.id, |body| self.log_for(&mut txn, body))?;
                let version = VersionImage::new(key.clone(), payload.clone(), txn.id, Some(target));
                self.versions.insert_version(version, |body| self.log_for(&mut txn, body))?;
                Some(payload)
            }
            Change::Delete => {
                let (target, _) = self.write_target(&snapshot, key, head.as_ref())?;
                self.versions.stamp_xmax(target, txn.id, |body| self.log_for(&mut txn, body))?;
                None
            }
        };

        if txn.isolation == IsolationLevel::Serializable {
            self.ssi.record_write(txn.id, key)?;
        }
        Ok(written)
    }

    /// The version an update or delete applies to: the visible one, which
    /// under the row lock must also be the live chain head
    fn write_target(
        &self,
        snapshot: &Snapshot,
        key: &RowKey,
        head: Option<&(VersionId, VersionImage)>,
    ) -> Result<(VersionId, VersionImage)> {
        let Some((target, version)) = self.versions.visible(key, snapshot, &self.txns)? else {
            return Err(BasaltError::NotFound(key.clone()));
        };
        if head.map(|(id, _)| *id) != Some(target) || !version.is_live() {
            return Err(BasaltError::SerializationFailure(format!(
                "{} was changed by a concurrent transaction",
                key
            )));
        }
        Ok((target, version))
    }

    // ===== Commit / Abort =====

    /// Commit. Returns once the commit record is durable.
    pub fn commit(&self, handle: TxnHandle) -> Result<()> {
        self.check_ready()?;
        let txn_arc = self.txn(handle.id)?;

        if handle.isolation == IsolationLevel::Serializable {
            if let Err(e) = self.ssi.check_commit(handle.id) {
                return self.settle(&handle, Err(e));
            }
        }

        let (commit_lsn, needs_flush) = {
            // The commit record and the Committing status reach a checkpoint together
            let _gate = self.page_gate()?;
            let mut txn = txn_arc.lock().map_err(|_| BasaltError::poisoned("transaction"))?;
            if txn.status != TxnStatus::Active {
                return Err(BasaltError::InvalidTransaction(format!(
                    "Transaction {} is {:?}",
                    txn.id, txn.status
                )));
            }
            let record = self.observe(self.log_for(&mut txn, LogBody::Commit))?;
            txn.set_status(TxnStatus::Committing)?;
            self.txns.set_status(handle.id, TxnStatus::Committing)?;
            (record.lsn, txn.has_writes())
        };

        // A transaction that wrote nothing has nothing to make durable
        if needs_flush {
            self.observe(self.wal.flush(commit_lsn))?;
        }

        if let Ok(mut txn) = txn_arc.lock() {
            txn.status = TxnStatus::Committed;
        }
        self.txns.finish(handle.id, TxnStatus::Committed)?;
        self.locks.release_all(handle.id)?;
        self.forget(handle.id)?;
        self.ssi.prune()?;
        log::debug!("Committed transaction {} at LSN {}", handle.id, commit_lsn);

        self.maybe_checkpoint();
        Ok(())
    }

    /// Roll back. Unknown and finished transactions are fine.
    ///
    /// Never fails on a halted engine: the transaction has no commit record,
    /// so recovery rolls it back on the next start. An abort that itself hits
    /// a fatal error halts the engine and is left to recovery the same way.
    pub fn abort(&self, handle: TxnHandle) -> Result<()> {
        if let EngineState::Halted(reason) = self.state() {
            log::debug!("Engine halted ({}), leaving transaction {} to recovery", reason, handle.id);
            return Ok(());
        }
        match self.abort_txn(handle.id) {
            Err(e) if e.is_fatal() => {
                log::warn!("Abort of transaction {} left to recovery: {}", handle.id, e);
                Ok(())
            }
            other => other,
        }
    }

    fn abort_txn(&self, id: TxnId) -> Result<()> {
        let txn_arc = match self.txn(id) {
            Ok(txn) => txn,
            Err(_) => return Ok(()),
        };

        let result = (|| -> Result<bool> {
            let _gate = self.page_gate()?;
            let mut txn = txn_arc.lock().map_err(|_| BasaltError::poisoned("transaction"))?;
            if matches!(txn.status, TxnStatus::AbortPending | TxnStatus::Aborted | TxnStatus::Committed) {
                return Ok(false);
            }
            txn.set_status(TxnStatus::AbortPending)?;
            self.txns.set_status(id, TxnStatus::AbortPending)?;

            self.log_for(&mut txn, LogBody::Abort)?;
            let undo_log = std::mem::take(&mut txn.undo_log);
            for record in undo_log.iter().rev() {
                self.versions.compensate(record, |body| self.log_for(&mut txn, body))?;
            }
            let end = self.log_for(&mut txn, LogBody::End)?;
            self.wal.flush(end.lsn)?;
            txn.set_status(TxnStatus::Aborted)?;
            log::debug!("Aborted transaction {}, {} changes undone", id, undo_log.len());
            Ok(true)
        })();

        if !self.observe(result)? {
            return Ok(());
        }
        self.txns.finish(id, TxnStatus::Aborted)?;
        self.locks.release_all(id)?;
        self.ssi.remove(id)?;
        self.forget(id)?;
        Ok(())
    }

    fn forget(&self, id: TxnId) -> Result<()> {
        self.active_txns
            .write()
            .map_err(|_| BasaltError::poisoned("active transactions"))?
            .remove(&id);
        Ok(())
    }

    // ===== Checkpoint / Vacuum =====

    /// Checkpoint now. Returns the LSN of the CheckpointBegin record.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.check_ready()?;
        let outcome = self.observe(self.checkpoint_inner())?;
        Ok(outcome.begin_lsn)
    }

    fn checkpoint_inner(&self) -> Result<CheckpointOutcome> {
        let _serial = self.checkpointing.lock().map_err(|_| BasaltError::poisoned("checkpoint"))?;
        self.run_quiesced()
    }

    /// Checkpoint with new lock grants held back and page writers drained
    fn run_quiesced(&self) -> Result<CheckpointOutcome> {
        let _pause = self.locks.pause()?;
        let _gate = self.gate.write().map_err(|_| BasaltError::poisoned("page gate"))?;

        let att = || -> Result<Vec<AttEntry>> {
            let txns = self.active_txns.read().map_err(|_| BasaltError::poisoned("active transactions"))?;
            let mut att = Vec::with_capacity(txns.len());
            for txn in txns.values() {
                let txn = txn.lock().map_err(|_| BasaltError::poisoned("transaction"))?;
                att.push(txn.att_entry());
            }
            att.sort_by_key(|e| e.txn_id);
            Ok(att)
        };
        run_checkpoint(&self.config.data_dir, &self.wal, &self.pool, att, self.txns.next_id())
    }

    /// Checkpoint once enough log has been written since the last one
    fn maybe_checkpoint(&self) {
        let threshold = self.config.checkpoint_threshold_bytes;
        if threshold == 0 || self.wal.bytes_since_checkpoint() < threshold {
            return;
        }
        // Someone else is already at it
        let Ok(_serial) = self.checkpointing.try_lock() else {
            return;
        };
        log::info!(
            "Automatic checkpoint after {} bytes of log",
            self.wal.bytes_since_checkpoint()
        );
        if let Err(e) = self.observe(self.run_quiesced()) {
            log::error!("Automatic checkpoint failed: {}", e);
        }
    }

    /// Remove versions no present or future snapshot can see
    pub fn vacuum(&self) -> Result<VacuumStats> {
        self.check_ready()?;
        let _serial = self.vacuuming.lock().map_err(|_| BasaltError::poisoned("vacuum"))?;
        let horizon = self.txns.horizon();
        let mut stats = VacuumStats::default();

        for key in self.versions.keys()? {
            stats.keys_scanned += 1;
            if !self.locks.try_acquire(SYSTEM_TXN, &key, LockMode::Exclusive)? {
                stats.keys_skipped += 1;
                continue;
            }
            let result = self.page_gate().and_then(|_gate| {
                self.versions.vacuum_key(
                    &key,
                    horizon,
                    &self.txns,
                    |body| self.wal.append(SYSTEM_TXN, None, body),
                    &mut stats,
                )
            });
            self.locks.release_all(SYSTEM_TXN)?;
            self.observe(result)?;
        }

        let pruned = self.txns.prune(horizon)?;
        log::info!(
            "Vacuum below transaction {}: {} versions removed, {} keys skipped, {} statuses pruned",
            horizon,
            stats.versions_removed,
            stats.keys_skipped,
            pruned
        );
        Ok(stats)
    }

    // ===== Recovery / Shutdown =====

    /// Restore the last consistent durable state. Mandatory before the first
    /// `begin`; may run again whenever no transaction is active.
    pub fn recover(&self) -> Result<RecoveryReport> {
        match self.state() {
            EngineState::Halted(reason) => return Err(BasaltError::Halted(reason)),
            EngineState::Closed => {
                return Err(BasaltError::InvalidState("engine is shut down".to_string()))
            }
            _ => {}
        }

        let _serial = self.checkpointing.lock().map_err(|_| BasaltError::poisoned("checkpoint"))?;
        if !self.active_transactions().is_empty() {
            return Err(BasaltError::InvalidState(
                "recovery requires that no transaction is active".to_string(),
            ));
        }

        let report = self.observe(self.recover_inner())?;
        self.set_state(EngineState::Ready);

        self.observe(self.run_quiesced())?;
        Ok(report)
    }

    fn recover_inner(&self) -> Result<RecoveryReport> {
        let _gate = self.gate.write().map_err(|_| BasaltError::poisoned("page gate"))?;

        // Nothing buffered may be lost by starting over from the log
        self.wal.flush_all()?;
        self.pool.flush_all()?;
        self.pool.discard_all()?;

        let scan = read_log(self.wal.path())?;
        if scan.torn_tail {
            self.wal.discard_tail(scan.valid_len)?;
        }

        let report = self.recovery.recover(&scan, &self.versions, &self.wal)?;
        self.txns.reset(report.next_txn_id)?;
        Ok(report)
    }

    /// Flush the log and every dirty page, then stop the log flusher
    pub fn shutdown(&self) -> Result<()> {
        if self.state() == EngineState::Ready {
            let result = self.wal.flush_all().and_then(|_| self.pool.flush_all());
            self.observe(result)?;
        }
        self.wal.shutdown();
        self.set_state(EngineState::Closed);
        log::info!("Transaction manager shut down");
        Ok(())
    }

    /// Stop as if the process died: unflushed log records and dirty pages are lost
    pub fn simulate_crash(&self) {
        self.wal.abandon();
        let _ = self.pool.discard_all();
        self.set_state(EngineState::Halted("simulated crash".to_string()));
    }

    // ===== Introspection =====

    /// Every version of `key`, newest first
    pub fn versions_for(&self, key: &RowKey) -> Result<Vec<VersionImage>> {
        Ok(self.versions.versions_for(key)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn dirty_pages(&self) -> usize {
        self.pool.dirty_pages().len()
    }
}
