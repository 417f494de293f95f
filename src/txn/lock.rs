//! Row lock manager
//!
//! Strict two-phase locking over `RowKey`s: locks are only ever released all
//! at once, when the transaction ends.
//!
//! ## Deadlocks
//!
//! Every time a request blocks, the waiter's edges in the waits-for graph are
//! refreshed and the graph is searched depth-first for a cycle through it.
//! One member of the cycle is picked by [`VictimPolicy`]. If the victim is the
//! requester it fails right away; otherwise the victim is marked doomed and
//! woken, and fails with `Deadlock` from its own wait.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{BasaltError, Result};
use crate::types::{RowKey, TxnId};

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding `self` already satisfies a request for `wanted`
    fn covers(&self, wanted: LockMode) -> bool {
        *self >= wanted
    }
}

/// Which member of a deadlock cycle gets aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VictimPolicy {
    /// Lowest transaction id
    #[default]
    Oldest,
    /// Highest transaction id
    Youngest,
    /// Fewest locks held (least work lost)
    FewestLocks,
    /// Fewest earlier retries, so repeated victims eventually win
    FewestRetries,
}

impl FromStr for VictimPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "oldest" => Ok(VictimPolicy::Oldest),
            "youngest" => Ok(VictimPolicy::Youngest),
            "fewest-locks" => Ok(VictimPolicy::FewestLocks),
            "fewest-retries" => Ok(VictimPolicy::FewestRetries),
            _ => Err(format!("Unknown victim policy: {}", s)),
        }
    }
}

/// Lock manager settings
#[derive(Debug, Clone, Default)]
pub struct LockConfig {
    pub victim_policy: VictimPolicy,
    /// Give up waiting after this long; `None` waits until granted or chosen
    /// as a deadlock victim
    pub lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<TxnId, LockMode>,
    waiting: VecDeque<(TxnId, LockMode)>,
}

impl LockEntry {
    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiting.is_empty()
    }

    /// Transactions `txn` has to wait for before getting `mode`
    fn blockers(&self, txn: TxnId, mode: LockMode) -> HashSet<TxnId> {
        let mut out: HashSet<TxnId> = self
            .holders
            .iter()
            .filter(|(holder, held)| **holder != txn && !held.compatible_with(mode))
            .map(|(holder, _)| *holder)
            .collect();
        // An upgrade jumps the queue; everyone else is FIFO
        if !self.holders.contains_key(&txn) {
            for (waiter, wanted) in &self.waiting {
                if *waiter == txn {
                    break;
                }
                if !wanted.compatible_with(mode) {
                    out.insert(*waiter);
                }
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<RowKey, LockEntry>,
    held: HashMap<TxnId, HashSet<RowKey>>,
    waits_for: HashMap<TxnId, HashSet<TxnId>>,
    doomed: HashSet<TxnId>,
    retries: HashMap<TxnId, u32>,
    paused: bool,
}

impl LockTable {
    fn holds(&self, txn: TxnId, key: &RowKey, mode: LockMode) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.holders.get(&txn))
            .map_or(false, |held| held.covers(mode))
    }

    fn grant(&mut self, txn: TxnId, key: &RowKey, mode: LockMode) {
        let entry = self.entries.entry(key.clone()).or_default();
        entry.waiting.retain(|(waiter, _)| *waiter != txn);
        let held = entry.holders.entry(txn).or_insert(mode);
        *held = (*held).max(mode);
        self.held.entry(txn).or_default().insert(key.clone());
        self.waits_for.remove(&txn);
    }

    fn stop_waiting(&mut self, txn: TxnId, key: &RowKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.waiting.retain(|(waiter, _)| *waiter != txn);
            if entry.is_idle() {
                self.entries.remove(key);
            }
        }
        self.waits_for.remove(&txn);
    }

    /// A cycle in the waits-for graph passing through `start`
    fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut visited = HashSet::new();
        if self.dfs(start, start, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(&self, node: TxnId, start: TxnId, path: &mut Vec<TxnId>, visited: &mut HashSet<TxnId>) -> bool {
        let Some(next) = self.waits_for.get(&node) else {
            return false;
        };
        let mut next: Vec<TxnId> = next.iter().copied().collect();
        next.sort_unstable();
        for to in next {
            if to == start {
                return true;
            }
            if visited.insert(to) {
                path.push(to);
                if self.dfs(to, start, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    fn choose_victim(&self, cycle: &[TxnId], policy: VictimPolicy) -> TxnId {
        let locks = |t: &TxnId| self.held.get(t).map_or(0, |k| k.len());
        let retries = |t: &TxnId| self.retries.get(t).copied().unwrap_or(0);
        let victim = match policy {
            VictimPolicy::Oldest => cycle.iter().min().copied(),
            VictimPolicy::Youngest => cycle.iter().max().copied(),
            VictimPolicy::FewestLocks => cycle.iter().min_by_key(|t| (locks(t), std::cmp::Reverse(**t))).copied(),
            VictimPolicy::FewestRetries => {
                cycle.iter().min_by_key(|t| (retries(t), std::cmp::Reverse(**t))).copied()
            }
        };
        victim.unwrap_or(cycle[0])
    }
}

/// Releases a [`LockManager::pause`] when dropped
pub struct LockPause<'a> {
    manager: &'a LockManager,
}

impl Drop for LockPause<'_> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.manager.table.lock() {
            table.paused = false;
        }
        self.manager.condvar.notify_all();
    }
}

pub struct LockManager {
    config: LockConfig,
    table: Mutex<LockTable>,
    condvar: Condvar,
    deadlocks: AtomicU64,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            table: Mutex::new(LockTable::default()),
            condvar: Condvar::new(),
            deadlocks: AtomicU64::new(0),
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, LockTable>> {
        self.table.lock().map_err(|_| BasaltError::poisoned("lock table"))
    }

    /// Acquire `mode` on `key` for `txn`, blocking while it conflicts.
    /// Fails with `Deadlock` if `txn` is chosen as a victim and with
    /// `LockTimeout` once the configured wait expires.
    pub fn acquire(&self, txn: TxnId, key: &RowKey, mode: LockMode) -> Result<()> {
        let deadline = self
            .config
            .lock_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut table = self.table()?;
        let mut queued = false;

        loop {
            if table.doomed.remove(&txn) {
                table.stop_waiting(txn, key);
                self.condvar.notify_all();
                return Err(BasaltError::Deadlock(txn));
            }
            if table.holds(txn, key, mode) {
                return Ok(());
            }

            let blockers = table
                .entries
                .get(key)
                .map(|e| e.blockers(txn, mode))
                .unwrap_or_default();
            if !table.paused && blockers.is_empty() {
                table.grant(txn, key, mode);
                return Ok(());
            }

            if !queued {
                table.entries.entry(key.clone()).or_default().waiting.push_back((txn, mode));
                queued = true;
                log::debug!("Transaction {} waiting for {:?} lock on {}", txn, mode, key);
            }
            table.waits_for.insert(txn, blockers);

            // A cycle with a doomed member is already being broken
            let cycle = table
                .find_cycle(txn)
                .filter(|cycle| !cycle.iter().any(|t| table.doomed.contains(t)));
            if let Some(cycle) = cycle {
                let victim = table.choose_victim(&cycle, self.config.victim_policy);
                self.deadlocks.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Deadlock among transactions {:?}, aborting {} ({:?} policy)",
                    cycle,
                    victim,
                    self.config.victim_policy
                );
                if victim == txn {
                    table.stop_waiting(txn, key);
                    self.condvar.notify_all();
                    return Err(BasaltError::Deadlock(txn));
                }
                table.doomed.insert(victim);
                self.condvar.notify_all();
            }

            table = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        table.stop_waiting(txn, key);
                        self.condvar.notify_all();
                        return Err(BasaltError::LockTimeout(key.clone()));
                    }
                    self.condvar
                        .wait_timeout(table, remaining)
                        .map_err(|_| BasaltError::poisoned("lock table"))?
                        .0
                }
                None => self
                    .condvar
                    .wait(table)
                    .map_err(|_| BasaltError::poisoned("lock table"))?,
            };
        }
    }

    /// Grant the lock only if that is possible without waiting
    pub fn try_acquire(&self, txn: TxnId, key: &RowKey, mode: LockMode) -> Result<bool> {
        let mut table = self.table()?;
        if table.holds(txn, key, mode) {
            return Ok(true);
        }
        let free = table.entries.get(key).map_or(true, |e| e.blockers(txn, mode).is_empty());
        if table.paused || !free {
            return Ok(false);
        }
        table.grant(txn, key, mode);
        Ok(true)
    }

    /// Drop every lock of `txn` and wake all waiters
    pub fn release_all(&self, txn: TxnId) -> Result<usize> {
        let mut table = self.table()?;
        let keys = table.held.remove(&txn).unwrap_or_default();
        for key in &keys {
            if let Some(entry) = table.entries.get_mut(key) {
                entry.holders.remove(&txn);
                if entry.is_idle() {
                    table.entries.remove(key);
                }
            }
        }
        for entry in table.entries.values_mut() {
            entry.waiting.retain(|(waiter, _)| *waiter != txn);
        }
        table.waits_for.remove(&txn);
        for edges in table.waits_for.values_mut() {
            edges.remove(&txn);
        }
        table.doomed.remove(&txn);
        table.retries.remove(&txn);
        drop(table);
        self.condvar.notify_all();
        Ok(keys.len())
    }

    /// Remember how often `txn`'s work was already retried
    pub fn set_retries(&self, txn: TxnId, retries: u32) -> Result<()> {
        self.table()?.retries.insert(txn, retries);
        Ok(())
    }

    /// Hold back every new grant until the guard is dropped
    pub fn pause(&self) -> Result<LockPause<'_>> {
        self.table()?.paused = true;
        Ok(LockPause { manager: self })
    }

    pub fn holders(&self, key: &RowKey) -> Vec<(TxnId, LockMode)> {
        let mut out: Vec<(TxnId, LockMode)> = match self.table.lock() {
            Ok(table) => table
                .entries
                .get(key)
                .map(|e| e.holders.iter().map(|(t, m)| (*t, *m)).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        out.sort_unstable();
        out
    }

    pub fn locks_held(&self, txn: TxnId) -> usize {
        self.table
            .lock()
            .map(|t| t.held.get(&txn).map_or(0, |k| k.len()))
            .unwrap_or(0)
    }

    pub fn deadlocks_detected(&self) -> u64 {
        self.deadlocks.load(Ordering::Relaxed)
    }
}
