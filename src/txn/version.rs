//! Version Store
//!
//! Every physical version of a row lives in a slot of its key's home page;
//! a version names the one it superseded through `prev`, so a key's versions
//! form a newest-first chain. The store keeps a `RowKey -> head` index on
//! top of the pages.
//!
//! All changes go through [`VersionStore::change_slot`], which appends the
//! describing log record and applies it to the cached page in one step.
//! Nothing here decides *whether* a change is allowed; that is the
//! coordinator's job.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::error::{BasaltError, Result};
use crate::storage::Page;
use crate::types::{Lsn, PageId, RowKey, SlotId, TxnId, VersionId, VersionImage};
use super::buffer::BufferPool;
use super::log::{LogBody, LogRecord};
use super::snapshot::{Snapshot, StatusOracle};

/// Counters reported by vacuum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub keys_scanned: usize,
    pub keys_skipped: usize,
    pub versions_removed: usize,
    pub versions_relinked: usize,
}

pub struct VersionStore {
    pool: Arc<BufferPool>,
    page_count: u32,
    heads: RwLock<HashMap<RowKey, VersionId>>,
}

impl VersionStore {
    pub fn new(pool: Arc<BufferPool>, page_count: u32) -> Self {
        Self {
            pool,
            page_count: page_count.max(1),
            heads: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn page_for(&self, key: &RowKey) -> PageId {
        key.page_for(self.page_count)
    }

    fn head_in(&self, key: &RowKey) -> Result<Option<VersionId>> {
        let heads = self.heads.read().map_err(|_| BasaltError::poisoned("version index"))?;
        Ok(heads.get(key).copied())
    }

    /// Walk a chain inside one page, newest first
    fn chain(page: &Page, head: Option<VersionId>) -> Vec<(VersionId, VersionImage)> {
        let mut out = Vec::new();
        let mut next = head;
        while let Some(id) = next {
            if id.page != page.id {
                break;
            }
            let Some(version) = page.get(id.slot) else {
                break;
            };
            next = version.prev;
            out.push((id, version.clone()));
        }
        out
    }

    /// All versions of `key`, newest first
    pub fn versions_for(&self, key: &RowKey) -> Result<Vec<(VersionId, VersionImage)>> {
        let page_id = self.page_for(key);
        self.pool.read(page_id, |page| {
            let head = self.head_in(key)?;
            Ok(Self::chain(page, head))
        })?
    }

    /// Newest version of `key`, whoever wrote it
    pub fn head(&self, key: &RowKey) -> Result<Option<(VersionId, VersionImage)>> {
        Ok(self.versions_for(key)?.into_iter().next())
    }

    /// First version of `key` visible to `snapshot`
    pub fn visible(
        &self,
        key: &RowKey,
        snapshot: &Snapshot,
        oracle: &dyn StatusOracle,
    ) -> Result<Option<(VersionId, VersionImage)>> {
        Ok(self
            .versions_for(key)?
            .into_iter()
            .find(|(_, v)| snapshot.is_visible(v, oracle)))
    }

    /// Keys that currently have a chain
    pub fn keys(&self) -> Result<Vec<RowKey>> {
        let heads = self.heads.read().map_err(|_| BasaltError::poisoned("version index"))?;
        let mut keys: Vec<RowKey> = heads.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Replace one slot of `page_id` with `after`, logging the change first.
    ///
    /// `slot: None` allocates a fresh slot. `log` receives the slot and the
    /// previous image and must append the describing record; the page is only
    /// touched if that succeeds.
    pub fn change_slot(
        &self,
        page_id: PageId,
        slot: Option<SlotId>,
        after: Option<VersionImage>,
        log: impl FnOnce(SlotId, Option<VersionImage>) -> Result<LogRecord>,
    ) -> Result<LogRecord> {
        self.pool.modify_with(page_id, |page| {
            let slot = slot.unwrap_or_else(|| page.allocate_slot());
            let before = page.get(slot).cloned();
            let record = log(slot, before.clone())?;
            page.put(slot, after.clone());
            self.track_head(VersionId::new(page_id, slot), before.as_ref(), after.as_ref())?;
            Ok((Some(record.lsn), record))
        })
    }

    /// Keep the head index in step with one slot change
    fn track_head(
        &self,
        id: VersionId,
        before: Option<&VersionImage>,
        after: Option<&VersionImage>,
    ) -> Result<()> {
        let mut heads = self.heads.write().map_err(|_| BasaltError::poisoned("version index"))?;
        match (before, after) {
            (None, Some(created)) => {
                heads.insert(created.key.clone(), id);
            }
            (Some(removed), None) => {
                if heads.get(&removed.key) == Some(&id) {
                    match removed.prev {
                        Some(prev) => heads.insert(removed.key.clone(), prev),
                        None => heads.remove(&removed.key),
                    };
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Log and apply a new version at the head of its key's chain
    pub fn insert_version(
        &self,
        version: VersionImage,
        append: impl FnOnce(LogBody) -> Result<LogRecord>,
    ) -> Result<LogRecord> {
        let page_id = self.page_for(&version.key);
        let after = Some(version);
        let logged = after.clone();
        self.change_slot(page_id, None, after, |slot, before| {
            append(LogBody::Update { page_id, slot, before, after: logged })
        })
    }

    /// Log and apply `xmax = txn_id` on an existing version
    pub fn stamp_xmax(
        &self,
        id: VersionId,
        txn_id: TxnId,
        append: impl FnOnce(LogBody) -> Result<LogRecord>,
    ) -> Result<LogRecord> {
        let current = self
            .pool
            .read(id.page, |page| page.get(id.slot).cloned())?
            .ok_or_else(|| BasaltError::Internal(format!("version {} does not exist", id)))?;
        let mut stamped = current;
        stamped.xmax = Some(txn_id);
        let after = Some(stamped);
        let logged = after.clone();
        self.change_slot(id.page, Some(id.slot), after, |slot, before| {
            append(LogBody::Update { page_id: id.page, slot, before, after: logged })
        })
    }

    /// Undo one Update record: restore its before-image and log a CLR
    pub fn compensate(
        &self,
        record: &LogRecord,
        append: impl FnOnce(LogBody) -> Result<LogRecord>,
    ) -> Result<LogRecord> {
        let LogBody::Update { page_id, slot, before, .. } = &record.body else {
            return Err(BasaltError::Internal(format!(
                "record {} ({}) cannot be undone",
                record.lsn,
                record.kind()
            )));
        };
        let page_id = *page_id;
        let image = before.clone();
        let logged = image.clone();
        let undo_next_lsn = record.prev_lsn;
        self.change_slot(page_id, Some(*slot), image, |slot, _| {
            append(LogBody::Clr { page_id, slot, image: logged, undo_next_lsn })
        })
    }

    /// Reapply a page-writing record if the page has not seen it yet.
    /// Returns whether the page changed. The head index is not maintained;
    /// call [`VersionStore::rebuild_index`] once redo is done.
    pub fn redo(&self, record: &LogRecord) -> Result<bool> {
        let (page_id, slot, image) = match &record.body {
            LogBody::Update { page_id, slot, after, .. } => (*page_id, *slot, after),
            LogBody::Clr { page_id, slot, image, .. } => (*page_id, *slot, image),
            _ => return Ok(false),
        };
        let lsn: Lsn = record.lsn;
        self.pool.modify_with(page_id, |page| {
            if page.page_lsn >= lsn {
                return Ok((None, false));
            }
            page.put(slot, image.clone());
            Ok((Some(lsn), true))
        })
    }

    /// Rebuild the head index from the pages. The head of a key is the one
    /// version no other version of that key names as `prev`.
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut heads = HashMap::new();
        for page_id in self.pool.page_ids()? {
            let page_heads = self.pool.read(page_id, |page| {
                let referenced: HashSet<VersionId> =
                    page.versions().filter_map(|(_, v)| v.prev).collect();
                page.versions()
                    .filter(|(id, _)| !referenced.contains(id))
                    .map(|(id, v)| (v.key.clone(), id))
                    .collect::<Vec<_>>()
            })?;
            for (key, id) in page_heads {
                // Slots only grow, so the later one is newer
                let entry = heads.entry(key).or_insert(id);
                if id > *entry {
                    *entry = id;
                }
            }
        }
        let count = heads.len();
        *self.heads.write().map_err(|_| BasaltError::poisoned("version index"))? = heads;
        Ok(count)
    }

    /// Drop the head index (the pages are about to be replayed)
    pub fn clear_index(&self) -> Result<()> {
        self.heads.write().map_err(|_| BasaltError::poisoned("version index"))?.clear();
        Ok(())
    }

    /// Remove the versions of `key` no snapshot can see any more: deleted or
    /// superseded by a transaction that committed below `horizon`.
    /// Survivors are relinked before anything is removed.
    pub fn vacuum_key(
        &self,
        key: &RowKey,
        horizon: TxnId,
        oracle: &dyn StatusOracle,
        mut append: impl FnMut(LogBody) -> Result<LogRecord>,
        stats: &mut VacuumStats,
    ) -> Result<()> {
        let chain = self.versions_for(key)?;
        let is_dead = |v: &VersionImage| {
            v.xmax.map_or(false, |x| x < horizon && oracle.is_committed(x))
        };
        let (dead, survivors): (Vec<_>, Vec<_>) =
            chain.iter().cloned().partition(|(_, v)| is_dead(v));
        if dead.is_empty() {
            return Ok(());
        }

        for (i, (id, version)) in survivors.iter().enumerate() {
            let wanted = survivors.get(i + 1).map(|(next, _)| *next);
            if version.prev == wanted {
                continue;
            }
            let mut relinked = version.clone();
            relinked.prev = wanted;
            let after = Some(relinked);
            let logged = after.clone();
            self.change_slot(id.page, Some(id.slot), after, |slot, before| {
                append(LogBody::Update { page_id: id.page, slot, before, after: logged })
            })?;
            stats.versions_relinked += 1;
        }

        // Newest first, so the head index always names a live slot
        for (id, _) in &dead {
            self.change_slot(id.page, Some(id.slot), None, |slot, before| {
                append(LogBody::Update { page_id: id.page, slot, before, after: None })
            })?;
            stats.versions_removed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPageStore;
    use crate::txn::wal::{WalConfig, WalManager};
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use tempfile::{tempdir, TempDir};

    struct AllCommitted;

    impl StatusOracle for AllCommitted {
        fn is_committed(&self, _txn_id: TxnId) -> bool {
            true
        }
    }

    struct Fixture {
        _dir: TempDir,
        wal: Arc<WalManager>,
        store: VersionStore,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let wal = Arc::new(WalManager::open(dir.path().join("wal.log"), WalConfig::synchronous()).unwrap());
        let pool = Arc::new(BufferPool::new(Arc::new(MemoryPageStore::new()), Arc::clone(&wal), 16));
        Fixture { _dir: dir, wal, store: VersionStore::new(pool, 4) }
    }

    fn key() -> RowKey {
        RowKey::new("seats", 1)
    }

    fn version(payload: &'static str, xmin: TxnId, prev: Option<VersionId>) -> VersionImage {
        VersionImage::new(key(), Bytes::from_static(payload.as_bytes()), xmin, prev)
    }

    impl Fixture {
        fn append(&self, txn_id: TxnId) -> impl FnMut(LogBody) -> Result<LogRecord> + '_ {
            move |body| self.wal.append(txn_id, None, body)
        }

        fn insert(&self, v: VersionImage) -> VersionId {
            let xmin = v.xmin;
            let record = self.store.insert_version(v, self.append(xmin)).unwrap();
            let LogBody::Update { page_id, slot, .. } = record.body else { unreachable!() };
            VersionId::new(page_id, slot)
        }
    }

    /// v1 by txn 1, superseded by v2 from txn 2
    fn two_versions(f: &Fixture) -> (VersionId, VersionId) {
        let v1 = f.insert(version("v1", 1, None));
        f.store.stamp_xmax(v1, 2, f.append(2)).unwrap();
        let v2 = f.insert(version("v2", 2, Some(v1)));
        (v1, v2)
    }

    #[test]
    fn test_chain_is_newest_first() {
        let f = fixture();
        let (v1, v2) = two_versions(&f);
        let chain = f.store.versions_for(&key()).unwrap();
        let ids: Vec<VersionId> = chain.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![v2, v1]);
        assert_eq!(chain[1].1.xmax, Some(2));
        assert_eq!(f.store.keys().unwrap(), vec![key()]);
    }

    #[test]
    fn test_visible_picks_version_for_snapshot() {
        let f = fixture();
        two_versions(&f);
        // Txn 2 still running for this snapshot: sees v1
        let old = Snapshot::new(3, 3, BTreeSet::from([2]));
        let (_, seen) = f.store.visible(&key(), &old, &AllCommitted).unwrap().unwrap();
        assert_eq!(seen.payload, Bytes::from_static(b"v1"));
        let new = Snapshot::new(3, 3, BTreeSet::new());
        let (_, seen) = f.store.visible(&key(), &new, &AllCommitted).unwrap().unwrap();
        assert_eq!(seen.payload, Bytes::from_static(b"v2"));
    }

    #[test]
    fn test_compensate_restores_before_image_and_head() {
        let f = fixture();
        let v1 = f.insert(version("v1", 1, None));
        let stamp = f.store.stamp_xmax(v1, 2, f.append(2)).unwrap();
        let insert = f.store.insert_version(version("v2", 2, Some(v1)), f.append(2)).unwrap();

        let clr = f.store.compensate(&insert, f.append(2)).unwrap();
        assert!(matches!(clr.body, LogBody::Clr { image: None, .. }));
        f.store.compensate(&stamp, f.append(2)).unwrap();

        let (head, version) = f.store.head(&key()).unwrap().unwrap();
        assert_eq!(head, v1);
        assert!(version.is_live());
    }

    #[test]
    fn test_redo_skips_records_the_page_already_has() {
        let f = fixture();
        let record = f.store.insert_version(version("v1", 1, None), f.append(1)).unwrap();
        assert!(!f.store.redo(&record).unwrap());

        f.store.pool().discard_all().unwrap();
        f.store.clear_index().unwrap();
        assert!(f.store.redo(&record).unwrap());
        assert!(!f.store.redo(&record).unwrap());
        assert_eq!(f.store.rebuild_index().unwrap(), 1);
        assert_eq!(f.store.head(&key()).unwrap().unwrap().1.payload, Bytes::from_static(b"v1"));
    }

    #[test]
    fn test_rebuild_index_finds_unreferenced_version() {
        let f = fixture();
        let (_, v2) = two_versions(&f);
        f.store.clear_index().unwrap();
        assert!(f.store.head(&key()).unwrap().is_none());
        f.store.rebuild_index().unwrap();
        assert_eq!(f.store.head(&key()).unwrap().unwrap().0, v2);
    }

    #[test]
    fn test_vacuum_removes_superseded_versions_below_horizon() {
        let f = fixture();
        let (_, v2) = two_versions(&f);
        let mut stats = VacuumStats::default();

        // Txn 2 not below the horizon yet
        f.store.vacuum_key(&key(), 2, &AllCommitted, f.append(0), &mut stats).unwrap();
        assert_eq!(stats.versions_removed, 0);

        f.store.vacuum_key(&key(), 3, &AllCommitted, f.append(0), &mut stats).unwrap();
        assert_eq!(stats.versions_removed, 1);
        assert_eq!(stats.versions_relinked, 1);
        let chain = f.store.versions_for(&key()).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].0, v2);
        assert_eq!(chain[0].1.prev, None);
    }

    #[test]
    fn test_vacuum_of_deleted_key_drops_the_chain() {
        let f = fixture();
        let v1 = f.insert(version("v1", 1, None));
        f.store.stamp_xmax(v1, 2, f.append(2)).unwrap();
        let mut stats = VacuumStats::default();
        f.store.vacuum_key(&key(), 5, &AllCommitted, f.append(0), &mut stats).unwrap();
        assert!(f.store.versions_for(&key()).unwrap().is_empty());
        assert!(f.store.keys().unwrap().is_empty());
    }
}
