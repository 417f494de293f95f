//! Buffer pool and Dirty Page Table
//!
//! Pages are cached in memory and modified there. A page goes back to the
//! page store only through [`BufferPool::flush_page`], which first forces the
//! log through the page's LSN. Eviction may write a dirty page of an
//! uncommitted transaction (steal); undo information is already in the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{BasaltError, Result};
use crate::storage::{Page, PageStore};
use crate::types::{Lsn, PageId};
use super::log::DptEntry;
use super::wal::WalManager;

/// Pages modified in memory since their last flush, with the LSN of the
/// oldest record that dirtied each one
#[derive(Debug, Default)]
pub struct DirtyPageTable {
    entries: Mutex<HashMap<PageId, Lsn>>,
}

impl DirtyPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `lsn` dirtied `page_id`. Keeps the earliest recLSN.
    pub fn mark_dirty(&self, page_id: PageId, lsn: Lsn) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(page_id).or_insert(lsn);
        }
    }

    /// Forget a page after it has been flushed
    pub fn clear(&self, page_id: PageId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&page_id);
        }
    }

    pub fn rec_lsn(&self, page_id: PageId) -> Option<Lsn> {
        self.entries.lock().ok()?.get(&page_id).copied()
    }

    /// Earliest recLSN over all dirty pages
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.entries.lock().ok()?.values().min().copied()
    }

    /// Entries sorted by page id, for checkpoints
    pub fn snapshot(&self) -> Vec<DptEntry> {
        let mut out: Vec<DptEntry> = match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .map(|(&page_id, &rec_lsn)| DptEntry { page_id, rec_lsn })
                .collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by_key(|e| e.page_id);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

struct Frame {
    page: Page,
    last_used: u64,
}

struct PoolState {
    frames: HashMap<PageId, Frame>,
    tick: u64,
}

/// Bounded page cache over a [`PageStore`]
pub struct BufferPool {
    store: Arc<dyn PageStore>,
    wal: Arc<WalManager>,
    dpt: DirtyPageTable,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(store: Arc<dyn PageStore>, wal: Arc<WalManager>, capacity: usize) -> Self {
        Self {
            store,
            wal,
            dpt: DirtyPageTable::new(),
            capacity: capacity.max(1),
            state: Mutex::new(PoolState { frames: HashMap::new(), tick: 0 }),
        }
    }

    pub fn dirty_pages(&self) -> &DirtyPageTable {
        &self.dpt
    }

    /// Run `f` against the current image of a page
    pub fn read<R>(&self, page_id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        let mut state = self.state.lock().map_err(|_| BasaltError::poisoned("buffer pool"))?;
        let frame = self.load(&mut state, page_id)?;
        Ok(f(&frame.page))
    }

    /// Modify a page on behalf of the log record `lsn`: stamps the page LSN
    /// and marks the page dirty
    pub fn modify<R>(&self, page_id: PageId, lsn: Lsn, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        self.modify_with(page_id, |page| Ok((Some(lsn), f(page))))
    }

    /// Like [`BufferPool::modify`], but `f` decides the LSN while holding the
    /// page, so a record can be appended and applied as one step. Returning
    /// `None` leaves the page clean.
    pub fn modify_with<R>(
        &self,
        page_id: PageId,
        f: impl FnOnce(&mut Page) -> Result<(Option<Lsn>, R)>,
    ) -> Result<R> {
        let mut state = self.state.lock().map_err(|_| BasaltError::poisoned("buffer pool"))?;
        let frame = self.load(&mut state, page_id)?;
        let (lsn, out) = f(&mut frame.page)?;
        if let Some(lsn) = lsn {
            frame.page.page_lsn = frame.page.page_lsn.max(lsn);
            self.dpt.mark_dirty(page_id, lsn);
        }
        Ok(out)
    }

    /// Fetch a page into the pool, evicting if full
    fn load<'a>(&self, state: &'a mut PoolState, page_id: PageId) -> Result<&'a mut Frame> {
        state.tick += 1;
        let tick = state.tick;

        if !state.frames.contains_key(&page_id) {
            if state.frames.len() >= self.capacity {
                self.evict_one(state)?;
            }
            let page = match self.store.read_page(page_id)? {
                Some(bytes) => Page::decode(&bytes)?,
                None => Page::new(page_id),
            };
            state.frames.insert(page_id, Frame { page, last_used: tick });
        }

        let frame = state
            .frames
            .get_mut(&page_id)
            .ok_or_else(|| BasaltError::Internal(format!("page {} vanished from pool", page_id)))?;
        frame.last_used = tick;
        Ok(frame)
    }

    /// Drop the least recently used page, preferring clean ones
    fn evict_one(&self, state: &mut PoolState) -> Result<()> {
        let victim = state
            .frames
            .iter()
            .min_by_key(|(id, frame)| (self.dpt.rec_lsn(**id).is_some(), frame.last_used))
            .map(|(id, _)| *id);
        let Some(victim) = victim else {
            return Ok(());
        };
        if let Some(frame) = state.frames.get(&victim) {
            if self.dpt.rec_lsn(victim).is_some() {
                log::debug!("Evicting dirty page {} (page LSN {})", victim, frame.page.page_lsn);
                self.write_back(&frame.page)?;
            }
        }
        state.frames.remove(&victim);
        Ok(())
    }

    /// Log-before-data: the log must be durable through the page LSN first
    fn write_back(&self, page: &Page) -> Result<()> {
        self.wal.flush(page.page_lsn)?;
        self.store.write_page(page.id, &page.encode()?)?;
        self.dpt.clear(page.id);
        Ok(())
    }

    /// Write one page to the store if it is dirty
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let state = self.state.lock().map_err(|_| BasaltError::poisoned("buffer pool"))?;
        if self.dpt.rec_lsn(page_id).is_none() {
            return Ok(());
        }
        if let Some(frame) = state.frames.get(&page_id) {
            self.write_back(&frame.page)?;
        }
        Ok(())
    }

    /// Write every dirty page and sync the store. Returns how many were written.
    pub fn flush_all(&self) -> Result<usize> {
        let state = self.state.lock().map_err(|_| BasaltError::poisoned("buffer pool"))?;
        let mut dirty: Vec<&Page> = state
            .frames
            .values()
            .map(|f| &f.page)
            .filter(|p| self.dpt.rec_lsn(p.id).is_some())
            .collect();
        dirty.sort_by_key(|p| p.id);

        // A single log flush covers every page
        if let Some(max_lsn) = dirty.iter().map(|p| p.page_lsn).max() {
            self.wal.flush(max_lsn)?;
        }
        for page in &dirty {
            self.write_back(page)?;
        }
        self.store.sync()?;
        Ok(dirty.len())
    }

    /// Drop every cached page and dirty entry without writing anything
    pub fn discard_all(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| BasaltError::poisoned("buffer pool"))?;
        state.frames.clear();
        self.dpt.clear_all();
        Ok(())
    }

    /// Every page id that exists in the store or the pool
    pub fn page_ids(&self) -> Result<Vec<PageId>> {
        let mut ids = self.store.page_ids()?;
        {
            let state = self.state.lock().map_err(|_| BasaltError::poisoned("buffer pool"))?;
            ids.extend(state.frames.keys().copied());
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn cached_pages(&self) -> usize {
        self.state.lock().map(|s| s.frames.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPageStore;
    use crate::txn::log::LogBody;
    use crate::txn::wal::WalConfig;
    use crate::types::{RowKey, VersionImage};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn image(id: u64) -> VersionImage {
        VersionImage::new(RowKey::new("t", id), Bytes::from_static(b"v"), 1, None)
    }

    fn setup(dir: &std::path::Path, capacity: usize) -> (MemoryPageStore, Arc<WalManager>, BufferPool) {
        let store = MemoryPageStore::new();
        let wal = Arc::new(WalManager::open(dir.join("wal.log"), WalConfig::synchronous()).unwrap());
        let pool = BufferPool::new(Arc::new(store.clone()), Arc::clone(&wal), capacity);
        (store, wal, pool)
    }

    #[test]
    fn test_dpt_keeps_earliest_rec_lsn() {
        let dpt = DirtyPageTable::new();
        dpt.mark_dirty(3, 10);
        dpt.mark_dirty(3, 20);
        dpt.mark_dirty(1, 15);
        assert_eq!(dpt.rec_lsn(3), Some(10));
        assert_eq!(dpt.min_rec_lsn(), Some(10));
        dpt.clear(3);
        assert_eq!(dpt.min_rec_lsn(), Some(15));
        assert_eq!(dpt.snapshot(), vec![DptEntry { page_id: 1, rec_lsn: 15 }]);
    }

    #[test]
    fn test_modify_marks_dirty_and_flush_writes_after_log() {
        let dir = tempdir().unwrap();
        let (store, wal, pool) = setup(dir.path(), 8);

        let record = wal.append(1, None, LogBody::Begin).unwrap();
        pool.modify(2, record.lsn, |page| page.put(0, Some(image(1)))).unwrap();
        assert_eq!(pool.dirty_pages().rec_lsn(2), Some(record.lsn));
        assert!(store.stored_page(2).unwrap().is_none());

        pool.flush_page(2).unwrap();
        assert!(wal.durable_lsn() >= record.lsn);
        let stored = store.stored_page(2).unwrap().unwrap();
        assert_eq!(stored.page_lsn, record.lsn);
        assert!(pool.dirty_pages().is_empty());
    }

    #[test]
    fn test_eviction_flushes_dirty_page_through_its_lsn() {
        let dir = tempdir().unwrap();
        let (store, wal, pool) = setup(dir.path(), 1);

        let first = wal.append(1, None, LogBody::Begin).unwrap();
        pool.modify(0, first.lsn, |page| page.put(0, Some(image(1)))).unwrap();
        // Loading a second page pushes the first one out
        pool.read(1, |_| ()).unwrap();

        assert_eq!(pool.cached_pages(), 1);
        assert!(wal.durable_lsn() >= first.lsn);
        assert!(store.stored_page(0).unwrap().unwrap().get(0).is_some());
        assert!(pool.dirty_pages().rec_lsn(0).is_none());
    }

    #[test]
    fn test_discard_all_loses_unflushed_changes() {
        let dir = tempdir().unwrap();
        let (_store, wal, pool) = setup(dir.path(), 4);
        let record = wal.append(1, None, LogBody::Begin).unwrap();
        pool.modify(0, record.lsn, |page| page.put(0, Some(image(1)))).unwrap();
        pool.discard_all().unwrap();
        assert!(pool.read(0, |page| page.get(0).is_none()).unwrap());
        assert!(pool.dirty_pages().is_empty());
    }

    #[test]
    fn test_flush_all_and_page_ids() {
        let dir = tempdir().unwrap();
        let (store, wal, pool) = setup(dir.path(), 4);
        let record = wal.append(1, None, LogBody::Begin).unwrap();
        pool.modify(0, record.lsn, |page| page.put(0, Some(image(1)))).unwrap();
        pool.modify(3, record.lsn, |page| page.put(0, Some(image(2)))).unwrap();
        assert_eq!(pool.flush_all().unwrap(), 2);
        assert_eq!(store.page_ids().unwrap(), vec![0, 3]);
        assert_eq!(pool.page_ids().unwrap(), vec![0, 3]);
    }
}
