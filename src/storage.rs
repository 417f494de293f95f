//! Page store for Basalt
//!
//! The transactional core only decides *when* a page may be written (after the
//! log describing it is durable); this module decides *how*.
//!
//! ### Directory Structure
//! ```text
//! data/
//! ├── wal.log           # Write-ahead log
//! ├── wal.checkpoint    # Checkpoint marker (JSON)
//! └── pages/
//!     ├── 00000000.page # bincode-encoded Page
//!     ├── 00000001.page
//!     └── ...
//! ```
//!
//! Each page file is replaced atomically (write to a temp file, fsync, rename),
//! so a crash leaves either the old or the new image, never a torn one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{BasaltError, Result};
use crate::types::{Lsn, PageId, SlotId, VersionId, VersionImage};

/// In-memory image of one page: a set of version slots stamped with the LSN
/// of the last log record applied to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    /// LSN of the newest change reflected in this image
    pub page_lsn: Lsn,
    /// Next free slot number; slots are never reused
    pub next_slot: SlotId,
    pub slots: BTreeMap<SlotId, VersionImage>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn get(&self, slot: SlotId) -> Option<&VersionImage> {
        self.slots.get(&slot)
    }

    /// Reserve a fresh slot number
    pub fn allocate_slot(&mut self) -> SlotId {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// Replace the contents of `slot`, returning what was there
    pub fn put(&mut self, slot: SlotId, image: Option<VersionImage>) -> Option<VersionImage> {
        if slot >= self.next_slot {
            self.next_slot = slot + 1;
        }
        match image {
            Some(v) => self.slots.insert(slot, v),
            None => self.slots.remove(&slot),
        }
    }

    /// All versions on this page with their ids
    pub fn versions(&self) -> impl Iterator<Item = (VersionId, &VersionImage)> {
        let id = self.id;
        self.slots.iter().map(move |(slot, v)| (VersionId::new(id, *slot), v))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Raw page I/O collaborator
pub trait PageStore: Send + Sync {
    /// Read the stored bytes of a page, `None` if it was never written
    fn read_page(&self, id: PageId) -> Result<Option<Vec<u8>>>;

    /// Durably replace the bytes of a page
    fn write_page(&self, id: PageId, bytes: &[u8]) -> Result<()>;

    /// Ids of every page that has been written
    fn page_ids(&self) -> Result<Vec<PageId>>;

    /// Make all completed writes durable
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// One file per page under `<data_dir>/pages`
pub struct FilePageStore {
    dir: PathBuf,
}

impl FilePageStore {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        let dir = data_dir.join("pages");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn page_path(&self, id: PageId) -> PathBuf {
        self.dir.join(format!("{:08}.page", id))
    }
}

impl PageStore for FilePageStore {
    fn read_page(&self, id: PageId) -> Result<Option<Vec<u8>>> {
        let path = self.page_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn write_page(&self, id: PageId, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.page_path(id))
            .map_err(|e| BasaltError::Io(e.error))?;
        Ok(())
    }

    fn page_ids(&self) -> Result<Vec<PageId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("page") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<PageId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn sync(&self) -> Result<()> {
        // Persist the directory entries created by rename
        #[cfg(unix)]
        fs::File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// Page store held in memory. Clones share the same pages, so a test can
/// "crash" an engine and reopen another one over the surviving pages.
#[derive(Clone, Default)]
pub struct MemoryPageStore {
    pages: Arc<RwLock<HashMap<PageId, Vec<u8>>>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded copy of a stored page
    pub fn stored_page(&self, id: PageId) -> Result<Option<Page>> {
        match self.read_page(id)? {
            Some(bytes) => Ok(Some(Page::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl PageStore for MemoryPageStore {
    fn read_page(&self, id: PageId) -> Result<Option<Vec<u8>>> {
        let pages = self.pages.read().map_err(|_| BasaltError::poisoned("page store"))?;
        Ok(pages.get(&id).cloned())
    }

    fn write_page(&self, id: PageId, bytes: &[u8]) -> Result<()> {
        let mut pages = self.pages.write().map_err(|_| BasaltError::poisoned("page store"))?;
        pages.insert(id, bytes.to_vec());
        Ok(())
    }

    fn page_ids(&self) -> Result<Vec<PageId>> {
        let pages = self.pages.read().map_err(|_| BasaltError::poisoned("page store"))?;
        let mut ids: Vec<PageId> = pages.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowKey;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn sample_page(id: PageId) -> Page {
        let mut page = Page::new(id);
        let slot = page.allocate_slot();
        page.put(
            slot,
            Some(VersionImage::new(RowKey::new("t", 1), Bytes::from_static(b"v1"), 3, None)),
        );
        page.page_lsn = 9;
        page
    }

    #[test]
    fn test_page_put_tracks_next_slot() {
        let mut page = Page::new(1);
        assert_eq!(page.allocate_slot(), 0);
        let v = VersionImage::new(RowKey::new("t", 1), Bytes::new(), 1, None);
        page.put(7, Some(v));
        assert_eq!(page.next_slot, 8);
        assert!(page.put(7, None).is_some());
        assert!(page.get(7).is_none());
    }

    #[test]
    fn test_file_page_store_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let store = FilePageStore::new(temp_dir.path().to_path_buf()).unwrap();
        assert!(store.read_page(3).unwrap().is_none());

        let page = sample_page(3);
        store.write_page(3, &page.encode().unwrap()).unwrap();
        store.sync().unwrap();

        let bytes = store.read_page(3).unwrap().unwrap();
        assert_eq!(Page::decode(&bytes).unwrap(), page);
        assert_eq!(store.page_ids().unwrap(), vec![3]);
    }

    #[test]
    fn test_file_page_store_overwrite() {
        let temp_dir = tempdir().unwrap();
        let store = FilePageStore::new(temp_dir.path().to_path_buf()).unwrap();
        store.write_page(0, b"old").unwrap();
        store.write_page(0, b"new").unwrap();
        assert_eq!(store.read_page(0).unwrap().unwrap(), b"new".to_vec());
    }

    #[test]
    fn test_memory_page_store_clones_share_pages() {
        let store = MemoryPageStore::new();
        let other = store.clone();
        store.write_page(5, &sample_page(5).encode().unwrap()).unwrap();
        assert_eq!(other.stored_page(5).unwrap().unwrap().page_lsn, 9);
        assert_eq!(other.page_ids().unwrap(), vec![5]);
    }
}
