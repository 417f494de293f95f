//! Core identifiers and value types shared by every layer of the engine

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Log Sequence Number - unique, strictly increasing id of a WAL record
pub type Lsn = u64;

/// Transaction ID (monotonic)
pub type TxnId = u64;

/// Page identifier in the page store
pub type PageId = u32;

/// Slot within a page
pub type SlotId = u32;

/// Transaction id used for engine-internal page changes (vacuum).
/// Never allocated to a user transaction and never undone.
pub const SYSTEM_TXN: TxnId = 0;

/// Logical row address: table name plus row id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub table: String,
    pub id: u64,
}

impl RowKey {
    pub fn new(table: impl Into<String>, id: u64) -> Self {
        Self { table: table.into(), id }
    }

    /// Home page of this key's versions. Stable across restarts.
    pub fn page_for(&self, page_count: u32) -> PageId {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.table.as_bytes());
        hasher.update(&self.id.to_le_bytes());
        hasher.finalize() % page_count.max(1)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

/// Physical address of a row version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId {
    pub page: PageId,
    pub slot: SlotId,
}

impl VersionId {
    pub fn new(page: PageId, slot: SlotId) -> Self {
        Self { page, slot }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page, self.slot)
    }
}

/// One physical version of a logical row, as stored in a page slot.
///
/// `xmin` is written once at creation. `xmax` is written once when the
/// version is deleted or superseded (and cleared only by undo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionImage {
    pub key: RowKey,
    pub payload: Bytes,
    pub xmin: TxnId,
    pub xmax: Option<TxnId>,
    /// The version this one superseded
    pub prev: Option<VersionId>,
}

impl VersionImage {
    pub fn new(key: RowKey, payload: Bytes, xmin: TxnId, prev: Option<VersionId>) -> Self {
        Self { key, payload, xmin, xmax: None, prev }
    }

    /// Whether nobody has deleted or superseded this version yet
    pub fn is_live(&self) -> bool {
        self.xmax.is_none()
    }
}

/// Transaction isolation levels, chosen per transaction at BEGIN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Fresh snapshot per statement
    ReadCommitted,
    /// One snapshot for the whole transaction (snapshot isolation)
    RepeatableRead,
    /// Snapshot isolation plus read/write dependency tracking
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether one snapshot is reused for every statement
    pub fn uses_transaction_snapshot(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', " ").replace('_', " ").as_str() {
            "READ COMMITTED" | "RC" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" | "RR" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("Unknown isolation level: {}", s)),
        }
    }
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Active,
    /// Commit record appended, waiting for it to become durable
    Committing,
    Committed,
    /// Undo in progress
    AbortPending,
    Aborted,
}

impl TxnStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }

    /// Whether a move from `self` to `next` is allowed.
    /// Only Active branches; everything else moves forward once.
    pub fn can_transition_to(&self, next: TxnStatus) -> bool {
        matches!(
            (self, next),
            (TxnStatus::Active, TxnStatus::Committing)
                | (TxnStatus::Active, TxnStatus::AbortPending)
                | (TxnStatus::Committing, TxnStatus::Committed)
                | (TxnStatus::Committing, TxnStatus::AbortPending)
                | (TxnStatus::AbortPending, TxnStatus::Aborted)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_for_is_stable_and_in_range() {
        let key = RowKey::new("accounts", 17);
        let page = key.page_for(64);
        assert!(page < 64);
        assert_eq!(page, RowKey::new("accounts", 17).page_for(64));
        assert_eq!(key.page_for(0), 0);
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!("serializable".parse::<IsolationLevel>().unwrap(), IsolationLevel::Serializable);
        assert_eq!("repeatable_read".parse::<IsolationLevel>().unwrap(), IsolationLevel::RepeatableRead);
        assert_eq!("read-committed".parse::<IsolationLevel>().unwrap(), IsolationLevel::ReadCommitted);
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_status_transitions_are_one_way() {
        assert!(TxnStatus::Active.can_transition_to(TxnStatus::Committing));
        assert!(TxnStatus::Active.can_transition_to(TxnStatus::AbortPending));
        assert!(!TxnStatus::Committed.can_transition_to(TxnStatus::Active));
        assert!(!TxnStatus::Aborted.can_transition_to(TxnStatus::Committing));
        assert!(TxnStatus::Committed.is_finished());
    }

    #[test]
    fn test_version_image_liveness() {
        let mut v = VersionImage::new(RowKey::new("t", 1), Bytes::from_static(b"x"), 5, None);
        assert!(v.is_live());
        v.xmax = Some(6);
        assert!(!v.is_live());
    }
}
