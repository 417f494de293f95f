//! Snapshots and the version visibility predicate

use std::collections::BTreeSet;

use crate::types::{TxnId, VersionImage};

/// Answers whether a transaction has committed
pub trait StatusOracle {
    fn is_committed(&self, txn_id: TxnId) -> bool;
}

/// The committed state a transaction reads against.
///
/// `start_id` is the id of the owning transaction; `active` holds every other
/// transaction that was running when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub owner: TxnId,
    pub start_id: TxnId,
    pub active: BTreeSet<TxnId>,
}

impl Snapshot {
    pub fn new(owner: TxnId, start_id: TxnId, active: BTreeSet<TxnId>) -> Self {
        Self { owner, start_id, active }
    }

    /// Whether `txn_id`'s commit is part of this snapshot
    pub fn sees_committed(&self, txn_id: TxnId, oracle: &dyn StatusOracle) -> bool {
        txn_id <= self.start_id && !self.active.contains(&txn_id) && oracle.is_committed(txn_id)
    }

    /// The visibility predicate.
    ///
    /// The creator must be the owner or committed before the snapshot. The
    /// version must not be deleted by the owner itself, nor by a transaction
    /// whose commit the snapshot includes.
    pub fn is_visible(&self, version: &VersionImage, oracle: &dyn StatusOracle) -> bool {
        let created = version.xmin == self.owner || self.sees_committed(version.xmin, oracle);
        if !created {
            return false;
        }
        match version.xmax {
            None => true,
            Some(xmax) if xmax == self.owner => false,
            Some(xmax) => !self.sees_committed(xmax, oracle),
        }
    }

    /// Smallest transaction id this snapshot may still need to distinguish
    pub fn oldest_relevant(&self) -> TxnId {
        self.active.iter().next().copied().unwrap_or(self.start_id).min(self.start_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowKey;
    use bytes::Bytes;
    use std::collections::HashSet;

    struct Committed(HashSet<TxnId>);

    impl StatusOracle for Committed {
        fn is_committed(&self, txn_id: TxnId) -> bool {
            self.0.contains(&txn_id)
        }
    }

    fn version(xmin: TxnId, xmax: Option<TxnId>) -> VersionImage {
        let mut v = VersionImage::new(RowKey::new("t", 1), Bytes::from_static(b"x"), xmin, None);
        v.xmax = xmax;
        v
    }

    fn snapshot(owner: TxnId, active: &[TxnId]) -> Snapshot {
        Snapshot::new(owner, owner, active.iter().copied().collect())
    }

    #[test]
    fn test_committed_before_start_is_visible() {
        let oracle = Committed([1].into_iter().collect());
        assert!(snapshot(5, &[]).is_visible(&version(1, None), &oracle));
    }

    #[test]
    fn test_uncommitted_creator_is_invisible() {
        let oracle = Committed(HashSet::new());
        assert!(!snapshot(5, &[]).is_visible(&version(3, None), &oracle));
    }

    #[test]
    fn test_creator_active_at_start_is_invisible_even_after_commit() {
        let oracle = Committed([3].into_iter().collect());
        assert!(!snapshot(5, &[3]).is_visible(&version(3, None), &oracle));
    }

    #[test]
    fn test_future_creator_is_invisible() {
        let oracle = Committed([7].into_iter().collect());
        assert!(!snapshot(5, &[]).is_visible(&version(7, None), &oracle));
    }

    #[test]
    fn test_own_writes_are_visible() {
        let oracle = Committed(HashSet::new());
        assert!(snapshot(5, &[]).is_visible(&version(5, None), &oracle));
    }

    #[test]
    fn test_own_delete_hides_version() {
        let oracle = Committed([1].into_iter().collect());
        assert!(!snapshot(5, &[]).is_visible(&version(1, Some(5)), &oracle));
    }

    #[test]
    fn test_deleter_outside_snapshot_keeps_version_visible() {
        let oracle = Committed([1, 3, 7].into_iter().collect());
        let s = snapshot(5, &[3]);
        // Deleter active at start
        assert!(s.is_visible(&version(1, Some(3)), &oracle));
        // Deleter started after us
        assert!(s.is_visible(&version(1, Some(7)), &oracle));
        // Deleter uncommitted
        assert!(s.is_visible(&version(1, Some(4)), &oracle));
    }

    #[test]
    fn test_committed_delete_before_start_hides_version() {
        let oracle = Committed([1, 2].into_iter().collect());
        assert!(!snapshot(5, &[]).is_visible(&version(1, Some(2)), &oracle));
    }

    #[test]
    fn test_oldest_relevant() {
        let s = snapshot(9, &[4, 6]);
        assert_eq!(s.oldest_relevant(), 4);
        assert_eq!(snapshot(9, &[]).oldest_relevant(), 9);
    }
}
