//! # Snapshots and Row Visibility
//!
//! Chunk rows carry `xmin` (inserting transaction) and `xmax` (deleting
//! transaction, `0` when live). Three visibility rules are used:
//!
//! | Kind  | Row visible when                                           |
//! |-------|------------------------------------------------------------|
//! | Mvcc  | xmin committed before the snapshot (or is ours) and xmax is |
//! |       | unset, aborted, or not yet visible                          |
//! | Toast | xmin did not abort; xmax is ignored                         |
//! | Any   | always                                                      |
//!
//! Toast visibility is what chunk reads use: a value referenced by a visible
//! main-table row must be readable even if a later transaction has already
//! deleted its chunks.

use smallvec::SmallVec;

use super::transaction::{TransactionManager, TxnId, TxnState, INVALID_TXN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Mvcc,
    Toast,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: SnapshotKind,
    /// Every id below this had finished when the snapshot was taken.
    pub xmin: TxnId,
    /// Every id at or above this had not started.
    pub xmax: TxnId,
    /// Transaction that took the snapshot; its own writes are visible.
    pub current: TxnId,
    pub in_progress: SmallVec<[TxnId; 8]>,
}

impl Snapshot {
    /// Visibility ignoring transaction state entirely.
    pub fn any() -> Self {
        Self {
            kind: SnapshotKind::Any,
            xmin: INVALID_TXN_ID,
            xmax: TxnId::MAX,
            current: INVALID_TXN_ID,
            in_progress: SmallVec::new(),
        }
    }

    /// A toast-visibility snapshot carrying this snapshot's horizon.
    pub fn as_toast(&self) -> Self {
        Self {
            kind: SnapshotKind::Toast,
            ..self.clone()
        }
    }

    fn sees(&self, txn: TxnId, txns: &TransactionManager) -> bool {
        if txn == self.current && txn != INVALID_TXN_ID {
            return true;
        }
        if txn >= self.xmax || self.in_progress.contains(&txn) {
            return false;
        }
        txns.state(txn) == TxnState::Committed
    }

    pub fn is_visible(&self, xmin: TxnId, xmax: TxnId, txns: &TransactionManager) -> bool {
        match self.kind {
            SnapshotKind::Any => true,
            SnapshotKind::Toast => txns.state(xmin) != TxnState::Aborted,
            SnapshotKind::Mvcc => {
                self.sees(xmin, txns) && (xmax == INVALID_TXN_ID || !self.sees(xmax, txns))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mvcc_hides_uncommitted_and_deleted() {
        let txns = TransactionManager::new();
        let writer = txns.begin();
        let reader = txns.begin();
        let snap = txns.snapshot(reader);
        assert!(!snap.is_visible(writer, 0, &txns));
        assert!(snap.is_visible(reader, 0, &txns));

        txns.commit(writer).unwrap();
        // still running when the snapshot was taken
        assert!(!snap.is_visible(writer, 0, &txns));
        let later = txns.snapshot(reader);
        assert!(later.is_visible(writer, 0, &txns));
        assert!(!later.is_visible(writer, reader, &txns));
    }

    #[test]
    fn test_toast_ignores_xmax() {
        let txns = TransactionManager::new();
        let t = txns.begin();
        let snap = txns.snapshot(t).as_toast();
        let deleter = txns.begin();
        txns.commit(deleter).unwrap();
        assert!(snap.is_visible(t, deleter, &txns));

        let aborted = txns.begin();
        txns.abort(aborted).unwrap();
        assert!(!snap.is_visible(aborted, 0, &txns));
        assert!(Snapshot::any().is_visible(aborted, 0, &txns));
    }
}
