//! # Transaction Status
//!
//! Transaction ids are 64-bit, allocated from a global atomic counter, and
//! never reused. The manager keeps a commit log mapping each id to its state
//! so that visibility checks on chunk rows can ask "did the inserting
//! transaction commit?".
//!
//! Special values:
//! - `INVALID_TXN_ID = 0`: no transaction (an undeleted row has `xmax = 0`)
//! - `FROZEN_TXN_ID = 2`: rows inserted frozen, always committed
//! - `FIRST_NORMAL_TXN_ID = 3`: first id handed out by `begin`
//!
//! ## Transaction States
//!
//! ```text
//! ┌────────────┐     commit()     ┌───────────┐
//! │ InProgress │ ───────────────> │ Committed │
//! └────────────┘                  └───────────┘
//!      │
//!      │ abort()
//!      v
//! ┌─────────┐
//! │ Aborted │
//! └─────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! - id allocation: lock-free `fetch_add`
//! - commit log: `parking_lot::RwLock` around a `hashbrown` map, read-mostly
//! - ids that are neither in the log nor frozen are treated as aborted,
//!   matching a crash before the commit record was written

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::snapshot::{Snapshot, SnapshotKind};

pub type TxnId = u64;

pub const INVALID_TXN_ID: TxnId = 0;
pub const FROZEN_TXN_ID: TxnId = 2;
pub const FIRST_NORMAL_TXN_ID: TxnId = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    InProgress,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub struct TransactionManager {
    next_id: AtomicU64,
    clog: RwLock<HashMap<TxnId, TxnState>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_NORMAL_TXN_ID),
            clog: RwLock::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> TxnId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clog.write().insert(id, TxnState::InProgress);
        id
    }

    pub fn commit(&self, txn: TxnId) -> Result<()> {
        self.finish(txn, TxnState::Committed)
    }

    pub fn abort(&self, txn: TxnId) -> Result<()> {
        self.finish(txn, TxnState::Aborted)
    }

    fn finish(&self, txn: TxnId, to: TxnState) -> Result<()> {
        let mut clog = self.clog.write();
        match clog.get_mut(&txn) {
            Some(state @ TxnState::InProgress) => {
                *state = to;
                Ok(())
            }
            Some(state) => bail!("transaction {} already finished as {:?}", txn, state),
            None => bail!("unknown transaction {}", txn),
        }
    }

    pub fn state(&self, txn: TxnId) -> TxnState {
        if txn == FROZEN_TXN_ID {
            return TxnState::Committed;
        }
        self.clog
            .read()
            .get(&txn)
            .copied()
            .unwrap_or(TxnState::Aborted)
    }

    pub fn is_committed(&self, txn: TxnId) -> bool {
        self.state(txn) == TxnState::Committed
    }

    pub fn is_aborted(&self, txn: TxnId) -> bool {
        self.state(txn) == TxnState::Aborted
    }

    /// Next id to be handed out; every id below it has been allocated.
    pub fn next_txn_id(&self) -> TxnId {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Takes an MVCC snapshot on behalf of `current`.
    pub fn snapshot(&self, current: TxnId) -> Snapshot {
        let clog = self.clog.read();
        let xmax = self.next_id.load(Ordering::SeqCst);
        let mut in_progress: SmallVec<[TxnId; 8]> = clog
            .iter()
            .filter(|(id, state)| **state == TxnState::InProgress && **id != current)
            .map(|(id, _)| *id)
            .collect();
        in_progress.sort_unstable();
        let xmin = in_progress.first().copied().unwrap_or(xmax);
        Snapshot {
            kind: SnapshotKind::Mvcc,
            xmin,
            xmax,
            current,
            in_progress,
        }
    }

    /// Oldest transaction that may still be running; rows deleted by
    /// committed transactions below it are invisible to everyone.
    pub fn oldest_running(&self) -> TxnId {
        let clog = self.clog.read();
        clog.iter()
            .filter(|(_, state)| **state == TxnState::InProgress)
            .map(|(id, _)| *id)
            .min()
            .unwrap_or_else(|| self.next_id.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mgr = TransactionManager::new();
        let a = mgr.begin();
        let b = mgr.begin();
        assert_eq!(a, FIRST_NORMAL_TXN_ID);
        assert!(b > a);
    }

    #[test]
    fn test_state_transitions() {
        let mgr = TransactionManager::new();
        let t = mgr.begin();
        assert_eq!(mgr.state(t), TxnState::InProgress);
        mgr.commit(t).unwrap();
        assert!(mgr.is_committed(t));
        assert!(mgr.abort(t).is_err());
        assert!(mgr.is_aborted(999));
        assert!(mgr.is_committed(FROZEN_TXN_ID));
    }

    #[test]
    fn test_snapshot_excludes_running() {
        let mgr = TransactionManager::new();
        let running = mgr.begin();
        let me = mgr.begin();
        let snap = mgr.snapshot(me);
        assert_eq!(snap.xmin, running);
        assert_eq!(snap.xmax, me + 1);
        assert!(snap.in_progress.contains(&running));
        assert!(!snap.in_progress.contains(&me));
        assert_eq!(mgr.oldest_running(), running);
    }
}
