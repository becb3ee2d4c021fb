//! # Session
//!
//! Per-logical-operation state the toast core needs from its host: the
//! current transaction, the snapshots it holds, the relation locks it has
//! taken, and a cooperative interrupt flag.
//!
//! ## Snapshot Stack
//!
//! ```text
//! registered: [S1, S2, ...]   long-lived (cursors, portals)
//! active:     [A1, A2, ...]   pushed per statement
//! ```
//!
//! [`Session::toast_snapshot`] picks the snapshot with the oldest `xmin`
//! across both sets and returns it with toast visibility. With neither present the read fails with
//! [`ToastError::NoSnapshot`]: detoasting after the owning snapshot is gone
//! could race with vacuum removing the chunks.
//!
//! ## Locks
//!
//! Locks are recorded per relation and mode and held until
//! [`Session::commit`] or [`Session::abort`]. There is no conflict
//! detection; the host lock manager is out of scope.
//!
//! ## Interrupts
//!
//! The interrupt flag is shared through an `Arc<AtomicBool>` so another
//! thread can request cancellation. Long loops call
//! [`Session::check_for_interrupts`] between chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::snapshot::Snapshot;
use super::transaction::{TransactionManager, TxnId};
use crate::toast::ToastError;
use crate::Oid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    AccessShare,
    RowExclusive,
}

#[derive(Debug, Default)]
struct SessionState {
    current: Option<TxnId>,
    registered: SmallVec<[Snapshot; 2]>,
    active: SmallVec<[Snapshot; 2]>,
    locks: SmallVec<[(Oid, LockMode); 4]>,
}

#[derive(Debug)]
pub struct Session {
    txns: Arc<TransactionManager>,
    state: Mutex<SessionState>,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    pub fn new(txns: Arc<TransactionManager>) -> Self {
        Self {
            txns,
            state: Mutex::new(SessionState::default()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    /// Starts a transaction and pushes a statement snapshot for it.
    pub fn begin(&self) -> Result<TxnId> {
        let mut state = self.state.lock();
        if let Some(txn) = state.current {
            bail!("transaction {} already in progress", txn);
        }
        let txn = self.txns.begin();
        state.current = Some(txn);
        state.active.push(self.txns.snapshot(txn));
        Ok(txn)
    }

    pub fn current_txn(&self) -> Result<TxnId> {
        match self.state.lock().current {
            Some(txn) => Ok(txn),
            None => bail!("no transaction in progress"),
        }
    }

    pub fn take_snapshot(&self) -> Result<Snapshot> {
        let txn = self.current_txn()?;
        Ok(self.txns.snapshot(txn))
    }

    pub fn register_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().registered.push(snapshot);
    }

    pub fn unregister_snapshots(&self) {
        self.state.lock().registered.clear();
    }

    pub fn push_active_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().active.push(snapshot);
    }

    pub fn pop_active_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().active.pop()
    }

    /// Snapshot chunk reads run under.
    pub fn toast_snapshot(&self) -> Result<Snapshot> {
        let state = self.state.lock();
        let oldest = state
            .registered
            .iter()
            .chain(state.active.iter())
            .min_by_key(|s| s.xmin);
        match oldest {
            Some(snapshot) => Ok(snapshot.as_toast()),
            None => Err(ToastError::NoSnapshot.into()),
        }
    }

    pub fn lock_relation(&self, relid: Oid, mode: LockMode) {
        let mut state = self.state.lock();
        if !state.locks.contains(&(relid, mode)) {
            state.locks.push((relid, mode));
        }
    }

    pub fn holds_lock(&self, relid: Oid, mode: LockMode) -> bool {
        self.state.lock().locks.contains(&(relid, mode))
    }

    pub fn held_locks(&self) -> Vec<(Oid, LockMode)> {
        self.state.lock().locks.to_vec()
    }

    pub fn commit(&self) -> Result<()> {
        self.finish(true)
    }

    pub fn abort(&self) -> Result<()> {
        self.finish(false)
    }

    fn finish(&self, commit: bool) -> Result<()> {
        let mut state = self.state.lock();
        let Some(txn) = state.current.take() else {
            bail!("no transaction in progress");
        };
        state.active.clear();
        state.registered.clear();
        state.locks.clear();
        drop(state);
        if commit {
            self.txns.commit(txn)
        } else {
            self.txns.abort(txn)
        }
    }

    /// Handle another thread can use to cancel this session's work.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn request_cancel(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Fails with [`ToastError::Cancelled`] once if a cancel is pending.
    pub fn check_for_interrupts(&self) -> Result<()> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            return Err(ToastError::Cancelled.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::SnapshotKind;

    fn session() -> Session {
        Session::new(Arc::new(TransactionManager::new()))
    }

    #[test]
    fn test_no_snapshot_outside_transaction() {
        let s = session();
        let err = s.toast_snapshot().unwrap_err();
        assert_eq!(err.downcast_ref::<ToastError>(), Some(&ToastError::NoSnapshot));

        s.begin().unwrap();
        assert_eq!(s.toast_snapshot().unwrap().kind, SnapshotKind::Toast);
        s.commit().unwrap();
        assert!(s.toast_snapshot().is_err());
    }

    #[test]
    fn test_oldest_registered_wins() {
        let s = session();
        let txns = Arc::clone(s.transactions());
        let blocker = txns.begin();
        s.begin().unwrap();
        let old = s.take_snapshot().unwrap();
        txns.commit(blocker).unwrap();
        let newer = s.take_snapshot().unwrap();
        s.register_snapshot(newer.clone());
        s.register_snapshot(old.clone());
        assert_eq!(s.toast_snapshot().unwrap().xmin, old.xmin);
        assert!(old.xmin < newer.xmin);
    }

    #[test]
    fn test_older_active_snapshot_beats_newer_registered() {
        let s = session();
        let txns = Arc::clone(s.transactions());
        let blocker = txns.begin();
        s.begin().unwrap();
        txns.commit(blocker).unwrap();
        let newer = s.take_snapshot().unwrap();
        s.register_snapshot(newer.clone());

        // the statement snapshot pushed by begin() still sees blocker running
        let chosen = s.toast_snapshot().unwrap();
        assert_eq!(chosen.xmin, blocker);
        assert!(chosen.xmin < newer.xmin);

        s.unregister_snapshots();
        s.pop_active_snapshot();
        assert!(s.toast_snapshot().is_err());
    }

    #[test]
    fn test_locks_released_at_commit() {
        let s = session();
        s.begin().unwrap();
        s.lock_relation(10, LockMode::RowExclusive);
        s.lock_relation(10, LockMode::RowExclusive);
        assert_eq!(s.held_locks().len(), 1);
        assert!(s.holds_lock(10, LockMode::RowExclusive));
        s.abort().unwrap();
        assert!(s.held_locks().is_empty());
    }

    #[test]
    fn test_interrupt_fires_once() {
        let s = session();
        s.interrupt_handle().store(true, Ordering::SeqCst);
        let err = s.check_for_interrupts().unwrap_err();
        assert_eq!(err.downcast_ref::<ToastError>(), Some(&ToastError::Cancelled));
        assert!(s.check_for_interrupts().is_ok());
    }
}
