//! # Transactions, Snapshots and Sessions
//!
//! The toast core does not own transaction machinery; it consumes three
//! things from the host:
//!
//! - a transaction status oracle ([`TransactionManager`]) that answers
//!   whether the writer of a chunk row committed or aborted,
//! - snapshots ([`Snapshot`]) deciding which chunk rows a scan may see,
//! - a per-operation [`Session`] carrying the current transaction, the
//!   snapshots it holds, its relation locks and the interrupt flag.
//!
//! The types here are a small in-process implementation of those roles so
//! that the storage engine can be run end to end.
//!
//! ```text
//! Session ──begin()──> TransactionManager::begin() ──> TxnId
//!    │                         │
//!    │ toast_snapshot()        │ snapshot(txn)
//!    v                         v
//! Snapshot{Toast} ──is_visible(xmin, xmax)──> TxnState lookups
//! ```

pub mod session;
pub mod snapshot;
pub mod transaction;

pub use session::{LockMode, Session};
pub use snapshot::{Snapshot, SnapshotKind};
pub use transaction::{
    TransactionManager, TxnId, TxnState, FIRST_NORMAL_TXN_ID, FROZEN_TXN_ID, INVALID_TXN_ID,
};
