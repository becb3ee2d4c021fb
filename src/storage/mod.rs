//! # Chunk Storage Interfaces
//!
//! The toast core never touches pages or buffers. Everything it needs from
//! the host table and index access methods is expressed by two traits:
//!
//! - [`ChunkRelation`]: one chunk relation (the secondary table holding the
//!   chunks of externalized values) together with its indexes
//! - [`RelationCatalog`]: opens chunk relations by id, because an external
//!   pointer names the relation its chunks live in
//!
//! ## Chunk Row
//!
//! ```text
//! +------------+-------------+-----------------------------+
//! | value_id   | chunk_seq   | chunk_data                  |
//! | u32        | i32 (>= 0)  | varlena, 1..=CHUNK_SIZE B   |
//! +------------+-------------+-----------------------------+
//! primary index: (value_id, chunk_seq), unique
//! ```
//!
//! ## Scan Keys
//!
//! Chunk reads always pin `value_id` and optionally bound `chunk_seq`:
//!
//! | Keys                                   | Meaning                     |
//! |----------------------------------------|-----------------------------|
//! | `[ValueId(v)]`                         | every chunk of `v`          |
//! | `[ValueId(v), SeqEq(s)]`               | one chunk                   |
//! | `[ValueId(v), SeqGe(a), SeqLe(b)]`     | chunks `a..=b`              |
//!
//! Scans return rows in ascending `chunk_seq` order; the readers depend on
//! this to stream chunks into place without reordering.
//!
//! ## Reference Host
//!
//! [`memory`] implements both traits in process memory with MVCC rows, an
//! ordered unique index, vacuum and scan statistics.

pub mod memory;

use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;

use crate::config::ToastOptions;
use crate::mvcc::{Snapshot, TxnId};
use crate::tuple::TupleDesc;
use crate::varlena::Varlena;
use crate::Oid;

pub use memory::{MemCatalog, MemChunkRelation, ScanStats};

/// Physical row address inside a chunk relation.
pub type Tid = u64;

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub tid: Tid,
    pub value_id: Oid,
    pub chunk_seq: i32,
    pub chunk: Varlena,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKey {
    ValueId(Oid),
    SeqEq(i32),
    SeqGe(i32),
    SeqLe(i32),
}

pub type ScanKeys = SmallVec<[ScanKey; 3]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub id: Oid,
    pub name: String,
    /// Accepts inserts.
    pub ready: bool,
    /// Usable for scans.
    pub valid: bool,
    pub unique: bool,
}

/// Flags forwarded from the caller to the row insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Insert the row already frozen (visible to every snapshot), as bulk
    /// loads into a freshly created relation do.
    pub frozen: bool,
}

pub type ChunkScan<'a> = Box<dyn Iterator<Item = Result<ChunkRow>> + 'a>;

/// Encrypts chunk payloads in place. Length must be preserved, since chunk
/// sizes are checked on read.
pub trait ChunkCipher: Send + Sync {
    fn seal(&self, value_id: Oid, chunk_seq: i32, data: &mut [u8]) -> Result<()>;
    fn open(&self, value_id: Oid, chunk_seq: i32, data: &mut [u8]) -> Result<()>;
}

pub trait ChunkRelation: Send + Sync {
    fn id(&self) -> Oid;

    fn name(&self) -> &str;

    fn indexes(&self) -> Vec<IndexInfo>;

    /// A fresh value id. Uniqueness within the relation is not guaranteed;
    /// callers probe for collisions.
    fn new_value_id(&self) -> Oid;

    /// Inserts one chunk row. Index entries are added separately with
    /// [`ChunkRelation::index_insert`].
    fn insert_row(
        &self,
        txn: TxnId,
        value_id: Oid,
        chunk_seq: i32,
        chunk: &Varlena,
        options: InsertOptions,
    ) -> Result<Tid>;

    fn index_insert(
        &self,
        index: &IndexInfo,
        value_id: Oid,
        chunk_seq: i32,
        tid: Tid,
        unique_check: bool,
    ) -> Result<()>;

    /// Ordered scan of `index` restricted by `keys`, returning rows visible
    /// to `snapshot`.
    fn scan<'a>(
        &'a self,
        index: &IndexInfo,
        keys: &[ScanKey],
        snapshot: &Snapshot,
    ) -> Result<ChunkScan<'a>>;

    /// Marks a row deleted by `txn`. Returns `Ok(false)` when the row was
    /// already deleted by `txn` or by a committed transaction.
    fn delete_row(&self, txn: TxnId, tid: Tid) -> Result<bool>;

    fn cipher(&self) -> Option<&dyn ChunkCipher> {
        None
    }
}

pub trait RelationCatalog: Send + Sync {
    fn open_chunk_relation(&self, relid: Oid) -> Result<Arc<dyn ChunkRelation>>;
}

/// A main table as the planner sees it.
#[derive(Debug, Clone)]
pub struct HeapRelation {
    pub relid: Oid,
    pub name: String,
    pub desc: TupleDesc,
    /// Chunk relation for spilled values; `None` disables spilling.
    pub chunk_relid: Option<Oid>,
    pub options: ToastOptions,
}

impl HeapRelation {
    pub fn new(relid: Oid, name: impl Into<String>, desc: TupleDesc) -> Self {
        Self {
            relid,
            name: name.into(),
            desc,
            chunk_relid: None,
            options: ToastOptions::default(),
        }
    }

    pub fn with_chunk_relation(mut self, relid: Oid) -> Self {
        self.chunk_relid = Some(relid);
        self
    }

    pub fn with_options(mut self, options: ToastOptions) -> Self {
        self.options = options;
        self
    }
}

pub fn chunk_relation_name(relid: Oid) -> String {
    format!("toast_{}", relid)
}
