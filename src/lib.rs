//! # turtoast - Oversized-Attribute Storage
//!
//! turtoast keeps large column values out of the way of row storage. A row
//! whose encoded size exceeds its relation's target is shrunk by
//! compressing its variable-length columns inline and, when that is not
//! enough, by moving them into a chunk relation and leaving a small
//! pointer in the row. Readers get the bytes back whole or as a slice,
//! fetching only the chunks a slice needs.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use turtoast::{
//!     detoast_full, toast_insert, Attribute, Datum, HeapRelation, HeapTuple, InsertOptions,
//!     MemCatalog, Session, StorageStrategy, ToastContext, TransactionManager, TupleDesc,
//! };
//!
//! let txns = Arc::new(TransactionManager::new());
//! let catalog = MemCatalog::new(Arc::clone(&txns));
//! let chunks = catalog.create_chunk_relation(1);
//!
//! let desc = TupleDesc::new(vec![
//!     Attribute::int4("id"),
//!     Attribute::varlena("body", StorageStrategy::Extended),
//! ])?;
//! let rel = HeapRelation::new(1, "docs", desc).with_chunk_relation(chunks.id());
//!
//! let session = Session::new(txns);
//! session.begin()?;
//! let ctx = ToastContext::new(&catalog, &session);
//!
//! let row = HeapTuple::form(&rel.desc, &[Some(Datum::int4(1)), Some(Datum::bytes(&big)?)], 1)?;
//! let stored = toast_insert(&ctx, &rel, &row, InsertOptions::default())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  toast: lifecycle ─> planner ─> chunk_store  │
//! │         detoast  ─────────────> chunk_store  │
//! ├──────────────────────┬───────────────────────┤
//! │  compression         │  varlena (headers,    │
//! │  (pglz, lz4, zstd)   │  external pointers)   │
//! ├──────────────────────┴───────────────────────┤
//! │  tuple (form / deform)   │  mvcc (session,   │
//! │                          │  snapshots)       │
//! ├──────────────────────────┴───────────────────┤
//! │  storage: ChunkRelation / RelationCatalog    │
//! │           (+ in-memory reference host)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`varlena`]: variable-length value headers and external pointers
//! - [`compression`]: codec registry (pglz always, lz4 and zstd by feature)
//! - [`toast`]: planner, chunk store, detoasting and row lifecycle hooks
//! - [`tuple`]: row descriptors and heap tuple forming/deforming
//! - [`storage`]: host interfaces plus an in-memory implementation
//! - [`mvcc`]: transactions, snapshots and the per-operation session
//! - [`config`]: layout constants and per-relation options

#[macro_use]
mod macros;

pub mod compression;
pub mod config;
pub mod mvcc;
pub mod storage;
pub mod toast;
pub mod tuple;
pub mod varlena;

/// Object identifier of a relation or a stored value.
pub type Oid = u32;

pub use compression::{CompressionMethod, CompressionRegistry};
pub use config::ToastOptions;
pub use mvcc::{LockMode, Session, Snapshot, TransactionManager, TxnId};
pub use storage::{
    ChunkCipher, ChunkRelation, HeapRelation, InsertOptions, MemCatalog, MemChunkRelation,
    RelationCatalog,
};
pub use toast::{
    delete_datum, detoast_external, detoast_full, detoast_slice, fetch_datum, fetch_datum_slice,
    flatten_to_datum, flatten_tuple, save_datum, toast_delete, toast_insert,
    toast_insert_or_update, toast_update, CorruptionKind, DeleteQueue, ToastContext, ToastError,
    ToastOutcome,
};
pub use tuple::{Attribute, Datum, HeapTuple, StorageStrategy, TupleDesc};
pub use varlena::{ExpandedObject, ToastPointer, Varlena, VarlenaKind};
