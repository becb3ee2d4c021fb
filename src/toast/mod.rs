//! # Oversized-Attribute Storage
//!
//! Large column values are kept out of the main row in two ways: they are
//! compressed inline, and when that is not enough they are split into chunks
//! stored in a separate chunk relation, leaving an 18-byte external pointer
//! in the row.
//!
//! ```text
//!            toast_insert / toast_update / toast_delete        (lifecycle)
//!                         │
//!                         v
//!                  toast_insert_or_update                      (planner)
//!                    │               │
//!      CompressionRegistry     save_datum / delete_datum       (chunk_store)
//!                                    │
//!                              ChunkRelation (host)
//!
//!   detoast_external / detoast_full / detoast_slice            (detoast)
//!                    │
//!          fetch_datum / fetch_datum_slice ──> ChunkIter
//! ```
//!
//! ## Context
//!
//! Every operation takes a [`ToastContext`]: the catalog used to open chunk
//! relations named by pointers, the session (transaction, snapshots, locks,
//! interrupts) and the compression registry. During a table rewrite the
//! context also carries the chunk relation of the table being rewritten, so
//! values keep their ids ([`ToastContext::preserving_value_ids`]).
//!
//! ## Errors
//!
//! All entry points return `eyre::Result`. Conditions a caller may want to
//! tell apart are [`ToastError`] values inside the report.

pub mod chunk_store;
pub mod detoast;
pub mod error;
pub mod lifecycle;
pub mod planner;

use std::sync::Arc;

use eyre::Result;

use crate::compression::CompressionRegistry;
use crate::mvcc::{LockMode, Session};
use crate::storage::{ChunkRelation, RelationCatalog};
use crate::Oid;

pub use chunk_store::{
    delete_datum, fetch_datum, fetch_datum_slice, save_datum, value_id_exists, ChunkIter,
};
pub use detoast::{detoast_external, detoast_full, detoast_slice};
pub use error::{CorruptionKind, ToastError};
pub use lifecycle::{
    flatten_to_datum, flatten_tuple, toast_delete, toast_insert, toast_update, DeleteQueue,
    ToastOutcome,
};
pub use planner::toast_insert_or_update;

#[derive(Clone, Copy)]
pub struct ToastContext<'a> {
    pub catalog: &'a dyn RelationCatalog,
    pub session: &'a Session,
    pub registry: CompressionRegistry,
    /// Chunk relation of the table being rewritten. When set, new pointers
    /// name this relation and existing value ids are kept.
    pub rewrite_relid: Option<Oid>,
}

impl std::fmt::Debug for ToastContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToastContext")
            .field("registry", &self.registry)
            .field("rewrite_relid", &self.rewrite_relid)
            .finish()
    }
}

impl<'a> ToastContext<'a> {
    pub fn new(catalog: &'a dyn RelationCatalog, session: &'a Session) -> Self {
        Self {
            catalog,
            session,
            registry: *CompressionRegistry::builtin(),
            rewrite_relid: None,
        }
    }

    pub fn with_registry(mut self, registry: CompressionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn preserving_value_ids(mut self, old_chunk_relid: Oid) -> Self {
        self.rewrite_relid = Some(old_chunk_relid);
        self
    }

    /// Opens a chunk relation and records `mode` on it for the rest of the
    /// transaction.
    pub(crate) fn open(&self, relid: Oid, mode: LockMode) -> Result<Arc<dyn ChunkRelation>> {
        let rel = self.catalog.open_chunk_relation(relid)?;
        self.session.lock_relation(relid, mode);
        Ok(rel)
    }
}
