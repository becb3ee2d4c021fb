//! # Row Lifecycle
//!
//! Hooks the table access method calls around storing and removing rows.
//!
//! | Row operation | Hook             | Chunk work                              |
//! |---------------|------------------|-----------------------------------------|
//! | insert        | [`toast_insert`] | spill new values                        |
//! | update        | [`toast_update`] | spill new values, queue replaced ones   |
//! | delete        | [`toast_delete`] | queue every on-disk external            |
//!
//! Speculative inserts and their abort go through the same hooks.
//!
//! ## Delete Ordering
//!
//! Chunk deletes are not run by the hooks. They come back as a
//! [`DeleteQueue`] that the caller executes after the row itself has been
//! updated or deleted, so a failure between the two never leaves a live row
//! pointing at deleted chunks.
//!
//! ## Flattening
//!
//! Rows leaving the storage layer (for example as a composite value stored
//! inside another row) must not reference chunks. [`flatten_tuple`] fetches
//! externals back inline; [`flatten_to_datum`] additionally decompresses and
//! wraps the tuple image in a plain varlena.

use eyre::Result;
use tracing::debug;

use super::chunk_store::delete_datum;
use super::detoast::{detoast_external, detoast_full};
use super::planner::toast_insert_or_update;
use super::ToastContext;
use crate::storage::{HeapRelation, InsertOptions};
use crate::tuple::{Datum, HeapTuple, TupleDesc};
use crate::varlena::Varlena;

/// External values whose chunks must be deleted once the owning row change
/// is stored.
#[derive(Debug, Clone, Default)]
pub struct DeleteQueue {
    values: Vec<Varlena>,
}

impl DeleteQueue {
    pub fn push(&mut self, value: Varlena) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Varlena> {
        self.values.iter()
    }

    /// Deletes the chunks of every queued value. Returns the number of chunk
    /// rows deleted.
    pub fn execute(self, ctx: &ToastContext<'_>) -> Result<usize> {
        let mut deleted = 0;
        for value in &self.values {
            deleted += delete_datum(ctx, value)?;
        }
        Ok(deleted)
    }
}

/// Result of toasting a row about to be stored.
#[derive(Debug, Clone)]
pub struct ToastOutcome {
    /// The tuple to store in place of the input.
    pub tuple: HeapTuple,
    /// Chunks to delete after the row is stored.
    pub deletes: DeleteQueue,
}

fn over_threshold(rel: &HeapRelation, tuple: &HeapTuple) -> bool {
    tuple.len() > rel.options.tuple_target()
}

/// Toasts a row before insert. The returned tuple must be stored instead
/// of `tuple`.
pub fn toast_insert(
    ctx: &ToastContext<'_>,
    rel: &HeapRelation,
    tuple: &HeapTuple,
    options: InsertOptions,
) -> Result<HeapTuple> {
    if !tuple.has_external() && !over_threshold(rel, tuple) {
        return Ok(tuple.clone());
    }
    Ok(toast_insert_or_update(ctx, rel, tuple, None, options)?.tuple)
}

/// Toasts the new version of an updated row.
pub fn toast_update(
    ctx: &ToastContext<'_>,
    rel: &HeapRelation,
    newtup: &HeapTuple,
    oldtup: &HeapTuple,
    options: InsertOptions,
) -> Result<ToastOutcome> {
    if !oldtup.has_external() && !newtup.has_external() && !over_threshold(rel, newtup) {
        return Ok(ToastOutcome {
            tuple: newtup.clone(),
            deletes: DeleteQueue::default(),
        });
    }
    toast_insert_or_update(ctx, rel, newtup, Some(oldtup), options)
}

/// Collects the on-disk externals of a row being deleted.
pub fn toast_delete(rel: &HeapRelation, oldtup: &HeapTuple) -> Result<DeleteQueue> {
    let mut queue = DeleteQueue::default();
    if !oldtup.has_external() {
        return Ok(queue);
    }
    for (attr, value) in rel.desc.attrs().iter().zip(oldtup.deform(&rel.desc)?) {
        if !attr.is_varlena() {
            continue;
        }
        if let Some(Datum::Varlena(v)) = value {
            if v.is_external_on_disk() {
                queue.push(v);
            }
        }
    }
    debug!(relation = %rel.name, count = queue.len(), "queued toast values of deleted row");
    Ok(queue)
}

/// Rebuilds `tuple` with every external value fetched back inline.
/// Compressed and short values are left as they are.
pub fn flatten_tuple(ctx: &ToastContext<'_>, desc: &TupleDesc, tuple: &HeapTuple) -> Result<HeapTuple> {
    let mut values = tuple.deform(desc)?;
    let mut changed = false;
    for value in values.iter_mut() {
        if let Some(Datum::Varlena(v)) = value {
            if v.is_external() {
                *v = detoast_external(ctx, v)?;
                changed = true;
            }
        }
    }
    if !changed {
        return Ok(tuple.clone());
    }
    tuple.rebuild(desc, &values)
}

/// Flattens `tuple` fully (no externals, no compression) and returns the
/// tuple image as a plain varlena.
pub fn flatten_to_datum(ctx: &ToastContext<'_>, desc: &TupleDesc, tuple: &HeapTuple) -> Result<Varlena> {
    let mut values = tuple.deform(desc)?;
    for value in values.iter_mut() {
        if let Some(Datum::Varlena(v)) = value {
            if v.is_external() || v.is_compressed_inline() {
                *v = detoast_full(ctx, v)?;
            }
        }
    }
    let flat = tuple.rebuild(desc, &values)?;
    Varlena::plain(flat.as_bytes())
}
