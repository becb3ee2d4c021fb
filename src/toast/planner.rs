//! # Toast Planner
//!
//! Shrinks a tuple until its data area fits the relation's target by
//! compressing and spilling varlena columns, one column at a time.
//!
//! ## Passes
//!
//! ```text
//! target = tuple_target - hoff
//!
//! pass 1: largest EXTENDED/EXTERNAL not yet compressed
//!           EXTENDED: try compression; EXTERNAL: mark incompressible
//!           still larger than target on its own -> spill now
//! pass 2: largest EXTENDED/EXTERNAL still inline -> spill
//! pass 3: largest MAIN not yet compressed -> try compression
//!
//! target = tuple_target_main - hoff
//!
//! pass 4: largest MAIN still inline -> spill
//! ```
//!
//! Each pass repeats while the data area is over target and a candidate is
//! left. Spilling needs a chunk relation; without one passes 2 and 4 are
//! skipped and pass 1 never spills. The planner never rejects a tuple: a
//! tuple still over target after pass 4 is returned as is.
//!
//! ## Candidates
//!
//! A column is a candidate only when it is currently larger than an
//! aligned external pointer (24 bytes); spilling anything smaller would not
//! save space. Among candidates the largest wins and ties go to the first
//! column.
//!
//! ## Updates
//!
//! An unchanged external pointer carried over from the old row version is
//! left alone. Any other external in the old version is queued for deletion
//! once the new row is stored. An external value in the new tuple that is
//! not the old one is fetched back inline first, so it can be compressed
//! and spilled under this relation's rules.

use eyre::Result;
use tracing::{debug, warn};

use super::chunk_store::save_datum;
use super::detoast::{detoast_external, detoast_full};
use super::lifecycle::{DeleteQueue, ToastOutcome};
use super::ToastContext;
use crate::compression::CompressionMethod;
use crate::config::{maxalign, TOAST_POINTER_SIZE};
use crate::storage::{HeapRelation, InsertOptions};
use crate::tuple::heap::{compute_data_size, header_len};
use crate::tuple::{Datum, HeapTuple, StorageStrategy};
use crate::varlena::{ToastPointer, Varlena};

#[derive(Debug, Clone)]
struct ColumnState {
    ignore: bool,
    incompressible: bool,
    needs_delete_old: bool,
    /// The working value no longer matches the input tuple.
    replaced: bool,
    size: usize,
    compression: CompressionMethod,
    old_external: Option<ToastPointer>,
}

struct Planner<'c, 'a> {
    ctx: &'c ToastContext<'a>,
    rel: &'c HeapRelation,
    options: InsertOptions,
    values: Vec<Option<Datum>>,
    cols: Vec<ColumnState>,
    has_nulls: bool,
}

impl<'c, 'a> Planner<'c, 'a> {
    fn init(
        ctx: &'c ToastContext<'a>,
        rel: &'c HeapRelation,
        mut values: Vec<Option<Datum>>,
        old_values: Option<&[Option<Datum>]>,
        options: InsertOptions,
    ) -> Result<Self> {
        let desc = &rel.desc;
        let mut cols = Vec::with_capacity(desc.natts());
        let mut has_nulls = false;

        for (i, attr) in desc.attrs().iter().enumerate() {
            let mut col = ColumnState {
                ignore: false,
                incompressible: false,
                needs_delete_old: false,
                replaced: false,
                size: 0,
                compression: attr.compression.unwrap_or(rel.options.compression()),
                old_external: None,
            };

            if let Some(old) = old_values.and_then(|old| old[i].as_ref()).and_then(Datum::as_varlena) {
                if attr.is_varlena() && old.is_external_on_disk() {
                    let new = values[i].as_ref().and_then(Datum::as_varlena);
                    let same = new.is_some_and(|new| {
                        new.is_external_on_disk() && new.as_bytes() == old.as_bytes()
                    });
                    if same {
                        col.ignore = true;
                        cols.push(col);
                        continue;
                    }
                    col.needs_delete_old = true;
                }
            }

            let mut inline = None;
            match &values[i] {
                None => {
                    col.ignore = true;
                    has_nulls = true;
                }
                Some(Datum::Fixed(_)) => col.ignore = true,
                Some(Datum::Varlena(v)) => {
                    if attr.storage == StorageStrategy::Plain {
                        col.ignore = true;
                    }
                    if v.is_external() {
                        if v.is_external_on_disk() {
                            col.old_external = Some(v.external_pointer()?);
                        }
                        let flat = if attr.storage == StorageStrategy::Plain {
                            detoast_full(ctx, v)?
                        } else {
                            detoast_external(ctx, v)?
                        };
                        col.size = flat.size_any();
                        col.replaced = true;
                        inline = Some(flat);
                    } else {
                        col.size = v.size_any();
                    }
                }
            }
            if let Some(flat) = inline {
                values[i] = Some(Datum::Varlena(flat));
            }
            cols.push(col);
        }

        Ok(Self {
            ctx,
            rel,
            options,
            values,
            cols,
            has_nulls,
        })
    }

    fn needs_change(&self) -> bool {
        self.cols.iter().any(|col| col.replaced)
    }

    fn data_size(&self) -> Result<usize> {
        compute_data_size(&self.rel.desc, &self.values)
    }

    fn varlena(&self, i: usize) -> Option<&Varlena> {
        self.values[i].as_ref().and_then(Datum::as_varlena)
    }

    fn find_biggest(&self, for_compression: bool, check_main: bool) -> Option<usize> {
        let mut biggest = None;
        let mut biggest_size = maxalign(TOAST_POINTER_SIZE);
        for (i, attr) in self.rel.desc.attrs().iter().enumerate() {
            let col = &self.cols[i];
            if col.ignore || (for_compression && col.incompressible) {
                continue;
            }
            let Some(v) = self.varlena(i) else {
                continue;
            };
            if v.is_external() || (for_compression && v.is_compressed_inline()) {
                continue;
            }
            let eligible = if check_main {
                attr.storage == StorageStrategy::Main
            } else {
                matches!(attr.storage, StorageStrategy::Extended | StorageStrategy::External)
            };
            if eligible && col.size > biggest_size {
                biggest = Some(i);
                biggest_size = col.size;
            }
        }
        biggest
    }

    fn try_compression(&mut self, i: usize) {
        let method = self.cols[i].compression;
        let Some(v) = self.varlena(i) else {
            return;
        };
        match self.ctx.registry.compress(v.data(), method) {
            Ok(Some(compressed)) => {
                let col = &mut self.cols[i];
                col.size = compressed.size_any();
                col.replaced = true;
                self.values[i] = Some(Datum::Varlena(compressed));
            }
            Ok(None) => self.cols[i].incompressible = true,
            Err(err) => {
                warn!(
                    column = %self.rel.desc.attr(i).name,
                    %method,
                    error = %err,
                    "compression failed, keeping value uncompressed"
                );
                self.cols[i].incompressible = true;
            }
        }
    }

    fn externalize(&mut self, i: usize) -> Result<()> {
        self.cols[i].ignore = true;
        let Some(v) = self.varlena(i) else {
            return Ok(());
        };
        debug!(
            relation = %self.rel.name,
            column = %self.rel.desc.attr(i).name,
            size = self.cols[i].size,
            "moving value out of line"
        );
        let pointer = save_datum(
            self.ctx,
            self.rel,
            v,
            self.cols[i].old_external.as_ref(),
            self.options,
        )?;
        self.cols[i].replaced = true;
        self.values[i] = Some(Datum::Varlena(pointer));
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let can_spill = self.rel.chunk_relid.is_some();
        let hoff = header_len(self.rel.desc.natts(), self.has_nulls);
        let max_data_len = self.rel.options.tuple_target().saturating_sub(hoff);

        while self.data_size()? > max_data_len {
            let Some(i) = self.find_biggest(true, false) else {
                break;
            };
            if self.rel.desc.attr(i).storage == StorageStrategy::Extended {
                self.try_compression(i);
            } else {
                self.cols[i].incompressible = true;
            }
            if self.cols[i].size > max_data_len && can_spill {
                self.externalize(i)?;
            }
        }

        while can_spill && self.data_size()? > max_data_len {
            let Some(i) = self.find_biggest(false, false) else {
                break;
            };
            self.externalize(i)?;
        }

        while self.data_size()? > max_data_len {
            let Some(i) = self.find_biggest(true, true) else {
                break;
            };
            self.try_compression(i);
        }

        let max_data_len = self.rel.options.tuple_target_main().saturating_sub(hoff);
        while can_spill && self.data_size()? > max_data_len {
            let Some(i) = self.find_biggest(false, true) else {
                break;
            };
            self.externalize(i)?;
        }
        Ok(())
    }
}

/// Runs the planner on `newtup`, the new version of a row whose previous
/// version (for updates) is `oldtup`.
///
/// Returns the tuple to store, a new allocation when any column changed,
/// and the old external values the caller must delete after storing it.
pub fn toast_insert_or_update(
    ctx: &ToastContext<'_>,
    rel: &HeapRelation,
    newtup: &HeapTuple,
    oldtup: Option<&HeapTuple>,
    options: InsertOptions,
) -> Result<ToastOutcome> {
    let values = newtup.deform(&rel.desc)?;
    let old_values = oldtup.map(|t| t.deform(&rel.desc)).transpose()?;

    let mut planner = Planner::init(ctx, rel, values, old_values.as_deref(), options)?;
    planner.run()?;

    let mut deletes = DeleteQueue::default();
    if let Some(old_values) = &old_values {
        for (col, old) in planner.cols.iter().zip(old_values) {
            if let (true, Some(Datum::Varlena(v))) = (col.needs_delete_old, old) {
                deletes.push(v.clone());
            }
        }
    }

    let tuple = if planner.needs_change() {
        newtup.rebuild(&rel.desc, &planner.values)?
    } else {
        newtup.clone()
    };
    if !deletes.is_empty() {
        debug!(relation = %rel.name, count = deletes.len(), "queued old toast values for deletion");
    }
    Ok(ToastOutcome { tuple, deletes })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{ToastOptions, CHUNK_SIZE};
    use crate::mvcc::{Session, TransactionManager};
    use crate::storage::{ChunkRelation, MemCatalog, MemChunkRelation};
    use crate::tuple::{Attribute, TupleDesc};
    use crate::varlena::VarlenaKind;

    struct Fixture {
        catalog: MemCatalog,
        session: Session,
        toast: Arc<MemChunkRelation>,
    }

    fn fixture() -> Fixture {
        let txns = Arc::new(TransactionManager::new());
        let catalog = MemCatalog::new(Arc::clone(&txns));
        let toast = catalog.create_chunk_relation(1);
        let session = Session::new(txns);
        session.begin().unwrap();
        Fixture {
            catalog,
            session,
            toast,
        }
    }

    fn relation(f: &Fixture, attrs: Vec<Attribute>) -> HeapRelation {
        HeapRelation::new(1, "t", TupleDesc::new(attrs).unwrap()).with_chunk_relation(f.toast.id())
    }

    fn noise(len: usize, seed: u64) -> Vec<u8> {
        use rand::rngs::StdRng;
        use rand::{RngCore, SeedableRng};
        let mut buf = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut buf);
        buf
    }

    fn column(tuple: &HeapTuple, rel: &HeapRelation, i: usize) -> Varlena {
        tuple.deform(&rel.desc).unwrap()[i]
            .as_ref()
            .and_then(Datum::as_varlena)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_small_tuple_untouched() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(&f, vec![Attribute::varlena("c", StorageStrategy::Extended)]);
        let tup = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(b"short").unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &tup, None, InsertOptions::default()).unwrap();
        assert_eq!(out.tuple, tup);
        assert!(out.deletes.is_empty());
    }

    #[test]
    fn test_compressible_value_stays_inline() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(&f, vec![Attribute::varlena("c", StorageStrategy::Extended)]);
        let payload = b"AB".repeat(1500);
        let tup = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&payload).unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &tup, None, InsertOptions::default()).unwrap();
        let v = column(&out.tuple, &rel, 0);
        assert_eq!(v.kind(), VarlenaKind::CompressedInline);
        assert_eq!(f.toast.row_count(), 0);
    }

    #[test]
    fn test_external_strategy_spills_without_compression() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(&f, vec![Attribute::varlena("c", StorageStrategy::External)]);
        let payload = b"AB".repeat(3000);
        let tup = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&payload).unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &tup, None, InsertOptions::default()).unwrap();
        let ptr = column(&out.tuple, &rel, 0).external_pointer().unwrap();
        assert!(!ptr.is_compressed());
        assert_eq!(ptr.ext_size(), payload.len());
        assert!(out.tuple.has_external());
        assert_eq!(f.toast.row_count(), payload.len().div_ceil(CHUNK_SIZE));
    }

    #[test]
    fn test_biggest_column_spilled_first() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(
            &f,
            vec![
                Attribute::varlena("a", StorageStrategy::External),
                Attribute::varlena("b", StorageStrategy::External),
            ],
        );
        let tup = HeapTuple::form(
            &rel.desc,
            &[
                Some(Datum::bytes(&noise(1200, 1)).unwrap()),
                Some(Datum::bytes(&noise(1500, 2)).unwrap()),
            ],
            1,
        )
        .unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &tup, None, InsertOptions::default()).unwrap();
        assert!(!column(&out.tuple, &rel, 0).is_external());
        assert!(column(&out.tuple, &rel, 1).is_external());
    }

    #[test]
    fn test_main_uses_relaxed_target() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(&f, vec![Attribute::varlena("m", StorageStrategy::Main)]);

        let medium = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&noise(4000, 3)).unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &medium, None, InsertOptions::default()).unwrap();
        assert!(column(&out.tuple, &rel, 0).is_plain());

        let large = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&noise(9000, 4)).unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &large, None, InsertOptions::default()).unwrap();
        assert!(column(&out.tuple, &rel, 0).is_external());
    }

    #[test]
    fn test_without_chunk_relation_nothing_spills() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = HeapRelation::new(
            1,
            "t",
            TupleDesc::new(vec![Attribute::varlena("c", StorageStrategy::External)]).unwrap(),
        );
        let tup = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&noise(5000, 5)).unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &tup, None, InsertOptions::default()).unwrap();
        assert!(column(&out.tuple, &rel, 0).is_plain());
    }

    #[test]
    fn test_plain_storage_never_touched() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(&f, vec![Attribute::varlena("p", StorageStrategy::Plain)])
            .with_options(ToastOptions::builder().tuple_target(128).build());
        let payload = b"AB".repeat(500);
        let tup = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&payload).unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &tup, None, InsertOptions::default()).unwrap();
        assert!(column(&out.tuple, &rel, 0).is_plain());
    }

    #[test]
    fn test_update_with_new_value_queues_old_delete() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let rel = relation(&f, vec![Attribute::varlena("c", StorageStrategy::External)]);
        let first = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(&noise(5000, 6)).unwrap())], 1).unwrap();
        let stored = toast_insert_or_update(&ctx, &rel, &first, None, InsertOptions::default())
            .unwrap()
            .tuple;

        let second = HeapTuple::form(&rel.desc, &[Some(Datum::bytes(b"small now").unwrap())], 1).unwrap();
        let out = toast_insert_or_update(&ctx, &rel, &second, Some(&stored), InsertOptions::default()).unwrap();
        assert_eq!(out.deletes.len(), 1);
        assert!(!column(&out.tuple, &rel, 0).is_external());
    }
}
