//! # Chunk Store
//!
//! Moves the bytes of one value into and out of a chunk relation.
//!
//! ## Write
//!
//! ```text
//! stored bytes (payload, or tcinfo + compressed data)
//!   ├── chunk 0: [0 .. CHUNK_SIZE)
//!   ├── chunk 1: [CHUNK_SIZE .. 2*CHUNK_SIZE)
//!   └── chunk N-1: remainder (1..=CHUNK_SIZE bytes)
//! ```
//!
//! Every chunk row is followed by an insert into each ready index of the
//! relation, with a uniqueness check on unique ones.
//!
//! ## Value Ids
//!
//! Normally a fresh id is drawn until one is found that the chunk relation
//! does not use. During a table rewrite the pointer keeps naming the old
//! chunk relation, and:
//!
//! 1. a value that already came from that relation keeps its id;
//! 2. if the id is already present in the new relation (the same value was
//!    copied before, for example as both a live and a recently dead row
//!    version) nothing is written at all;
//! 3. fresh ids must be unused in both relations.
//!
//! ## Read
//!
//! Whole and slice reads share [`ChunkIter`], a lazy iterator over an
//! ordered index scan that validates every chunk before handing it out:
//!
//! | Check                                  | Failure           |
//! |----------------------------------------|-------------------|
//! | chunk is plain or short                | `ToastedChunk`    |
//! | `seq == expected`                      | `UnexpectedChunk` |
//! | `seq <= end_chunk`                     | `ChunkOutOfRange` |
//! | size is `CHUNK_SIZE`, or the remainder | `ChunkSize`       |
//! | scan ended at `end_chunk + 1`          | `MissingChunk`    |
//!
//! Chunks are read under the session's toast snapshot, so chunks deleted by
//! a later transaction are still returned.

use eyre::{bail, Result};
use tracing::{debug, trace};

use super::{ToastContext, ToastError};
use crate::compression::CompressionMethod;
use crate::config::{CHUNK_SIZE, MAX_ALLOC_SIZE, VARHDRSZ};
use crate::mvcc::{LockMode, Session, Snapshot};
use crate::storage::{
    ChunkRelation, ChunkScan, HeapRelation, IndexInfo, InsertOptions, ScanKey, ScanKeys,
};
use crate::toast::error::CorruptionKind;
use crate::varlena::{ToastPointer, Varlena, VarlenaKind};
use crate::Oid;

/// Index used for chunk scans.
fn valid_index(rel: &dyn ChunkRelation) -> Result<IndexInfo> {
    match rel.indexes().into_iter().find(|idx| idx.valid) {
        Some(idx) => Ok(idx),
        None => bail!("no valid index found for toast relation \"{}\"", rel.name()),
    }
}

/// Whether any row of `value_id` exists in `rel`, dead or alive.
pub fn value_id_exists(rel: &dyn ChunkRelation, value_id: Oid) -> Result<bool> {
    let index = valid_index(rel)?;
    let mut scan = rel.scan(&index, &[ScanKey::ValueId(value_id)], &Snapshot::any())?;
    Ok(scan.next().transpose()?.is_some())
}

/// Bytes that go into the chunk relation, with the pointer fields they imply.
struct Stored<'v> {
    data: &'v [u8],
    raw_size: usize,
    method: Option<CompressionMethod>,
}

fn stored_form(value: &Varlena) -> Result<Stored<'_>> {
    let Some(bytes) = value.as_bytes() else {
        bail!("cannot save an in-memory {:?} value", value.kind());
    };
    match value.kind() {
        VarlenaKind::Short => Ok(Stored {
            data: value.data(),
            raw_size: value.size_payload() + VARHDRSZ,
            method: None,
        }),
        VarlenaKind::CompressedInline => {
            let id = value.compression_method_id();
            let Some(method) = CompressionMethod::from_id(id) else {
                return Err(ToastError::UnsupportedCompression { method: id }.into());
            };
            Ok(Stored {
                data: &bytes[VARHDRSZ..],
                raw_size: value.compressed_raw_size() + VARHDRSZ,
                method: Some(method),
            })
        }
        VarlenaKind::Plain => Ok(Stored {
            data: value.data(),
            raw_size: value.size_any(),
            method: None,
        }),
        VarlenaKind::External(kind) => bail!("cannot save an external {:?} value", kind),
    }
}

/// Writes `value` to the chunk relation of `rel` and returns the external
/// pointer datum that replaces it.
///
/// `value` may be plain, short or inline-compressed. `old_external` is the
/// pointer the previous row version held for this column, consulted only
/// when the context is rewriting a table.
pub fn save_datum(
    ctx: &ToastContext<'_>,
    rel: &HeapRelation,
    value: &Varlena,
    old_external: Option<&ToastPointer>,
    options: InsertOptions,
) -> Result<Varlena> {
    let Some(chunk_relid) = rel.chunk_relid else {
        bail!("table \"{}\" has no toast relation", rel.name);
    };
    let stored = stored_form(value)?;
    let txn = ctx.session.current_txn()?;
    let toastrel = ctx.open(chunk_relid, LockMode::RowExclusive)?;

    let mut value_id = None;
    let mut skip_write = false;
    let pointer_relid = match ctx.rewrite_relid {
        None => {
            value_id = Some(loop {
                let candidate = toastrel.new_value_id();
                if !value_id_exists(toastrel.as_ref(), candidate)? {
                    break candidate;
                }
            });
            toastrel.id()
        }
        Some(rewrite_relid) => {
            if let Some(old) = old_external.filter(|old| old.chunk_relid == rewrite_relid) {
                value_id = Some(old.value_id);
                if value_id_exists(toastrel.as_ref(), old.value_id)? {
                    debug!(
                        value_id = old.value_id,
                        relation = toastrel.name(),
                        "toast value already copied, reusing"
                    );
                    skip_write = true;
                }
            }
            if value_id.is_none() {
                let oldrel = ctx.open(rewrite_relid, LockMode::AccessShare)?;
                value_id = Some(loop {
                    let candidate = toastrel.new_value_id();
                    if !value_id_exists(toastrel.as_ref(), candidate)?
                        && !value_id_exists(oldrel.as_ref(), candidate)?
                    {
                        break candidate;
                    }
                });
            }
            rewrite_relid
        }
    };
    let Some(value_id) = value_id else {
        bail!("no value id chosen for toast value");
    };

    if !skip_write {
        let indexes: Vec<IndexInfo> = toastrel.indexes().into_iter().filter(|i| i.ready).collect();
        let mut buf = Vec::with_capacity(CHUNK_SIZE);
        for (seq, chunk) in stored.data.chunks(CHUNK_SIZE).enumerate() {
            ctx.session.check_for_interrupts()?;
            let seq = seq as i32;
            buf.clear();
            buf.extend_from_slice(chunk);
            if let Some(cipher) = toastrel.cipher() {
                cipher.seal(value_id, seq, &mut buf)?;
            }
            let row = Varlena::plain(&buf)?;
            let tid = toastrel.insert_row(txn, value_id, seq, &row, options)?;
            for index in &indexes {
                toastrel.index_insert(index, value_id, seq, tid, index.unique)?;
            }
            trace!(value_id, seq, len = chunk.len(), "wrote toast chunk");
        }
        debug!(
            value_id,
            relation = toastrel.name(),
            chunks = stored.data.len().div_ceil(CHUNK_SIZE),
            ext_size = stored.data.len(),
            raw_size = stored.raw_size,
            "saved toast value"
        );
    }

    let ptr = ToastPointer::new(
        pointer_relid,
        value_id,
        stored.raw_size as i32,
        stored.data.len() as u32,
        stored.method,
    );
    Ok(Varlena::external(&ptr))
}

/// Deletes every chunk row of an on-disk external value. Other shapes are
/// ignored. Rows already deleted are skipped, so running this twice for the
/// same value is harmless. Returns the number of rows deleted.
pub fn delete_datum(ctx: &ToastContext<'_>, value: &Varlena) -> Result<usize> {
    if !value.is_external_on_disk() {
        return Ok(0);
    }
    let ptr = value.external_pointer()?;
    let txn = ctx.session.current_txn()?;
    let toastrel = ctx.open(ptr.chunk_relid, LockMode::RowExclusive)?;
    let index = valid_index(toastrel.as_ref())?;

    let mut deleted = 0;
    let scan = toastrel.scan(&index, &[ScanKey::ValueId(ptr.value_id)], &Snapshot::any())?;
    for row in scan {
        ctx.session.check_for_interrupts()?;
        let row = row?;
        if toastrel.delete_row(txn, row.tid)? {
            deleted += 1;
        }
    }
    debug!(value_id = ptr.value_id, relation = toastrel.name(), deleted, "deleted toast value");
    Ok(deleted)
}

/// One validated chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: i32,
    pub data: Vec<u8>,
}

/// Validated chunks of one value, in sequence order.
///
/// The iterator stops after the first error.
pub struct ChunkIter<'a> {
    scan: ChunkScan<'a>,
    relation: &'a dyn ChunkRelation,
    session: &'a Session,
    value_id: Oid,
    ext_size: usize,
    total_chunks: i32,
    end_chunk: i32,
    expected: i32,
    done: bool,
}

impl<'a> ChunkIter<'a> {
    /// Starts a scan for chunks `start_chunk..=end_chunk` of a value stored
    /// as `ext_size` bytes.
    pub fn new(
        relation: &'a dyn ChunkRelation,
        session: &'a Session,
        ptr: &ToastPointer,
        start_chunk: i32,
        end_chunk: i32,
    ) -> Result<Self> {
        let snapshot = session.toast_snapshot()?;
        let index = valid_index(relation)?;
        let total_chunks = ptr.ext_size().div_ceil(CHUNK_SIZE) as i32;

        let mut keys: ScanKeys = ScanKeys::new();
        keys.push(ScanKey::ValueId(ptr.value_id));
        if start_chunk == 0 && end_chunk == total_chunks - 1 {
            // whole value
        } else if start_chunk == end_chunk {
            keys.push(ScanKey::SeqEq(start_chunk));
        } else {
            keys.push(ScanKey::SeqGe(start_chunk));
            keys.push(ScanKey::SeqLe(end_chunk));
        }

        let scan = relation.scan(&index, &keys, &snapshot)?;
        Ok(Self {
            scan,
            relation,
            session,
            value_id: ptr.value_id,
            ext_size: ptr.ext_size(),
            total_chunks,
            end_chunk,
            expected: start_chunk,
            done: false,
        })
    }

    fn corrupt(&self, kind: CorruptionKind, observed: i64, expected: i64) -> eyre::Report {
        ToastError::DataCorrupt {
            kind,
            value_id: self.value_id,
            observed,
            expected,
            relation: self.relation.name().to_string(),
        }
        .into()
    }

    fn check(&mut self, chunk: Varlena, seq: i32) -> Result<Chunk> {
        if !matches!(chunk.kind(), VarlenaKind::Plain | VarlenaKind::Short) {
            return Err(self.corrupt(CorruptionKind::ToastedChunk, seq as i64, self.expected as i64));
        }
        if seq != self.expected {
            return Err(self.corrupt(CorruptionKind::UnexpectedChunk, seq as i64, self.expected as i64));
        }
        if seq > self.end_chunk {
            return Err(self.corrupt(CorruptionKind::ChunkOutOfRange, seq as i64, self.end_chunk as i64));
        }
        let expected_size = if seq < self.total_chunks - 1 {
            CHUNK_SIZE
        } else {
            self.ext_size - (self.total_chunks as usize - 1) * CHUNK_SIZE
        };
        let mut data = chunk.data().to_vec();
        if data.len() != expected_size {
            return Err(self.corrupt(CorruptionKind::ChunkSize, data.len() as i64, expected_size as i64));
        }
        if let Some(cipher) = self.relation.cipher() {
            cipher.open(self.value_id, seq, &mut data)?;
        }
        trace!(value_id = self.value_id, seq, len = data.len(), "read toast chunk");
        self.expected += 1;
        Ok(Chunk { seq, data })
    }

    fn step(&mut self) -> Option<Result<Chunk>> {
        if let Err(e) = self.session.check_for_interrupts() {
            return Some(Err(e));
        }
        match self.scan.next() {
            None if self.expected != self.end_chunk + 1 => Some(Err(self.corrupt(
                CorruptionKind::MissingChunk,
                self.expected as i64,
                (self.end_chunk + 1) as i64,
            ))),
            None => None,
            Some(Err(e)) => Some(Err(e)),
            Some(Ok(row)) => Some(self.check(row.chunk, row.chunk_seq)),
        }
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.step();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

fn check_alloc(len: usize) -> Result<()> {
    if len > MAX_ALLOC_SIZE {
        return Err(ToastError::SizeOverflow {
            requested: len,
            limit: MAX_ALLOC_SIZE,
        }
        .into());
    }
    Ok(())
}

/// Reads back every stored byte of an external value (compressed data
/// stays compressed).
pub fn fetch_datum(ctx: &ToastContext<'_>, ptr: &ToastPointer) -> Result<Vec<u8>> {
    let ext_size = ptr.ext_size();
    check_alloc(ext_size)?;
    // fail before touching the relation when no snapshot protects the read
    ctx.session.toast_snapshot()?;
    let toastrel = ctx.open(ptr.chunk_relid, LockMode::AccessShare)?;

    let mut out = vec![0u8; ext_size];
    if ext_size == 0 {
        return Ok(out);
    }
    let last = (ext_size.div_ceil(CHUNK_SIZE) - 1) as i32;
    for chunk in ChunkIter::new(toastrel.as_ref(), ctx.session, ptr, 0, last)? {
        let chunk = chunk?;
        let start = chunk.seq as usize * CHUNK_SIZE;
        out[start..start + chunk.data.len()].copy_from_slice(&chunk.data);
    }
    Ok(out)
}

/// Reads stored bytes `[offset, offset + length)` of an external value.
///
/// Offsets at or past the end give an empty result; lengths running past
/// the end are clamped. Only the chunks covering the range are scanned.
pub fn fetch_datum_slice(
    ctx: &ToastContext<'_>,
    ptr: &ToastPointer,
    offset: usize,
    length: usize,
) -> Result<Vec<u8>> {
    let ext_size = ptr.ext_size();
    let (offset, length) = if offset >= ext_size {
        (0, 0)
    } else {
        (offset, length.min(ext_size - offset))
    };
    check_alloc(length)?;
    ctx.session.toast_snapshot()?;
    let toastrel = ctx.open(ptr.chunk_relid, LockMode::AccessShare)?;

    let mut out = vec![0u8; length];
    if length == 0 {
        return Ok(out);
    }
    let start_chunk = (offset / CHUNK_SIZE) as i32;
    let end_chunk = ((offset + length - 1) / CHUNK_SIZE) as i32;
    let start_off = offset % CHUNK_SIZE;
    let end_off = (offset + length - 1) % CHUNK_SIZE;

    for chunk in ChunkIter::new(toastrel.as_ref(), ctx.session, ptr, start_chunk, end_chunk)? {
        let chunk = chunk?;
        let from = if chunk.seq == start_chunk { start_off } else { 0 };
        let to = if chunk.seq == end_chunk {
            end_off
        } else {
            chunk.data.len() - 1
        };
        let dest = chunk.seq as usize * CHUNK_SIZE + from - offset;
        out[dest..dest + (to - from + 1)].copy_from_slice(&chunk.data[from..=to]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mvcc::TransactionManager;
    use crate::storage::{MemCatalog, MemChunkRelation};
    use crate::tuple::{Attribute, StorageStrategy, TupleDesc};

    struct Fixture {
        catalog: MemCatalog,
        session: Session,
        rel: HeapRelation,
        toast: Arc<MemChunkRelation>,
    }

    fn fixture() -> Fixture {
        let txns = Arc::new(TransactionManager::new());
        let catalog = MemCatalog::new(Arc::clone(&txns));
        let toast = catalog.create_chunk_relation(1);
        let desc = TupleDesc::new(vec![Attribute::varlena("v", StorageStrategy::External)]).unwrap();
        let rel = HeapRelation::new(1, "t", desc).with_chunk_relation(toast.id());
        let session = Session::new(txns);
        session.begin().unwrap();
        Fixture {
            catalog,
            session,
            rel,
            toast,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_save_then_fetch() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let data = payload(CHUNK_SIZE * 2 + 17);
        let value = Varlena::plain(&data).unwrap();
        let ext = save_datum(&ctx, &f.rel, &value, None, InsertOptions::default()).unwrap();
        let ptr = ext.external_pointer().unwrap();

        assert_eq!(ptr.raw_size as usize, data.len() + VARHDRSZ);
        assert_eq!(ptr.ext_size(), data.len());
        assert!(!ptr.is_compressed());
        let chunks = f.toast.live_chunks(ptr.value_id);
        let sizes: Vec<usize> = chunks.iter().map(|(_, c)| c.len()).collect();
        assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 17]);

        assert_eq!(fetch_datum(&ctx, &ptr).unwrap(), data);
        assert!(f.session.holds_lock(f.toast.id(), LockMode::RowExclusive));
        assert!(f.session.holds_lock(f.toast.id(), LockMode::AccessShare));
    }

    #[test]
    fn test_slice_crossing_chunk_boundary() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let data = payload(CHUNK_SIZE * 3);
        let ext = save_datum(&ctx, &f.rel, &Varlena::plain(&data).unwrap(), None, InsertOptions::default())
            .unwrap();
        let ptr = ext.external_pointer().unwrap();

        f.toast.reset_stats();
        let off = CHUNK_SIZE - 5;
        let got = fetch_datum_slice(&ctx, &ptr, off, 10).unwrap();
        assert_eq!(got, &data[off..off + 10]);
        assert_eq!(f.toast.stats().rows_returned, 2);

        let tail = fetch_datum_slice(&ctx, &ptr, data.len() - 3, 100).unwrap();
        assert_eq!(tail, &data[data.len() - 3..]);
        assert!(fetch_datum_slice(&ctx, &ptr, data.len(), 4).unwrap().is_empty());
    }

    #[test]
    fn test_short_input_records_widened_raw_size() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let ext = save_datum(&ctx, &f.rel, &Varlena::short(b"abc").unwrap(), None, InsertOptions::default())
            .unwrap();
        let ptr = ext.external_pointer().unwrap();
        assert_eq!(ptr.raw_size, 7);
        assert_eq!(ptr.ext_size, 3);
        assert_eq!(fetch_datum(&ctx, &ptr).unwrap(), b"abc");
    }

    #[test]
    fn test_value_id_collision_is_skipped() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let first = save_datum(&ctx, &f.rel, &Varlena::plain(b"one").unwrap(), None, InsertOptions::default())
            .unwrap()
            .external_pointer()
            .unwrap();
        f.toast.set_next_value_id(first.value_id);
        let second = save_datum(&ctx, &f.rel, &Varlena::plain(b"two").unwrap(), None, InsertOptions::default())
            .unwrap()
            .external_pointer()
            .unwrap();
        assert_ne!(first.value_id, second.value_id);
    }

    #[test]
    fn test_delete_twice_is_noop() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let ext = save_datum(&ctx, &f.rel, &Varlena::plain(&payload(5000)).unwrap(), None, InsertOptions::default())
            .unwrap();
        assert_eq!(delete_datum(&ctx, &ext).unwrap(), 3);
        assert_eq!(delete_datum(&ctx, &ext).unwrap(), 0);
        assert_eq!(delete_datum(&ctx, &Varlena::plain(b"x").unwrap()).unwrap(), 0);
    }

    #[test]
    fn test_missing_tail_chunk() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let ext = save_datum(&ctx, &f.rel, &Varlena::plain(&payload(5000)).unwrap(), None, InsertOptions::default())
            .unwrap();
        let ptr = ext.external_pointer().unwrap();
        f.toast.remove_chunk(ptr.value_id, 2);
        let err = fetch_datum(&ctx, &ptr).unwrap_err();
        match err.downcast_ref::<ToastError>() {
            Some(ToastError::DataCorrupt {
                kind: CorruptionKind::MissingChunk,
                observed: 2,
                expected: 3,
                ..
            }) => {}
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_fetch_needs_snapshot() {
        let f = fixture();
        let ctx = ToastContext::new(&f.catalog, &f.session);
        let ext = save_datum(&ctx, &f.rel, &Varlena::plain(b"abc").unwrap(), None, InsertOptions::default())
            .unwrap();
        f.session.commit().unwrap();
        let err = fetch_datum(&ctx, &ext.external_pointer().unwrap()).unwrap_err();
        assert_eq!(err.downcast_ref::<ToastError>(), Some(&ToastError::NoSnapshot));
    }
}
