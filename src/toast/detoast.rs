//! # Detoasting
//!
//! Turning any varlena shape back into bytes a consumer can read.
//!
//! | Entry point          | Result                                          |
//! |----------------------|-------------------------------------------------|
//! | [`detoast_external`] | no longer external; compression left in place   |
//! | [`detoast_full`]     | plain (4-byte header, uncompressed)             |
//! | [`detoast_slice`]    | plain, holding payload bytes `[off, off + len)` |
//!
//! ## Slices of Compressed Externals
//!
//! A prefix of a pglz stream decodes a prefix of the value, and the number
//! of compressed bytes needed for `n` raw bytes is bounded in closed form
//! ([`pglz::maximum_compressed_size`]). Only that many stored bytes are
//! fetched, plus the `tcinfo` word that precedes the stream. Other codecs
//! need the whole stored value.
//!
//! ## Slice Bounds
//!
//! - a negative offset fails with [`ToastError::BadSliceOffset`]
//! - a negative length means "to the end of the value"
//! - an offset at or past the end yields an empty value
//! - a length running past the end is clamped

use eyre::Result;

use super::chunk_store::{fetch_datum, fetch_datum_slice};
use super::{ToastContext, ToastError};
use crate::compression::{pglz, CompressionMethod};
use crate::config::VARHDRSZ;
use crate::varlena::{Varlena, VarlenaKind};

fn flatten_expanded(value: &Varlena) -> Result<Varlena> {
    match value {
        Varlena::Expanded { object, .. } => {
            let mut buf = vec![0u8; object.flat_size()];
            object.flatten_into(&mut buf);
            Varlena::from_bytes(buf)
        }
        other => Ok(other.clone()),
    }
}

/// Replaces an external value by its stored form. Inline values are
/// returned unchanged.
pub fn detoast_external(ctx: &ToastContext<'_>, value: &Varlena) -> Result<Varlena> {
    match value {
        Varlena::Indirect(target) => {
            if target.is_external() {
                detoast_external(ctx, target)
            } else {
                Ok((**target).clone())
            }
        }
        Varlena::Expanded { .. } => flatten_expanded(value),
        Varlena::Bytes(_) if value.is_external_on_disk() => {
            let ptr = value.external_pointer()?;
            let stored = fetch_datum(ctx, &ptr)?;
            if ptr.is_compressed() {
                Varlena::compressed_from_stored(&stored)
            } else {
                Varlena::plain(&stored)
            }
        }
        Varlena::Bytes(_) => Ok(value.clone()),
    }
}

/// Produces the plain form of any value.
pub fn detoast_full(ctx: &ToastContext<'_>, value: &Varlena) -> Result<Varlena> {
    let inline = if value.is_external() {
        detoast_external(ctx, value)?
    } else {
        value.clone()
    };
    match inline.kind() {
        VarlenaKind::CompressedInline => ctx.registry.decompress(&inline),
        VarlenaKind::Short => inline.to_plain(),
        VarlenaKind::Plain => Ok(inline),
        VarlenaKind::External(kind) => {
            eyre::bail!("value is still external ({:?}) after detoasting", kind)
        }
    }
}

/// Produces a plain value holding payload bytes `[offset, offset + length)`
/// of `value`. A negative `length` reads to the end.
pub fn detoast_slice(
    ctx: &ToastContext<'_>,
    value: &Varlena,
    offset: i64,
    length: i64,
) -> Result<Varlena> {
    if offset < 0 {
        return Err(ToastError::BadSliceOffset { offset }.into());
    }
    // end of the slice, or None for "to the end"
    let limit: Option<usize> = if length < 0 {
        None
    } else {
        offset
            .checked_add(length)
            .and_then(|end| usize::try_from(end).ok())
    };
    let offset = usize::try_from(offset).map_err(|_| ToastError::BadSliceOffset { offset })?;

    let source = match value {
        Varlena::Indirect(target) => return detoast_slice(ctx, target, offset as i64, length),
        Varlena::Expanded { .. } => flatten_expanded(value)?,
        Varlena::Bytes(_) if value.is_external_on_disk() => {
            let ptr = value.external_pointer()?;
            if !ptr.is_compressed() {
                let length = match limit {
                    Some(end) => end - offset,
                    None => usize::MAX,
                };
                let data = fetch_datum_slice(ctx, &ptr, offset, length)?;
                return Varlena::plain(&data);
            }
            let stored = match limit {
                Some(end) if ptr.method == Some(CompressionMethod::Pglz.id()) => {
                    // tcinfo precedes the compressed stream
                    let header = crate::config::VARHDRSZ_COMPRESSED - VARHDRSZ;
                    let needed = pglz::maximum_compressed_size(end, ptr.ext_size())
                        .saturating_add(header)
                        .min(ptr.ext_size());
                    fetch_datum_slice(ctx, &ptr, 0, needed)?
                }
                _ => fetch_datum(ctx, &ptr)?,
            };
            Varlena::compressed_from_stored(&stored)?
        }
        Varlena::Bytes(_) => value.clone(),
    };

    let plain = match source.kind() {
        VarlenaKind::CompressedInline => match limit {
            Some(end) => ctx.registry.decompress_slice(&source, end)?,
            None => ctx.registry.decompress(&source)?,
        },
        _ => source,
    };

    let data = plain.data();
    let size = data.len();
    let (start, len) = if offset >= size {
        (0, 0)
    } else {
        match limit {
            Some(end) if end <= size => (offset, end - offset),
            _ => (offset, size - offset),
        }
    };
    Varlena::plain(&data[start..start + len])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mvcc::{Session, TransactionManager};
    use crate::storage::{ChunkRelation, HeapRelation, InsertOptions, MemCatalog};
    use crate::toast::chunk_store::save_datum;
    use crate::tuple::{Attribute, StorageStrategy, TupleDesc};
    use crate::varlena::ExpandedObject;

    fn setup() -> (MemCatalog, Session, HeapRelation) {
        let txns = Arc::new(TransactionManager::new());
        let catalog = MemCatalog::new(Arc::clone(&txns));
        let toast = catalog.create_chunk_relation(1);
        let desc = TupleDesc::new(vec![Attribute::varlena("v", StorageStrategy::Extended)]).unwrap();
        let rel = HeapRelation::new(1, "t", desc).with_chunk_relation(toast.id());
        let session = Session::new(txns);
        session.begin().unwrap();
        (catalog, session, rel)
    }

    #[test]
    fn test_short_widens_to_plain() {
        let (catalog, session, _) = setup();
        let ctx = ToastContext::new(&catalog, &session);
        let short = Varlena::short(b"hello").unwrap();
        let plain = detoast_full(&ctx, &short).unwrap();
        assert!(plain.is_plain());
        assert_eq!(plain.data(), b"hello");
    }

    #[test]
    fn test_external_keeps_compression() {
        let (catalog, session, rel) = setup();
        let ctx = ToastContext::new(&catalog, &session);
        let payload = b"XYZ".repeat(5000);
        let compressed = ctx
            .registry
            .compress(&payload, CompressionMethod::Pglz)
            .unwrap()
            .unwrap();
        let ext = save_datum(&ctx, &rel, &compressed, None, InsertOptions::default()).unwrap();

        let fetched = detoast_external(&ctx, &ext).unwrap();
        assert!(fetched.is_compressed_inline());
        assert_eq!(fetched.as_bytes(), compressed.as_bytes());
        assert_eq!(detoast_full(&ctx, &ext).unwrap().data(), &payload[..]);
    }

    #[test]
    fn test_slice_bounds() {
        let (catalog, session, _) = setup();
        let ctx = ToastContext::new(&catalog, &session);
        let v = Varlena::plain(b"0123456789").unwrap();
        assert_eq!(detoast_slice(&ctx, &v, 2, 3).unwrap().data(), b"234");
        assert_eq!(detoast_slice(&ctx, &v, 8, 100).unwrap().data(), b"89");
        assert_eq!(detoast_slice(&ctx, &v, 4, -1).unwrap().data(), b"456789");
        assert!(detoast_slice(&ctx, &v, 10, 1).unwrap().data().is_empty());

        let err = detoast_slice(&ctx, &v, -1, 1).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ToastError>(),
            Some(&ToastError::BadSliceOffset { offset: -1 })
        );
    }

    #[test]
    fn test_slice_of_inline_compressed_with_offset() {
        let (catalog, session, _) = setup();
        let ctx = ToastContext::new(&catalog, &session);
        let payload = b"abcd".repeat(100);
        let compressed = ctx
            .registry
            .compress(&payload, CompressionMethod::Pglz)
            .unwrap()
            .unwrap();
        let slice = detoast_slice(&ctx, &compressed, 5, 6).unwrap();
        assert_eq!(slice.data(), &payload[5..11]);
    }

    #[derive(Debug)]
    struct Text(String);

    impl ExpandedObject for Text {
        fn flat_size(&self) -> usize {
            VARHDRSZ + self.0.len()
        }

        fn flatten_into(&self, out: &mut [u8]) {
            crate::varlena::header::set_plain_size(out, self.flat_size()).unwrap();
            out[VARHDRSZ..].copy_from_slice(self.0.as_bytes());
        }
    }

    #[test]
    fn test_in_memory_shapes() {
        let (catalog, session, _) = setup();
        let ctx = ToastContext::new(&catalog, &session);
        let expanded = Varlena::expanded(Arc::new(Text("expanded".into())), true);
        assert_eq!(detoast_full(&ctx, &expanded).unwrap().data(), b"expanded");
        assert_eq!(detoast_slice(&ctx, &expanded, 2, 4).unwrap().data(), b"pand");

        let target = Arc::new(Varlena::short(b"pointee").unwrap());
        let indirect = Varlena::indirect(target).unwrap();
        let flat = detoast_external(&ctx, &indirect).unwrap();
        assert!(flat.is_short());
        assert_eq!(detoast_full(&ctx, &indirect).unwrap().data(), b"pointee");
        assert_eq!(detoast_slice(&ctx, &indirect, 3, 10).unwrap().data(), b"ntee");
    }
}
