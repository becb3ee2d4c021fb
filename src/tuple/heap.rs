//! # Heap Tuple Layout
//!
//! ```text
//! +-------------------+-------------+---------+---------------------------+
//! | TupleHeader (23B) | null bitmap | padding | attribute data            |
//! +-------------------+-------------+---------+---------------------------+
//! 0                   23            hoff = MAXALIGN(23 + bitmap)
//! ```
//!
//! The null bitmap is only present when `HEAP_HASNULL` is set; bit `i` set
//! means attribute `i` is not null.
//!
//! ## Attribute Placement
//!
//! Each attribute is aligned to its declared alignment, except varlenas
//! stored with a 1-byte header (short values and external pointers), which
//! are never aligned. Packable plain varlenas small enough for a 1-byte
//! header are converted to the short form when the tuple is filled.
//!
//! When walking a formed tuple the reader cannot know in advance whether a
//! varlena was aligned. A zero byte at an unaligned offset can only be
//! padding, while a nonzero byte starts a 1-byte-header value; this is what
//! [`header::not_pad_byte`] checks.
//!
//! ## In-Memory Values
//!
//! Indirect values are stored as their target. Expanded objects are
//! flattened into the tuple, so a formed tuple never depends on process
//! memory.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{AttLen, Attribute, Datum, TupleDesc};
use crate::config::{maxalign, MAX_ALLOC_SIZE, TUPLE_HEADER_SIZE, VARHDRSZ_SHORT};
use crate::varlena::{header, Varlena};
use crate::Oid;

pub const HEAP_HASNULL: u16 = 0x0001;
pub const HEAP_HASVARWIDTH: u16 = 0x0002;
pub const HEAP_HASEXTERNAL: u16 = 0x0004;
pub const HEAP_NATTS_MASK: u16 = 0x07FF;

const INFOMASK_DATA_BITS: u16 = HEAP_HASNULL | HEAP_HASVARWIDTH | HEAP_HASEXTERNAL;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TupleHeader {
    xmin: U32,
    xmax: U32,
    cid: U32,
    ctid_block: U32,
    ctid_offset: U16,
    infomask2: U16,
    infomask: U16,
    hoff: u8,
}

const _: () = assert!(std::mem::size_of::<TupleHeader>() == TUPLE_HEADER_SIZE);

impl TupleHeader {
    zerocopy_accessors! {
        xmin: u32,
        xmax: u32,
        cid: u32,
        ctid_block: u32,
        ctid_offset: u16,
        infomask2: u16,
        infomask: u16,
    }

    pub fn hoff(&self) -> u8 {
        self.hoff
    }

    pub fn set_hoff(&mut self, hoff: u8) {
        self.hoff = hoff;
    }

    pub fn natts(&self) -> usize {
        (self.infomask2() & HEAP_NATTS_MASK) as usize
    }

    pub fn set_natts(&mut self, natts: usize) {
        let keep = self.infomask2() & !HEAP_NATTS_MASK;
        self.set_infomask2(keep | (natts as u16 & HEAP_NATTS_MASK));
    }
}

pub fn bitmap_len(natts: usize) -> usize {
    natts.div_ceil(8)
}

/// `hoff` for a tuple of `natts` attributes.
pub fn header_len(natts: usize, has_nulls: bool) -> usize {
    let bitmap = if has_nulls { bitmap_len(natts) } else { 0 };
    maxalign(TUPLE_HEADER_SIZE + bitmap)
}

/// Bytes a varlena occupies inside a tuple and whether it is aligned.
fn varlena_footprint(attr: &Attribute, v: &Varlena) -> (usize, bool) {
    match v {
        Varlena::Indirect(target) => varlena_footprint(attr, target),
        Varlena::Expanded { object, .. } => (object.flat_size(), true),
        Varlena::Bytes(b) => {
            if header::is_1b(b) {
                (b.len(), false)
            } else if attr.is_packable() && v.can_make_short() {
                (v.size_payload() + VARHDRSZ_SHORT, false)
            } else {
                (b.len(), true)
            }
        }
    }
}

fn check_fixed(attr: &Attribute, bytes: &[u8]) -> Result<usize> {
    let AttLen::Fixed(n) = attr.len else {
        eyre::bail!("column '{}' is variable-length", attr.name);
    };
    ensure!(
        bytes.len() == n as usize,
        "column '{}' expects {} bytes, got {}",
        attr.name,
        n,
        bytes.len()
    );
    Ok(n as usize)
}

/// Size of the data area `values` would occupy.
pub fn compute_data_size(desc: &TupleDesc, values: &[Option<Datum>]) -> Result<usize> {
    let mut len = 0usize;
    for (attr, value) in desc.attrs().iter().zip(values) {
        match value {
            None => {}
            Some(Datum::Fixed(bytes)) => {
                let n = check_fixed(attr, bytes)?;
                len = attr.align.apply(len) + n;
            }
            Some(Datum::Varlena(v)) => {
                ensure!(attr.is_varlena(), "column '{}' is fixed-width", attr.name);
                let (n, aligned) = varlena_footprint(attr, v);
                if aligned {
                    len = attr.align.apply(len);
                }
                len += n;
            }
        }
    }
    Ok(len)
}

fn pad_to(out: &mut Vec<u8>, attr: &Attribute) {
    let aligned = attr.align.apply(out.len());
    out.resize(aligned, 0);
}

fn fill_varlena(attr: &Attribute, v: &Varlena, out: &mut Vec<u8>, infomask: &mut u16) -> Result<()> {
    match v {
        Varlena::Indirect(target) => fill_varlena(attr, target, out, infomask),
        Varlena::Expanded { object, .. } => {
            pad_to(out, attr);
            let start = out.len();
            out.resize(start + object.flat_size(), 0);
            object.flatten_into(&mut out[start..]);
            Ok(())
        }
        Varlena::Bytes(b) => {
            if header::is_1b_e(b) {
                *infomask |= HEAP_HASEXTERNAL;
                out.extend_from_slice(b);
            } else if header::is_1b(b) {
                out.extend_from_slice(b);
            } else if attr.is_packable() && v.can_make_short() {
                let short = v.to_short()?;
                out.extend_from_slice(short.as_bytes().unwrap_or_default());
            } else {
                pad_to(out, attr);
                out.extend_from_slice(b);
            }
            Ok(())
        }
    }
}

/// Writes the data area and null bitmap for `values`.
///
/// Returns `(data, bitmap, infomask_bits)`; the bitmap is empty when no
/// value is null.
pub fn fill(desc: &TupleDesc, values: &[Option<Datum>]) -> Result<(Vec<u8>, Vec<u8>, u16)> {
    ensure!(
        values.len() == desc.natts(),
        "expected {} values, got {}",
        desc.natts(),
        values.len()
    );
    let has_nulls = values.iter().any(Option::is_none);
    let mut bitmap = if has_nulls {
        vec![0u8; bitmap_len(desc.natts())]
    } else {
        Vec::new()
    };
    let mut infomask = if has_nulls { HEAP_HASNULL } else { 0 };
    let mut data = Vec::with_capacity(compute_data_size(desc, values)?);

    for (i, (attr, value)) in desc.attrs().iter().zip(values).enumerate() {
        let Some(value) = value else {
            continue;
        };
        if has_nulls {
            bitmap[i >> 3] |= 1 << (i & 0x07);
        }
        match value {
            Datum::Fixed(bytes) => {
                check_fixed(attr, bytes)?;
                pad_to(&mut data, attr);
                data.extend_from_slice(bytes);
            }
            Datum::Varlena(v) => {
                ensure!(attr.is_varlena(), "column '{}' is fixed-width", attr.name);
                infomask |= HEAP_HASVARWIDTH;
                fill_varlena(attr, v, &mut data, &mut infomask)?;
            }
        }
    }
    Ok((data, bitmap, infomask))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapTuple {
    data: Vec<u8>,
    table_oid: Oid,
}

impl HeapTuple {
    /// Forms a new tuple from `values`.
    pub fn form(desc: &TupleDesc, values: &[Option<Datum>], table_oid: Oid) -> Result<Self> {
        Self::assemble(TupleHeader::default(), desc, values, table_oid)
    }

    /// Forms a tuple from `values` carrying over `self`'s header fields
    /// (visibility info, ctid) and table oid. Only the natts, hoff and
    /// data-describing infomask bits are recomputed.
    pub fn rebuild(&self, desc: &TupleDesc, values: &[Option<Datum>]) -> Result<Self> {
        Self::assemble(self.header(), desc, values, self.table_oid)
    }

    fn assemble(
        mut hdr: TupleHeader,
        desc: &TupleDesc,
        values: &[Option<Datum>],
        table_oid: Oid,
    ) -> Result<Self> {
        let (data, bitmap, bits) = fill(desc, values)?;
        let hoff = header_len(desc.natts(), !bitmap.is_empty());
        let total = hoff + data.len();
        if total > MAX_ALLOC_SIZE {
            return Err(crate::toast::ToastError::SizeOverflow {
                requested: total,
                limit: MAX_ALLOC_SIZE,
            }
            .into());
        }

        hdr.set_natts(desc.natts());
        hdr.set_hoff(hoff as u8);
        hdr.set_infomask((hdr.infomask() & !INFOMASK_DATA_BITS) | bits);

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(hdr.as_bytes());
        buf.extend_from_slice(&bitmap);
        buf.resize(hoff, 0);
        buf.extend_from_slice(&data);
        Ok(Self {
            data: buf,
            table_oid,
        })
    }

    /// Wraps an existing tuple image.
    pub fn from_bytes(data: Vec<u8>, table_oid: Oid) -> Result<Self> {
        ensure!(
            data.len() >= TUPLE_HEADER_SIZE,
            "tuple too short: {} < {}",
            data.len(),
            TUPLE_HEADER_SIZE
        );
        let tup = Self { data, table_oid };
        let hoff = tup.hoff();
        ensure!(
            hoff >= TUPLE_HEADER_SIZE && hoff <= tup.data.len(),
            "tuple header offset {} out of range",
            hoff
        );
        if tup.has_nulls() {
            ensure!(
                TUPLE_HEADER_SIZE + bitmap_len(tup.natts()) <= hoff,
                "null bitmap overlaps tuple data"
            );
        }
        Ok(tup)
    }

    pub fn header(&self) -> TupleHeader {
        TupleHeader::read_from_bytes(&self.data[..TUPLE_HEADER_SIZE]).unwrap_or_default()
    }

    fn update_header(&mut self, f: impl FnOnce(&mut TupleHeader)) {
        let mut hdr = self.header();
        f(&mut hdr);
        self.data[..TUPLE_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    pub fn set_table_oid(&mut self, oid: Oid) {
        self.table_oid = oid;
    }

    pub fn ctid(&self) -> (u32, u16) {
        let hdr = self.header();
        (hdr.ctid_block(), hdr.ctid_offset())
    }

    pub fn set_ctid(&mut self, block: u32, offset: u16) {
        self.update_header(|h| {
            h.set_ctid_block(block);
            h.set_ctid_offset(offset);
        });
    }

    pub fn hoff(&self) -> usize {
        self.data[TUPLE_HEADER_SIZE - 1] as usize
    }

    pub fn natts(&self) -> usize {
        self.header().natts()
    }

    pub fn infomask(&self) -> u16 {
        self.header().infomask()
    }

    pub fn has_nulls(&self) -> bool {
        self.infomask() & HEAP_HASNULL != 0
    }

    pub fn has_varwidth(&self) -> bool {
        self.infomask() & HEAP_HASVARWIDTH != 0
    }

    pub fn has_external(&self) -> bool {
        self.infomask() & HEAP_HASEXTERNAL != 0
    }

    /// Size of the data area.
    pub fn data_len(&self) -> usize {
        self.data.len() - self.hoff()
    }

    fn is_null(&self, att: usize) -> bool {
        if !self.has_nulls() {
            return false;
        }
        let bits = &self.data[TUPLE_HEADER_SIZE..];
        bits[att >> 3] & (1 << (att & 0x07)) == 0
    }

    /// Splits the tuple into per-column values. Columns beyond the tuple's
    /// own attribute count read as null.
    pub fn deform(&self, desc: &TupleDesc) -> Result<Vec<Option<Datum>>> {
        let data = &self.data[self.hoff()..];
        let natts = self.natts().min(desc.natts());
        let mut values = Vec::with_capacity(desc.natts());
        let mut off = 0usize;

        for (i, attr) in desc.attrs().iter().enumerate().take(natts) {
            if self.is_null(i) {
                values.push(None);
                continue;
            }
            match attr.len {
                AttLen::Fixed(n) => {
                    off = attr.align.apply(off);
                    let end = off + n as usize;
                    ensure!(end <= data.len(), "column '{}' runs past tuple end", attr.name);
                    values.push(Some(Datum::Fixed(data[off..end].to_vec())));
                    off = end;
                }
                AttLen::Varlena => {
                    ensure!(off < data.len(), "column '{}' runs past tuple end", attr.name);
                    if !header::not_pad_byte(data[off]) {
                        off = attr.align.apply(off);
                    }
                    ensure!(off < data.len(), "column '{}' runs past tuple end", attr.name);
                    let size = header::size_any(&data[off..])?;
                    let end = off + size;
                    ensure!(
                        size > 0 && end <= data.len(),
                        "column '{}' runs past tuple end",
                        attr.name
                    );
                    values.push(Some(Datum::Varlena(Varlena::from_bytes(
                        data[off..end].to_vec(),
                    )?)));
                    off = end;
                }
            }
        }
        values.resize(desc.natts(), None);
        Ok(values)
    }
}
