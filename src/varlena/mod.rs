//! # Varlena Values
//!
//! A varlena is a self-describing variable-length value. Byte-encoded shapes
//! (plain, short, inline-compressed, on-disk external) live in a `Vec<u8>`
//! whose first byte selects the shape; see [`header`] for the bit layout.
//! The in-memory external shapes (indirect and expanded) can never reach
//! disk and are modelled as typed variants holding an `Arc`.
//!
//! ```text
//! Varlena
//!   ├── Bytes(Vec<u8>)
//!   │     ├── Plain             [4B hdr | payload]
//!   │     ├── Short             [1B hdr | payload]          total <= 127
//!   │     ├── CompressedInline  [4B hdr | tcinfo | (method) | data]
//!   │     └── External          [0x01 | vartag | pointer payload]
//!   ├── Indirect(Arc<Varlena>)  target is always byte-encoded
//!   └── Expanded { object, writable }
//! ```
//!
//! ## Compressed Header
//!
//! `tcinfo` holds the raw payload size in its low 30 bits and a 2-bit method
//! code on top. Methods without a 2-bit code store the marker `3` and one
//! extra method byte right after `tcinfo`.
//!
//! ## Size Helpers
//!
//! - [`Varlena::size_any`]: bytes the value occupies where it sits
//! - [`Varlena::raw_size`]: size of the fully detoasted value, header included
//! - [`Varlena::stored_size`]: bytes physically stored (inline or in chunks)

pub mod header;
pub mod pointer;

use std::fmt;
use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::compression::CompressionMethod;
use crate::config::{
    IN_MEMORY_POINTER_PAYLOAD, VARATT_SHORT_MAX, VARHDRSZ, VARHDRSZ_COMPRESSED,
    VARHDRSZ_COMPRESSED_EXTENDED, VARHDRSZ_EXTERNAL, VARHDRSZ_SHORT, VARLENA_EXTSIZE_BITS,
    VARLENA_EXTSIZE_MASK,
};
pub use header::VarTag;
pub use pointer::ToastPointer;
use pointer::EXTENDED_METHOD_MARKER;

/// A decoded in-memory representation that can serialize itself back into a
/// plain varlena.
pub trait ExpandedObject: fmt::Debug + Send + Sync {
    /// Total bytes of the flat form, 4-byte header included.
    fn flat_size(&self) -> usize;

    /// Writes the flat form, header included, into `out` of length
    /// `flat_size()`. The result must be a plain (uncompressed, 4-byte
    /// header) varlena.
    fn flatten_into(&self, out: &mut [u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKind {
    OnDiskLegacy,
    OnDiskExtended,
    Indirect,
    Expanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarlenaKind {
    Plain,
    Short,
    CompressedInline,
    External(ExtKind),
}

#[derive(Debug, Clone)]
pub enum Varlena {
    Bytes(Vec<u8>),
    Indirect(Arc<Varlena>),
    Expanded {
        object: Arc<dyn ExpandedObject>,
        writable: bool,
    },
}

impl Varlena {
    /// Parses and validates a byte-encoded varlena.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let size = header::size_any(&bytes)?;
        ensure!(
            size == bytes.len(),
            "varlena header says {} bytes, buffer holds {}",
            size,
            bytes.len()
        );
        if header::is_1b_e(&bytes) {
            let tag = header::vartag_1b_e(&bytes);
            ensure!(
                VarTag::from_u8(tag).is_some_and(VarTag::is_on_disk),
                "in-memory vartag {} cannot appear in a byte buffer",
                tag
            );
        } else if header::is_1b(&bytes) {
            ensure!(size >= VARHDRSZ_SHORT, "short varlena shorter than its header");
        } else if header::is_4b_c(&bytes) {
            ensure!(size >= VARHDRSZ_COMPRESSED, "compressed varlena shorter than its header");
            let code = read_tcinfo(&bytes) >> VARLENA_EXTSIZE_BITS;
            if code == EXTENDED_METHOD_MARKER {
                ensure!(
                    size >= VARHDRSZ_COMPRESSED_EXTENDED,
                    "extended compressed varlena shorter than its header"
                );
            }
        } else {
            ensure!(size >= VARHDRSZ, "plain varlena shorter than its header");
        }
        Ok(Varlena::Bytes(bytes))
    }

    /// A plain value with a 4-byte header.
    pub fn plain(payload: &[u8]) -> Result<Self> {
        let mut buf = vec![0u8; VARHDRSZ + payload.len()];
        header::set_plain_size(&mut buf, VARHDRSZ + payload.len())?;
        buf[VARHDRSZ..].copy_from_slice(payload);
        Ok(Varlena::Bytes(buf))
    }

    /// A short value with a 1-byte header.
    pub fn short(payload: &[u8]) -> Result<Self> {
        let mut buf = vec![0u8; VARHDRSZ_SHORT + payload.len()];
        header::set_short_size(&mut buf, VARHDRSZ_SHORT + payload.len())?;
        buf[VARHDRSZ_SHORT..].copy_from_slice(payload);
        Ok(Varlena::Bytes(buf))
    }

    /// An inline-compressed value holding `data` produced by `method` from a
    /// payload of `raw_len` bytes.
    pub fn compressed(method: CompressionMethod, raw_len: usize, data: &[u8]) -> Result<Self> {
        ensure!(
            raw_len <= VARLENA_EXTSIZE_MASK as usize,
            "raw size {} does not fit tcinfo",
            raw_len
        );
        let legacy = CompressionMethod::has_legacy_code(method.id());
        let hdr = if legacy {
            VARHDRSZ_COMPRESSED
        } else {
            VARHDRSZ_COMPRESSED_EXTENDED
        };
        let code = if legacy {
            method.id() as u32
        } else {
            EXTENDED_METHOD_MARKER
        };

        let mut buf = vec![0u8; hdr + data.len()];
        header::set_compressed_size(&mut buf, hdr + data.len())?;
        let tcinfo = raw_len as u32 | (code << VARLENA_EXTSIZE_BITS);
        buf[VARHDRSZ..VARHDRSZ_COMPRESSED].copy_from_slice(&tcinfo.to_le_bytes());
        if !legacy {
            buf[VARHDRSZ_COMPRESSED] = method.id();
        }
        buf[hdr..].copy_from_slice(data);
        Ok(Varlena::Bytes(buf))
    }

    /// Rewraps stored chunk bytes of a compressed external value (tcinfo
    /// onward) under a compressed-inline header.
    pub fn compressed_from_stored(stored: &[u8]) -> Result<Self> {
        let mut buf = vec![0u8; VARHDRSZ + stored.len()];
        header::set_compressed_size(&mut buf, VARHDRSZ + stored.len())?;
        buf[VARHDRSZ..].copy_from_slice(stored);
        Varlena::from_bytes(buf)
    }

    pub fn external(ptr: &ToastPointer) -> Self {
        Varlena::Bytes(ptr.encode())
    }

    /// An indirect pointer. The target must be byte-encoded.
    pub fn indirect(target: Arc<Varlena>) -> Result<Self> {
        ensure!(
            matches!(*target, Varlena::Bytes(_)),
            "indirect varlena cannot point at another in-memory pointer"
        );
        Ok(Varlena::Indirect(target))
    }

    pub fn expanded(object: Arc<dyn ExpandedObject>, writable: bool) -> Self {
        Varlena::Expanded { object, writable }
    }

    pub fn kind(&self) -> VarlenaKind {
        match self {
            Varlena::Indirect(_) => VarlenaKind::External(ExtKind::Indirect),
            Varlena::Expanded { .. } => VarlenaKind::External(ExtKind::Expanded),
            Varlena::Bytes(b) => {
                if header::is_1b_e(b) {
                    match VarTag::from_u8(header::vartag_1b_e(b)) {
                        Some(VarTag::OnDiskExtended) => VarlenaKind::External(ExtKind::OnDiskExtended),
                        _ => VarlenaKind::External(ExtKind::OnDiskLegacy),
                    }
                } else if header::is_1b(b) {
                    VarlenaKind::Short
                } else if header::is_4b_c(b) {
                    VarlenaKind::CompressedInline
                } else {
                    VarlenaKind::Plain
                }
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Varlena::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Varlena::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind(), VarlenaKind::External(_))
    }

    pub fn is_external_on_disk(&self) -> bool {
        matches!(
            self.kind(),
            VarlenaKind::External(ExtKind::OnDiskLegacy | ExtKind::OnDiskExtended)
        )
    }

    pub fn is_compressed_inline(&self) -> bool {
        self.kind() == VarlenaKind::CompressedInline
    }

    pub fn is_short(&self) -> bool {
        self.kind() == VarlenaKind::Short
    }

    pub fn is_plain(&self) -> bool {
        self.kind() == VarlenaKind::Plain
    }

    /// Total bytes occupied, header included. In-memory pointers report the
    /// size of their tagged pointer form.
    pub fn size_any(&self) -> usize {
        match self {
            Varlena::Bytes(b) => b.len(),
            _ => VARHDRSZ_EXTERNAL + IN_MEMORY_POINTER_PAYLOAD,
        }
    }

    fn header_size(&self) -> usize {
        match self.kind() {
            VarlenaKind::Plain => VARHDRSZ,
            VarlenaKind::Short => VARHDRSZ_SHORT,
            VarlenaKind::CompressedInline => self.compressed_header_size(),
            VarlenaKind::External(_) => VARHDRSZ_EXTERNAL,
        }
    }

    /// Bytes after the header (after the full compression header for
    /// inline-compressed values).
    pub fn size_payload(&self) -> usize {
        self.size_any() - self.header_size()
    }

    /// Payload bytes. Empty for in-memory pointers.
    pub fn data(&self) -> &[u8] {
        match self {
            Varlena::Bytes(b) => &b[self.header_size()..],
            _ => &[],
        }
    }

    /// `tcinfo` of an inline-compressed value.
    fn tcinfo(&self) -> u32 {
        self.as_bytes().map(read_tcinfo).unwrap_or(0)
    }

    /// Raw payload size recorded in the compression header.
    pub fn compressed_raw_size(&self) -> usize {
        (self.tcinfo() & VARLENA_EXTSIZE_MASK) as usize
    }

    /// Method id recorded in the compression header.
    pub fn compression_method_id(&self) -> u8 {
        let code = self.tcinfo() >> VARLENA_EXTSIZE_BITS;
        if code == EXTENDED_METHOD_MARKER {
            self.as_bytes()
                .and_then(|b| b.get(VARHDRSZ_COMPRESSED).copied())
                .unwrap_or(u8::MAX)
        } else {
            code as u8
        }
    }

    pub fn compressed_header_size(&self) -> usize {
        if self.tcinfo() >> VARLENA_EXTSIZE_BITS == EXTENDED_METHOD_MARKER {
            VARHDRSZ_COMPRESSED_EXTENDED
        } else {
            VARHDRSZ_COMPRESSED
        }
    }

    /// Decodes the on-disk pointer of an external value.
    pub fn external_pointer(&self) -> Result<ToastPointer> {
        match self {
            Varlena::Bytes(b) if header::is_1b_e(b) => ToastPointer::decode(b),
            _ => bail!("value is not an on-disk external: {:?}", self.kind()),
        }
    }

    /// Plain values whose payload fits a 1-byte header.
    pub fn can_make_short(&self) -> bool {
        self.is_plain() && self.size_payload() + VARHDRSZ_SHORT <= VARATT_SHORT_MAX
    }

    pub fn to_short(&self) -> Result<Varlena> {
        ensure!(self.can_make_short(), "value cannot use a 1-byte header");
        Varlena::short(self.data())
    }

    /// Widens a short value to a 4-byte header; plain values are cloned.
    pub fn to_plain(&self) -> Result<Varlena> {
        match self.kind() {
            VarlenaKind::Plain => Ok(self.clone()),
            VarlenaKind::Short => Varlena::plain(self.data()),
            other => bail!("cannot widen {:?} to a plain varlena", other),
        }
    }

    /// Size of the fully detoasted value, 4-byte header included.
    pub fn raw_size(&self) -> Result<usize> {
        Ok(match self {
            Varlena::Indirect(target) => target.raw_size()?,
            Varlena::Expanded { object, .. } => object.flat_size(),
            Varlena::Bytes(_) => match self.kind() {
                VarlenaKind::External(_) => self.external_pointer()?.raw_size as usize,
                VarlenaKind::CompressedInline => self.compressed_raw_size() + VARHDRSZ,
                VarlenaKind::Short => self.size_payload() + VARHDRSZ,
                VarlenaKind::Plain => self.size_any(),
            },
        })
    }

    /// Bytes physically stored for this value: chunk bytes for externals,
    /// the inline size otherwise.
    pub fn stored_size(&self) -> Result<usize> {
        Ok(match self {
            Varlena::Indirect(target) => target.stored_size()?,
            Varlena::Expanded { object, .. } => object.flat_size(),
            Varlena::Bytes(_) if self.is_external() => self.external_pointer()?.ext_size(),
            Varlena::Bytes(_) => self.size_any(),
        })
    }
}

fn read_tcinfo(bytes: &[u8]) -> u32 {
    if bytes.len() < VARHDRSZ_COMPRESSED {
        return 0;
    }
    u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ints(Vec<u32>);

    impl ExpandedObject for Ints {
        fn flat_size(&self) -> usize {
            VARHDRSZ + self.0.len() * 4
        }

        fn flatten_into(&self, out: &mut [u8]) {
            header::set_plain_size(out, self.flat_size()).unwrap();
            for (i, v) in self.0.iter().enumerate() {
                out[VARHDRSZ + i * 4..VARHDRSZ + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
    }

    #[test]
    fn test_shapes_are_classified() {
        assert_eq!(Varlena::plain(b"abc").unwrap().kind(), VarlenaKind::Plain);
        assert_eq!(Varlena::short(b"abc").unwrap().kind(), VarlenaKind::Short);
        let ptr = ToastPointer::new(1, 2, 5004, 5000, None);
        assert_eq!(
            Varlena::external(&ptr).kind(),
            VarlenaKind::External(ExtKind::OnDiskLegacy)
        );
        let exp = Varlena::expanded(Arc::new(Ints(vec![1, 2])), false);
        assert_eq!(exp.kind(), VarlenaKind::External(ExtKind::Expanded));
        assert_eq!(exp.size_any(), 10);
    }

    #[test]
    fn test_payload_sizes() {
        let plain = Varlena::plain(&[7u8; 100]).unwrap();
        assert_eq!(plain.size_any(), 104);
        assert_eq!(plain.size_payload(), 100);
        assert_eq!(plain.data(), &[7u8; 100][..]);

        let short = plain.to_short().unwrap();
        assert_eq!(short.size_any(), 101);
        assert_eq!(short.data(), plain.data());
        assert_eq!(short.to_plain().unwrap().as_bytes(), plain.as_bytes());
    }

    #[test]
    fn test_short_limit() {
        assert!(Varlena::plain(&[0u8; 126]).unwrap().can_make_short());
        assert!(!Varlena::plain(&[0u8; 127]).unwrap().can_make_short());
    }

    #[test]
    fn test_compressed_header_fields() {
        let v = Varlena::compressed(CompressionMethod::Lz4, 5000, &[1, 2, 3]).unwrap();
        assert!(v.is_compressed_inline());
        assert_eq!(v.compressed_raw_size(), 5000);
        assert_eq!(v.compression_method_id(), 1);
        assert_eq!(v.data(), &[1, 2, 3]);
        assert_eq!(v.raw_size().unwrap(), 5004);

        let z = Varlena::compressed(CompressionMethod::Zstd, 5000, &[9]).unwrap();
        assert_eq!(z.compressed_header_size(), VARHDRSZ_COMPRESSED_EXTENDED);
        assert_eq!(z.compression_method_id(), 2);
        assert_eq!(z.size_payload(), 1);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        let mut bytes = Varlena::plain(b"hello").unwrap().into_bytes().unwrap();
        assert!(Varlena::from_bytes(bytes.clone()).is_ok());
        bytes.push(0);
        assert!(Varlena::from_bytes(bytes).is_err());
        assert!(Varlena::from_bytes(vec![0x01, VarTag::Indirect as u8]).is_err());
    }

    #[test]
    fn test_indirect_cannot_nest() {
        let target = Arc::new(Varlena::plain(b"x").unwrap());
        let ind = Varlena::indirect(target).unwrap();
        assert!(Varlena::indirect(Arc::new(ind)).is_err());
    }

    #[test]
    fn test_raw_and_stored_size() {
        let ptr = ToastPointer::new(1, 2, 100_004, 1200, Some(CompressionMethod::Pglz));
        let v = Varlena::external(&ptr);
        assert_eq!(v.raw_size().unwrap(), 100_004);
        assert_eq!(v.stored_size().unwrap(), 1200);

        let short = Varlena::short(b"abc").unwrap();
        assert_eq!(short.raw_size().unwrap(), 7);
        assert_eq!(short.stored_size().unwrap(), 4);

        let exp = Varlena::expanded(Arc::new(Ints(vec![1, 2, 3])), true);
        assert_eq!(exp.raw_size().unwrap(), 16);
    }
}
