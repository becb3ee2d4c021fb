//! # External Pointer Codec
//!
//! A value moved out of line is replaced in its tuple by a small fat pointer
//! naming the chunk relation and the value id under which the chunks live.
//!
//! ## Legacy Format (vartag 18, 18 bytes)
//!
//! ```text
//! +------+--------+---------+---------+----------+-------------+
//! | 0x01 | vartag | rawsize | extinfo | value_id | chunk_relid |
//! | 1 B  | 1 B    | i32 LE  | u32 LE  | u32 LE   | u32 LE      |
//! +------+--------+---------+---------+----------+-------------+
//! ```
//!
//! `rawsize` counts the 4-byte header of the detoasted value. `extinfo`
//! holds the stored payload length in its low 30 bits and the compression
//! method code in its top 2 bits.
//!
//! ## Extended Format (vartag 19, 22 bytes)
//!
//! The legacy fields followed by a method byte and three reserved zero bytes.
//! The top bits of `extinfo` carry the marker `3` when the value is
//! compressed, and the method byte names the codec. Writers only pick this
//! form when the codec has no legacy code.
//!
//! ## Alignment
//!
//! Pointers sit at arbitrary byte offsets inside tuples. Decoding always
//! copies the payload into an owned `Unaligned` zerocopy struct first; no
//! reference into the tuple is ever reinterpreted.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::header::{is_1b_e, set_external_tag, vartag_1b_e, VarTag};
use crate::compression::CompressionMethod;
use crate::config::{
    EXTERNAL_POINTER_EXTENDED_PAYLOAD, EXTERNAL_POINTER_PAYLOAD, TOAST_POINTER_SIZE,
    TOAST_POINTER_SIZE_EXTENDED, VARHDRSZ, VARHDRSZ_EXTERNAL, VARLENA_EXTSIZE_BITS,
    VARLENA_EXTSIZE_MASK,
};
use crate::Oid;

/// `extinfo` method code announcing an explicit method byte.
pub const EXTENDED_METHOD_MARKER: u32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ExternalPointer {
    rawsize: I32,
    extinfo: U32,
    value_id: U32,
    chunk_relid: U32,
}

const _: () = assert!(std::mem::size_of::<ExternalPointer>() == EXTERNAL_POINTER_PAYLOAD);

impl ExternalPointer {
    zerocopy_accessors! {
        rawsize: i32,
        extinfo: u32,
        value_id: u32,
        chunk_relid: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ExtendedExternalPointer {
    rawsize: I32,
    extinfo: U32,
    value_id: U32,
    chunk_relid: U32,
    method: u8,
    reserved: [u8; 3],
}

const _: () =
    assert!(std::mem::size_of::<ExtendedExternalPointer>() == EXTERNAL_POINTER_EXTENDED_PAYLOAD);

impl ExtendedExternalPointer {
    zerocopy_accessors! {
        rawsize: i32,
        extinfo: u32,
        value_id: u32,
        chunk_relid: u32,
    }

    pub fn method(&self) -> u8 {
        self.method
    }
}

/// Copies the legacy payload out of an on-disk pointer datum.
pub fn ext_get_pointer(datum: &[u8]) -> Result<ExternalPointer> {
    ensure!(
        datum.len() >= TOAST_POINTER_SIZE,
        "external pointer too short: {} < {}",
        datum.len(),
        TOAST_POINTER_SIZE
    );
    ExternalPointer::read_from_bytes(&datum[VARHDRSZ_EXTERNAL..TOAST_POINTER_SIZE])
        .map_err(|_| eyre::eyre!("misaligned external pointer payload"))
}

/// Copies the extended payload out of an on-disk pointer datum.
pub fn ext_get_pointer_extended(datum: &[u8]) -> Result<ExtendedExternalPointer> {
    ensure!(
        datum.len() >= TOAST_POINTER_SIZE_EXTENDED,
        "extended external pointer too short: {} < {}",
        datum.len(),
        TOAST_POINTER_SIZE_EXTENDED
    );
    ExtendedExternalPointer::read_from_bytes(&datum[VARHDRSZ_EXTERNAL..TOAST_POINTER_SIZE_EXTENDED])
        .map_err(|_| eyre::eyre!("misaligned extended external pointer payload"))
}

/// Decoded on-disk pointer, independent of which vartag carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToastPointer {
    /// Detoasted size including the 4-byte header.
    pub raw_size: i32,
    /// Bytes stored in the chunk relation.
    pub ext_size: u32,
    /// Codec of the stored bytes; `None` when stored uncompressed.
    pub method: Option<u8>,
    pub value_id: Oid,
    pub chunk_relid: Oid,
}

impl ToastPointer {
    pub fn new(
        chunk_relid: Oid,
        value_id: Oid,
        raw_size: i32,
        ext_size: u32,
        method: Option<CompressionMethod>,
    ) -> Self {
        Self {
            raw_size,
            ext_size,
            method: method.map(CompressionMethod::id),
            value_id,
            chunk_relid,
        }
    }

    /// Stored bytes are compressed iff they are smaller than the raw payload.
    pub fn is_compressed(&self) -> bool {
        (self.ext_size as i64) < self.raw_size as i64 - VARHDRSZ as i64
    }

    /// Payload length of the detoasted value, header excluded.
    pub fn raw_payload_len(&self) -> usize {
        (self.raw_size as usize).saturating_sub(VARHDRSZ)
    }

    pub fn ext_size(&self) -> usize {
        self.ext_size as usize
    }

    /// Tag a writer uses for this pointer: legacy unless the codec has no
    /// 2-bit code.
    pub fn vartag(&self) -> VarTag {
        match self.method {
            Some(id) if self.is_compressed() && !CompressionMethod::has_legacy_code(id) => {
                VarTag::OnDiskExtended
            }
            _ => VarTag::OnDisk,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self.vartag() {
            VarTag::OnDiskExtended => TOAST_POINTER_SIZE_EXTENDED,
            _ => TOAST_POINTER_SIZE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let tag = self.vartag();
        let code = match (tag, self.method) {
            (VarTag::OnDiskExtended, _) => EXTENDED_METHOD_MARKER,
            (_, Some(id)) if self.is_compressed() => id as u32,
            _ => 0,
        };
        let extinfo = (self.ext_size & VARLENA_EXTSIZE_MASK) | (code << VARLENA_EXTSIZE_BITS);

        let mut buf = vec![0u8; VARHDRSZ_EXTERNAL];
        set_external_tag(&mut buf, tag);
        match tag {
            VarTag::OnDiskExtended => {
                let payload = ExtendedExternalPointer {
                    rawsize: I32::new(self.raw_size),
                    extinfo: U32::new(extinfo),
                    value_id: U32::new(self.value_id),
                    chunk_relid: U32::new(self.chunk_relid),
                    method: self.method.unwrap_or(0),
                    reserved: [0; 3],
                };
                buf.extend_from_slice(payload.as_bytes());
            }
            _ => {
                let payload = ExternalPointer {
                    rawsize: I32::new(self.raw_size),
                    extinfo: U32::new(extinfo),
                    value_id: U32::new(self.value_id),
                    chunk_relid: U32::new(self.chunk_relid),
                };
                buf.extend_from_slice(payload.as_bytes());
            }
        }
        buf
    }

    pub fn decode(datum: &[u8]) -> Result<Self> {
        ensure!(
            datum.len() >= VARHDRSZ_EXTERNAL && is_1b_e(datum),
            "not an external datum"
        );
        match VarTag::from_u8(vartag_1b_e(datum)) {
            Some(VarTag::OnDisk) => {
                let raw = ext_get_pointer(datum)?;
                let mut ptr = Self {
                    raw_size: raw.rawsize(),
                    ext_size: raw.extinfo() & VARLENA_EXTSIZE_MASK,
                    method: None,
                    value_id: raw.value_id(),
                    chunk_relid: raw.chunk_relid(),
                };
                if ptr.is_compressed() {
                    ptr.method = Some((raw.extinfo() >> VARLENA_EXTSIZE_BITS) as u8);
                }
                Ok(ptr)
            }
            Some(VarTag::OnDiskExtended) => {
                let raw = ext_get_pointer_extended(datum)?;
                let mut ptr = Self {
                    raw_size: raw.rawsize(),
                    ext_size: raw.extinfo() & VARLENA_EXTSIZE_MASK,
                    method: None,
                    value_id: raw.value_id(),
                    chunk_relid: raw.chunk_relid(),
                };
                if ptr.is_compressed() {
                    let code = raw.extinfo() >> VARLENA_EXTSIZE_BITS;
                    ptr.method = Some(if code == EXTENDED_METHOD_MARKER {
                        raw.method()
                    } else {
                        code as u8
                    });
                }
                Ok(ptr)
            }
            Some(tag) => bail!("vartag {:?} is not an on-disk pointer", tag),
            None => bail!("unrecognized vartag {}", vartag_1b_e(datum)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_layout_is_bit_exact() {
        let ptr = ToastPointer::new(16385, 16400, 50004, 50000, None);
        let bytes = ptr.encode();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 18);
        assert_eq!(&bytes[2..6], &50004i32.to_le_bytes());
        assert_eq!(&bytes[6..10], &50000u32.to_le_bytes());
        assert_eq!(&bytes[10..14], &16400u32.to_le_bytes());
        assert_eq!(&bytes[14..18], &16385u32.to_le_bytes());
        assert_eq!(ToastPointer::decode(&bytes).unwrap(), ptr);
    }

    #[test]
    fn test_legacy_compressed_method_bits() {
        let ptr = ToastPointer::new(1, 2, 100004, 1200, Some(CompressionMethod::Lz4));
        let bytes = ptr.encode();
        assert_eq!(bytes.len(), TOAST_POINTER_SIZE);
        let extinfo = u32::from_le_bytes(bytes[6..10].try_into().unwrap());
        assert_eq!(extinfo >> 30, 1);
        assert_eq!(extinfo & VARLENA_EXTSIZE_MASK, 1200);

        let decoded = ToastPointer::decode(&bytes).unwrap();
        assert!(decoded.is_compressed());
        assert_eq!(decoded.method, Some(CompressionMethod::Lz4.id()));
    }

    #[test]
    fn test_zstd_uses_extended_tag() {
        let ptr = ToastPointer::new(1, 2, 100004, 900, Some(CompressionMethod::Zstd));
        let bytes = ptr.encode();
        assert_eq!(bytes.len(), TOAST_POINTER_SIZE_EXTENDED);
        assert_eq!(bytes[1], 19);
        assert_eq!(bytes[18], CompressionMethod::Zstd.id());
        assert_eq!(&bytes[19..22], &[0, 0, 0]);
        assert_eq!(ToastPointer::decode(&bytes).unwrap(), ptr);
    }

    #[test]
    fn test_uncompressed_method_is_dropped() {
        // ext_size == raw payload, so the value is not compressed
        let ptr = ToastPointer::new(1, 2, 104, 100, Some(CompressionMethod::Zstd));
        assert!(!ptr.is_compressed());
        assert_eq!(ptr.vartag(), VarTag::OnDisk);
        let decoded = ToastPointer::decode(&ptr.encode()).unwrap();
        assert_eq!(decoded.method, None);
    }

    #[test]
    fn test_decode_unaligned_offset() {
        let ptr = ToastPointer::new(7, 9, 5004, 5000, None);
        let mut buf = vec![0xAAu8; 3];
        buf.extend_from_slice(&ptr.encode());
        assert_eq!(ToastPointer::decode(&buf[3..]).unwrap(), ptr);
    }

    #[test]
    fn test_decode_rejects_in_memory_tags() {
        let buf = [0x01, VarTag::Indirect as u8, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(ToastPointer::decode(&buf).is_err());
        assert!(ToastPointer::decode(&[0x01, 99]).is_err());
        assert!(ToastPointer::decode(&[0x01, 18, 0]).is_err());
    }
}
