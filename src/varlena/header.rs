//! # Varlena Header Codec
//!
//! Byte-level encoding of the four varlena header shapes. All functions
//! operate on raw slices whose first byte is the header; the first byte alone
//! decides the shape:
//!
//! ```text
//! xxxxxx00  4-byte header, uncompressed        len = u32 LE >> 2
//! xxxxxx10  4-byte header, compressed inline   len = u32 LE >> 2
//! 00000001  1-byte tag, external pointer       vartag in byte 1
//! xxxxxxx1  1-byte header, short value         len = b0 >> 1
//! ```
//!
//! Lengths always include the header. A zero first byte can only be
//! alignment padding, never the start of a 1-byte-header value, which is how
//! tuple walkers tell padding from data.

use eyre::{bail, ensure, Result};

use crate::config::{
    EXTERNAL_POINTER_EXTENDED_PAYLOAD, EXTERNAL_POINTER_PAYLOAD, IN_MEMORY_POINTER_PAYLOAD,
    MAX_ALLOC_SIZE, VARATT_SHORT_MAX, VARHDRSZ, VARHDRSZ_EXTERNAL, VARHDRSZ_SHORT,
};
use crate::toast::ToastError;

/// Tag selecting the payload of an external datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VarTag {
    Indirect = 1,
    ExpandedRo = 2,
    ExpandedRw = 3,
    OnDisk = 18,
    OnDiskExtended = 19,
}

impl VarTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(VarTag::Indirect),
            2 => Some(VarTag::ExpandedRo),
            3 => Some(VarTag::ExpandedRw),
            18 => Some(VarTag::OnDisk),
            19 => Some(VarTag::OnDiskExtended),
            _ => None,
        }
    }

    /// Payload bytes following the 2-byte tag header.
    pub fn payload_size(self) -> usize {
        match self {
            VarTag::Indirect | VarTag::ExpandedRo | VarTag::ExpandedRw => {
                IN_MEMORY_POINTER_PAYLOAD
            }
            VarTag::OnDisk => EXTERNAL_POINTER_PAYLOAD,
            VarTag::OnDiskExtended => EXTERNAL_POINTER_EXTENDED_PAYLOAD,
        }
    }

    pub fn is_on_disk(self) -> bool {
        matches!(self, VarTag::OnDisk | VarTag::OnDiskExtended)
    }

    pub fn is_expanded(self) -> bool {
        matches!(self, VarTag::ExpandedRo | VarTag::ExpandedRw)
    }
}

#[inline]
pub fn is_4b(bytes: &[u8]) -> bool {
    bytes[0] & 0x01 == 0x00
}

#[inline]
pub fn is_4b_u(bytes: &[u8]) -> bool {
    bytes[0] & 0x03 == 0x00
}

#[inline]
pub fn is_4b_c(bytes: &[u8]) -> bool {
    bytes[0] & 0x03 == 0x02
}

#[inline]
pub fn is_1b(bytes: &[u8]) -> bool {
    bytes[0] & 0x01 == 0x01
}

#[inline]
pub fn is_1b_e(bytes: &[u8]) -> bool {
    bytes[0] == 0x01
}

/// A nonzero byte at an unaligned offset must be a 1-byte header.
#[inline]
pub fn not_pad_byte(byte: u8) -> bool {
    byte != 0
}

#[inline]
pub fn size_4b(bytes: &[u8]) -> usize {
    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    ((word >> 2) & 0x3FFF_FFFF) as usize
}

#[inline]
pub fn size_1b(bytes: &[u8]) -> usize {
    ((bytes[0] >> 1) & 0x7F) as usize
}

#[inline]
pub fn vartag_1b_e(bytes: &[u8]) -> u8 {
    bytes[1]
}

/// Total bytes occupied by the byte-encoded varlena starting at `bytes[0]`.
///
/// External datums with an unknown tag are reported as an error since their
/// length cannot be known.
pub fn size_any(bytes: &[u8]) -> Result<usize> {
    ensure!(!bytes.is_empty(), "empty varlena");
    if is_1b_e(bytes) {
        ensure!(bytes.len() >= VARHDRSZ_EXTERNAL, "truncated external varlena header");
        let tag = VarTag::from_u8(vartag_1b_e(bytes))
            .ok_or_else(|| eyre::eyre!("unrecognized vartag {}", vartag_1b_e(bytes)))?;
        Ok(VARHDRSZ_EXTERNAL + tag.payload_size())
    } else if is_1b(bytes) {
        Ok(size_1b(bytes))
    } else {
        ensure!(bytes.len() >= VARHDRSZ, "truncated 4-byte varlena header");
        Ok(size_4b(bytes))
    }
}

fn check_4b_len(len: usize) -> Result<u32> {
    if len > MAX_ALLOC_SIZE {
        return Err(ToastError::SizeOverflow {
            requested: len,
            limit: MAX_ALLOC_SIZE,
        }
        .into());
    }
    Ok(len as u32)
}

/// Writes a plain 4-byte header describing `len` total bytes.
pub fn set_plain_size(buf: &mut [u8], len: usize) -> Result<()> {
    let len = check_4b_len(len)?;
    buf[..VARHDRSZ].copy_from_slice(&(len << 2).to_le_bytes());
    Ok(())
}

/// Writes a compressed-inline 4-byte header describing `len` total bytes.
pub fn set_compressed_size(buf: &mut [u8], len: usize) -> Result<()> {
    let len = check_4b_len(len)?;
    buf[..VARHDRSZ].copy_from_slice(&((len << 2) | 0x02).to_le_bytes());
    Ok(())
}

/// Writes a 1-byte header describing `len` total bytes.
pub fn set_short_size(buf: &mut [u8], len: usize) -> Result<()> {
    if len < VARHDRSZ_SHORT || len > VARATT_SHORT_MAX {
        bail!("length {} does not fit a 1-byte varlena header", len);
    }
    buf[0] = ((len as u8) << 1) | 0x01;
    Ok(())
}

/// Writes the 2-byte tag header of an external datum.
pub fn set_external_tag(buf: &mut [u8], tag: VarTag) {
    buf[0] = 0x01;
    buf[1] = tag as u8;
}
