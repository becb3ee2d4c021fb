//! # Compression Registry
//!
//! Maps compression method ids to codecs and enforces the rule that decides
//! whether a compressed form is worth keeping.
//!
//! ## Method Ids
//!
//! | Id | Name   | Alias    | Encoding in `tcinfo` / `extinfo`       |
//! |----|--------|----------|----------------------------------------|
//! | 0  | pglz   | `legacy` | 2-bit code 0                           |
//! | 1  | lz4    | `fast`   | 2-bit code 1                           |
//! | 2  | zstd   | `high`   | marker 3 + explicit method byte        |
//! | 3  | -      | reserved | never written                          |
//!
//! pglz is always linked. lz4 and zstd are linked by the `lz4` and `zstd`
//! cargo features; a stored value naming a codec that is not linked fails
//! with [`ToastError::UnsupportedCompression`].
//!
//! ## Acceptance Rule
//!
//! A compressed datum is only returned when
//!
//! ```text
//! size(compressed datum) + 2 < size(payload) + VARHDRSZ
//! ```
//!
//! so at least three bytes are saved after alignment padding. Otherwise
//! [`CompressionRegistry::compress`] returns `Ok(None)` and the caller keeps
//! the value plain.
//!
//! ## Registry Lifetime
//!
//! The built-in registry is a `static` table built at compile time. Other
//! registries (for example one that lacks a codec) are plain values derived
//! from it with [`CompressionRegistry::without`]; none of them is mutable.

#[cfg(feature = "lz4")]
pub mod lz4;
pub mod pglz;
#[cfg(feature = "zstd")]
pub mod zstd;

use std::fmt;
use std::str::FromStr;

use eyre::{bail, Result};

use crate::config::VARHDRSZ;
use crate::toast::ToastError;
use crate::varlena::Varlena;

/// Number of method ids addressable by the registry table.
pub const MAX_COMPRESSION_METHODS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionMethod {
    Pglz = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionMethod {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(CompressionMethod::Pglz),
            1 => Some(CompressionMethod::Lz4),
            2 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    /// Ids that fit the 2-bit field without the extended marker.
    pub fn has_legacy_code(id: u8) -> bool {
        id <= CompressionMethod::Lz4 as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Pglz => "pglz",
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionMethod {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "pglz" => Ok(CompressionMethod::Pglz),
            "fast" | "lz4" => Ok(CompressionMethod::Lz4),
            "high" | "zstd" => Ok(CompressionMethod::Zstd),
            other => bail!("unknown compression method '{}'", other),
        }
    }
}

/// A block codec. Inputs and outputs are bare payloads; varlena headers
/// are handled by the registry.
pub trait Codec: Send + Sync {
    fn method(&self) -> CompressionMethod;

    /// Returns `Ok(None)` when the codec declines to compress `input`.
    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>>;

    fn decompress(&self, input: &[u8], raw_len: usize) -> Result<Vec<u8>>;

    /// Decompresses at least the first `slice_len` bytes. `input` may be a
    /// prefix of the compressed stream when the codec supports that.
    fn decompress_slice(&self, input: &[u8], raw_len: usize, slice_len: usize) -> Result<Vec<u8>>;
}

static PGLZ_CODEC: pglz::PglzCodec = pglz::PglzCodec::new(pglz::Strategy::DEFAULT);

#[cfg(feature = "lz4")]
const LZ4_SLOT: Option<&'static dyn Codec> = Some(&lz4::Lz4Codec);
#[cfg(not(feature = "lz4"))]
const LZ4_SLOT: Option<&'static dyn Codec> = None;

#[cfg(feature = "zstd")]
const ZSTD_SLOT: Option<&'static dyn Codec> = Some(&zstd::ZstdCodec);
#[cfg(not(feature = "zstd"))]
const ZSTD_SLOT: Option<&'static dyn Codec> = None;

static BUILTIN: CompressionRegistry = CompressionRegistry {
    codecs: [Some(&PGLZ_CODEC), LZ4_SLOT, ZSTD_SLOT, None],
};

#[derive(Clone, Copy)]
pub struct CompressionRegistry {
    codecs: [Option<&'static dyn Codec>; MAX_COMPRESSION_METHODS],
}

impl fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let linked: Vec<_> = self
            .codecs
            .iter()
            .flatten()
            .map(|codec| codec.method().name())
            .collect();
        f.debug_struct("CompressionRegistry")
            .field("linked", &linked)
            .finish()
    }
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        *Self::builtin()
    }
}

impl CompressionRegistry {
    /// Codecs linked into this build.
    pub fn builtin() -> &'static CompressionRegistry {
        &BUILTIN
    }

    /// A copy of this registry with `method` unlinked.
    pub fn without(&self, method: CompressionMethod) -> CompressionRegistry {
        let mut codecs = self.codecs;
        codecs[method.id() as usize] = None;
        CompressionRegistry { codecs }
    }

    pub fn is_linked(&self, method: CompressionMethod) -> bool {
        self.codecs[method.id() as usize].is_some()
    }

    fn codec(&self, id: u8) -> Result<&'static dyn Codec> {
        match self.codecs.get(id as usize).copied().flatten() {
            Some(codec) => Ok(codec),
            None => Err(ToastError::UnsupportedCompression { method: id }.into()),
        }
    }

    /// Compresses `payload` into an inline-compressed varlena.
    ///
    /// Codec errors surface as [`ToastError::CompressionFailed`]; callers
    /// that want "incompressible" semantics treat any error as `None`.
    pub fn compress(&self, payload: &[u8], method: CompressionMethod) -> Result<Option<Varlena>> {
        let codec = self.codec(method.id())?;
        let Some(data) = codec.compress(payload)? else {
            return Ok(None);
        };

        let compressed = Varlena::compressed(method, payload.len(), &data)?;
        if compressed.size_any() + 2 < payload.len() + VARHDRSZ {
            Ok(Some(compressed))
        } else {
            Ok(None)
        }
    }

    /// Decompresses an inline-compressed varlena into a plain one.
    pub fn decompress(&self, value: &Varlena) -> Result<Varlena> {
        let (id, raw_len, data) = compressed_parts(value)?;
        let codec = self.codec(id)?;
        let raw = codec.decompress(data, raw_len)?;
        if raw.len() != raw_len {
            return Err(ToastError::CompressionFailed {
                method: id,
                detail: format!("decompressed {} bytes, expected {}", raw.len(), raw_len),
            }
            .into());
        }
        Varlena::plain(&raw)
    }

    /// Decompresses the first `slice_len` payload bytes.
    ///
    /// Requests reaching the end of the value take the full path.
    pub fn decompress_slice(&self, value: &Varlena, slice_len: usize) -> Result<Varlena> {
        let (id, raw_len, data) = compressed_parts(value)?;
        if slice_len >= raw_len {
            return self.decompress(value);
        }
        let codec = self.codec(id)?;
        let mut raw = codec.decompress_slice(data, raw_len, slice_len)?;
        if raw.len() < slice_len {
            return Err(ToastError::CompressionFailed {
                method: id,
                detail: format!(
                    "compressed prefix yielded {} bytes, wanted {}",
                    raw.len(),
                    slice_len
                ),
            }
            .into());
        }
        raw.truncate(slice_len);
        Varlena::plain(&raw)
    }
}

fn compressed_parts(value: &Varlena) -> Result<(u8, usize, &[u8])> {
    if !value.is_compressed_inline() {
        bail!("value is not inline-compressed: {:?}", value.kind());
    }
    Ok((
        value.compression_method_id(),
        value.compressed_raw_size(),
        value.data(),
    ))
}

pub(crate) fn codec_failure(method: CompressionMethod, detail: impl fmt::Display) -> eyre::Report {
    ToastError::CompressionFailed {
        method: method.id(),
        detail: detail.to_string(),
    }
    .into()
}
