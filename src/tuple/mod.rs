//! # Tuple Model
//!
//! Rows are described by a [`TupleDesc`] (one [`Attribute`] per column) and
//! carried either deformed, as `Vec<Option<Datum>>` with `None` for SQL
//! null, or formed into a [`HeapTuple`] byte image.
//!
//! ## Storage Strategies
//!
//! | Strategy | Code | Compress inline | Move out of line          |
//! |----------|------|-----------------|---------------------------|
//! | Plain    | `p`  | no              | no                        |
//! | Extended | `x`  | yes             | yes                       |
//! | External | `e`  | no              | yes                       |
//! | Main     | `m`  | yes             | only as a last resort     |
//!
//! Fixed-width columns are always `Plain`.

pub mod heap;

use std::fmt;

use eyre::{ensure, Result};

use crate::compression::CompressionMethod;
use crate::config::MAX_TUPLE_ATTRIBUTES;
use crate::varlena::Varlena;

pub use heap::{HeapTuple, TupleHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageStrategy {
    Plain,
    Extended,
    External,
    Main,
}

impl StorageStrategy {
    pub fn code(self) -> char {
        match self {
            StorageStrategy::Plain => 'p',
            StorageStrategy::Extended => 'x',
            StorageStrategy::External => 'e',
            StorageStrategy::Main => 'm',
        }
    }
}

/// Alignment requirement of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Align {
    Char = 1,
    Short = 2,
    Int = 4,
    Double = 8,
}

impl Align {
    #[inline]
    pub fn apply(self, off: usize) -> usize {
        let a = self as usize;
        (off + a - 1) & !(a - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttLen {
    Fixed(u16),
    Varlena,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub len: AttLen,
    pub align: Align,
    pub storage: StorageStrategy,
    /// Method used when this column is compressed; `None` means the
    /// relation default.
    pub compression: Option<CompressionMethod>,
}

impl Attribute {
    /// A variable-length column (text / bytea style, int-aligned).
    pub fn varlena(name: impl Into<String>, storage: StorageStrategy) -> Self {
        Self {
            name: name.into(),
            len: AttLen::Varlena,
            align: Align::Int,
            storage,
            compression: None,
        }
    }

    pub fn fixed(name: impl Into<String>, len: u16, align: Align) -> Self {
        Self {
            name: name.into(),
            len: AttLen::Fixed(len),
            align,
            storage: StorageStrategy::Plain,
            compression: None,
        }
    }

    pub fn int4(name: impl Into<String>) -> Self {
        Self::fixed(name, 4, Align::Int)
    }

    pub fn int8(name: impl Into<String>) -> Self {
        Self::fixed(name, 8, Align::Double)
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = Some(method);
        self
    }

    pub fn is_varlena(&self) -> bool {
        self.len == AttLen::Varlena
    }

    /// Varlena columns that may be stored with a 1-byte header.
    pub fn is_packable(&self) -> bool {
        self.is_varlena() && self.storage != StorageStrategy::Plain
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    attrs: Vec<Attribute>,
}

impl TupleDesc {
    pub fn new(attrs: Vec<Attribute>) -> Result<Self> {
        ensure!(
            attrs.len() <= MAX_TUPLE_ATTRIBUTES,
            "tables can have at most {} columns",
            MAX_TUPLE_ATTRIBUTES
        );
        for attr in &attrs {
            ensure!(
                attr.is_varlena() || attr.storage == StorageStrategy::Plain,
                "fixed-width column '{}' must use plain storage",
                attr.name
            );
        }
        Ok(Self { attrs })
    }

    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn attr(&self, i: usize) -> &Attribute {
        &self.attrs[i]
    }

    pub fn natts(&self) -> usize {
        self.attrs.len()
    }
}

/// One column value.
#[derive(Debug, Clone)]
pub enum Datum {
    /// Little-endian bytes of a fixed-width value.
    Fixed(Vec<u8>),
    Varlena(Varlena),
}

impl Datum {
    pub fn int4(v: i32) -> Self {
        Datum::Fixed(v.to_le_bytes().to_vec())
    }

    pub fn int8(v: i64) -> Self {
        Datum::Fixed(v.to_le_bytes().to_vec())
    }

    /// A plain varlena holding `payload`.
    pub fn bytes(payload: &[u8]) -> Result<Self> {
        Ok(Datum::Varlena(Varlena::plain(payload)?))
    }

    pub fn as_varlena(&self) -> Option<&Varlena> {
        match self {
            Datum::Varlena(v) => Some(v),
            Datum::Fixed(_) => None,
        }
    }

    pub fn as_int4(&self) -> Option<i32> {
        match self {
            Datum::Fixed(b) if b.len() == 4 => Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            _ => None,
        }
    }
}

impl From<Varlena> for Datum {
    fn from(v: Varlena) -> Self {
        Datum::Varlena(v)
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_columns_must_be_plain() {
        let mut bad = Attribute::int4("id");
        bad.storage = StorageStrategy::Main;
        assert!(TupleDesc::new(vec![bad]).is_err());
        assert!(TupleDesc::new(vec![Attribute::int4("id")]).is_ok());
    }

    #[test]
    fn test_packable() {
        assert!(Attribute::varlena("t", StorageStrategy::Extended).is_packable());
        assert!(!Attribute::varlena("t", StorageStrategy::Plain).is_packable());
        assert!(!Attribute::int4("i").is_packable());
    }

    #[test]
    fn test_align() {
        assert_eq!(Align::Int.apply(5), 8);
        assert_eq!(Align::Double.apply(8), 8);
        assert_eq!(Align::Char.apply(5), 5);
    }
}
