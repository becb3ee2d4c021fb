//! Error kinds surfaced by the toast core.
//!
//! Every fallible API returns `eyre::Result`; failures that callers need to
//! tell apart carry a [`ToastError`] inside the report:
//!
//! ```ignore
//! match report.downcast_ref::<ToastError>() {
//!     Some(ToastError::DataCorrupt { value_id, .. }) => { /* ... */ }
//!     _ => { /* host or I/O failure */ }
//! }
//! ```

use crate::compression::CompressionMethod;
use crate::Oid;

/// Which consistency check a chunk read tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// A chunk arrived out of sequence.
    UnexpectedChunk,
    /// A chunk number lies outside the requested range.
    ChunkOutOfRange,
    /// A chunk carries the wrong number of bytes.
    ChunkSize,
    /// The scan ended before the last chunk.
    MissingChunk,
    /// A chunk is itself compressed or external.
    ToastedChunk,
}

impl CorruptionKind {
    fn describe(self) -> &'static str {
        match self {
            CorruptionKind::UnexpectedChunk => "unexpected chunk number",
            CorruptionKind::ChunkOutOfRange => "chunk number out of range",
            CorruptionKind::ChunkSize => "unexpected chunk size",
            CorruptionKind::MissingChunk => "missing chunk number",
            CorruptionKind::ToastedChunk => "found toasted toast chunk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToastError {
    /// `observed` / `expected` are chunk numbers, except for `ChunkSize`
    /// where they are byte counts.
    DataCorrupt {
        kind: CorruptionKind,
        value_id: Oid,
        observed: i64,
        expected: i64,
        relation: String,
    },
    UnsupportedCompression {
        method: u8,
    },
    CompressionFailed {
        method: u8,
        detail: String,
    },
    SizeOverflow {
        requested: usize,
        limit: usize,
    },
    NoSnapshot,
    BadSliceOffset {
        offset: i64,
    },
    Cancelled,
}

impl std::fmt::Display for ToastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToastError::DataCorrupt {
                kind,
                value_id,
                observed,
                expected,
                relation,
            } => write!(
                f,
                "{} {} (expected {}) for toast value {} in {}",
                kind.describe(),
                observed,
                expected,
                value_id,
                relation
            ),
            ToastError::UnsupportedCompression { method } => {
                write!(f, "compression method {} is not supported by this build", method)
            }
            ToastError::CompressionFailed { method, detail } => {
                match CompressionMethod::from_id(*method) {
                    Some(m) => write!(f, "{} codec failed: {}", m, detail),
                    None => write!(f, "codec {} failed: {}", method, detail),
                }
            }
            ToastError::SizeOverflow { requested, limit } => write!(
                f,
                "requested size {} exceeds the single allocation limit {}",
                requested, limit
            ),
            ToastError::NoSnapshot => {
                write!(f, "cannot fetch toast data without an active snapshot")
            }
            ToastError::BadSliceOffset { offset } => {
                write!(f, "invalid slice offset {}", offset)
            }
            ToastError::Cancelled => write!(f, "canceling statement due to user request"),
        }
    }
}

impl std::error::Error for ToastError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_relation_and_chunk() {
        let err = ToastError::DataCorrupt {
            kind: CorruptionKind::UnexpectedChunk,
            value_id: 16400,
            observed: 6,
            expected: 5,
            relation: "toast_16385".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("unexpected chunk number 6 (expected 5)"));
        assert!(msg.contains("16400"));
        assert!(msg.contains("toast_16385"));
    }

    #[test]
    fn test_downcast_through_report() {
        let report: eyre::Report = ToastError::Cancelled.into();
        assert_eq!(report.downcast_ref::<ToastError>(), Some(&ToastError::Cancelled));
    }
}
