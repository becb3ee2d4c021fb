//! # Storage Layout Constants
//!
//! This module centralizes every numeric constant that shapes the on-disk
//! format of toasted values. Constants that depend on each other are derived
//! here rather than hard-coded, and the derivations are checked at compile
//! time.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (24) + ITEM_ID_SIZE (4) per line pointer
//!       │
//!       ├─> TOAST_TUPLE_TARGET (derived: 4 tuples per page)
//!       │     Planner target for the data area of a main-table row.
//!       │
//!       ├─> TOAST_TUPLE_TARGET_MAIN (derived: 1 tuple per page)
//!       │     Relaxed target used only for MAIN columns in the last pass.
//!       │
//!       └─> EXTERN_TUPLE_MAX_SIZE (derived: 4 chunk rows per page)
//!             │
//!             └─> CHUNK_SIZE = EXTERN_TUPLE_MAX_SIZE
//!                              - MAXALIGN(TUPLE_HEADER_SIZE)
//!                              - sizeof(value_id) - sizeof(chunk_seq)
//!                              - VARHDRSZ
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `CHUNK_SIZE == 1996` for 8 KiB pages. Changing it, or anything it is
//!    derived from, is an on-disk format change: stored values would fail the
//!    chunk length checks on read.
//! 2. Four chunk rows (header + value_id + chunk_seq + payload) fit on one
//!    page.
//! 3. `TOAST_POINTER_SIZE` is the byte size of a legacy on-disk pointer datum
//!    (2-byte tag header + 16-byte payload).
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{CHUNK_SIZE, TOAST_TUPLE_TARGET};
//! ```

// ============================================================================
// PAGE LAYOUT
// ============================================================================

/// Size of a heap page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Page header preceding the line pointer array.
pub const PAGE_HEADER_SIZE: usize = 24;

/// One line pointer (item id) per tuple on the page.
pub const ITEM_ID_SIZE: usize = 4;

/// Strictest alignment any attribute may require.
pub const MAXIMUM_ALIGNOF: usize = 8;

/// Fixed part of a heap tuple header, before the nulls bitmap.
pub const TUPLE_HEADER_SIZE: usize = 23;

#[inline]
pub const fn maxalign(len: usize) -> usize {
    (len + MAXIMUM_ALIGNOF - 1) & !(MAXIMUM_ALIGNOF - 1)
}

#[inline]
pub const fn maxalign_down(len: usize) -> usize {
    len & !(MAXIMUM_ALIGNOF - 1)
}

/// Largest tuple size that still lets `tuples_per_page` tuples share a page.
pub const fn maximum_bytes_per_tuple(tuples_per_page: usize) -> usize {
    maxalign_down(
        (PAGE_SIZE - maxalign(PAGE_HEADER_SIZE + tuples_per_page * ITEM_ID_SIZE))
            / tuples_per_page,
    )
}

// ============================================================================
// VARLENA HEADERS
// ============================================================================

/// 4-byte varlena header.
pub const VARHDRSZ: usize = 4;

/// 1-byte varlena header.
pub const VARHDRSZ_SHORT: usize = 1;

/// Header of a tagged external datum (0x01 marker + vartag).
pub const VARHDRSZ_EXTERNAL: usize = 2;

/// Header of an inline-compressed datum with a legacy method code.
pub const VARHDRSZ_COMPRESSED: usize = 8;

/// Header of an inline-compressed datum carrying an explicit method byte.
pub const VARHDRSZ_COMPRESSED_EXTENDED: usize = 9;

/// Largest total length a 1-byte header can describe.
pub const VARATT_SHORT_MAX: usize = 0x7F;

/// Width of the length field in 4-byte headers and in `extinfo`/`tcinfo`.
pub const VARLENA_EXTSIZE_BITS: u32 = 30;

/// Mask selecting the length bits of `extinfo`/`tcinfo`.
pub const VARLENA_EXTSIZE_MASK: u32 = (1 << VARLENA_EXTSIZE_BITS) - 1;

/// Largest single allocation the pipeline will attempt (30-bit length).
pub const MAX_ALLOC_SIZE: usize = 0x3FFF_FFFF;

// ============================================================================
// TOAST POINTERS
// ============================================================================

/// Payload of a legacy on-disk pointer: rawsize, extinfo, value_id, relid.
pub const EXTERNAL_POINTER_PAYLOAD: usize = 16;

/// Payload of an extended on-disk pointer: legacy fields + method + 3 reserved.
pub const EXTERNAL_POINTER_EXTENDED_PAYLOAD: usize = 20;

/// Payload of an in-memory (indirect / expanded) pointer: one machine pointer.
pub const IN_MEMORY_POINTER_PAYLOAD: usize = 8;

/// Size of a legacy on-disk pointer datum.
pub const TOAST_POINTER_SIZE: usize = VARHDRSZ_EXTERNAL + EXTERNAL_POINTER_PAYLOAD;

/// Size of an extended on-disk pointer datum.
pub const TOAST_POINTER_SIZE_EXTENDED: usize =
    VARHDRSZ_EXTERNAL + EXTERNAL_POINTER_EXTENDED_PAYLOAD;

const _: () = assert!(TOAST_POINTER_SIZE == 18, "legacy pointer must stay 18 bytes");

// ============================================================================
// TOAST THRESHOLDS
// Per-page targets shared by the planner and the chunk store
// ============================================================================

/// Main-table rows are toasted until four of them fit on a page.
pub const TOAST_TUPLES_PER_PAGE: usize = 4;

/// Default `TARGET_PRIMARY`.
pub const TOAST_TUPLE_TARGET: usize = maximum_bytes_per_tuple(TOAST_TUPLES_PER_PAGE);

/// MAIN columns are only moved out when a single row no longer fits a page.
pub const TOAST_TUPLES_PER_PAGE_MAIN: usize = 1;

/// Default `TARGET_MAIN`.
pub const TOAST_TUPLE_TARGET_MAIN: usize = maximum_bytes_per_tuple(TOAST_TUPLES_PER_PAGE_MAIN);

/// Chunk rows per page in the chunk relation.
pub const EXTERN_TUPLES_PER_PAGE: usize = 4;

/// Largest chunk row, header included.
pub const EXTERN_TUPLE_MAX_SIZE: usize = maximum_bytes_per_tuple(EXTERN_TUPLES_PER_PAGE);

/// Payload bytes per chunk row.
pub const CHUNK_SIZE: usize = EXTERN_TUPLE_MAX_SIZE
    - maxalign(TUPLE_HEADER_SIZE)
    - std::mem::size_of::<u32>()
    - std::mem::size_of::<i32>()
    - VARHDRSZ;

const _: () = assert!(TOAST_TUPLE_TARGET == 2032, "TOAST_TUPLE_TARGET derivation mismatch");
const _: () = assert!(TOAST_TUPLE_TARGET_MAIN == 8160, "TOAST_TUPLE_TARGET_MAIN derivation mismatch");
const _: () = assert!(CHUNK_SIZE == 1996, "CHUNK_SIZE is an on-disk format constant");

const _: () = assert!(
    EXTERN_TUPLES_PER_PAGE
        * (maxalign(TUPLE_HEADER_SIZE) + 4 + 4 + VARHDRSZ + CHUNK_SIZE + ITEM_ID_SIZE)
        <= PAGE_SIZE - PAGE_HEADER_SIZE,
    "four chunk rows must fit on a page"
);

// ============================================================================
// OBJECT IDS
// ============================================================================

/// Value ids below this are never handed out by the id generator.
pub const FIRST_NORMAL_OBJECT_ID: u32 = 16384;

/// Largest number of attributes a tuple may carry (11-bit natts field).
pub const MAX_TUPLE_ATTRIBUTES: usize = 1600;
