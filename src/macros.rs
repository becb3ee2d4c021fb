//! # Internal Macros
//!
//! Boilerplate reduction for the zerocopy structs that describe on-disk
//! layouts (external pointer payloads, tuple headers).
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for fields stored with the
//! little-endian wrapper types (`U16`, `U32`, `I32`). The struct itself stays
//! `Unaligned`, so it can be copied out of a 1-byte aligned tuple slice.
//!
//! ```ignore
//! use zerocopy::little_endian::{I32, U32};
//!
//! #[repr(C)]
//! struct Payload {
//!     rawsize: I32,
//!     value_id: U32,
//! }
//!
//! impl Payload {
//!     zerocopy_accessors! {
//!         rawsize: i32,
//!         value_id: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn rawsize(&self) -> i32 { self.rawsize.get() }
//! // pub fn set_rawsize(&mut self, val: i32) { self.rawsize = I32::new(val); }
//! // pub fn value_id(&self) -> u32 { self.value_id.get() }
//! // pub fn set_value_id(&mut self, val: u32) { self.value_id = U32::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, i32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i32) {
                self.$field = ::zerocopy::little_endian::I32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
