//! # Configuration
//!
//! Compile-time layout constants live in [`constants`]; they define the
//! on-disk format and are checked against each other with const assertions.
//!
//! Per-relation runtime knobs (tuple target, default compression method) are
//! carried by [`ToastOptions`], built with [`ToastOptions::builder`].

pub mod constants;
pub use constants::*;

use crate::compression::CompressionMethod;

/// Per-relation toast settings.
///
/// | Option               | Default                    |
/// |----------------------|----------------------------|
/// | tuple_target         | `TOAST_TUPLE_TARGET` (2032)|
/// | tuple_target_main    | `TOAST_TUPLE_TARGET_MAIN`  |
/// | compression          | `CompressionMethod::Pglz`  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToastOptions {
    tuple_target: usize,
    tuple_target_main: usize,
    compression: CompressionMethod,
}

impl Default for ToastOptions {
    fn default() -> Self {
        Self {
            tuple_target: TOAST_TUPLE_TARGET,
            tuple_target_main: TOAST_TUPLE_TARGET_MAIN,
            compression: CompressionMethod::Pglz,
        }
    }
}

impl ToastOptions {
    pub fn builder() -> ToastOptionsBuilder {
        ToastOptionsBuilder {
            options: Self::default(),
        }
    }

    /// `TARGET_PRIMARY`: whole-tuple size the first three passes aim for.
    pub fn tuple_target(&self) -> usize {
        self.tuple_target
    }

    /// `TARGET_MAIN`: relaxed size used by the last pass.
    pub fn tuple_target_main(&self) -> usize {
        self.tuple_target_main
    }

    /// Method used for columns that do not name one.
    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }
}

#[derive(Debug, Clone)]
pub struct ToastOptionsBuilder {
    options: ToastOptions,
}

impl ToastOptionsBuilder {
    pub fn tuple_target(mut self, bytes: usize) -> Self {
        self.options.tuple_target = bytes;
        self
    }

    pub fn tuple_target_main(mut self, bytes: usize) -> Self {
        self.options.tuple_target_main = bytes;
        self
    }

    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.options.compression = method;
        self
    }

    pub fn build(self) -> ToastOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_page_layout() {
        let opts = ToastOptions::default();
        assert_eq!(opts.tuple_target(), TOAST_TUPLE_TARGET);
        assert_eq!(opts.tuple_target_main(), TOAST_TUPLE_TARGET_MAIN);
        assert_eq!(opts.compression(), CompressionMethod::Pglz);
    }

    #[test]
    fn test_builder_overrides() {
        let opts = ToastOptions::builder()
            .tuple_target(256)
            .compression("high".parse().unwrap())
            .build();
        assert_eq!(opts.tuple_target(), 256);
        assert_eq!(opts.compression(), CompressionMethod::Zstd);
    }
}
