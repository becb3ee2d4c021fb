//! lz4 block codec (method 1, "fast").
//!
//! Blocks carry no size prefix; the raw length comes from `tcinfo`. The
//! block format cannot be decoded partially, so slices decode the whole
//! block and let the registry truncate.

use eyre::Result;

use super::{codec_failure, Codec, CompressionMethod};

#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lz4
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(Some(lz4_flex::block::compress(input)))
    }

    fn decompress(&self, input: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(input, raw_len)
            .map_err(|e| codec_failure(CompressionMethod::Lz4, e))
    }

    fn decompress_slice(&self, input: &[u8], raw_len: usize, _slice_len: usize) -> Result<Vec<u8>> {
        self.decompress(input, raw_len)
    }
}
