//! zstd codec (method 2, "high").
//!
//! Whole values go through the bulk API. Slices stream-decode just enough
//! frames to fill the requested prefix.

use std::io::Read;

use eyre::Result;

use super::{codec_failure, Codec, CompressionMethod};

pub const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        ::zstd::bulk::compress(input, COMPRESSION_LEVEL)
            .map(Some)
            .map_err(|e| codec_failure(CompressionMethod::Zstd, e))
    }

    fn decompress(&self, input: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        ::zstd::bulk::decompress(input, raw_len)
            .map_err(|e| codec_failure(CompressionMethod::Zstd, e))
    }

    fn decompress_slice(&self, input: &[u8], raw_len: usize, slice_len: usize) -> Result<Vec<u8>> {
        let mut decoder = ::zstd::stream::read::Decoder::new(input)
            .map_err(|e| codec_failure(CompressionMethod::Zstd, e))?;
        let mut out = vec![0u8; slice_len.min(raw_len)];
        decoder
            .read_exact(&mut out)
            .map_err(|e| codec_failure(CompressionMethod::Zstd, e))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_stops_early() {
        let codec = ZstdCodec;
        let input: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = codec.compress(&input).unwrap().unwrap();
        let prefix = codec.decompress_slice(&compressed, input.len(), 300).unwrap();
        assert_eq!(prefix, &input[..300]);
    }

    #[test]
    fn test_garbage_reports_failure() {
        let codec = ZstdCodec;
        assert!(codec.decompress(b"definitely not zstd", 100).is_err());
    }
}
