//! # pglz Codec
//!
//! LZ77-family codec used as the always-available legacy method. The stream
//! is a sequence of groups, each introduced by a control byte whose bits
//! (LSB first) say whether the next item is a literal byte or a match tag.
//!
//! ## Match Tags
//!
//! ```text
//! 2-byte form (len 3..=17):   [off_hi:4 | len-3:4] [off_lo:8]
//! 3-byte form (len 18..=273): [off_hi:4 | 0xF]     [off_lo:8] [len-18:8]
//! ```
//!
//! Offsets are 12 bits and count back from the current output position.
//! A tag may overlap its own output (offset smaller than length), which is
//! how runs are encoded.
//!
//! ## History
//!
//! The compressor keeps hashed history lists over the last 4096 input
//! positions. The hash table size scales with the input (512 to 8192
//! buckets). Entry 0 of the entry table is a sentinel and is never a valid
//! list member.
//!
//! ## Strategy
//!
//! | Field            | DEFAULT  | ALWAYS   |
//! |------------------|----------|----------|
//! | min_input_size   | 32       | 0        |
//! | max_input_size   | i32::MAX | i32::MAX |
//! | min_comp_rate    | 25 %     | 0 %      |
//! | first_success_by | 1024     | i32::MAX |
//! | match_size_good  | 128      | 128      |
//! | match_size_drop  | 10 %     | 6 %      |

use eyre::Result;

use super::{codec_failure, Codec, CompressionMethod};

const MAX_HISTORY_LISTS: usize = 8192;
const HISTORY_SIZE: usize = 4096;
const MAX_MATCH: usize = 273;
const MAX_OFFSET: usize = 0x0fff;

const _: () = assert!(MAX_HISTORY_LISTS.is_power_of_two());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub min_input_size: i32,
    pub max_input_size: i32,
    pub min_comp_rate: i32,
    pub first_success_by: i32,
    pub match_size_good: i32,
    pub match_size_drop: i32,
}

impl Strategy {
    pub const DEFAULT: Strategy = Strategy {
        min_input_size: 32,
        max_input_size: i32::MAX,
        min_comp_rate: 25,
        first_success_by: 1024,
        match_size_good: 128,
        match_size_drop: 10,
    };

    pub const ALWAYS: Strategy = Strategy {
        min_input_size: 0,
        max_input_size: i32::MAX,
        min_comp_rate: 0,
        first_success_by: i32::MAX,
        match_size_good: 128,
        match_size_drop: 6,
    };
}

#[derive(Debug, Clone, Copy, Default)]
struct HistEntry {
    next: u16,
    prev: u16,
    hindex: usize,
    pos: usize,
}

struct History {
    start: Vec<u16>,
    entries: Vec<HistEntry>,
    next: usize,
    recycle: bool,
    mask: usize,
}

impl History {
    fn new(input_len: usize) -> Self {
        let buckets = match input_len {
            0..=127 => 512,
            128..=255 => 1024,
            256..=511 => 2048,
            512..=1023 => 4096,
            _ => MAX_HISTORY_LISTS,
        };
        Self {
            start: vec![0; buckets],
            entries: vec![HistEntry::default(); HISTORY_SIZE + 1],
            next: 1,
            recycle: false,
            mask: buckets - 1,
        }
    }

    // Bytes are hashed as signed chars so bucket choice matches other
    // implementations of this format.
    #[inline]
    fn index(&self, input: &[u8], pos: usize) -> usize {
        let s = &input[pos..];
        let h = if s.len() < 4 {
            s[0] as i8 as i32
        } else {
            ((s[0] as i8 as i32) << 6)
                ^ ((s[1] as i8 as i32) << 4)
                ^ ((s[2] as i8 as i32) << 2)
                ^ (s[3] as i8 as i32)
        };
        (h as usize) & self.mask
    }

    fn add(&mut self, input: &[u8], pos: usize) {
        let hindex = self.index(input, pos);
        let hn = self.next;

        if self.recycle {
            let old = self.entries[hn];
            if old.prev == 0 {
                self.start[old.hindex] = old.next;
            } else {
                self.entries[old.prev as usize].next = old.next;
            }
            if old.next != 0 {
                self.entries[old.next as usize].prev = old.prev;
            }
        }

        let head = self.start[hindex];
        self.entries[hn] = HistEntry {
            next: head,
            prev: 0,
            hindex,
            pos,
        };
        // entry 0 is the sentinel, writing its prev is harmless
        self.entries[head as usize].prev = hn as u16;
        self.start[hindex] = hn as u16;

        self.next += 1;
        if self.next >= HISTORY_SIZE + 1 {
            self.next = 1;
            self.recycle = true;
        }
    }

    fn find_match(
        &self,
        input: &[u8],
        pos: usize,
        mut good_match: usize,
        good_drop: usize,
    ) -> Option<(usize, usize)> {
        let end = input.len();
        let mut len = 0usize;
        let mut off = 0usize;

        let mut hentno = self.start[self.index(input, pos)];
        while hentno != 0 {
            let hent = self.entries[hentno as usize];
            let thisoff = pos - hent.pos;
            if thisoff >= MAX_OFFSET {
                break;
            }

            let mut thislen = 0usize;
            let (mut ip, mut hp) = (pos, hent.pos);
            if len >= 16 {
                if ip + len <= end && input[ip..ip + len] == input[hp..hp + len] {
                    thislen = len;
                    ip += len;
                    hp += len;
                    while ip < end && input[ip] == input[hp] && thislen < MAX_MATCH {
                        thislen += 1;
                        ip += 1;
                        hp += 1;
                    }
                }
            } else {
                while ip < end && input[ip] == input[hp] && thislen < MAX_MATCH {
                    thislen += 1;
                    ip += 1;
                    hp += 1;
                }
            }

            if thislen > len {
                len = thislen;
                off = thisoff;
            }

            hentno = hent.next;
            if hentno != 0 {
                if len >= good_match {
                    break;
                }
                good_match -= (good_match * good_drop) / 100;
            }
        }

        (len > 2).then_some((len, off))
    }
}

/// Control-byte bookkeeping for the output stream.
struct Emitter {
    out: Vec<u8>,
    ctrl_pos: Option<usize>,
    ctrl_byte: u8,
    ctrl_bit: u8,
}

impl Emitter {
    fn with_capacity(cap: usize) -> Self {
        Self {
            out: Vec::with_capacity(cap),
            ctrl_pos: None,
            ctrl_byte: 0,
            ctrl_bit: 0,
        }
    }

    #[inline]
    fn next_item(&mut self) {
        if self.ctrl_bit == 0 {
            if let Some(p) = self.ctrl_pos {
                self.out[p] = self.ctrl_byte;
            }
            self.ctrl_pos = Some(self.out.len());
            self.out.push(0);
            self.ctrl_byte = 0;
            self.ctrl_bit = 1;
        }
    }

    fn literal(&mut self, byte: u8) {
        self.next_item();
        self.out.push(byte);
        self.ctrl_bit <<= 1;
    }

    fn tag(&mut self, len: usize, off: usize) {
        self.next_item();
        self.ctrl_byte |= self.ctrl_bit;
        self.ctrl_bit <<= 1;
        let off_hi = ((off & 0xf00) >> 4) as u8;
        if len > 17 {
            self.out.push(off_hi | 0x0f);
            self.out.push((off & 0xff) as u8);
            self.out.push((len - 18) as u8);
        } else {
            self.out.push(off_hi | (len - 3) as u8);
            self.out.push((off & 0xff) as u8);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if let Some(p) = self.ctrl_pos {
            self.out[p] = self.ctrl_byte;
        }
        self.out
    }
}

/// Compresses `input` under `strategy`. Returns `None` when the strategy
/// rejects the input or the required compression rate is not reached.
pub fn compress(input: &[u8], strategy: &Strategy) -> Option<Vec<u8>> {
    let slen = input.len();
    if strategy.match_size_good <= 0
        || slen < strategy.min_input_size.max(0) as usize
        || slen > strategy.max_input_size.max(0) as usize
    {
        return None;
    }

    let good_match = (strategy.match_size_good as usize).clamp(17, MAX_MATCH);
    let good_drop = strategy.match_size_drop.clamp(0, 100) as usize;
    let need_rate = strategy.min_comp_rate.clamp(0, 99) as usize;
    let first_success_by = strategy.first_success_by.max(0) as usize;

    let result_max = if slen > i32::MAX as usize / 100 {
        (slen / 100) * (100 - need_rate)
    } else {
        (slen * (100 - need_rate)) / 100
    };

    let mut hist = History::new(slen);
    let mut em = Emitter::with_capacity(slen + 4);
    let mut found_match = false;
    let mut dp = 0usize;

    while dp < slen {
        if em.out.len() >= result_max {
            return None;
        }
        if !found_match && em.out.len() >= first_success_by {
            return None;
        }

        match hist.find_match(input, dp, good_match, good_drop) {
            Some((len, off)) => {
                em.tag(len, off);
                for _ in 0..len {
                    hist.add(input, dp);
                    dp += 1;
                }
                found_match = true;
            }
            None => {
                em.literal(input[dp]);
                hist.add(input, dp);
                dp += 1;
            }
        }
    }

    let out = em.finish();
    (out.len() < result_max).then_some(out)
}

/// Decompresses up to `raw_len` bytes from `source`.
///
/// With `check_complete` the whole source must be consumed and exactly
/// `raw_len` bytes produced; without it `source` may be a prefix of a longer
/// stream and fewer bytes may come back.
pub fn decompress(source: &[u8], raw_len: usize, check_complete: bool) -> Result<Vec<u8>> {
    let corrupt = |what: &str| codec_failure(CompressionMethod::Pglz, what);
    let mut out: Vec<u8> = Vec::with_capacity(raw_len);
    let mut sp = 0usize;

    while sp < source.len() && out.len() < raw_len {
        let mut ctrl = source[sp];
        sp += 1;

        let mut items = 0;
        while items < 8 && sp < source.len() && out.len() < raw_len {
            if ctrl & 1 == 1 {
                if sp + 2 > source.len() {
                    return Err(corrupt("match tag runs past end of input"));
                }
                let mut len = (source[sp] & 0x0f) as usize + 3;
                let mut off = (((source[sp] & 0xf0) as usize) << 4) | source[sp + 1] as usize;
                sp += 2;
                if len == 18 {
                    if sp >= source.len() {
                        return Err(corrupt("match length byte missing"));
                    }
                    len += source[sp] as usize;
                    sp += 1;
                }
                if off == 0 || off > out.len() {
                    return Err(corrupt("match offset out of range"));
                }

                len = len.min(raw_len - out.len());
                let from = out.len() - off;
                while off < len {
                    out.extend_from_within(from..from + off);
                    len -= off;
                    off += off;
                }
                out.extend_from_within(from..from + len);
            } else {
                out.push(source[sp]);
                sp += 1;
            }
            ctrl >>= 1;
            items += 1;
        }
    }

    if check_complete && (out.len() != raw_len || sp != source.len()) {
        return Err(corrupt("compressed data is corrupt"));
    }
    Ok(out)
}

/// Upper bound on compressed bytes needed to produce `raw_len` output bytes,
/// capped at `total_compressed`.
///
/// Every literal costs 9 bits, and a prefix may end inside a 2 or 3 byte
/// tag, hence the `+ 2`.
pub fn maximum_compressed_size(raw_len: usize, total_compressed: usize) -> usize {
    let bound = (raw_len as u64 * 9 + 7) / 8 + 2;
    bound.min(total_compressed as u64) as usize
}

#[derive(Debug, Clone, Copy)]
pub struct PglzCodec {
    strategy: Strategy,
}

impl PglzCodec {
    pub const fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }
}

impl Codec for PglzCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Pglz
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(compress(input, &self.strategy))
    }

    fn decompress(&self, input: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        decompress(input, raw_len, true)
    }

    fn decompress_slice(&self, input: &[u8], raw_len: usize, slice_len: usize) -> Result<Vec<u8>> {
        decompress(input, slice_len.min(raw_len), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toast::ToastError;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    #[test]
    fn test_run_compresses_to_a_few_bytes() {
        let input: Vec<u8> = b"AB".iter().copied().cycle().take(2000).collect();
        let out = compress(&input, &Strategy::DEFAULT).unwrap();
        assert!(out.len() <= 30, "got {} bytes", out.len());
        assert_eq!(decompress(&out, input.len(), true).unwrap(), input);
    }

    #[test]
    fn test_overlapping_tag_doubles_offset() {
        let input = b"112341234123412341234".repeat(4);
        let out = compress(&input, &Strategy::ALWAYS).unwrap();
        assert_eq!(decompress(&out, input.len(), true).unwrap(), input);
    }

    #[test]
    fn test_random_input_is_declined() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut input = vec![0u8; 4096];
        rng.fill_bytes(&mut input);
        assert!(compress(&input, &Strategy::DEFAULT).is_none());
    }

    #[test]
    fn test_below_min_input_size() {
        let input = [b'a'; 31];
        assert!(compress(&input, &Strategy::DEFAULT).is_none());
        assert!(compress(&input, &Strategy::ALWAYS).is_some());
    }

    #[test]
    fn test_long_history_wraps() {
        // more than HISTORY_SIZE positions so entries get recycled
        let mut rng = StdRng::seed_from_u64(11);
        let mut block = vec![0u8; 64];
        rng.fill_bytes(&mut block);
        let input: Vec<u8> = block.iter().copied().cycle().take(20_000).collect();
        let out = compress(&input, &Strategy::DEFAULT).unwrap();
        assert_eq!(decompress(&out, input.len(), true).unwrap(), input);
    }

    #[test]
    fn test_prefix_decode_from_truncated_stream() {
        let input: Vec<u8> = b"XYZ".iter().copied().cycle().take(100_000).collect();
        let out = compress(&input, &Strategy::DEFAULT).unwrap();
        let need = maximum_compressed_size(10, out.len());
        assert_eq!(need, 14);
        let prefix = decompress(&out[..need], 10, false).unwrap();
        assert_eq!(prefix, b"XYZXYZXYZX");
    }

    #[test]
    fn test_zero_offset_is_corrupt() {
        // control byte says "tag", tag encodes offset 0
        let err = decompress(&[0x01, 0x00, 0x00], 10, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToastError>(),
            Some(ToastError::CompressionFailed { method: 0, .. })
        ));
    }

    #[test]
    fn test_incomplete_stream_detected() {
        let input: Vec<u8> = b"hello world ".iter().copied().cycle().take(600).collect();
        let out = compress(&input, &Strategy::DEFAULT).unwrap();
        assert!(decompress(&out[..out.len() - 1], input.len(), true).is_err());
        assert!(decompress(&out, input.len() + 1, true).is_err());
    }

    #[test]
    fn test_maximum_compressed_size_caps_at_total() {
        assert_eq!(maximum_compressed_size(8, 100), 11);
        assert_eq!(maximum_compressed_size(1000, 100), 100);
    }
}
