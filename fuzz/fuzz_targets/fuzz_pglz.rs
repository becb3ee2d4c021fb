//! Fuzz testing for the pglz codec.
//!
//! Arbitrary byte streams are fed to the decompressor, which must reject
//! malformed input with an error instead of panicking. Inputs that do
//! compress must decompress back to themselves, in full and as a prefix.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use turtoast::compression::pglz::{self, Strategy};

#[derive(Debug, Arbitrary)]
struct PglzInput {
    stream: Vec<u8>,
    raw_len: u16,
    check_complete: bool,
    payload: Vec<u8>,
    prefix: u16,
}

fuzz_target!(|input: PglzInput| {
    let _ = pglz::decompress(&input.stream, input.raw_len as usize, input.check_complete);

    if let Some(compressed) = pglz::compress(&input.payload, &Strategy::ALWAYS) {
        let raw = pglz::decompress(&compressed, input.payload.len(), true)
            .expect("compressed stream must decode");
        assert_eq!(raw, input.payload);

        let prefix = (input.prefix as usize).min(input.payload.len());
        let needed = pglz::maximum_compressed_size(prefix, compressed.len());
        let head = pglz::decompress(&compressed[..needed], prefix, false)
            .expect("bounded prefix must decode");
        assert_eq!(&head[..prefix], &input.payload[..prefix]);
    }
});
