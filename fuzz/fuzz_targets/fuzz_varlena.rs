//! Fuzz testing for varlena and external pointer parsing.
//!
//! Arbitrary buffers are parsed as varlena values. Anything accepted must
//! answer its size and shape queries without panicking, and external
//! pointers must survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;

use turtoast::varlena::header;
use turtoast::{CompressionRegistry, Varlena, VarlenaKind};

fuzz_target!(|data: &[u8]| {
    let _ = header::size_any(data);

    let Ok(value) = Varlena::from_bytes(data.to_vec()) else {
        return;
    };
    assert_eq!(value.size_any(), data.len());
    let _ = value.data();
    let _ = value.raw_size();
    let _ = value.stored_size();

    match value.kind() {
        VarlenaKind::External(_) => {
            if let Ok(ptr) = value.external_pointer() {
                let _ = ptr.is_compressed();
                let reparsed = Varlena::external(&ptr)
                    .external_pointer()
                    .expect("encoded pointer must parse");
                assert_eq!(reparsed.value_id, ptr.value_id);
                assert_eq!(reparsed.chunk_relid, ptr.chunk_relid);
                assert_eq!(reparsed.ext_size, ptr.ext_size);
            }
        }
        VarlenaKind::CompressedInline => {
            let _ = CompressionRegistry::builtin().decompress(&value);
            let _ = CompressionRegistry::builtin().decompress_slice(&value, 8);
        }
        VarlenaKind::Short | VarlenaKind::Plain => {
            let _ = value.to_plain();
        }
    }
});
