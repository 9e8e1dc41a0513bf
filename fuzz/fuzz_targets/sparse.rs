#![no_main]

use libfuzzer_sys::fuzz_target;
use partimg::sparse::{peek, unsparse, SparseHeader};

fuzz_target!(|data: &[u8]| {
    // skip headers claiming more than a few MiB of output
    if let Ok(header) = SparseHeader::from_reader(data) {
        if header.image_len() > 8 * 1024 * 1024 {
            return;
        }
    }
    let mut output = std::io::Cursor::new(vec![]);
    let _ = unsparse(data, &mut output);
    let _ = peek(data, 0x1000);
});
