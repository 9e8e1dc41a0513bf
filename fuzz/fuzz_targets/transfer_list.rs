#![no_main]

use libfuzzer_sys::fuzz_target;
use partimg::pipeline::transfer_list::TransferList;

fuzz_target!(|data: (String, Vec<u8>)| {
    let (list, payload) = data;
    let Ok(list) = TransferList::parse(&list) else {
        return;
    };
    if list.max_block() > 2048 {
        return;
    }
    let mut output = std::io::Cursor::new(vec![]);
    let _ = list.replay(payload.as_slice(), &mut output);
});
