#![no_main]

use libfuzzer_sys::fuzz_target;
use partimg::ext4::Ext4Volume;
use partimg::Walk;

fuzz_target!(|data: &[u8]| {
    let Ok(mut volume) = Ext4Volume::open(std::io::Cursor::new(data)) else {
        return;
    };
    for record in Walk::new(&mut volume).take(4096) {
        if record.is_err() {
            break;
        }
    }
});
