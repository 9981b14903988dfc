#![no_main]

use libfuzzer_sys::fuzz_target;

use edgestash::proxy::fuzzing::parse_range;

fuzz_target!(|data: &[u8]| {
    let header = String::from_utf8_lossy(data);

    for total_size in [0u64, 1, 4096, u64::MAX] {
        if let Some(range) = parse_range(header.as_ref(), total_size) {
            assert!(range.start <= range.end);
            assert!(range.end < total_size);
            assert!(range.len() <= total_size);
        }
    }
});
