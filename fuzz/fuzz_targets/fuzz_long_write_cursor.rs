//! Fuzz target: `BatchCursor`
//!
//! Drives arbitrary take / rewind sequences over arbitrary payload and batch
//! sizes and checks that every range stays in bounds and that a full pass
//! from any rewind point reaches the end of the payload.
//!
//! cargo fuzz run fuzz_long_write_cursor

#![no_main]

use gattqueue::ops::BatchCursor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let len = u16::from_le_bytes([data[0], data[1]]) as usize;
    let batch_size = data[2] as usize;

    let Ok(mut cursor) = BatchCursor::new(len, batch_size) else {
        assert_eq!(batch_size, 0, "only a zero batch size is rejected");
        return;
    };

    for op in &data[3..] {
        if op & 0x80 == 0 {
            if let Some(range) = cursor.take() {
                assert!(range.start < range.end, "empty batch");
                assert!(range.end <= len, "batch past the payload");
                assert!(range.len() <= batch_size, "batch too long");
                assert_eq!(range.start % batch_size, 0, "batch not aligned");
            } else {
                assert_eq!(cursor.remaining(), 0);
            }
        } else {
            cursor.rewind_to((op & 0x7f) as usize);
            assert!(cursor.offset() <= len);
        }
    }

    // Whatever state we are in, draining reaches the end.
    let mut left = cursor.batch_count();
    while cursor.take().is_some() {
        assert!(left > 0, "more batches than the payload holds");
        left -= 1;
    }
    assert_eq!(cursor.remaining(), 0);
});
