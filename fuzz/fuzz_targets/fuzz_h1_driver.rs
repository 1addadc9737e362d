#![no_main]

use libfuzzer_sys::fuzz_target;
use rask_core::driver::Driver;
use rask_core::parser::h1::H1Driver;

// Feeds arbitrary bytes in two chunks to exercise the driver's
// AwaitingHead/StreamingBody split across a short read, the same boundary
// a real socket read would impose.
fuzz_target!(|data: &[u8]| {
    let mut driver = H1Driver::new();
    let mid = data.len() / 2;
    let _ = driver.feed(&data[..mid]);
    let _ = driver.feed(&data[mid..]);
});
