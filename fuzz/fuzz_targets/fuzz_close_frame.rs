#![no_main]

use libfuzzer_sys::fuzz_target;
use wsocket::Message;

fuzz_target!(|data: &[u8]| {
    // Kind byte followed by the payload.
    let Some((&kind, payload)) = data.split_first() else {
        return;
    };
    let message = Message::from_raw(kind, payload.to_vec());

    if message.kind().is_ok() {
        let _ = message.close_frame();
    }
});
