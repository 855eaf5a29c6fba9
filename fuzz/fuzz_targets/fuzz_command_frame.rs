#![no_main]

use libfuzzer_sys::fuzz_target;
use logo_wialon_gateway::telemetry::{parse_command_frame, Command};

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    if let Ok(Command::Message { kind, value }) = parse_command_frame(&line) {
        // Fields never carry the separator.
        assert!(!kind.contains('#'));
        assert!(!value.contains('#'));
    }
});
