#![no_main]

use libfuzzer_sys::fuzz_target;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = warden::config::parse_config(s, Path::new("warden.yaml"));
        let _ = warden::config::parse_config(s, Path::new("warden.toml"));
    }
});
