#![no_main]

use libfuzzer_sys::fuzz_target;
use warden::config::SafetyConfig;
use warden::safety::{Direction, SafetyScreener};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let screener = SafetyScreener::new(SafetyConfig::default());
        let findings = screener.scan(text, Direction::Input);
        for finding in &findings {
            assert!(finding.span.end <= text.len());
        }
        let once = warden::safety::redact(text, &findings);
        let _ = screener.scan(&once, Direction::Output);
    }
});
