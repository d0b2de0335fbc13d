//! Fuzz harness for `PaxConfig::from_toml`.
//!
//! Arbitrary text must either parse into a configuration that validates and
//! survives a serialize/parse cycle, or be rejected with an error. Panics
//! are failures.

#![no_main]
use libfuzzer_sys::fuzz_target;
use pax_core::config::PaxConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = PaxConfig::from_toml(text) else {
        return;
    };
    assert!(config.validate().is_ok());
    if let Ok(rendered) = config.to_toml() {
        let reparsed = PaxConfig::from_toml(&rendered);
        assert!(reparsed.is_ok(), "rendered config failed to parse: {rendered}");
    }
});
