//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must parse into a `Config` or fail, and validation of a
//! parsed config must not panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_core::LimitPolicy;
use relay_node::config::Config;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<Config>(s) {
            let _ = config.validate();
            let _ = config.network.socket_addrs();
        }

        if let Ok(policy) = toml::from_str::<LimitPolicy>(s) {
            let _ = policy.validate();
            let _ = policy.circuit_caps();
        }
    }
});
