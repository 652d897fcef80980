//! Fuzz test for peer id parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_core::PeerId;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(peer) = s.parse::<PeerId>() {
            let printed = peer.to_string();
            assert_eq!(printed.parse::<PeerId>().ok(), Some(peer));
        }
    }

    if let Ok(bytes) = <[u8; 32]>::try_from(data) {
        let peer = PeerId::from_bytes(bytes);
        assert_eq!(peer.as_bytes(), &bytes);
        assert!(!peer.fmt_short().is_empty());
    }
});
