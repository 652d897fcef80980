//! Peer and circuit identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a network participant
///
/// In practice this is the 32-byte Ed25519 public key of the peer, but the
/// relay treats it as an opaque, comparable value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Wrap raw identifier bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes in hex, for log lines
    #[must_use]
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

/// Error parsing a [`PeerId`] from hex
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParsePeerIdError {
    /// Input was not valid hex
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Input decoded to the wrong number of bytes
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParsePeerIdError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

/// Unique token identifying one relayed circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit-{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let peer = PeerId::from_bytes(bytes);

        let parsed: PeerId = peer.to_string().parse().unwrap();
        assert_eq!(parsed, peer);
        assert_eq!(peer.fmt_short(), "ab00000000000000");
    }

    #[test]
    fn test_peer_id_parse_errors() {
        assert!(matches!(
            "zz".parse::<PeerId>(),
            Err(ParsePeerIdError::Hex(_))
        ));
        assert_eq!(
            "abcd".parse::<PeerId>(),
            Err(ParsePeerIdError::Length(2))
        );
    }

    #[test]
    fn test_circuit_id_display() {
        assert_eq!(CircuitId(0x2a).to_string(), "circuit-0000002a");
    }
}
