//! Relay control protocol message definitions and framing.
//!
//! Every control message is a `bincode` encoded enum preceded by its length
//! as a 4-byte big-endian integer. Once a circuit is `Connected` the same
//! stream stops carrying frames and carries relayed bytes instead, so frames
//! are read straight from the socket without read-ahead buffering.
//!
//! Every connection opens with a handshake:
//!
//! ```text
//! Hello { peer }           ──▶
//!                          ◀──  Welcome { nonce }
//! Authenticate { sig }     ──▶
//!                          ◀──  Authenticated | Rejected { AuthenticationFailed }
//! ```

use crate::error::{NodeError, Result};
use crate::identity::NONCE_LEN;
use relay_core::{CircuitId, CircuitLimits, PeerId, Status};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control protocol version
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum encoded frame length in bytes
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Circuit limits on the wire; `None` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireLimits {
    /// Duration limit in whole seconds
    pub duration_secs: Option<u64>,
    /// Byte limit
    pub bytes: Option<u64>,
}

impl From<CircuitLimits> for WireLimits {
    fn from(limits: CircuitLimits) -> Self {
        Self {
            duration_secs: limits.duration.get().map(|d| d.as_secs()),
            bytes: limits.bytes.get(),
        }
    }
}

impl From<WireLimits> for CircuitLimits {
    fn from(limits: WireLimits) -> Self {
        Self {
            duration: limits.duration_secs.map(Duration::from_secs).into(),
            bytes: limits.bytes.into(),
        }
    }
}

/// Messages sent by peers to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Opens every connection
    Hello {
        /// Sender's peer id
        peer: PeerId,
        /// Free-form software identifier
        agent: String,
    },

    /// Proof of ownership of the id claimed in `Hello`
    Authenticate {
        /// Ed25519 signature over the `Welcome` nonce
        signature: Vec<u8>,
    },

    /// Ask to be reachable through the relay
    Reserve {
        /// Sender believes it already holds a reservation
        renewal: bool,
    },

    /// Ask to be connected to a reserved peer
    Connect {
        /// Reserved peer to dial
        destination: PeerId,
        /// Requested limits
        limits: WireLimits,
    },

    /// Destination picks up an incoming circuit on a fresh connection
    Accept {
        /// Circuit announced by `Incoming`
        circuit: CircuitId,
    },

    /// Liveness check
    Ping {
        /// Echoed by `Pong`
        nonce: u64,
    },
}

/// Messages sent by the relay to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Answer to `Hello`
    Welcome {
        /// Relay's peer id
        relay: PeerId,
        /// Relay's software identifier
        agent: String,
        /// Sender's address as seen by the relay
        observed_addr: SocketAddr,
        /// Protocol version spoken by the relay
        protocol: u32,
        /// Challenge the peer must sign
        nonce: [u8; NONCE_LEN],
    },

    /// Answer to a valid `Authenticate`
    Authenticated,

    /// Reservation granted
    ReserveOk {
        /// Reservation lifetime in seconds, `None` if it never expires
        ttl_secs: Option<u64>,
        /// Caps applied to circuits towards the reserving peer
        limits: WireLimits,
    },

    /// A peer dialed the reserving peer; sent on its control connection
    Incoming {
        /// Circuit to accept
        circuit: CircuitId,
        /// Dialing peer
        source: PeerId,
        /// Effective limits
        limits: WireLimits,
    },

    /// Circuit established; raw bytes follow
    Connected {
        /// Circuit token
        circuit: CircuitId,
        /// Effective limits
        limits: WireLimits,
    },

    /// Request refused
    Rejected {
        /// Reason
        status: Status,
    },

    /// Answer to `Ping`
    Pong {
        /// Nonce from the `Ping`
        nonce: u64,
    },
}

impl ClientMessage {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "Hello",
            ClientMessage::Authenticate { .. } => "Authenticate",
            ClientMessage::Reserve { .. } => "Reserve",
            ClientMessage::Connect { .. } => "Connect",
            ClientMessage::Accept { .. } => "Accept",
            ClientMessage::Ping { .. } => "Ping",
        }
    }
}

impl RelayMessage {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Welcome { .. } => "Welcome",
            RelayMessage::Authenticated => "Authenticated",
            RelayMessage::ReserveOk { .. } => "ReserveOk",
            RelayMessage::Incoming { .. } => "Incoming",
            RelayMessage::Connected { .. } => "Connected",
            RelayMessage::Rejected { .. } => "Rejected",
            RelayMessage::Pong { .. } => "Pong",
        }
    }
}

/// Encode `msg` as one length-prefixed frame
///
/// # Errors
///
/// Returns an error if the message does not encode or exceeds
/// [`MAX_FRAME_LEN`].
pub fn encode_frame<M: Serialize>(msg: &M) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    // Bounded by MAX_FRAME_LEN above
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from the front of `buf`
///
/// Returns the message and the number of bytes consumed, or `None` while
/// `buf` does not hold a whole frame yet.
///
/// # Errors
///
/// Returns [`NodeError::FrameTooLarge`] for an oversized length prefix and
/// [`NodeError::Codec`] for an undecodable body.
pub fn decode_frame<M: DeserializeOwned>(buf: &[u8]) -> Result<Option<(M, usize)>> {
    let Some((prefix, rest)) = buf.split_first_chunk::<4>() else {
        return Ok(None);
    };
    let len = u32::from_be_bytes(*prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(len));
    }
    let Some(body) = rest.get(..len) else {
        return Ok(None);
    };
    Ok(Some((bincode::deserialize(body)?, 4 + len)))
}

/// Write one frame
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// # Errors
///
/// Returns [`NodeError::ConnectionClosed`] on a clean end of stream,
/// [`NodeError::FrameTooLarge`] for an oversized length prefix and
/// [`NodeError::Codec`] for an undecodable body.
pub async fn read_frame<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}
