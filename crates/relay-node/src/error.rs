//! Error types for the relay node
//!
//! Engine rejections never show up here: they are answered to the peer as a
//! [`Status`](relay_core::Status) and the connection carries on. A
//! [`NodeError`] ends the connection (or, during startup, the process).
//!
//! # Error Categories
//!
//! - **Transient**: the peer went away or was slow; nothing to fix locally
//! - **Permanent**: bad configuration, unreadable key or a protocol violation

use relay_core::{PolicyError, Status};
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ I/O Errors ============
    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Failed to bind a listen address
    #[error("Failed to bind {addr}: {reason}")]
    Bind {
        /// Address that could not be bound
        addr: std::net::SocketAddr,
        /// Underlying error
        reason: String,
    },

    // ============ Identity Errors ============
    /// Key file missing, unreadable or malformed
    #[error("Identity error: {0}")]
    Identity(Cow<'static, str>),

    // ============ Protocol Errors ============
    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(Cow<'static, str>),

    /// Frame length above the protocol maximum
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Peer sent a message that is not valid at this point of the exchange
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// Relay refused the request
    #[error("Request rejected: {0}")]
    Rejected(Status),

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Io(_) | NodeError::Timeout(_) | NodeError::ConnectionClosed
        ) || matches!(
            self,
            NodeError::Rejected(Status::ConnectionFailed | Status::Rejected(_))
        )
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        NodeError::Protocol(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create an identity error with static context (zero allocation)
    #[must_use]
    pub const fn identity(context: &'static str) -> Self {
        NodeError::Identity(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            NodeError::ConnectionClosed
        } else {
            NodeError::Io(err.to_string())
        }
    }
}

impl From<bincode::Error> for NodeError {
    fn from(err: bincode::Error) -> Self {
        NodeError::Codec(Cow::Owned(err.to_string()))
    }
}

impl From<PolicyError> for NodeError {
    fn from(err: PolicyError) -> Self {
        NodeError::InvalidConfig(Cow::Owned(err.to_string()))
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
