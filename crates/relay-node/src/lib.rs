//! # Relay Node
//!
//! Network shell around the [`relay_core`] engine: identity, configuration,
//! TCP listeners, the control protocol and the per-circuit byte pump.
//!
//! ## Connection flow
//!
//! ```text
//!  destination                 relay                      source
//!      │  handshake              │                           │
//!      │  Reserve ──────────────▶│                           │
//!      │◀────────────── ReserveOk│        handshake          │
//!      │                         │◀──────────────── Connect  │
//!      │◀─────────────── Incoming│                           │
//!      │  (new connection)       │                           │
//!      │  handshake, Accept ────▶│                           │
//!      │◀────────────── Connected│Connected ────────────────▶│
//!      │◀════════ relayed bytes ═╪═══════ relayed bytes ════▶│
//! ```
//!
//! Every connection opens with a handshake in which the client signs a
//! relay-chosen nonce with the key behind its claimed peer id.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod pump;
pub mod server;

pub use client::{IncomingCircuit, RelayClient, RelayedCircuit, ReservationInfo};
pub use config::Config;
pub use error::{NodeError, Result};
pub use identity::Identity;
pub use server::RelayNode;
