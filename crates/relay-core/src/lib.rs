//! # Relay Core
//!
//! Protocol engine of a circuit relay: a publicly reachable node that lets
//! peers behind NAT reserve a slot and be dialed through it.
//!
//! This crate provides:
//! - Limit policy with bounded and unbounded limits
//! - Concurrent reservation table with TTL expiry
//! - Circuit manager enforcing per-circuit byte and duration caps
//! - Request handler tying admission, accounting and teardown together
//! - Metrics sinks observing the relay's lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Relay                                   │
//! │   (reservation and circuit requests, sweeps, shutdown)          │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │       ReservationTable         │        CircuitManager          │
//! │  (peer → reservation, TTL)     │  (open circuits, byte caps)    │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │                       MetricsSink                                │
//! │   (fire-and-forget observer, never influences decisions)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine performs no I/O. Transports, framing and byte pumping live in
//! the node crate, which drives a [`Relay`] and forwards bytes for each
//! [`CircuitGrant`] it hands out.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit;
pub mod handler;
pub mod metrics;
pub mod peer;
pub mod policy;
pub mod reservation;
pub mod status;

pub use circuit::{ByteVerdict, CircuitGrant, CircuitInfo, CircuitManager, ClosedCircuit};
pub use handler::{
    CircuitRequest, Relay, RequestState, ReservationRequest, ReservationVoucher, SweepReport,
};
pub use metrics::{
    ChannelMetrics, FanoutMetrics, LogMetrics, MetricsSink, MetricsSnapshot, NoopMetrics,
    RelayEvent, RelayMetrics,
};
pub use peer::{CircuitId, ParsePeerIdError, PeerId};
pub use policy::{CircuitLimits, Limit, LimitPolicy, PolicyError};
pub use reservation::{Reservation, ReservationGrant, ReservationTable, ReserveOutcome};
pub use status::{CloseReason, RejectReason, Status};
