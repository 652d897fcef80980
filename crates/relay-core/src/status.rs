//! Request outcomes and close reasons
//!
//! Rejections are expected, frequent and reported to the requesting peer with
//! a distinct code. They are values, not errors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a reservation or circuit request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// The relay already holds its maximum number of reservations
    CapacityExceeded,
    /// The destination holds no live reservation
    NoReservation,
    /// The destination already has its maximum number of open circuits
    PerReservationCapacityExceeded,
    /// The relay already has its maximum number of open circuits
    GlobalCapacityExceeded,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::CapacityExceeded => "reservation capacity exceeded",
            RejectReason::NoReservation => "no reservation",
            RejectReason::PerReservationCapacityExceeded => {
                "per-reservation circuit capacity exceeded"
            }
            RejectReason::GlobalCapacityExceeded => "global circuit capacity exceeded",
        };
        f.write_str(s)
    }
}

/// Outcome code reported to peers and to the metrics sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Request granted
    Ok,
    /// Refused by the engine
    Rejected(RejectReason),
    /// The destination could not be reached to complete the circuit
    ConnectionFailed,
    /// The request did not follow the protocol
    MalformedMessage,
    /// The peer could not prove it owns the id it claimed
    AuthenticationFailed,
}

impl Status {
    /// True for [`Status::Ok`]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl From<RejectReason> for Status {
    fn from(reason: RejectReason) -> Self {
        Status::Rejected(reason)
    }
}

impl<T> From<&Result<T, RejectReason>> for Status {
    fn from(result: &Result<T, RejectReason>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(reason) => Status::Rejected(*reason),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("ok"),
            Status::Rejected(reason) => write!(f, "rejected: {reason}"),
            Status::ConnectionFailed => f.write_str("connection failed"),
            Status::MalformedMessage => f.write_str("malformed message"),
            Status::AuthenticationFailed => f.write_str("authentication failed"),
        }
    }
}

/// Why a circuit was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// One side finished or errored
    Finished,
    /// The circuit reached its byte limit
    ByteLimit,
    /// The circuit reached its duration limit
    DurationLimit,
    /// The destination's reservation was released or expired
    ReservationClosed,
    /// The destination never picked up the circuit
    DestinationUnreachable,
    /// The relay is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Finished => "finished",
            CloseReason::ByteLimit => "byte limit reached",
            CloseReason::DurationLimit => "duration limit reached",
            CloseReason::ReservationClosed => "reservation closed",
            CloseReason::DestinationUnreachable => "destination unreachable",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}
