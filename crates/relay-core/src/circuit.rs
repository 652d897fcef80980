//! Circuit manager
//!
//! Owns every open circuit and enforces per-circuit byte and duration caps.
//! A circuit refers back to its destination's reservation by peer id and
//! generation only; the reservation table never holds circuits.
//!
//! Admission runs while holding the destination's reservation entry lock, so
//! a concurrent release or sweep either sees the new circuit and closes it,
//! or runs first and the admission fails with
//! [`RejectReason::NoReservation`].

use crate::peer::{CircuitId, PeerId};
use crate::policy::{CircuitLimits, Limit, LimitPolicy};
use crate::reservation::{Reservation, ReservationTable};
use crate::status::{CloseReason, RejectReason};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// An open circuit
#[derive(Debug)]
struct Circuit {
    id: CircuitId,
    source: PeerId,
    destination: PeerId,
    /// Generation of the destination reservation this circuit counts against
    generation: u64,
    opened_at: Instant,
    limits: CircuitLimits,
    deadline: Option<Instant>,
    bytes: AtomicU64,
    cancel: CancellationToken,
}

impl Circuit {
    fn grant(&self) -> CircuitGrant {
        CircuitGrant {
            id: self.id,
            source: self.source,
            destination: self.destination,
            limits: self.limits,
            opened_at: self.opened_at,
            deadline: self.deadline,
            cancel: self.cancel.clone(),
        }
    }
}

/// Handle given to the byte pump of an accepted circuit
#[derive(Debug, Clone)]
pub struct CircuitGrant {
    /// Circuit token
    pub id: CircuitId,
    /// Dialing peer
    pub source: PeerId,
    /// Reserved peer being dialed
    pub destination: PeerId,
    /// Effective limits
    pub limits: CircuitLimits,
    /// Admission instant
    pub opened_at: Instant,
    /// Instant the duration limit is reached, if bounded
    pub deadline: Option<Instant>,
    /// Cancelled when the engine closes the circuit
    pub cancel: CancellationToken,
}

/// What the pump may do with the chunk it just recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteVerdict {
    /// Forward the whole chunk
    Continue,
    /// Forward only `permitted` bytes of the chunk, then close with
    /// [`CloseReason::ByteLimit`]
    LimitReached {
        /// Bytes of the chunk still within the limit
        permitted: u64,
    },
    /// The circuit is not open; stop forwarding
    Unknown,
}

/// Summary of a closed circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedCircuit {
    /// Circuit token
    pub id: CircuitId,
    /// Dialing peer
    pub source: PeerId,
    /// Reserved peer
    pub destination: PeerId,
    /// Why it closed
    pub reason: CloseReason,
    /// Time between admission and close
    pub duration: Duration,
    /// Bytes relayed, never above the byte limit
    pub bytes_transferred: u64,
}

/// Snapshot of an open circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitInfo {
    /// Circuit token
    pub id: CircuitId,
    /// Dialing peer
    pub source: PeerId,
    /// Reserved peer
    pub destination: PeerId,
    /// Effective limits
    pub limits: CircuitLimits,
    /// Bytes relayed so far
    pub bytes_transferred: u64,
}

/// Concurrent registry of open circuits
#[derive(Debug)]
pub struct CircuitManager {
    policy: LimitPolicy,
    reservations: Arc<ReservationTable>,
    circuits: DashMap<CircuitId, Arc<Circuit>>,
    count: AtomicUsize,
    next_id: AtomicU64,
}

impl CircuitManager {
    /// Create a manager admitting circuits against `reservations`
    #[must_use]
    pub fn new(reservations: Arc<ReservationTable>) -> Self {
        Self {
            policy: *reservations.policy(),
            reservations,
            circuits: DashMap::new(),
            count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Admit a circuit from `source` to `destination`
    ///
    /// Checks, in order: the destination holds a live reservation, the
    /// reservation has a free circuit slot, the relay has a free circuit
    /// slot. Effective limits are the requested ones capped by the policy.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`RejectReason`].
    pub fn try_open(
        &self,
        source: PeerId,
        destination: PeerId,
        requested: CircuitLimits,
        now: Instant,
    ) -> Result<CircuitGrant, RejectReason> {
        let limits = self.policy.effective_circuit_limits(requested);
        let per_reservation = self.policy.max_circuits_per_reservation;
        let global = self.policy.max_circuits;

        self.reservations
            .with_live(&destination, now, |reservation| {
                if !per_reservation.permits(reservation.active_circuits) {
                    return Err(RejectReason::PerReservationCapacityExceeded);
                }
                self.count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                        global.permits(count).then_some(count + 1)
                    })
                    .map_err(|_| RejectReason::GlobalCapacityExceeded)?;

                reservation.active_circuits += 1;
                if let Limit::Max(max) = per_reservation {
                    assert!(
                        reservation.active_circuits <= max,
                        "reservation of {} holds {} circuits, above its ceiling of {}",
                        destination.fmt_short(),
                        reservation.active_circuits,
                        max
                    );
                }

                let circuit = Arc::new(Circuit {
                    id: CircuitId(self.next_id.fetch_add(1, Ordering::Relaxed)),
                    source,
                    destination,
                    generation: reservation.generation,
                    opened_at: now,
                    limits,
                    deadline: limits.duration.get().and_then(|d| now.checked_add(d)),
                    bytes: AtomicU64::new(0),
                    cancel: CancellationToken::new(),
                });
                let grant = circuit.grant();
                self.circuits.insert(circuit.id, circuit);
                Ok(grant)
            })
            .unwrap_or(Err(RejectReason::NoReservation))
    }

    /// Account `n` relayed bytes to circuit `id`
    ///
    /// The cumulative count never decreases and never exceeds the circuit's
    /// byte limit. Safe to call from both directions of a circuit at once.
    pub fn record_bytes(&self, id: CircuitId, n: u64) -> ByteVerdict {
        let Some(circuit) = self.circuits.get(&id).map(|c| Arc::clone(c.value())) else {
            return ByteVerdict::Unknown;
        };

        match circuit.limits.bytes {
            Limit::Unbounded => {
                let _ = circuit
                    .bytes
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                        Some(cur.saturating_add(n))
                    });
                ByteVerdict::Continue
            }
            Limit::Max(max) => {
                let mut permitted = n;
                let _ = circuit
                    .bytes
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                        permitted = max.saturating_sub(cur).min(n);
                        Some(cur + permitted)
                    });
                if permitted < n {
                    ByteVerdict::LimitReached { permitted }
                } else {
                    ByteVerdict::Continue
                }
            }
        }
    }

    /// Close circuit `id`
    ///
    /// Cancels the circuit's pump and frees its reservation slot. Idempotent:
    /// closing an unknown or already closed id returns `None`.
    pub fn close(&self, id: CircuitId, reason: CloseReason, now: Instant) -> Option<ClosedCircuit> {
        let (_, circuit) = self.circuits.remove(&id)?;
        self.count.fetch_sub(1, Ordering::SeqCst);
        circuit.cancel.cancel();
        self.reservations
            .release_circuit_slot(&circuit.destination, circuit.generation);

        Some(ClosedCircuit {
            id,
            source: circuit.source,
            destination: circuit.destination,
            reason,
            duration: now.saturating_duration_since(circuit.opened_at),
            bytes_transferred: circuit.bytes.load(Ordering::Acquire),
        })
    }

    fn close_where(
        &self,
        reason: CloseReason,
        now: Instant,
        pred: impl Fn(&Circuit) -> bool,
    ) -> Vec<ClosedCircuit> {
        let ids: Vec<CircuitId> = self
            .circuits
            .iter()
            .filter(|c| pred(c.value()))
            .map(|c| *c.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.close(id, reason, now))
            .collect()
    }

    /// Close every circuit counted against `reservation`
    ///
    /// Circuits of a newer reservation held by the same peer are left alone.
    pub fn cascade_close(
        &self,
        reservation: &Reservation,
        reason: CloseReason,
        now: Instant,
    ) -> Vec<ClosedCircuit> {
        self.close_where(reason, now, |c| {
            c.destination == reservation.peer && c.generation == reservation.generation
        })
    }

    /// Close every circuit whose duration limit has been reached
    pub fn expire_overdue(&self, now: Instant) -> Vec<ClosedCircuit> {
        self.close_where(CloseReason::DurationLimit, now, |c| {
            c.deadline.is_some_and(|deadline| now >= deadline)
        })
    }

    /// Close every circuit
    pub fn close_all(&self, reason: CloseReason, now: Instant) -> Vec<ClosedCircuit> {
        self.close_where(reason, now, |_| true)
    }

    /// Snapshot of circuit `id`
    #[must_use]
    pub fn get(&self, id: CircuitId) -> Option<CircuitInfo> {
        self.circuits.get(&id).map(|c| CircuitInfo {
            id: c.id,
            source: c.source,
            destination: c.destination,
            limits: c.limits,
            bytes_transferred: c.bytes.load(Ordering::Acquire),
        })
    }

    /// Open circuits towards `destination`
    #[must_use]
    pub fn count_towards(&self, destination: &PeerId) -> usize {
        self.circuits
            .iter()
            .filter(|c| c.destination == *destination)
            .count()
    }

    /// Number of open circuits
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// True if no circuit is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
