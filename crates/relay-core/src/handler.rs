//! Relay protocol handler
//!
//! [`Relay`] is the engine the node shell talks to. It processes reservation
//! and circuit requests against the [`ReservationTable`] and the
//! [`CircuitManager`], reports every outcome to the [`MetricsSink`], and
//! hands the shell a [`CircuitGrant`] for each accepted circuit.
//!
//! # Request lifecycle
//!
//! ```text
//! Received ──▶ Validated ──┬──▶ Rejected
//!                          └──▶ Accepted ──▶ Open ──▶ Closed
//! ```
//!
//! Reservation requests end at `Accepted` or `Rejected`. A circuit request
//! that is accepted becomes `Open`; the shell then pumps bytes, calling
//! [`Relay::record_bytes`] per chunk and [`Relay::close_circuit`] when
//! either side finishes.
//!
//! Rejections are expected and never retried here. Bookkeeping
//! inconsistencies are programming errors and panic.

use crate::circuit::{ByteVerdict, CircuitGrant, CircuitInfo, CircuitManager, ClosedCircuit};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::peer::{CircuitId, PeerId};
use crate::policy::{CircuitLimits, Limit, LimitPolicy};
use crate::reservation::{Reservation, ReservationTable};
use crate::status::{CloseReason, RejectReason, Status};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Stage of a request inside the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Arrived from the shell
    Received,
    /// Normalized and ready for admission
    Validated,
    /// Granted
    Accepted,
    /// Refused (terminal)
    Rejected,
    /// Circuit is relaying bytes
    Open,
    /// Circuit has been torn down (terminal)
    Closed,
}

/// A peer asking to be reachable through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRequest {
    /// Requesting peer, as authenticated by the transport
    pub peer: PeerId,
    /// The peer claims to be renewing an existing reservation
    pub renewal: bool,
}

/// A peer asking to be connected to a reserved peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRequest {
    /// Dialing peer
    pub source: PeerId,
    /// Reserved peer to dial
    pub destination: PeerId,
    /// Limits the dialer asks for
    pub limits: CircuitLimits,
}

impl CircuitRequest {
    /// Normalize requested limits: a zero limit carries no usable
    /// preference and is read as "no preference"
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.limits.bytes == Limit::Max(0) {
            self.limits.bytes = Limit::Unbounded;
        }
        if self.limits.duration == Limit::Max(Duration::ZERO) {
            self.limits.duration = Limit::Unbounded;
        }
        self
    }
}

/// Reservation granted to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationVoucher {
    /// Reserved peer
    pub peer: PeerId,
    /// Generation of the reservation
    pub generation: u64,
    /// Expiry instant, `None` if it never expires
    pub expires_at: Option<Instant>,
    /// Negotiated time to live
    pub ttl: Limit<Duration>,
    /// Caps applied to every circuit towards the peer
    pub circuit_limits: CircuitLimits,
    /// Maximum circuits open towards the peer at once
    pub max_circuits: Limit<usize>,
    /// True if an existing reservation was refreshed
    pub renewed: bool,
}

/// Work done by one [`Relay::sweep`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations removed because they expired
    pub reservations_expired: usize,
    /// Circuits closed, by cascade or by their duration limit
    pub circuits_closed: usize,
}

/// The relay protocol engine
#[derive(Debug)]
pub struct Relay {
    policy: LimitPolicy,
    reservations: Arc<ReservationTable>,
    circuits: CircuitManager,
    metrics: Arc<dyn MetricsSink>,
    enabled: AtomicBool,
}

impl Relay {
    /// Create an engine enforcing `policy` without metrics
    #[must_use]
    pub fn new(policy: LimitPolicy) -> Self {
        Self::with_metrics(policy, Arc::new(NoopMetrics))
    }

    /// Create an engine enforcing `policy` and reporting to `metrics`
    #[must_use]
    pub fn with_metrics(policy: LimitPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        let reservations = Arc::new(ReservationTable::new(policy));
        let circuits = CircuitManager::new(Arc::clone(&reservations));
        metrics.relay_status(true);
        info!(?policy, "relay service enabled");
        Self {
            policy,
            reservations,
            circuits,
            metrics,
            enabled: AtomicBool::new(true),
        }
    }

    /// False once [`Relay::shutdown`] has run; a disabled relay admits
    /// nothing
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The policy in force
    #[must_use]
    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// The metrics sink events are reported to
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Process a reservation request at the current instant
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::CapacityExceeded`] when the relay is full.
    pub fn process_reservation_request(
        &self,
        request: ReservationRequest,
    ) -> Result<ReservationVoucher, RejectReason> {
        self.process_reservation_request_at(request, Instant::now())
    }

    /// Process a reservation request at `now`
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::CapacityExceeded`] when the relay is full.
    pub fn process_reservation_request_at(
        &self,
        request: ReservationRequest,
        now: Instant,
    ) -> Result<ReservationVoucher, RejectReason> {
        let ReservationRequest { peer, renewal } = request;
        trace!(peer = %peer.fmt_short(), renewal, state = ?RequestState::Received, "reservation request");

        let decision = if self.is_enabled() {
            let outcome = self.reservations.try_reserve(peer, renewal, now);
            for evicted in &outcome.evicted {
                self.close_reservation(evicted, CloseReason::ReservationClosed, now);
            }
            outcome.decision
        } else {
            Err(RejectReason::CapacityExceeded)
        };

        let result = decision.map(|grant| ReservationVoucher {
            peer,
            generation: grant.generation,
            expires_at: grant.expires_at,
            ttl: self.policy.reservation_ttl,
            circuit_limits: self.policy.circuit_caps(),
            max_circuits: self.policy.max_circuits_per_reservation,
            renewed: grant.renewed,
        });

        match &result {
            Ok(voucher) => {
                debug!(
                    peer = %peer.fmt_short(),
                    renewed = voucher.renewed,
                    state = ?RequestState::Accepted,
                    "reservation accepted"
                );
                self.metrics.reservation_allowed(voucher.renewed);
            }
            Err(reason) => {
                debug!(
                    peer = %peer.fmt_short(),
                    %reason,
                    state = ?RequestState::Rejected,
                    "reservation rejected"
                );
            }
        }
        self.metrics.reservation_request_handled(Status::from(&result));
        result
    }

    /// Release `peer`'s reservation and close its circuits
    ///
    /// Returns false if the peer held no reservation, so a repeated release
    /// cascades at most once.
    pub fn release_reservation(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        match self.reservations.release(peer) {
            Some(reservation) => {
                self.close_reservation(&reservation, CloseReason::ReservationClosed, now);
                true
            }
            None => false,
        }
    }

    /// Release `peer`'s reservation only if it is still `generation`
    ///
    /// Used when the connection that obtained a reservation goes away while
    /// the peer may already hold a newer one.
    pub fn release_reservation_generation(&self, peer: &PeerId, generation: u64) -> bool {
        let now = Instant::now();
        match self.reservations.release_generation(peer, generation) {
            Some(reservation) => {
                self.close_reservation(&reservation, CloseReason::ReservationClosed, now);
                true
            }
            None => false,
        }
    }

    fn close_reservation(
        &self,
        reservation: &Reservation,
        reason: CloseReason,
        now: Instant,
    ) -> usize {
        let closed = self.circuits.cascade_close(reservation, reason, now);
        // Circuits may close on their own between removal and cascade, but
        // no circuit can exist without having taken one of the slots.
        assert!(
            closed.len() <= reservation.active_circuits,
            "reservation of {} (generation {}) accounted {} circuits but {} were open",
            reservation.peer.fmt_short(),
            reservation.generation,
            reservation.active_circuits,
            closed.len()
        );
        for circuit in &closed {
            self.report_closed(circuit);
        }
        debug!(
            peer = %reservation.peer.fmt_short(),
            circuits = closed.len(),
            %reason,
            "reservation closed"
        );
        self.metrics.reservation_closed(closed.len());
        closed.len()
    }

    /// True iff `peer` holds a live reservation now
    #[must_use]
    pub fn is_live(&self, peer: &PeerId) -> bool {
        self.reservations.is_live(peer, Instant::now())
    }

    /// Snapshot of `peer`'s reservation
    #[must_use]
    pub fn reservation(&self, peer: &PeerId) -> Option<Reservation> {
        self.reservations.get(peer)
    }

    /// Process a circuit request at the current instant
    ///
    /// # Errors
    ///
    /// Returns the reason the circuit was refused.
    pub fn process_circuit_request(
        &self,
        request: CircuitRequest,
    ) -> Result<CircuitGrant, RejectReason> {
        self.process_circuit_request_at(request, Instant::now())
    }

    /// Process a circuit request at `now`
    ///
    /// # Errors
    ///
    /// Returns the reason the circuit was refused.
    pub fn process_circuit_request_at(
        &self,
        request: CircuitRequest,
        now: Instant,
    ) -> Result<CircuitGrant, RejectReason> {
        trace!(
            source = %request.source.fmt_short(),
            destination = %request.destination.fmt_short(),
            state = ?RequestState::Received,
            "circuit request"
        );
        let request = request.normalized();
        trace!(limits = ?request.limits, state = ?RequestState::Validated, "circuit request");

        let result = if self.is_enabled() {
            self.circuits
                .try_open(request.source, request.destination, request.limits, now)
        } else {
            Err(RejectReason::NoReservation)
        };

        match &result {
            Ok(grant) => {
                debug!(
                    id = %grant.id,
                    source = %grant.source.fmt_short(),
                    destination = %grant.destination.fmt_short(),
                    limits = ?grant.limits,
                    state = ?RequestState::Open,
                    "circuit opened"
                );
                self.metrics.connection_opened();
            }
            Err(reason) => {
                debug!(
                    source = %request.source.fmt_short(),
                    destination = %request.destination.fmt_short(),
                    %reason,
                    state = ?RequestState::Rejected,
                    "circuit rejected"
                );
            }
        }
        self.metrics.connection_request_handled(Status::from(&result));
        result
    }

    /// Account `n` relayed bytes to circuit `id`
    ///
    /// See [`CircuitManager::record_bytes`].
    pub fn record_bytes(&self, id: CircuitId, n: u64) -> ByteVerdict {
        let verdict = self.circuits.record_bytes(id, n);
        let counted = match verdict {
            ByteVerdict::Continue => n,
            ByteVerdict::LimitReached { permitted } => permitted,
            ByteVerdict::Unknown => 0,
        };
        if counted > 0 {
            self.metrics.bytes_transferred(counted);
        }
        verdict
    }

    /// Close circuit `id`; idempotent
    pub fn close_circuit(&self, id: CircuitId, reason: CloseReason) -> Option<ClosedCircuit> {
        self.close_circuit_at(id, reason, Instant::now())
    }

    /// Close circuit `id` at `now`; idempotent
    pub fn close_circuit_at(
        &self,
        id: CircuitId,
        reason: CloseReason,
        now: Instant,
    ) -> Option<ClosedCircuit> {
        let closed = self.circuits.close(id, reason, now)?;
        self.report_closed(&closed);
        Some(closed)
    }

    fn report_closed(&self, closed: &ClosedCircuit) {
        debug!(
            id = %closed.id,
            reason = %closed.reason,
            duration = ?closed.duration,
            bytes = closed.bytes_transferred,
            state = ?RequestState::Closed,
            "circuit closed"
        );
        self.metrics.connection_closed(closed.duration);
    }

    /// Snapshot of circuit `id`
    #[must_use]
    pub fn circuit(&self, id: CircuitId) -> Option<CircuitInfo> {
        self.circuits.get(id)
    }

    /// Report a request the shell refused before it reached the engine
    pub fn report_circuit_failure(&self, status: Status) {
        self.metrics.connection_request_handled(status);
    }

    /// Report a malformed reservation request refused by the shell
    pub fn report_reservation_failure(&self, status: Status) {
        self.metrics.reservation_request_handled(status);
    }

    /// Expire reservations and overdue circuits at the current instant
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Expire reservations and overdue circuits at `now`
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for reservation in self.reservations.sweep(now) {
            report.circuits_closed +=
                self.close_reservation(&reservation, CloseReason::ReservationClosed, now);
            report.reservations_expired += 1;
        }

        for closed in self.circuits.expire_overdue(now) {
            self.report_closed(&closed);
            report.circuits_closed += 1;
        }

        if report != SweepReport::default() {
            debug!(
                reservations = report.reservations_expired,
                circuits = report.circuits_closed,
                "sweep"
            );
        }
        report
    }

    /// Disable the relay, then release every reservation and close every
    /// circuit
    ///
    /// Safe to call again: a request admitted while the first call was
    /// draining is cleaned up by the next one, and the disabled status is
    /// reported once.
    pub fn shutdown(&self) {
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);
        let now = Instant::now();
        let reservations = self.reservations.drain();
        let count = reservations.len();
        for reservation in &reservations {
            self.close_reservation(reservation, CloseReason::Shutdown, now);
        }
        for closed in self.circuits.close_all(CloseReason::Shutdown, now) {
            self.report_closed(&closed);
        }
        if was_enabled {
            info!(reservations = count, "relay service disabled");
            self.metrics.relay_status(false);
        } else if count > 0 {
            debug!(reservations = count, "late reservations released");
        }
    }

    /// Number of reservations, including expired ones awaiting sweep
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Number of open circuits
    #[must_use]
    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }
}
