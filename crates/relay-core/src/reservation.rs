//! Reservation table
//!
//! Tracks which peers currently hold a relay reservation, when each one
//! expires, and how many circuits are open towards it.
//!
//! Entries live in a [`DashMap`] so unrelated peers never contend on a single
//! lock. The reservation count is a separate atomic updated with
//! compare-and-swap, which keeps admission exact across shards.
//!
//! Removing a reservation never touches circuits directly. Every operation
//! that destroys reservations returns them, and the caller cascade-closes
//! their circuits through the circuit manager.

use crate::peer::PeerId;
use crate::policy::{Limit, LimitPolicy};
use crate::status::RejectReason;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// A peer's reservation on this relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The reserving peer
    pub peer: PeerId,
    /// Distinguishes successive reservations held by the same peer
    pub generation: u64,
    /// When the reservation was first granted
    pub granted_at: Instant,
    /// Expiry instant, `None` if the TTL is unbounded
    pub expires_at: Option<Instant>,
    /// Open circuits towards this peer
    pub active_circuits: usize,
    /// Set once the reservation has been refreshed
    pub renewed: bool,
}

impl Reservation {
    /// Live iff `now < expires_at`
    #[must_use]
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

/// A granted or refreshed reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationGrant {
    /// Generation of the reservation now in place
    pub generation: u64,
    /// Expiry instant, `None` if the TTL is unbounded
    pub expires_at: Option<Instant>,
    /// True if an existing live reservation was refreshed
    pub renewed: bool,
}

/// Result of [`ReservationTable::try_reserve`]
#[derive(Debug)]
pub struct ReserveOutcome {
    /// Accept or reject
    pub decision: Result<ReservationGrant, RejectReason>,
    /// Expired reservations removed while admitting; their circuits must be
    /// cascade-closed
    pub evicted: Vec<Reservation>,
}

/// Concurrent table of reservations keyed by peer
#[derive(Debug)]
pub struct ReservationTable {
    policy: LimitPolicy,
    entries: DashMap<PeerId, Reservation>,
    /// Number of entries, live or awaiting sweep
    count: AtomicUsize,
    next_generation: AtomicU64,
}

impl ReservationTable {
    /// Create an empty table enforcing `policy`
    #[must_use]
    pub fn new(policy: LimitPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    /// The policy this table enforces
    #[must_use]
    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    fn expiry(&self, now: Instant) -> Option<Instant> {
        // An unrepresentable expiry is treated as never expiring.
        self.policy
            .reservation_ttl
            .get()
            .and_then(|ttl| now.checked_add(ttl))
    }

    fn new_reservation(&self, peer: PeerId, now: Instant) -> Reservation {
        Reservation {
            peer,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            granted_at: now,
            expires_at: self.expiry(now),
            active_circuits: 0,
            renewed: false,
        }
    }

    /// Admit or refresh a reservation for `peer`
    ///
    /// Accepts iff the peer already holds a live reservation and this is a
    /// renewal, or the table holds fewer reservations than the policy
    /// allows. A renewal claim from a peer without a live reservation is
    /// treated as a fresh request. When the table is full, expired entries
    /// are swept once before giving up.
    pub fn try_reserve(&self, peer: PeerId, is_renewal: bool, now: Instant) -> ReserveOutcome {
        let mut evicted = Vec::new();
        let mut decision = self.admit(peer, is_renewal, now, &mut evicted);

        if decision == Err(RejectReason::CapacityExceeded) {
            let swept = self.sweep(now);
            if !swept.is_empty() {
                evicted.extend(swept);
                decision = self.admit(peer, is_renewal, now, &mut evicted);
            }
        }

        ReserveOutcome { decision, evicted }
    }

    fn admit(
        &self,
        peer: PeerId,
        is_renewal: bool,
        now: Instant,
        evicted: &mut Vec<Reservation>,
    ) -> Result<ReservationGrant, RejectReason> {
        let max = self.policy.max_reservations;

        match self.entries.entry(peer) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    // The peer already occupies a slot, so a non-renewal
                    // refresh is only admitted below the ceiling.
                    if !is_renewal && !max.permits(self.count.load(Ordering::SeqCst)) {
                        return Err(RejectReason::CapacityExceeded);
                    }
                    let expires_at = self.expiry(now);
                    let reservation = entry.get_mut();
                    reservation.expires_at = expires_at;
                    reservation.renewed = true;
                    return Ok(ReservationGrant {
                        generation: reservation.generation,
                        expires_at,
                        renewed: true,
                    });
                }

                // Stale entry: its slot is reused, but the request must still
                // fit alongside every other reservation.
                let others = self.count.load(Ordering::SeqCst).saturating_sub(1);
                if !max.permits(others) {
                    return Err(RejectReason::CapacityExceeded);
                }
                let fresh = self.new_reservation(peer, now);
                let grant = ReservationGrant {
                    generation: fresh.generation,
                    expires_at: fresh.expires_at,
                    renewed: false,
                };
                evicted.push(entry.insert(fresh));
                Ok(grant)
            }
            Entry::Vacant(entry) => {
                self.count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                        max.permits(count).then_some(count + 1)
                    })
                    .map_err(|_| RejectReason::CapacityExceeded)?;
                let fresh = self.new_reservation(peer, now);
                let grant = ReservationGrant {
                    generation: fresh.generation,
                    expires_at: fresh.expires_at,
                    renewed: false,
                };
                entry.insert(fresh);
                Ok(grant)
            }
        }
    }

    /// Remove the reservation held by `peer`, if any
    ///
    /// Idempotent: a second call returns `None`.
    pub fn release(&self, peer: &PeerId) -> Option<Reservation> {
        let (_, reservation) = self.entries.remove(peer)?;
        self.count.fetch_sub(1, Ordering::SeqCst);
        Some(reservation)
    }

    /// Remove the reservation held by `peer` only if it is still `generation`
    pub fn release_generation(&self, peer: &PeerId, generation: u64) -> Option<Reservation> {
        let (_, reservation) = self
            .entries
            .remove_if(peer, |_, r| r.generation == generation)?;
        self.count.fetch_sub(1, Ordering::SeqCst);
        Some(reservation)
    }

    /// True iff `peer` holds a reservation and `now < expires_at`
    #[must_use]
    pub fn is_live(&self, peer: &PeerId, now: Instant) -> bool {
        self.entries.get(peer).is_some_and(|r| r.is_live(now))
    }

    /// Remove every expired reservation and return them
    pub fn sweep(&self, now: Instant) -> Vec<Reservation> {
        let expired: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|r| !r.is_live(now))
            .map(|r| *r.key())
            .collect();

        // Re-check under the entry lock: a peer may have re-reserved since.
        expired
            .into_iter()
            .filter_map(|peer| self.entries.remove_if(&peer, |_, r| !r.is_live(now)))
            .map(|(_, reservation)| {
                self.count.fetch_sub(1, Ordering::SeqCst);
                reservation
            })
            .collect()
    }

    /// Remove every reservation, live or not
    pub fn drain(&self) -> Vec<Reservation> {
        let peers: Vec<PeerId> = self.entries.iter().map(|r| *r.key()).collect();
        peers
            .iter()
            .filter_map(|peer| self.release(peer))
            .collect()
    }

    /// Run `f` against the live reservation of `peer` while holding its
    /// entry lock
    ///
    /// Returns `None` if the peer has no live reservation. Releases and
    /// sweeps of this peer wait until `f` returns.
    pub(crate) fn with_live<R>(
        &self,
        peer: &PeerId,
        now: Instant,
        f: impl FnOnce(&mut Reservation) -> R,
    ) -> Option<R> {
        let mut entry = self.entries.get_mut(peer)?;
        if !entry.is_live(now) {
            return None;
        }
        Some(f(entry.value_mut()))
    }

    /// Give back one circuit slot of `peer`'s reservation `generation`
    ///
    /// A no-op if that reservation no longer exists.
    ///
    /// # Panics
    ///
    /// Panics if the reservation has no open circuit to give back, which
    /// means the circuit accounting is corrupt.
    pub(crate) fn release_circuit_slot(&self, peer: &PeerId, generation: u64) {
        let Some(mut reservation) = self.entries.get_mut(peer) else {
            return;
        };
        if reservation.generation != generation {
            return;
        }
        assert!(
            reservation.active_circuits > 0,
            "circuit accounting underflow for reservation of {} (generation {})",
            peer.fmt_short(),
            generation
        );
        reservation.active_circuits -= 1;
    }

    /// Snapshot of `peer`'s reservation
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<Reservation> {
        self.entries.get(peer).map(|r| r.clone())
    }

    /// Number of reservations, including expired ones awaiting sweep
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// True if the table holds no reservation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reservations live at `now`
    #[must_use]
    pub fn live_count(&self, now: Instant) -> usize {
        self.entries.iter().filter(|r| r.is_live(now)).count()
    }

    /// Per-reservation circuit ceiling
    #[must_use]
    pub fn max_circuits_per_reservation(&self) -> Limit<usize> {
        self.policy.max_circuits_per_reservation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn policy(max: usize, ttl_secs: u64) -> LimitPolicy {
        LimitPolicy {
            max_reservations: Limit::Max(max),
            reservation_ttl: Limit::Max(Duration::from_secs(ttl_secs)),
            ..LimitPolicy::default()
        }
    }

    #[test]
    fn test_reserve_until_capacity() {
        let table = ReservationTable::new(policy(2, 60));
        let now = Instant::now();

        assert!(table.try_reserve(peer(1), false, now).decision.is_ok());
        assert!(table.try_reserve(peer(2), false, now).decision.is_ok());
        assert_eq!(
            table.try_reserve(peer(3), false, now).decision,
            Err(RejectReason::CapacityExceeded)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_renewal_at_capacity() {
        let table = ReservationTable::new(policy(1, 60));
        let t0 = Instant::now();
        let first = table.try_reserve(peer(1), false, t0).decision.unwrap();
        assert!(!first.renewed);

        let t1 = t0 + Duration::from_secs(30);
        let renewed = table.try_reserve(peer(1), true, t1).decision.unwrap();
        assert!(renewed.renewed);
        assert_eq!(renewed.generation, first.generation);
        assert_eq!(renewed.expires_at, Some(t1 + Duration::from_secs(60)));

        let stored = table.get(&peer(1)).unwrap();
        assert!(stored.renewed);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_non_renewal_from_holder_at_capacity_is_rejected() {
        let table = ReservationTable::new(policy(1, 60));
        let now = Instant::now();
        table.try_reserve(peer(1), false, now).decision.unwrap();

        assert_eq!(
            table.try_reserve(peer(1), false, now).decision,
            Err(RejectReason::CapacityExceeded)
        );
    }

    #[test]
    fn test_renewal_claim_without_reservation_is_fresh() {
        let table = ReservationTable::new(policy(4, 60));
        let grant = table
            .try_reserve(peer(1), true, Instant::now())
            .decision
            .unwrap();
        assert!(!grant.renewed);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_liveness_is_strict() {
        let table = ReservationTable::new(policy(4, 1));
        let t0 = Instant::now();
        table.try_reserve(peer(1), false, t0).decision.unwrap();

        assert!(table.is_live(&peer(1), t0 + Duration::from_millis(999)));
        assert!(!table.is_live(&peer(1), t0 + Duration::from_secs(1)));
        assert!(!table.is_live(&peer(2), t0));
    }

    #[test]
    fn test_release_is_idempotent() {
        let table = ReservationTable::new(policy(4, 60));
        table
            .try_reserve(peer(1), false, Instant::now())
            .decision
            .unwrap();

        assert!(table.release(&peer(1)).is_some());
        assert!(table.release(&peer(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_generation_ignores_newer_reservation() {
        let table = ReservationTable::new(policy(4, 60));
        let now = Instant::now();
        let grant = table.try_reserve(peer(1), false, now).decision.unwrap();

        assert!(table.release_generation(&peer(1), grant.generation + 1).is_none());
        assert!(table.release_generation(&peer(1), grant.generation).is_some());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let table = ReservationTable::new(policy(4, 10));
        let t0 = Instant::now();
        table.try_reserve(peer(1), false, t0).decision.unwrap();
        table
            .try_reserve(peer(2), false, t0 + Duration::from_secs(5))
            .decision
            .unwrap();

        let swept = table.sweep(t0 + Duration::from_secs(10));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].peer, peer(1));
        assert_eq!(table.len(), 1);
        assert!(table.is_live(&peer(2), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_full_table_sweeps_lazily() {
        let table = ReservationTable::new(policy(1, 1));
        let t0 = Instant::now();
        table.try_reserve(peer(1), false, t0).decision.unwrap();

        let outcome = table.try_reserve(peer(2), false, t0 + Duration::from_secs(2));
        assert!(outcome.decision.is_ok());
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].peer, peer(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_entry_is_replaced_with_new_generation() {
        let table = ReservationTable::new(policy(4, 1));
        let t0 = Instant::now();
        let first = table.try_reserve(peer(1), true, t0).decision.unwrap();

        let outcome = table.try_reserve(peer(1), true, t0 + Duration::from_secs(1));
        let second = outcome.decision.unwrap();
        assert!(!second.renewed);
        assert_ne!(second.generation, first.generation);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].generation, first.generation);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unbounded_ttl_never_expires() {
        let table = ReservationTable::new(LimitPolicy::unbounded());
        let t0 = Instant::now();
        let grant = table.try_reserve(peer(1), false, t0).decision.unwrap();

        assert_eq!(grant.expires_at, None);
        assert!(table.is_live(&peer(1), t0 + Duration::from_secs(10 * 365 * 24 * 3600)));
    }

    #[test]
    fn test_circuit_slot_accounting() {
        let table = ReservationTable::new(policy(4, 60));
        let now = Instant::now();
        let grant = table.try_reserve(peer(1), false, now).decision.unwrap();

        table
            .with_live(&peer(1), now, |r| r.active_circuits += 1)
            .unwrap();
        // Stale generation is ignored
        table.release_circuit_slot(&peer(1), grant.generation + 7);
        assert_eq!(table.get(&peer(1)).unwrap().active_circuits, 1);

        table.release_circuit_slot(&peer(1), grant.generation);
        assert_eq!(table.get(&peer(1)).unwrap().active_circuits, 0);
    }

    #[test]
    #[should_panic(expected = "circuit accounting underflow")]
    fn test_slot_underflow_panics() {
        let table = ReservationTable::new(policy(4, 60));
        let grant = table
            .try_reserve(peer(1), false, Instant::now())
            .decision
            .unwrap();
        table.release_circuit_slot(&peer(1), grant.generation);
    }

    #[test]
    fn test_drain() {
        let table = ReservationTable::new(policy(4, 60));
        let now = Instant::now();
        for n in 0..3 {
            table.try_reserve(peer(n), false, now).decision.unwrap();
        }
        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_reserves_for_last_slot() {
        let table = std::sync::Arc::new(ReservationTable::new(policy(3, 60)));
        let now = Instant::now();
        assert!(table.try_reserve(peer(1), false, now).decision.is_ok());
        assert!(table.try_reserve(peer(2), false, now).decision.is_ok());

        let handles: Vec<_> = (0..8u8)
            .map(|n| {
                let table = std::sync::Arc::clone(&table);
                std::thread::spawn(move || table.try_reserve(peer(10 + n), false, now).decision)
            })
            .collect();
        let decisions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(decisions.iter().filter(|d| d.is_ok()).count(), 1);
        assert!(
            decisions
                .iter()
                .filter_map(|d| d.as_ref().err())
                .all(|reason| *reason == RejectReason::CapacityExceeded)
        );
        assert_eq!(table.len(), 3);
        assert_eq!(table.live_count(now), 3);
    }
}
