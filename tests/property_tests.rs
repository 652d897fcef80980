//! Property-based tests for relay admission and accounting
//!
//! Every test drives the engine with explicit instants, so expiry is
//! deterministic.

use proptest::prelude::*;
use relay_core::{
    ByteVerdict, CircuitLimits, CircuitRequest, CloseReason, Limit, LimitPolicy, RejectReason,
    Relay, RelayEvent, ReservationRequest, ReservationTable,
};
use relay_integration_tests::{RecordingSink, peer};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Op {
    Reserve { peer: u32, renewal: bool },
    Dial { source: u32, destination: u32 },
    Release { peer: u32 },
    Advance { millis: u64 },
    Sweep,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..6, any::<bool>()).prop_map(|(peer, renewal)| Op::Reserve { peer, renewal }),
        (10u32..14, 0u32..6).prop_map(|(source, destination)| Op::Dial {
            source,
            destination
        }),
        (0u32..6).prop_map(|peer| Op::Release { peer }),
        (0u64..600).prop_map(|millis| Op::Advance { millis }),
        Just(Op::Sweep),
    ]
}

fn limit_strategy(max: usize) -> impl Strategy<Value = Limit<usize>> {
    prop_oneof![Just(Limit::Unbounded), (1..=max).prop_map(Limit::Max)]
}

// ============================================================================
// Reservation Table
// ============================================================================

mod reservation_properties {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn live_reservations_never_exceed_ceiling(
            max in 1usize..5,
            ops in prop::collection::vec((0u32..8, any::<bool>(), 0u64..400), 1..80),
        ) {
            let table = ReservationTable::new(LimitPolicy {
                max_reservations: Limit::Max(max),
                reservation_ttl: Limit::Max(Duration::from_secs(1)),
                ..LimitPolicy::default()
            });
            let mut now = Instant::now();

            for (n, renewal, advance) in ops {
                now += Duration::from_millis(advance);
                let _ = table.try_reserve(peer(n), renewal, now);
                prop_assert!(table.live_count(now) <= max);
                prop_assert!(table.len() <= max);
            }
        }

        #[test]
        fn release_is_idempotent(
            peers in prop::collection::hash_set(0u32..32, 1..10),
        ) {
            let table = ReservationTable::new(LimitPolicy::unbounded());
            let now = Instant::now();
            for n in &peers {
                prop_assert!(table.try_reserve(peer(*n), false, now).decision.is_ok());
            }
            for n in &peers {
                prop_assert!(table.release(&peer(*n)).is_some());
                prop_assert!(table.release(&peer(*n)).is_none());
            }
            prop_assert!(table.is_empty());
        }
    }
}

// ============================================================================
// Circuit admission
// ============================================================================

mod admission_properties {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn admission_follows_destination_liveness(
            max_reservations in limit_strategy(4),
            per_reservation in limit_strategy(3),
            ops in prop::collection::vec(op_strategy(), 1..100),
        ) {
            let relay = Relay::new(LimitPolicy {
                max_reservations,
                max_circuits_per_reservation: per_reservation,
                max_circuits: Limit::Unbounded,
                reservation_ttl: Limit::Max(Duration::from_secs(1)),
                max_circuit_duration: Limit::Unbounded,
                max_circuit_bytes: Limit::Unbounded,
            });
            let mut now = Instant::now();

            for op in ops {
                match op {
                    Op::Reserve { peer: n, renewal } => {
                        let _ = relay.process_reservation_request_at(
                            ReservationRequest { peer: peer(n), renewal },
                            now,
                        );
                    }
                    Op::Dial { source, destination } => {
                        let live = relay
                            .reservation(&peer(destination))
                            .is_some_and(|r| r.is_live(now));
                        let result = relay.process_circuit_request_at(
                            CircuitRequest {
                                source: peer(source),
                                destination: peer(destination),
                                limits: CircuitLimits::UNBOUNDED,
                            },
                            now,
                        );
                        match result {
                            Ok(_) => prop_assert!(live),
                            Err(RejectReason::NoReservation) => prop_assert!(!live),
                            Err(_) => {}
                        }
                    }
                    Op::Release { peer: n } => {
                        relay.release_reservation(&peer(n));
                    }
                    Op::Advance { millis } => now += Duration::from_millis(millis),
                    Op::Sweep => {
                        relay.sweep_at(now);
                    }
                }

                if let Limit::Max(max) = per_reservation {
                    for n in 0..6 {
                        if let Some(reservation) = relay.reservation(&peer(n)) {
                            prop_assert!(reservation.active_circuits <= max);
                        }
                    }
                }
            }
        }

        #[test]
        fn cascade_closes_exactly_k_circuits(k in 0usize..12, bystanders in 0usize..4) {
            let metrics = RecordingSink::new();
            let relay = Relay::with_metrics(LimitPolicy::unbounded(), metrics.clone());
            for n in [1, 2] {
                relay
                    .process_reservation_request(ReservationRequest { peer: peer(n), renewal: false })
                    .unwrap();
            }
            let dial = |source: usize, destination: u32| CircuitRequest {
                source: peer(100 + source as u32),
                destination: peer(destination),
                limits: CircuitLimits::UNBOUNDED,
            };
            for i in 0..k {
                relay.process_circuit_request(dial(i, 1)).unwrap();
            }
            for i in 0..bystanders {
                relay.process_circuit_request(dial(i, 2)).unwrap();
            }

            prop_assert!(relay.release_reservation(&peer(1)));
            prop_assert!(!relay.release_reservation(&peer(1)));

            prop_assert_eq!(metrics.closed_connections(), k);
            prop_assert_eq!(
                metrics.count(|e| *e == RelayEvent::ReservationClosed { open_circuits: k }),
                1
            );
            prop_assert_eq!(relay.circuit_count(), bystanders);
        }
    }
}

// ============================================================================
// Byte accounting
// ============================================================================

mod byte_properties {
    use super::*;

    fn open(max_bytes: Limit<u64>) -> (Relay, relay_core::CircuitGrant) {
        let relay = Relay::new(LimitPolicy {
            max_circuit_bytes: max_bytes,
            ..LimitPolicy::unbounded()
        });
        relay
            .process_reservation_request(ReservationRequest { peer: peer(1), renewal: false })
            .unwrap();
        let grant = relay
            .process_circuit_request(CircuitRequest {
                source: peer(2),
                destination: peer(1),
                limits: CircuitLimits::UNBOUNDED,
            })
            .unwrap();
        (relay, grant)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn bytes_are_monotonic_and_capped(
            max in 1u64..10_000,
            chunks in prop::collection::vec(0u64..2_000, 1..40),
        ) {
            let (relay, grant) = open(Limit::Max(max));
            let mut previous = 0u64;

            for n in chunks {
                let verdict = relay.record_bytes(grant.id, n);
                let total = relay.circuit(grant.id).unwrap().bytes_transferred;

                prop_assert!(total >= previous);
                prop_assert!(total <= max);
                match verdict {
                    ByteVerdict::Continue => prop_assert_eq!(total, previous + n),
                    ByteVerdict::LimitReached { permitted } => {
                        prop_assert!(permitted < n);
                        prop_assert_eq!(total, previous + permitted);
                        prop_assert_eq!(total, max);
                    }
                    ByteVerdict::Unknown => prop_assert!(false, "circuit vanished"),
                }
                previous = total;
            }

            let closed = relay.close_circuit(grant.id, CloseReason::ByteLimit).unwrap();
            prop_assert_eq!(closed.bytes_transferred, previous);
        }

        #[test]
        fn unbounded_bytes_saturate(chunks in prop::collection::vec(any::<u64>(), 1..8)) {
            let (relay, grant) = open(Limit::Unbounded);
            let mut expected = 0u64;
            for n in chunks {
                prop_assert_eq!(relay.record_bytes(grant.id, n), ByteVerdict::Continue);
                expected = expected.saturating_add(n);
            }
            prop_assert_eq!(relay.circuit(grant.id).unwrap().bytes_transferred, expected);
        }

        #[test]
        fn close_is_idempotent(closes in 1usize..5) {
            let metrics = RecordingSink::new();
            let relay = Relay::with_metrics(LimitPolicy::unbounded(), metrics.clone());
            relay
                .process_reservation_request(ReservationRequest { peer: peer(1), renewal: false })
                .unwrap();
            let grant = relay
                .process_circuit_request(CircuitRequest {
                    source: peer(2),
                    destination: peer(1),
                    limits: CircuitLimits::UNBOUNDED,
                })
                .unwrap();

            let closed = (0..closes)
                .filter(|_| relay.close_circuit(grant.id, CloseReason::Finished).is_some())
                .count();
            prop_assert_eq!(closed, 1);
            prop_assert_eq!(metrics.closed_connections(), 1);
            prop_assert_eq!(relay.reservation(&peer(1)).unwrap().active_circuits, 0);
        }
    }
}
