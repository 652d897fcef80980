//! Fuzz target for reservation and circuit admission
//!
//! Drives the engine with arbitrary operations at explicit instants and
//! checks the ceilings after every step.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use relay_core::{
    CircuitId, CircuitLimits, CircuitRequest, CloseReason, Limit, LimitPolicy, PeerId, Relay,
    ReservationRequest,
};
use std::time::{Duration, Instant};

#[derive(Debug, Arbitrary)]
enum Op {
    Reserve { peer: u8, renewal: bool },
    Dial { source: u8, destination: u8, bytes: u16 },
    Record { circuit: u8, n: u16 },
    Close { circuit: u8 },
    Release { peer: u8 },
    Advance { millis: u16 },
    Sweep,
}

#[derive(Debug, Arbitrary)]
struct Input {
    max_reservations: u8,
    per_reservation: u8,
    max_circuits: u8,
    ops: Vec<Op>,
}

fn peer(n: u8) -> PeerId {
    PeerId::from_bytes([n % 8; 32])
}

fn limit(n: u8) -> Limit<usize> {
    match n % 6 {
        0 => Limit::Unbounded,
        n => Limit::Max(n as usize),
    }
}

fuzz_target!(|input: Input| {
    let policy = LimitPolicy {
        max_reservations: limit(input.max_reservations),
        max_circuits_per_reservation: limit(input.per_reservation),
        max_circuits: limit(input.max_circuits),
        reservation_ttl: Limit::Max(Duration::from_secs(2)),
        max_circuit_duration: Limit::Max(Duration::from_secs(5)),
        max_circuit_bytes: Limit::Max(4096),
    };
    let relay = Relay::new(policy);
    let mut now = Instant::now();
    let mut opened: Vec<CircuitId> = Vec::new();

    for op in input.ops {
        match op {
            Op::Reserve { peer: n, renewal } => {
                let _ = relay.process_reservation_request_at(
                    ReservationRequest { peer: peer(n), renewal },
                    now,
                );
            }
            Op::Dial { source, destination, bytes } => {
                let request = CircuitRequest {
                    source: peer(source),
                    destination: peer(destination),
                    limits: CircuitLimits {
                        duration: Limit::Unbounded,
                        bytes: Limit::Max(u64::from(bytes)),
                    },
                };
                if let Ok(grant) = relay.process_circuit_request_at(request, now) {
                    opened.push(grant.id);
                }
            }
            Op::Record { circuit, n } => {
                if let Some(id) = opened.get(circuit as usize % opened.len().max(1)) {
                    let _ = relay.record_bytes(*id, u64::from(n));
                    if let Some(info) = relay.circuit(*id) {
                        assert!(info.limits.bytes.get().is_none_or(|max| info.bytes_transferred <= max));
                    }
                }
            }
            Op::Close { circuit } => {
                if let Some(id) = opened.get(circuit as usize % opened.len().max(1)) {
                    let _ = relay.close_circuit_at(*id, CloseReason::Finished, now);
                }
            }
            Op::Release { peer: n } => {
                relay.release_reservation(&peer(n));
            }
            Op::Advance { millis } => now += Duration::from_millis(u64::from(millis)),
            Op::Sweep => {
                relay.sweep_at(now);
            }
        }

        if let Limit::Max(max) = policy.max_reservations {
            assert!(relay.reservation_count() <= max);
        }
        if let Limit::Max(max) = policy.max_circuits {
            assert!(relay.circuit_count() <= max);
        }
        if let Limit::Max(max) = policy.max_circuits_per_reservation {
            for n in 0..8 {
                if let Some(reservation) = relay.reservation(&peer(n)) {
                    assert!(reservation.active_circuits <= max);
                }
            }
        }
    }
});
