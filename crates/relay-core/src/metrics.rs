//! Metrics sink
//!
//! The relay reports lifecycle events to a [`MetricsSink`]. Sinks observe
//! only: every callback is infallible and must return promptly, and nothing a
//! sink does can influence a relay decision.
//!
//! Provided sinks:
//! - [`LogMetrics`]: writes each event to `tracing`
//! - [`RelayMetrics`]: atomic counters with [`RelayMetrics::snapshot`]
//! - [`ChannelMetrics`]: forwards [`RelayEvent`]s over a bounded channel,
//!   dropping events when the consumer falls behind
//! - [`FanoutMetrics`]: forwards to several sinks

use crate::status::Status;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Observer of relay lifecycle events
pub trait MetricsSink: Send + Sync + Debug {
    /// The relay service was enabled or disabled
    fn relay_status(&self, _enabled: bool) {}
    /// A circuit was opened
    fn connection_opened(&self) {}
    /// A circuit was closed after `duration`
    fn connection_closed(&self, _duration: Duration) {}
    /// A circuit request was answered with `status`
    fn connection_request_handled(&self, _status: Status) {}
    /// A reservation was granted
    fn reservation_allowed(&self, _is_renewal: bool) {}
    /// A reservation was closed while `open_circuits` circuits referred to it
    fn reservation_closed(&self, _open_circuits: usize) {}
    /// A reservation request was answered with `status`
    fn reservation_request_handled(&self, _status: Status) {}
    /// `n` bytes were relayed
    fn bytes_transferred(&self, _n: u64) {}
}

/// Sink that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Sink that logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn relay_status(&self, enabled: bool) {
        info!(enabled, "relay status changed");
    }

    fn connection_opened(&self) {
        debug!("relay connection opened");
    }

    fn connection_closed(&self, duration: Duration) {
        debug!(?duration, "relay connection closed");
    }

    fn connection_request_handled(&self, status: Status) {
        debug!(%status, "relay connection request handled");
    }

    fn reservation_allowed(&self, is_renewal: bool) {
        debug!(is_renewal, "relay reservation allowed");
    }

    fn reservation_closed(&self, open_circuits: usize) {
        debug!(open_circuits, "relay reservation closed");
    }

    fn reservation_request_handled(&self, status: Status) {
        debug!(%status, "relay reservation request handled");
    }

    fn bytes_transferred(&self, n: u64) {
        trace!(bytes = n, "relay bytes transferred");
    }
}

/// Counter values at one instant
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Circuits opened
    pub connections_opened: u64,
    /// Circuits closed
    pub connections_closed: u64,
    /// Circuit requests granted
    pub connection_requests_accepted: u64,
    /// Circuit requests refused
    pub connection_requests_rejected: u64,
    /// Reservations granted (including renewals)
    pub reservations_allowed: u64,
    /// Renewals granted
    pub reservation_renewals: u64,
    /// Reservation requests refused
    pub reservation_requests_rejected: u64,
    /// Reservations closed
    pub reservations_closed: u64,
    /// Bytes relayed
    pub bytes_transferred: u64,
}

/// Counting sink
#[derive(Debug, Default)]
pub struct RelayMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connection_requests_accepted: AtomicU64,
    connection_requests_rejected: AtomicU64,
    reservations_allowed: AtomicU64,
    reservation_renewals: AtomicU64,
    reservation_requests_rejected: AtomicU64,
    reservations_closed: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl RelayMetrics {
    /// Current counter values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: load(&self.connections_opened),
            connections_closed: load(&self.connections_closed),
            connection_requests_accepted: load(&self.connection_requests_accepted),
            connection_requests_rejected: load(&self.connection_requests_rejected),
            reservations_allowed: load(&self.reservations_allowed),
            reservation_renewals: load(&self.reservation_renewals),
            reservation_requests_rejected: load(&self.reservation_requests_rejected),
            reservations_closed: load(&self.reservations_closed),
            bytes_transferred: load(&self.bytes_transferred),
        }
    }
}

impl MetricsSink for RelayMetrics {
    fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, _duration: Duration) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_request_handled(&self, status: Status) {
        if status.is_ok() {
            self.connection_requests_accepted
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.connection_requests_rejected
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reservation_allowed(&self, is_renewal: bool) {
        self.reservations_allowed.fetch_add(1, Ordering::Relaxed);
        if is_renewal {
            self.reservation_renewals.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reservation_closed(&self, _open_circuits: usize) {
        self.reservations_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn reservation_request_handled(&self, status: Status) {
        if !status.is_ok() {
            self.reservation_requests_rejected
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn bytes_transferred(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }
}

/// One lifecycle event, as forwarded by [`ChannelMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// See [`MetricsSink::relay_status`]
    RelayStatus(bool),
    /// See [`MetricsSink::connection_opened`]
    ConnectionOpened,
    /// See [`MetricsSink::connection_closed`]
    ConnectionClosed(Duration),
    /// See [`MetricsSink::connection_request_handled`]
    ConnectionRequestHandled(Status),
    /// See [`MetricsSink::reservation_allowed`]
    ReservationAllowed {
        /// Whether an existing reservation was refreshed
        is_renewal: bool,
    },
    /// See [`MetricsSink::reservation_closed`]
    ReservationClosed {
        /// Circuits open when the reservation closed
        open_circuits: usize,
    },
    /// See [`MetricsSink::reservation_request_handled`]
    ReservationRequestHandled(Status),
    /// See [`MetricsSink::bytes_transferred`]
    BytesTransferred(u64),
}

/// Fire-and-forget sink forwarding events over a bounded channel
#[derive(Debug)]
pub struct ChannelMetrics {
    tx: mpsc::Sender<RelayEvent>,
    dropped: AtomicU64,
}

impl ChannelMetrics {
    /// Create the sink and the receiving end of its queue
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the queue was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn emit(&self, event: RelayEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(%err, dropped, "metrics event dropped");
        }
    }
}

impl MetricsSink for ChannelMetrics {
    fn relay_status(&self, enabled: bool) {
        self.emit(RelayEvent::RelayStatus(enabled));
    }

    fn connection_opened(&self) {
        self.emit(RelayEvent::ConnectionOpened);
    }

    fn connection_closed(&self, duration: Duration) {
        self.emit(RelayEvent::ConnectionClosed(duration));
    }

    fn connection_request_handled(&self, status: Status) {
        self.emit(RelayEvent::ConnectionRequestHandled(status));
    }

    fn reservation_allowed(&self, is_renewal: bool) {
        self.emit(RelayEvent::ReservationAllowed { is_renewal });
    }

    fn reservation_closed(&self, open_circuits: usize) {
        self.emit(RelayEvent::ReservationClosed { open_circuits });
    }

    fn reservation_request_handled(&self, status: Status) {
        self.emit(RelayEvent::ReservationRequestHandled(status));
    }

    fn bytes_transferred(&self, n: u64) {
        self.emit(RelayEvent::BytesTransferred(n));
    }
}

/// Sink forwarding every event to each inner sink in order
#[derive(Debug, Default, Clone)]
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    /// Create an empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutMetrics {
    fn relay_status(&self, enabled: bool) {
        self.sinks.iter().for_each(|s| s.relay_status(enabled));
    }

    fn connection_opened(&self) {
        self.sinks.iter().for_each(|s| s.connection_opened());
    }

    fn connection_closed(&self, duration: Duration) {
        self.sinks.iter().for_each(|s| s.connection_closed(duration));
    }

    fn connection_request_handled(&self, status: Status) {
        self.sinks
            .iter()
            .for_each(|s| s.connection_request_handled(status));
    }

    fn reservation_allowed(&self, is_renewal: bool) {
        self.sinks
            .iter()
            .for_each(|s| s.reservation_allowed(is_renewal));
    }

    fn reservation_closed(&self, open_circuits: usize) {
        self.sinks
            .iter()
            .for_each(|s| s.reservation_closed(open_circuits));
    }

    fn reservation_request_handled(&self, status: Status) {
        self.sinks
            .iter()
            .for_each(|s| s.reservation_request_handled(status));
    }

    fn bytes_transferred(&self, n: u64) {
        self.sinks.iter().for_each(|s| s.bytes_transferred(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RejectReason;

    #[test]
    fn test_counters() {
        let metrics = RelayMetrics::default();
        metrics.reservation_allowed(false);
        metrics.reservation_allowed(true);
        metrics.reservation_request_handled(Status::Rejected(RejectReason::CapacityExceeded));
        metrics.connection_request_handled(Status::Ok);
        metrics.connection_request_handled(Status::Rejected(RejectReason::NoReservation));
        metrics.bytes_transferred(40);
        metrics.bytes_transferred(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.reservations_allowed, 2);
        assert_eq!(snap.reservation_renewals, 1);
        assert_eq!(snap.reservation_requests_rejected, 1);
        assert_eq!(snap.connection_requests_accepted, 1);
        assert_eq!(snap.connection_requests_rejected, 1);
        assert_eq!(snap.bytes_transferred, 42);
    }

    #[test]
    fn test_channel_drops_when_full() {
        let (sink, mut rx) = ChannelMetrics::new(2);
        sink.connection_opened();
        sink.bytes_transferred(7);
        sink.relay_status(true);

        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), RelayEvent::ConnectionOpened);
        assert_eq!(rx.try_recv().unwrap(), RelayEvent::BytesTransferred(7));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_survives_closed_receiver() {
        let (sink, rx) = ChannelMetrics::new(4);
        drop(rx);
        sink.reservation_closed(3);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(RelayMetrics::default());
        let b = Arc::new(RelayMetrics::default());
        let fanout = FanoutMetrics::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(LogMetrics));

        fanout.connection_opened();
        assert_eq!(a.snapshot().connections_opened, 1);
        assert_eq!(b.snapshot().connections_opened, 1);
    }
}
