//! Relay node server.
//!
//! One task per accepted TCP connection. A connection starts with the
//! signed `Hello`/`Welcome`/`Authenticate` handshake and then takes one of
//! three roles:
//!
//! - **Control**: after a granted `Reserve`, the connection is the reserving
//!   peer's control channel. The relay announces circuits on it with
//!   `Incoming`, and the reservation is released when it closes.
//! - **Source**: a `Connect` that the engine accepts waits for the
//!   destination to pick the circuit up, then turns into a relayed stream.
//! - **Destination**: an `Accept` hands the connection to the waiting
//!   source.
//!
//! Connections that hold no reservation are dropped after the idle timeout.

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::identity::{Identity, handshake_nonce, verify_handshake};
use crate::protocol::{ClientMessage, PROTOCOL_VERSION, RelayMessage, read_frame, write_frame};
use crate::pump::{CHUNK_SIZE, pump};
use dashmap::DashMap;
use relay_core::{
    CircuitId, CircuitLimits, CircuitRequest, CloseReason, MetricsSink, PeerId, Relay,
    ReservationRequest, ReservationVoucher, Status,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Queued messages per control connection
const CONTROL_QUEUE: usize = 32;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Control connection of a reserving peer
#[derive(Debug)]
struct ControlHandle {
    conn_id: u64,
    generation: u64,
    tx: mpsc::Sender<RelayMessage>,
}

/// Circuit waiting for its destination to accept
#[derive(Debug)]
struct PendingCircuit {
    destination: PeerId,
    tx: oneshot::Sender<TcpStream>,
}

/// State shared by every connection task
#[derive(Debug)]
struct Shared {
    relay: Arc<Relay>,
    peer_id: PeerId,
    agent: String,
    idle_timeout: Duration,
    accept_timeout: Duration,
    controls: DashMap<PeerId, ControlHandle>,
    pending: DashMap<CircuitId, PendingCircuit>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    next_conn_id: AtomicU64,
}

/// A bound relay node, ready to run
#[derive(Debug)]
pub struct RelayNode {
    shared: Arc<Shared>,
    listeners: Vec<TcpListener>,
    sweep_interval: Duration,
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |e: std::io::Error| NodeError::Bind {
        addr,
        reason: e.to_string(),
    };

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    if addr.is_ipv6() {
        // Avoid dualstack so the IPv4 listener can share the port
        socket.set_only_v6(true).map_err(bind_err)?;
    }
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(listener).map_err(bind_err)
}

impl RelayNode {
    /// Bind every configured listen address
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Bind`] if any address cannot be bound, or
    /// [`NodeError::InvalidConfig`] for an invalid configuration.
    pub async fn bind(
        config: &Config,
        identity: &Identity,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let listeners = config
            .network
            .socket_addrs()
            .into_iter()
            .map(bind_listener)
            .collect::<Result<Vec<_>>>()?;

        let relay = Arc::new(Relay::with_metrics(config.limits, metrics));
        let shared = Arc::new(Shared {
            relay,
            peer_id: identity.peer_id(),
            agent: config.node.agent.clone(),
            idle_timeout: config.network.idle_timeout(),
            accept_timeout: config.network.accept_timeout(),
            controls: DashMap::new(),
            pending: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            next_conn_id: AtomicU64::new(1),
        });

        Ok(Self {
            shared,
            listeners,
            sweep_interval: config.network.sweep_interval(),
        })
    }

    /// Addresses the node is listening on
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// The protocol engine
    #[must_use]
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.shared.relay)
    }

    /// The node's peer id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// Token that stops [`RelayNode::run`] when cancelled
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled, then release every
    /// reservation, close every circuit and wait for connection tasks
    pub async fn run(self) {
        let RelayNode {
            shared,
            listeners,
            sweep_interval,
        } = self;

        for listener in listeners {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, peer = %shared.peer_id, "relay listening");
            }
            shared
                .tasks
                .spawn(accept_loop(Arc::clone(&shared), listener));
        }
        shared
            .tasks
            .spawn(sweep_loop(Arc::clone(&shared), sweep_interval));

        shared.shutdown.cancelled().await;
        info!("relay shutting down");

        shared.relay.shutdown();
        shared.tasks.close();
        shared.tasks.wait().await;
        // catches anything admitted while connection tasks were winding down
        shared.relay.shutdown();
        info!("relay stopped");
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                // Back off on descriptor exhaustion
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let conn = Arc::clone(&shared);
        shared.tasks.spawn(async move {
            if let Err(e) = conn.serve(stream, remote).await {
                debug!(%remote, error = %e, "connection ended with error");
            }
        });
    }
}

async fn sweep_loop(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                shared.relay.sweep();
            }
        }
    }
}

async fn write_control(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<RelayMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn reserve_ok(voucher: &ReservationVoucher) -> RelayMessage {
    RelayMessage::ReserveOk {
        ttl_secs: voucher.ttl.get().map(|ttl| ttl.as_secs()),
        limits: voucher.circuit_limits.into(),
    }
}

fn rejected(status: impl Into<Status>) -> RelayMessage {
    RelayMessage::Rejected {
        status: status.into(),
    }
}

impl Shared {
    /// Read the next request, or `None` on shutdown, idle timeout or a
    /// clean close
    async fn read_idle(&self, stream: &mut TcpStream) -> Result<Option<ClientMessage>> {
        let read = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            read = timeout(self.idle_timeout, read_frame::<_, ClientMessage>(stream)) => read,
        };
        match read {
            Err(_) => {
                debug!("idle timeout");
                Ok(None)
            }
            Ok(Ok(msg)) => Ok(Some(msg)),
            Ok(Err(NodeError::ConnectionClosed)) => Ok(None),
            Ok(Err(e @ (NodeError::Codec(_) | NodeError::FrameTooLarge(_)))) => {
                let _ = write_frame(stream, &rejected(Status::MalformedMessage)).await;
                Err(e)
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Report a well-formed message that is not valid where it was sent
    fn report_malformed(&self, msg: &ClientMessage) {
        debug!(message = msg.message_type(), "unexpected message");
        match msg {
            ClientMessage::Reserve { .. } => self
                .relay
                .report_reservation_failure(Status::MalformedMessage),
            ClientMessage::Connect { .. } => {
                self.relay.report_circuit_failure(Status::MalformedMessage);
            }
            _ => {}
        }
    }

    /// Run the `Hello`/`Welcome`/`Authenticate` exchange
    ///
    /// Returns the peer id the client proved it owns, or `None` if the
    /// connection closed or went idle first.
    async fn handshake(
        &self,
        stream: &mut TcpStream,
        remote: SocketAddr,
        conn_id: u64,
    ) -> Result<Option<PeerId>> {
        let claimed = match self.read_idle(stream).await? {
            Some(ClientMessage::Hello { peer, agent }) => {
                debug!(conn_id, %remote, peer = %peer.fmt_short(), %agent, "hello");
                peer
            }
            Some(other) => {
                self.report_malformed(&other);
                write_frame(stream, &rejected(Status::MalformedMessage)).await?;
                return Err(NodeError::protocol("expected Hello"));
            }
            None => return Ok(None),
        };

        let nonce = handshake_nonce();
        let welcome = RelayMessage::Welcome {
            relay: self.peer_id,
            agent: self.agent.clone(),
            observed_addr: remote,
            protocol: PROTOCOL_VERSION,
            nonce,
        };
        write_frame(stream, &welcome).await?;

        let signature = match self.read_idle(stream).await? {
            Some(ClientMessage::Authenticate { signature }) => signature,
            Some(other) => {
                self.report_malformed(&other);
                write_frame(stream, &rejected(Status::MalformedMessage)).await?;
                return Err(NodeError::protocol("expected Authenticate"));
            }
            None => return Ok(None),
        };
        if let Err(e) = verify_handshake(&claimed, &self.peer_id, &nonce, &signature) {
            warn!(conn_id, %remote, peer = %claimed.fmt_short(), error = %e, "authentication failed");
            write_frame(stream, &rejected(Status::AuthenticationFailed)).await?;
            return Err(e);
        }
        write_frame(stream, &RelayMessage::Authenticated).await?;
        Ok(Some(claimed))
    }

    async fn serve(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let Some(peer) = self.handshake(&mut stream, remote, conn_id).await? else {
            return Ok(());
        };

        loop {
            let Some(msg) = self.read_idle(&mut stream).await? else {
                return Ok(());
            };
            match msg {
                ClientMessage::Ping { nonce } => {
                    write_frame(&mut stream, &RelayMessage::Pong { nonce }).await?;
                }
                ClientMessage::Reserve { renewal } => {
                    let request = ReservationRequest { peer, renewal };
                    match self.relay.process_reservation_request(request) {
                        Ok(voucher) => return self.control(stream, peer, conn_id, voucher).await,
                        Err(reason) => write_frame(&mut stream, &rejected(reason)).await?,
                    }
                }
                ClientMessage::Connect {
                    destination,
                    limits,
                } => match self.dial(stream, peer, destination, limits.into()).await? {
                    Some(returned) => stream = returned,
                    None => return Ok(()),
                },
                ClientMessage::Accept { circuit } => {
                    match self.accept(stream, peer, circuit).await? {
                        Some(returned) => stream = returned,
                        None => return Ok(()),
                    }
                }
                other @ (ClientMessage::Hello { .. } | ClientMessage::Authenticate { .. }) => {
                    self.report_malformed(&other);
                    write_frame(&mut stream, &rejected(Status::MalformedMessage)).await?;
                    return Err(NodeError::protocol("repeated handshake"));
                }
            }
        }
    }

    /// Serve a reserving peer's control connection until it closes, then
    /// release the reservation it holds
    ///
    /// The connection owns the reservation before `ReserveOk` is written, so
    /// a peer that vanishes mid-answer still has its reservation released.
    async fn control(
        self: Arc<Self>,
        stream: TcpStream,
        peer: PeerId,
        conn_id: u64,
        voucher: ReservationVoucher,
    ) -> Result<()> {
        let generation = voucher.generation;
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        self.tasks
            .spawn(write_control(writer, rx, self.shutdown.clone()));

        if let Some(previous) = self.controls.insert(
            peer,
            ControlHandle {
                conn_id,
                generation,
                tx: tx.clone(),
            },
        ) {
            debug!(peer = %peer.fmt_short(), previous = previous.conn_id, conn_id, "control connection replaced");
        }
        info!(peer = %peer.fmt_short(), conn_id, "peer reserved");

        let answered = tx.send(reserve_ok(&voucher)).await.is_ok();
        let result = if !answered {
            Ok(())
        } else {
            loop {
                let read = tokio::select! {
                    _ = self.shutdown.cancelled() => break Ok(()),
                    read = read_frame::<_, ClientMessage>(&mut reader) => read,
                };
                let reply = match read {
                    Ok(ClientMessage::Reserve { renewal }) => {
                        match self
                            .relay
                            .process_reservation_request(ReservationRequest { peer, renewal })
                        {
                            Ok(voucher) => {
                                if let Some(mut handle) = self.controls.get_mut(&peer) {
                                    if handle.conn_id == conn_id {
                                        handle.generation = voucher.generation;
                                    }
                                }
                                reserve_ok(&voucher)
                            }
                            Err(reason) => rejected(reason),
                        }
                    }
                    Ok(ClientMessage::Ping { nonce }) => RelayMessage::Pong { nonce },
                    Ok(other) => {
                        self.report_malformed(&other);
                        rejected(Status::MalformedMessage)
                    }
                    Err(NodeError::ConnectionClosed) => break Ok(()),
                    Err(e @ (NodeError::Codec(_) | NodeError::FrameTooLarge(_))) => {
                        let _ = tx.send(rejected(Status::MalformedMessage)).await;
                        break Err(e);
                    }
                    Err(e) => break Err(e),
                };
                if tx.send(reply).await.is_err() {
                    break Ok(());
                }
            }
        };

        if let Some((_, handle)) = self.controls.remove_if(&peer, |_, h| h.conn_id == conn_id) {
            if self
                .relay
                .release_reservation_generation(&peer, handle.generation)
            {
                info!(peer = %peer.fmt_short(), conn_id, "reservation released");
            }
        }
        result
    }

    /// Handle `Connect` from `source`
    ///
    /// Returns the stream when the circuit was refused so the peer may try
    /// again, or `None` once the stream has been relayed.
    async fn dial(
        &self,
        mut stream: TcpStream,
        source: PeerId,
        destination: PeerId,
        limits: CircuitLimits,
    ) -> Result<Option<TcpStream>> {
        let request = CircuitRequest {
            source,
            destination,
            limits,
        };
        let grant = match self.relay.process_circuit_request(request) {
            Ok(grant) => grant,
            Err(reason) => {
                write_frame(&mut stream, &rejected(reason)).await?;
                return Ok(Some(stream));
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(grant.id, PendingCircuit { destination, tx });

        let control = self.controls.get(&destination).map(|h| h.tx.clone());
        let incoming = RelayMessage::Incoming {
            circuit: grant.id,
            source,
            limits: grant.limits.into(),
        };
        let notified = control.is_some_and(|control| control.try_send(incoming).is_ok());

        let accepted = if notified {
            tokio::select! {
                _ = grant.cancel.cancelled() => None,
                _ = self.shutdown.cancelled() => None,
                accepted = timeout(self.accept_timeout, rx) => accepted.ok().and_then(|r| r.ok()),
            }
        } else {
            None
        };
        self.pending.remove(&grant.id);

        let Some(mut peer_stream) = accepted else {
            debug!(
                id = %grant.id,
                destination = %destination.fmt_short(),
                notified,
                "destination did not accept circuit"
            );
            self.relay
                .close_circuit(grant.id, CloseReason::DestinationUnreachable);
            self.relay.report_circuit_failure(Status::ConnectionFailed);
            write_frame(&mut stream, &rejected(Status::ConnectionFailed)).await?;
            return Ok(Some(stream));
        };

        let connected = RelayMessage::Connected {
            circuit: grant.id,
            limits: grant.limits.into(),
        };
        let announced = async {
            write_frame(&mut stream, &connected).await?;
            write_frame(&mut peer_stream, &connected).await
        }
        .await;
        if let Err(e) = announced {
            self.relay.close_circuit(grant.id, CloseReason::Finished);
            return Err(e);
        }

        trace!(id = %grant.id, "circuit connected");
        if let Some(closed) = pump(&self.relay, &grant, stream, peer_stream, CHUNK_SIZE).await {
            debug!(
                id = %closed.id,
                reason = %closed.reason,
                bytes = closed.bytes_transferred,
                "circuit finished"
            );
        }
        Ok(None)
    }

    /// Handle `Accept` from `peer`
    ///
    /// Returns the stream when there is nothing to accept, or `None` once it
    /// has been handed to the waiting source.
    async fn accept(
        &self,
        mut stream: TcpStream,
        peer: PeerId,
        circuit: CircuitId,
    ) -> Result<Option<TcpStream>> {
        let waiting = self
            .pending
            .remove_if(&circuit, |_, p| p.destination == peer);
        let unclaimed = match waiting {
            Some((_, pending)) => match pending.tx.send(stream) {
                Ok(()) => return Ok(None),
                Err(returned) => returned,
            },
            None => stream,
        };
        stream = unclaimed;

        debug!(%circuit, peer = %peer.fmt_short(), "nothing to accept");
        write_frame(&mut stream, &rejected(Status::ConnectionFailed)).await?;
        Ok(Some(stream))
    }
}
