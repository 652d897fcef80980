//! Relay client for reserving and dialing through a relay node.

use crate::error::{NodeError, Result};
use crate::identity::Identity;
use crate::protocol::{ClientMessage, PROTOCOL_VERSION, RelayMessage, read_frame, write_frame};
use relay_core::{CircuitId, CircuitLimits, Limit, PeerId};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;

/// How long to wait for the relay to answer a request
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reservation granted by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationInfo {
    /// Time to live of the reservation
    pub ttl: Limit<Duration>,
    /// Caps applied to circuits towards us
    pub limits: CircuitLimits,
}

/// A circuit announced on the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingCircuit {
    /// Circuit to accept
    pub circuit: CircuitId,
    /// Dialing peer
    pub source: PeerId,
    /// Effective limits
    pub limits: CircuitLimits,
}

/// An established circuit; the stream carries relayed bytes
#[derive(Debug)]
pub struct RelayedCircuit {
    /// Circuit token
    pub id: CircuitId,
    /// Effective limits
    pub limits: CircuitLimits,
    /// Stream to the remote peer
    pub stream: TcpStream,
}

/// Connection to a relay node
#[derive(Debug)]
pub struct RelayClient {
    relay_addr: SocketAddr,
    identity: Identity,
    agent: String,
    relay: PeerId,
    relay_agent: String,
    observed_addr: SocketAddr,
    stream: TcpStream,
    /// Circuits announced while waiting for another answer
    incoming: VecDeque<IncomingCircuit>,
}

impl RelayClient {
    /// Connect to a relay and prove ownership of `identity`
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails, times out, the relay speaks
    /// another protocol version or refuses the signed nonce.
    pub async fn connect(addr: SocketAddr, identity: &Identity, agent: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let hello = ClientMessage::Hello {
            peer: identity.peer_id(),
            agent: agent.to_string(),
        };
        write_frame(&mut stream, &hello).await?;

        let (relay, relay_agent, observed_addr, nonce) = match Self::read_reply(&mut stream).await? {
            RelayMessage::Welcome {
                relay,
                agent,
                observed_addr,
                protocol,
                nonce,
            } => {
                if protocol != PROTOCOL_VERSION {
                    return Err(NodeError::protocol("unsupported protocol version"));
                }
                (relay, agent, observed_addr, nonce)
            }
            RelayMessage::Rejected { status } => return Err(NodeError::Rejected(status)),
            _ => return Err(NodeError::protocol("expected Welcome")),
        };

        let authenticate = ClientMessage::Authenticate {
            signature: identity.sign_handshake(&relay, &nonce),
        };
        write_frame(&mut stream, &authenticate).await?;

        match Self::read_reply(&mut stream).await? {
            RelayMessage::Authenticated => Ok(Self {
                relay_addr: addr,
                identity: identity.clone(),
                agent: agent.to_string(),
                relay,
                relay_agent,
                observed_addr,
                stream,
                incoming: VecDeque::new(),
            }),
            RelayMessage::Rejected { status } => Err(NodeError::Rejected(status)),
            _ => Err(NodeError::protocol("expected Authenticated")),
        }
    }

    async fn read_reply(stream: &mut TcpStream) -> Result<RelayMessage> {
        time::timeout(RESPONSE_TIMEOUT, read_frame(stream))
            .await
            .map_err(|_| NodeError::timeout("relay response"))?
    }

    /// Read replies until one that is not an `Incoming` announcement
    async fn next_reply(&mut self) -> Result<RelayMessage> {
        loop {
            match Self::read_reply(&mut self.stream).await? {
                RelayMessage::Incoming {
                    circuit,
                    source,
                    limits,
                } => self.incoming.push_back(IncomingCircuit {
                    circuit,
                    source,
                    limits: limits.into(),
                }),
                other => return Ok(other),
            }
        }
    }

    /// The relay's peer id
    #[must_use]
    pub fn relay_id(&self) -> PeerId {
        self.relay
    }

    /// Software identifier the relay announced
    #[must_use]
    pub fn relay_agent(&self) -> &str {
        &self.relay_agent
    }

    /// Our address as seen by the relay
    #[must_use]
    pub fn observed_addr(&self) -> SocketAddr {
        self.observed_addr
    }

    /// Reserve a slot; the reservation lasts as long as this connection
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Rejected`] if the relay refuses.
    pub async fn reserve(&mut self, renewal: bool) -> Result<ReservationInfo> {
        write_frame(&mut self.stream, &ClientMessage::Reserve { renewal }).await?;
        match self.next_reply().await? {
            RelayMessage::ReserveOk { ttl_secs, limits } => Ok(ReservationInfo {
                ttl: ttl_secs.map(Duration::from_secs).into(),
                limits: limits.into(),
            }),
            RelayMessage::Rejected { status } => Err(NodeError::Rejected(status)),
            _ => Err(NodeError::protocol("expected ReserveOk")),
        }
    }

    /// Round-trip a ping
    ///
    /// # Errors
    ///
    /// Returns error if the relay does not echo the nonce.
    pub async fn ping(&mut self, nonce: u64) -> Result<()> {
        write_frame(&mut self.stream, &ClientMessage::Ping { nonce }).await?;
        match self.next_reply().await? {
            RelayMessage::Pong { nonce: echoed } if echoed == nonce => Ok(()),
            RelayMessage::Rejected { status } => Err(NodeError::Rejected(status)),
            _ => Err(NodeError::protocol("expected Pong")),
        }
    }

    /// Wait for the next circuit announced on this control connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection closes or sends anything else.
    pub async fn next_incoming(&mut self) -> Result<IncomingCircuit> {
        if let Some(incoming) = self.incoming.pop_front() {
            return Ok(incoming);
        }
        match read_frame(&mut self.stream).await? {
            RelayMessage::Incoming {
                circuit,
                source,
                limits,
            } => Ok(IncomingCircuit {
                circuit,
                source,
                limits: limits.into(),
            }),
            _ => Err(NodeError::protocol("expected Incoming")),
        }
    }

    /// Pick up an announced circuit on a fresh connection
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Rejected`] if the circuit is gone.
    pub async fn accept_incoming(&self, incoming: &IncomingCircuit) -> Result<RelayedCircuit> {
        let client = Self::connect(self.relay_addr, &self.identity, &self.agent).await?;
        client.accept(incoming.circuit).await
    }

    /// Send `Accept` for `circuit` on this connection
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Rejected`] if the circuit is gone.
    pub async fn accept(mut self, circuit: CircuitId) -> Result<RelayedCircuit> {
        write_frame(&mut self.stream, &ClientMessage::Accept { circuit }).await?;
        self.await_connected().await
    }

    /// Ask to be connected to `destination`
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Rejected`] with the relay's status if the
    /// circuit is refused or the destination never picks it up.
    pub async fn dial(
        mut self,
        destination: PeerId,
        limits: CircuitLimits,
    ) -> Result<RelayedCircuit> {
        let connect = ClientMessage::Connect {
            destination,
            limits: limits.into(),
        };
        write_frame(&mut self.stream, &connect).await?;
        self.await_connected().await
    }

    async fn await_connected(mut self) -> Result<RelayedCircuit> {
        match self.next_reply().await? {
            RelayMessage::Connected { circuit, limits } => Ok(RelayedCircuit {
                id: circuit,
                limits: limits.into(),
                stream: self.stream,
            }),
            RelayMessage::Rejected { status } => Err(NodeError::Rejected(status)),
            _ => Err(NodeError::protocol("expected Connected")),
        }
    }
}
