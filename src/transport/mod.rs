/**
 * transport/mod.rs
 *
 * Datagram host abstraction the matchmaking core runs on:
 * - bind to a local port, connect out, send one message per datagram
 * - polling receive-with-timeout yielding typed events
 *
 * Two implementations: a UDP host for real traffic and an in-process
 * loopback host for tests.
 */

mod loopback;
mod udp;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use udp::UdpTransport;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportError;

/// Typed events yielded by `Host::service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A pairwise connection attempt completed; `peer` is the observed
    /// remote address (which may differ from the dialed one when a NAT
    /// rewrites the source port).
    Connect { peer: SocketAddr },
    Receive { peer: SocketAddr, payload: Vec<u8> },
    Disconnect { peer: SocketAddr },
}

impl Event {
    pub fn peer(&self) -> SocketAddr {
        match self {
            Event::Connect { peer } => *peer,
            Event::Receive { peer, .. } => *peer,
            Event::Disconnect { peer } => *peer,
        }
    }
}

/// A bound local endpoint. Dropping it releases the port.
pub trait Host: Send + 'static {
    fn local_port(&self) -> u16;

    /// Start an outbound connection attempt. Non-blocking; completion is
    /// reported as a `Connect` event from `service`.
    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Send one message to a peer. Per-packet failures are transient; the
    /// protocol layer relies on timeouts, not on this result.
    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError>;

    /// Poll for the next event, waiting at most `timeout`. `None` means the
    /// step elapsed quietly.
    fn service(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Event>, TransportError>> + Send;

    /// Begin a graceful disconnect. The peer's acknowledgement arrives as a
    /// `Disconnect` event; callers bound the wait and fall back to `reset`.
    fn disconnect(&mut self, addr: SocketAddr);

    /// Forcibly drop all state for a peer.
    fn reset(&mut self, addr: SocketAddr);
}

/// Factory for hosts. Cloned into the worker tasks that own the endpoints.
pub trait Transport: Clone + Send + Sync + 'static {
    type Host: Host;

    /// Bind a host to `port`, sized for up to `peer_capacity` peers.
    fn bind(&self, port: u16, peer_capacity: usize) -> Result<Self::Host, TransportError>;

    /// Resolve a "host:port" string to a socket address.
    fn resolve(&self, addr: &str) -> Result<SocketAddr, TransportError>;
}
