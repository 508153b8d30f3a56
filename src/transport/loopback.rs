/**
 * transport/loopback.rs
 *
 * In-process transport with the same handshake semantics as the UDP host,
 * for tests that need a scripted directory server and punchable peers
 * without touching the network.
 *
 * Connecting to an unbound port silently drops the dial, which is exactly
 * what a filtering NAT does to an unanswered Syn.
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use super::{Event, Host, Transport};
use crate::error::TransportError;

#[derive(Debug)]
enum FrameKind {
    Syn,
    SynAck,
    Data(Vec<u8>),
    Fin,
    FinAck,
}

#[derive(Debug)]
struct Frame {
    from: SocketAddr,
    kind: FrameKind,
}

#[derive(Debug, Default)]
struct Registry {
    ports: HashMap<u16, mpsc::UnboundedSender<Frame>>,
    next_ephemeral: u16,
}

/// Shared fake network. Clone it into every transport that should be able
/// to reach the others.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Registry>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
        }
    }

    /// Whether a port is currently held by a live host. Lets tests assert
    /// that teardown released every endpoint.
    pub fn is_bound(&self, port: u16) -> bool {
        self.inner.lock().unwrap().ports.contains_key(&port)
    }

    fn bind(&self, port: u16) -> Result<(u16, mpsc::UnboundedReceiver<Frame>), TransportError> {
        let mut reg = self.inner.lock().unwrap();
        let port = if port == 0 {
            let mut candidate = 60000.max(reg.next_ephemeral);
            while reg.ports.contains_key(&candidate) {
                candidate = candidate.wrapping_add(1).max(60000);
            }
            reg.next_ephemeral = candidate.wrapping_add(1);
            candidate
        } else {
            port
        };
        if reg.ports.contains_key(&port) {
            return Err(TransportError::Bind {
                port,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "port in use"),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        reg.ports.insert(port, tx);
        Ok((port, rx))
    }

    fn unbind(&self, port: u16) {
        self.inner.lock().unwrap().ports.remove(&port);
    }

    fn deliver(&self, to: SocketAddr, frame: Frame) {
        let reg = self.inner.lock().unwrap();
        match reg.ports.get(&to.port()) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            // Unbound target: the datagram vanishes, like any filtered dial.
            None => trace!(%to, "dropping frame to unbound port"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    type Host = LoopbackHost;

    fn bind(&self, port: u16, peer_capacity: usize) -> Result<LoopbackHost, TransportError> {
        let (port, rx) = self.network.bind(port)?;
        Ok(LoopbackHost {
            network: self.network.clone(),
            port,
            peer_capacity,
            rx,
            peers: HashMap::new(),
        })
    }

    fn resolve(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        if let Ok(sa) = addr.parse() {
            return Ok(sa);
        }
        // Hostname form: everything resolves to loopback here.
        let port = addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad address {addr}"),
                ))
            })?;
        Ok(SocketAddr::from(([127, 0, 0, 1], port)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Pending,
    Connected,
}

#[derive(Debug)]
pub struct LoopbackHost {
    network: LoopbackNetwork,
    port: u16,
    peer_capacity: usize,
    rx: mpsc::UnboundedReceiver<Frame>,
    peers: HashMap<SocketAddr, PeerState>,
}

impl LoopbackHost {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    fn push(&self, to: SocketAddr, kind: FrameKind) {
        self.network.deliver(
            to,
            Frame {
                from: self.addr(),
                kind,
            },
        );
    }

    fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|s| **s == PeerState::Connected)
            .count()
    }

    fn handle_frame(&mut self, frame: Frame) -> Option<Event> {
        let from = frame.from;
        match frame.kind {
            FrameKind::Syn => match self.peers.get(&from) {
                Some(PeerState::Connected) => {
                    self.push(from, FrameKind::SynAck);
                    None
                }
                Some(PeerState::Pending) => {
                    self.peers.insert(from, PeerState::Connected);
                    self.push(from, FrameKind::SynAck);
                    Some(Event::Connect { peer: from })
                }
                None => {
                    if self.connected_count() >= self.peer_capacity {
                        return None;
                    }
                    self.peers.insert(from, PeerState::Connected);
                    self.push(from, FrameKind::SynAck);
                    Some(Event::Connect { peer: from })
                }
            },
            FrameKind::SynAck => match self.peers.get(&from) {
                Some(PeerState::Pending) => {
                    self.peers.insert(from, PeerState::Connected);
                    Some(Event::Connect { peer: from })
                }
                _ => None,
            },
            FrameKind::Data(payload) => match self.peers.get(&from) {
                Some(PeerState::Connected) => Some(Event::Receive {
                    peer: from,
                    payload,
                }),
                _ => None,
            },
            FrameKind::Fin => {
                self.push(from, FrameKind::FinAck);
                self.peers
                    .remove(&from)
                    .map(|_| Event::Disconnect { peer: from })
            }
            FrameKind::FinAck => self
                .peers
                .remove(&from)
                .map(|_| Event::Disconnect { peer: from }),
        }
    }
}

impl Host for LoopbackHost {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        self.peers.insert(addr, PeerState::Pending);
        self.push(addr, FrameKind::Syn);
        Ok(())
    }

    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        self.push(addr, FrameKind::Data(payload.to_vec()));
        Ok(())
    }

    async fn service(&mut self, timeout: Duration) -> Result<Option<Event>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Ok(None),
                Ok(Some(frame)) => {
                    if let Some(event) = self.handle_frame(frame) {
                        return Ok(Some(event));
                    }
                }
            }
        }
    }

    fn disconnect(&mut self, addr: SocketAddr) {
        self.push(addr, FrameKind::Fin);
    }

    fn reset(&mut self, addr: SocketAddr) {
        self.peers.remove(&addr);
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        self.network.unbind(self.port);
    }
}
