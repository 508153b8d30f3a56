/**
 * transport/udp.rs
 *
 * UDP host. One message per datagram, with a one-byte control header so
 * both sides of a simultaneous open can tell a dial from an answer.
 *
 * Outbound attempts re-send their Syn on every service call until answered;
 * that refresh traffic is what keeps the NAT mapping open for the peer's
 * packets to come back through.
 */

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{Event, Host, Transport};
use crate::error::TransportError;

const MAGIC: &[u8; 4] = b"MPT1";
const MAX_DATAGRAM: usize = 1400;
const SYN_INTERVAL: Duration = Duration::from_millis(200);

const KIND_SYN: u8 = 1;
const KIND_SYN_ACK: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_FIN: u8 = 4;
const KIND_FIN_ACK: u8 = 5;

#[derive(Debug)]
enum PeerState {
    /// Outbound dial in flight; `Instant` is the last Syn send time.
    Pending(Instant),
    Connected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

impl Transport for UdpTransport {
    type Host = UdpHost;

    fn bind(&self, port: u16, peer_capacity: usize) -> Result<UdpHost, TransportError> {
        UdpHost::bind(port, peer_capacity)
    }

    fn resolve(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        addr.to_socket_addrs()
            .map_err(TransportError::Io)?
            .next()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {addr}"),
                ))
            })
    }
}

pub struct UdpHost {
    socket: UdpSocket,
    port: u16,
    peer_capacity: usize,
    peers: HashMap<SocketAddr, PeerState>,
}

impl UdpHost {
    fn bind(port: u16, peer_capacity: usize) -> Result<Self, TransportError> {
        // SO_REUSEADDR so a follow-up search can rebind the range without
        // waiting out lingering sockets.
        let bind = |port: u16| -> std::io::Result<UdpSocket> {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            let addr: SocketAddr = ([0, 0, 0, 0], port).into();
            socket.bind(&addr.into())?;
            UdpSocket::from_std(socket.into())
        };

        let socket = bind(port).map_err(|source| TransportError::Bind { port, source })?;
        let port = socket
            .local_addr()
            .map_err(TransportError::Io)?
            .port();
        debug!(port, "bound udp host");
        Ok(Self {
            socket,
            port,
            peer_capacity,
            peers: HashMap::new(),
        })
    }

    fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.push(kind);
        buf.extend_from_slice(payload);
        buf
    }

    fn send_control(&self, addr: SocketAddr, kind: u8) {
        // Transient losses here are fine, timeouts cover them.
        let _ = self.socket.try_send_to(&Self::frame(kind, &[]), addr);
    }

    /// Re-dial every pending peer whose Syn interval elapsed.
    fn refresh_pending(&mut self) {
        let now = Instant::now();
        let due: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter_map(|(addr, state)| match state {
                PeerState::Pending(last) if now.duration_since(*last) >= SYN_INTERVAL => {
                    Some(*addr)
                }
                _ => None,
            })
            .collect();
        for addr in due {
            self.send_control(addr, KIND_SYN);
            self.peers.insert(addr, PeerState::Pending(now));
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, data: &[u8]) -> Option<Event> {
        if data.len() < 5 || &data[..4] != MAGIC {
            trace!(%from, len = data.len(), "ignoring malformed datagram");
            return None;
        }
        let (kind, payload) = (data[4], &data[5..]);
        match kind {
            KIND_SYN => {
                match self.peers.get(&from) {
                    Some(PeerState::Connected) => {
                        // Duplicate dial from an established peer.
                        self.send_control(from, KIND_SYN_ACK);
                        None
                    }
                    Some(PeerState::Pending(_)) => {
                        // Simultaneous open: our dial crossed theirs.
                        self.peers.insert(from, PeerState::Connected);
                        self.send_control(from, KIND_SYN_ACK);
                        Some(Event::Connect { peer: from })
                    }
                    None => {
                        if self.connected_count() >= self.peer_capacity {
                            trace!(%from, "at peer capacity, dropping dial");
                            return None;
                        }
                        self.peers.insert(from, PeerState::Connected);
                        self.send_control(from, KIND_SYN_ACK);
                        Some(Event::Connect { peer: from })
                    }
                }
            }
            KIND_SYN_ACK => match self.peers.get(&from) {
                Some(PeerState::Pending(_)) => {
                    self.peers.insert(from, PeerState::Connected);
                    Some(Event::Connect { peer: from })
                }
                _ => None,
            },
            KIND_DATA => match self.peers.get(&from) {
                Some(PeerState::Connected) => Some(Event::Receive {
                    peer: from,
                    payload: payload.to_vec(),
                }),
                _ => None,
            },
            KIND_FIN => {
                self.send_control(from, KIND_FIN_ACK);
                if self.peers.remove(&from).is_some() {
                    Some(Event::Disconnect { peer: from })
                } else {
                    None
                }
            }
            KIND_FIN_ACK => self
                .peers
                .remove(&from)
                .map(|_| Event::Disconnect { peer: from }),
            _ => None,
        }
    }

    fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|s| matches!(s, PeerState::Connected))
            .count()
    }
}

impl Host for UdpHost {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        debug!(%addr, "dialing peer");
        self.peers.insert(addr, PeerState::Pending(Instant::now()));
        self.send_control(addr, KIND_SYN);
        Ok(())
    }

    fn send(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        let _ = self.socket.try_send_to(&Self::frame(KIND_DATA, payload), addr);
        Ok(())
    }

    async fn service(&mut self, timeout: Duration) -> Result<Option<Event>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            self.refresh_pending();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let step = remaining.min(SYN_INTERVAL);
            match tokio::time::timeout(step, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok((len, from))) => {
                    if let Some(event) = self.handle_datagram(from, &buf[..len]) {
                        return Ok(Some(event));
                    }
                }
                // Per-packet receive errors are transient (ICMP-induced
                // resets on some platforms); keep polling.
                Ok(Err(e)) => trace!(error = %e, "transient recv error"),
            }
        }
    }

    fn disconnect(&mut self, addr: SocketAddr) {
        self.send_control(addr, KIND_FIN);
    }

    fn reset(&mut self, addr: SocketAddr) {
        self.peers.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simultaneous_open_yields_one_connect_per_side() {
        let transport = UdpTransport;
        let mut a = transport.bind(0, 4).unwrap();
        let mut b = transport.bind(0, 4).unwrap();
        let a_addr: SocketAddr = ([127, 0, 0, 1], a.local_port()).into();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();

        a.connect(b_addr).unwrap();
        b.connect(a_addr).unwrap();

        let mut a_connects = 0;
        let mut b_connects = 0;
        for _ in 0..10 {
            if let Some(Event::Connect { .. }) =
                a.service(Duration::from_millis(50)).await.unwrap()
            {
                a_connects += 1;
            }
            if let Some(Event::Connect { .. }) =
                b.service(Duration::from_millis(50)).await.unwrap()
            {
                b_connects += 1;
            }
            if a_connects > 0 && b_connects > 0 {
                break;
            }
        }
        assert_eq!(a_connects, 1);
        assert_eq!(b_connects, 1);
    }

    #[tokio::test]
    async fn data_flows_after_connect() {
        let transport = UdpTransport;
        let mut a = transport.bind(0, 4).unwrap();
        let mut b = transport.bind(0, 4).unwrap();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();

        a.connect(b_addr).unwrap();
        // Drive both until a sees the SynAck.
        let mut a_peer = None;
        for _ in 0..10 {
            let _ = b.service(Duration::from_millis(50)).await.unwrap();
            if let Some(Event::Connect { peer }) =
                a.service(Duration::from_millis(50)).await.unwrap()
            {
                a_peer = Some(peer);
                break;
            }
        }
        let a_peer = a_peer.expect("connect timed out");

        a.send(a_peer, b"ping").unwrap();
        let mut got = None;
        for _ in 0..10 {
            if let Some(Event::Receive { payload, .. }) =
                b.service(Duration::from_millis(50)).await.unwrap()
            {
                got = Some(payload);
                break;
            }
        }
        assert_eq!(got.as_deref(), Some(&b"ping"[..]));
    }
}
