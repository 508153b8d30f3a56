/**
 * matchmaking/coordinator.rs
 *
 * Drives simultaneous outbound connection attempts toward every candidate
 * address and reconciles the resulting CONNECT events into one verified
 * peer per remote slot.
 *
 * The local port from ticket negotiation is reused here on purpose: the
 * remote NATs already hold mappings keyed to it, so dialing from the same
 * port is what lets the crossing packets through.
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::types::ConnectionCandidate;
use crate::config::MatchmakingConfig;
use crate::transport::{Event, Host, Transport};

/// Connection progress, pollable by the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Unset,
    Initiated,
    Connected,
    Failed,
    Disconnected,
}

/// Terminal result of one coordinator run.
pub enum CoordinatorOutcome<H: Host> {
    Connected {
        host: H,
        /// Verified peer address per remote slot, in candidate order.
        peers: Vec<SocketAddr>,
    },
    Failed {
        /// Still-unconnected remote slot indices, ascending.
        failed_slots: Vec<usize>,
    },
}

pub struct CoordinatorHandle<H: Host> {
    pub status: watch::Receiver<ConnectStatus>,
    outcome: oneshot::Receiver<CoordinatorOutcome<H>>,
    remote_count: usize,
}

impl<H: Host> CoordinatorHandle<H> {
    /// Wait for the coordinator to reach a terminal status. The worker
    /// observes the shared cancel flag, so this resolves within one poll
    /// step of cancellation as well.
    pub async fn outcome(self) -> CoordinatorOutcome<H> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            // Worker dropped without reporting; treat every slot as failed.
            Err(_) => CoordinatorOutcome::Failed {
                failed_slots: (0..self.remote_count).collect(),
            },
        }
    }
}

pub fn spawn<T: Transport>(
    transport: T,
    config: Arc<MatchmakingConfig>,
    local_port: u16,
    candidates: Vec<ConnectionCandidate>,
    cancel: Arc<AtomicBool>,
) -> CoordinatorHandle<T::Host> {
    let (status_tx, status_rx) = watch::channel(ConnectStatus::Unset);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let remote_count = candidates.len();
    tokio::spawn(async move {
        let outcome = run(transport, config, local_port, candidates, cancel, &status_tx).await;
        let _ = outcome_tx.send(outcome);
    });
    CoordinatorHandle {
        status: status_rx,
        outcome: outcome_rx,
        remote_count,
    }
}

async fn run<T: Transport>(
    transport: T,
    config: Arc<MatchmakingConfig>,
    local_port: u16,
    candidates: Vec<ConnectionCandidate>,
    cancel: Arc<AtomicBool>,
    status: &watch::Sender<ConnectStatus>,
) -> CoordinatorOutcome<T::Host> {
    let mut table = SlotTable::new(candidates);
    status.send_replace(ConnectStatus::Initiated);

    let mut host = match transport.bind(local_port, config.peer_capacity) {
        Ok(host) => host,
        Err(e) => {
            warn!(local_port, error = %e, "could not rebind punch port");
            status.send_replace(ConnectStatus::Failed);
            return CoordinatorOutcome::Failed {
                failed_slots: table.unconnected_slots(),
            };
        }
    };

    // Active-connections registry, for diagnostics and to spot address
    // reuse when a peer's source port changes mid-handshake.
    let mut registry: HashMap<String, Vec<SocketAddr>> = HashMap::new();

    for candidate in table.candidates() {
        debug!(slot = candidate.slot, addr = %candidate.addr, "dialing candidate");
        let _ = host.connect(candidate.addr);
        registry
            .entry(address_key(candidate.addr))
            .or_default()
            .push(candidate.addr);
    }

    let deadline = Instant::now() + config.punch_deadline;
    while !table.all_connected() {
        if cancel.load(Ordering::SeqCst) || Instant::now() >= deadline {
            let failed_slots = table.unconnected_slots();
            info!(?failed_slots, "peer connection attempt failed");
            status.send_replace(ConnectStatus::Failed);
            return CoordinatorOutcome::Failed { failed_slots };
        }

        let step = config
            .punch_poll
            .min(deadline.saturating_duration_since(Instant::now()));
        match host.service(step).await {
            Ok(Some(Event::Connect { peer })) => {
                let entry = registry.entry(address_key(peer)).or_default();
                entry.push(peer);
                if entry.len() > 1 {
                    debug!(%peer, seen = entry.len(), "address reused across attempts");
                }
                match table.observe_connect(peer) {
                    SlotOutcome::Assigned(slot) => {
                        info!(slot, %peer, "remote slot connected");
                    }
                    SlotOutcome::Duplicate => {
                        // A connected peer dialing again from a new source
                        // port; binding it would starve another slot.
                        info!(%peer, "already connected, discarding event");
                    }
                    SlotOutcome::Unmatched => {
                        warn!(%peer, "connect event from unknown host");
                    }
                }
            }
            Ok(Some(Event::Disconnect { peer })) => {
                debug!(%peer, "disconnect during punching");
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "transient transport error"),
        }
    }

    info!("all remote slots connected");
    status.send_replace(ConnectStatus::Connected);
    CoordinatorOutcome::Connected {
        peers: table.connected_peers(),
        host,
    }
}

fn address_key(addr: SocketAddr) -> String {
    format!("{}-{}", addr.ip(), addr.port())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    /// Bound the peer to this remote slot.
    Assigned(usize),
    /// Host already occupies a connected slot; event discarded.
    Duplicate,
    /// No candidate has this host.
    Unmatched,
}

/// Candidate slots and their verified peers, indexed by remote slot
/// (candidate order).
#[derive(Debug)]
struct SlotTable {
    candidates: Vec<ConnectionCandidate>,
    connected: Vec<Option<SocketAddr>>,
}

impl SlotTable {
    fn new(candidates: Vec<ConnectionCandidate>) -> Self {
        let connected = vec![None; candidates.len()];
        Self {
            candidates,
            connected,
        }
    }

    fn candidates(&self) -> &[ConnectionCandidate] {
        &self.candidates
    }

    /// Reconcile one CONNECT event. Matching is by host only: some NATs
    /// rewrite the source port between packets, and requiring a port match
    /// makes those connections spuriously fail.
    fn observe_connect(&mut self, peer: SocketAddr) -> SlotOutcome {
        let host = peer.ip();
        for (i, candidate) in self.candidates.iter().enumerate() {
            if self.connected[i].is_some() && candidate.addr.ip() == host {
                return SlotOutcome::Duplicate;
            }
        }
        for (i, candidate) in self.candidates.iter().enumerate() {
            if self.connected[i].is_none() && candidate.addr.ip() == host {
                self.connected[i] = Some(peer);
                return SlotOutcome::Assigned(i);
            }
        }
        SlotOutcome::Unmatched
    }

    fn all_connected(&self) -> bool {
        self.connected.iter().all(Option::is_some)
    }

    fn unconnected_slots(&self) -> Vec<usize> {
        self.connected
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.is_none().then_some(i))
            .collect()
    }

    fn connected_peers(&self) -> Vec<SocketAddr> {
        self.connected.iter().filter_map(|c| *c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(slot: usize, addr: &str) -> ConnectionCandidate {
        ConnectionCandidate {
            addr: addr.parse().unwrap(),
            slot,
        }
    }

    #[test]
    fn duplicate_connect_from_connected_host_is_discarded() {
        let mut table = SlotTable::new(vec![
            candidate(0, "10.0.0.1:41100"),
            candidate(1, "10.0.0.2:41200"),
        ]);
        assert_eq!(
            table.observe_connect("10.0.0.1:41100".parse().unwrap()),
            SlotOutcome::Assigned(0)
        );
        // Same host again, different source port.
        assert_eq!(
            table.observe_connect("10.0.0.1:55555".parse().unwrap()),
            SlotOutcome::Duplicate
        );
        assert_eq!(table.connected[0], Some("10.0.0.1:41100".parse().unwrap()));
    }

    #[test]
    fn matching_ignores_the_port() {
        let mut table = SlotTable::new(vec![candidate(0, "10.0.0.1:41100")]);
        assert_eq!(
            table.observe_connect("10.0.0.1:60000".parse().unwrap()),
            SlotOutcome::Assigned(0)
        );
    }

    #[test]
    fn ambiguous_host_fills_the_lower_slot_first() {
        let mut table = SlotTable::new(vec![
            candidate(0, "10.0.0.1:41100"),
            candidate(1, "10.0.0.1:41200"),
        ]);
        assert_eq!(
            table.observe_connect("10.0.0.1:41200".parse().unwrap()),
            SlotOutcome::Assigned(0)
        );
    }

    #[test]
    fn unknown_host_is_unmatched() {
        let mut table = SlotTable::new(vec![candidate(0, "10.0.0.1:41100")]);
        assert_eq!(
            table.observe_connect("172.16.0.1:41100".parse().unwrap()),
            SlotOutcome::Unmatched
        );
        assert!(!table.all_connected());
    }

    #[test]
    fn unconnected_slots_are_ascending() {
        let mut table = SlotTable::new(vec![
            candidate(0, "10.0.0.1:1"),
            candidate(1, "10.0.0.2:2"),
            candidate(2, "10.0.0.3:3"),
        ]);
        table.observe_connect("10.0.0.2:2".parse().unwrap());
        assert_eq!(table.unconnected_slots(), vec![0, 2]);
    }
}
