/**
 * matchmaking/policy.rs
 *
 * Address resolution policy: per remote peer, pick between its externally
 * visible address and its LAN address. The LAN path is only preferred when
 * both players sit behind the same gateway, where dialing the external
 * address would needlessly route traffic out to the internet and back.
 */

use std::net::SocketAddr;

use super::types::{ConnectionCandidate, PlayerDescriptor};
use crate::error::SearchError;

/// Host part of an "ip:port" string.
pub fn host_of(addr: &str) -> Option<&str> {
    addr.rsplit_once(':').map(|(host, _)| host)
}

/// The address string to dial for one remote player.
pub fn choose_address<'a>(remote: &'a PlayerDescriptor, local_external_ip: &str) -> &'a str {
    let remote_external_ip = host_of(&remote.external).unwrap_or(&remote.external);
    match &remote.lan {
        Some(lan) if remote_external_ip == local_external_ip => lan,
        _ => &remote.external,
    }
}

/// Resolve every remote player into a dial candidate.
pub fn resolve_candidates(
    players: &[PlayerDescriptor],
    local_slot: usize,
    local_external_ip: &str,
) -> Result<Vec<ConnectionCandidate>, SearchError> {
    let mut candidates = Vec::new();
    for player in players {
        if player.slot == local_slot {
            continue;
        }
        let chosen = choose_address(player, local_external_ip);
        let addr: SocketAddr = chosen.parse().map_err(|_| {
            SearchError::DirectoryProtocolError(format!(
                "unparseable peer address {chosen:?} for slot {}",
                player.slot
            ))
        })?;
        candidates.push(ConnectionCandidate {
            addr,
            slot: player.slot,
        });
    }
    Ok(candidates)
}
