/**
 * matchmaking/types.rs
 *
 * Data model for a search: the request, the assignment the directory
 * server hands back, and the per-peer connection candidates derived
 * from it.
 */

use std::net::SocketAddr;

/// Queue to search in. The numeric values are the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlinePlayMode {
    Ranked = 0,
    Unranked = 1,
    Direct = 2,
    Teams = 3,
}

impl OnlinePlayMode {
    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// The game a ticket is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameDescriptor {
    pub id: String,
    /// Directory-side identifier for the title.
    pub external_id: String,
    pub revision: u32,
    /// Client family string, e.g. "DolphinNetplay".
    pub kind: String,
    pub name: String,
}

/// One search attempt. Built once per `start()` call.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub game: GameDescriptor,
    pub mode: OnlinePlayMode,
    /// Opponent filter for direct mode; empty otherwise.
    pub connect_code: String,
    /// Traversal room to meet in; empty for open queue.
    pub room_id: String,
}

impl MatchRequest {
    pub fn new(game: GameDescriptor, mode: OnlinePlayMode) -> Self {
        Self {
            game,
            mode,
            connect_code: String::new(),
            room_id: String::new(),
        }
    }
}

/// One player in an assignment. `slot` is the zero-based match slot (the
/// wire carries a one-based "port").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerDescriptor {
    pub uid: String,
    pub display_name: String,
    pub connect_code: String,
    pub slot: usize,
    pub is_local: bool,
    /// Externally visible "ip:port".
    pub external: String,
    /// LAN-visible "ip:port", when the player reported one.
    pub lan: Option<String>,
}

/// Resolved dial target for one remote player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCandidate {
    pub addr: SocketAddr,
    pub slot: usize,
}

/// Allowed stage ids when the server sends none. The sixth entry is added
/// only for two-player matches.
pub const DEFAULT_STAGE_IDS: [u16; 5] = [0x03, 0x08, 0x1C, 0x1F, 0x20];
pub const TWO_PLAYER_EXTRA_STAGE_ID: u16 = 0x02;

/// A parsed get-ticket assignment, ready for the connection coordinator.
#[derive(Debug, Clone)]
pub struct TicketAssignment {
    pub players: Vec<PlayerDescriptor>,
    pub local_slot: usize,
    /// Exactly one peer per match is the authoritative tie-breaker.
    pub is_decider: bool,
    pub stages: Vec<u16>,
    pub candidates: Vec<ConnectionCandidate>,
}

impl TicketAssignment {
    pub fn remote_count(&self) -> usize {
        self.candidates.len()
    }

    /// First remote player, used for the success report.
    pub fn first_remote(&self) -> Option<&PlayerDescriptor> {
        self.players.iter().find(|p| !p.is_local)
    }
}

/// Fill in the stage fallback when the server returned none.
pub fn stage_list(from_server: Option<Vec<u16>>, player_count: usize) -> Vec<u16> {
    match from_server {
        Some(stages) if !stages.is_empty() => stages,
        _ => {
            let mut stages = DEFAULT_STAGE_IDS.to_vec();
            if player_count == 2 {
                stages.push(TWO_PLAYER_EXTRA_STAGE_ID);
            }
            stages
        }
    }
}
