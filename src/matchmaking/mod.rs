/**
 * matchmaking/mod.rs
 *
 * Matchmaking module implementing:
 * - Directory server ticket protocol (JSON over the control channel)
 * - Search state machine with cancel and retry
 * - Peer address selection policy
 * - Simultaneous-dial connection coordinator
 */

mod coordinator;
mod policy;
mod protocol;
mod session;
mod types;

pub use coordinator::{ConnectStatus, CoordinatorHandle, CoordinatorOutcome};
pub use policy::{choose_address, host_of, resolve_candidates};
pub use protocol::{
    decode, server_error, CreateTicketRequest, CreateTicketResponse, GetTicketResponse,
    WirePlayer, CREATE_TICKET, CREATE_TICKET_RESP, GET_TICKET_RESP,
};
pub use session::{MatchResult, MatchSession, Matchmaker, ProcessState, SearchOutcome};
pub use types::{
    stage_list, ConnectionCandidate, GameDescriptor, MatchRequest, OnlinePlayMode,
    PlayerDescriptor, TicketAssignment, DEFAULT_STAGE_IDS, TWO_PLAYER_EXTRA_STAGE_ID,
};
