/**
 * matchmaking/protocol.rs
 *
 * JSON messages exchanged with the directory server, one per datagram.
 * Decoding is schema-validated: a missing or mistyped field fails fast
 * with DirectoryProtocolError instead of producing empty strings.
 */

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{MatchRequest, PlayerDescriptor};
use crate::error::SearchError;
use crate::user::UserProfile;

pub const CREATE_TICKET: &str = "create-ticket";
pub const CREATE_TICKET_RESP: &str = "create-ticket-resp";
pub const GET_TICKET_RESP: &str = "get-ticket-resp";

#[derive(Debug, Serialize)]
pub struct CreateTicketRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user: WireUser,
    pub search: WireSearch,
    #[serde(rename = "appVersion")]
    pub app_version: String,
    #[serde(rename = "ipAddressLan")]
    pub ip_address_lan: String,
}

#[derive(Debug, Serialize)]
pub struct WireUser {
    pub uid: String,
    #[serde(rename = "playKey")]
    pub play_key: String,
    #[serde(rename = "connectCode")]
    pub connect_code: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct WireSearch {
    pub mode: u8,
    #[serde(rename = "traversalRoomId")]
    pub traversal_room_id: String,
    #[serde(rename = "connectCode")]
    pub connect_code: String,
    pub game: WireGame,
}

#[derive(Debug, Serialize)]
pub struct WireGame {
    pub id: String,
    #[serde(rename = "externalId")]
    pub external_id: String,
    pub revision: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

impl CreateTicketRequest {
    /// Assemble the ticket request. Modes outside the ranked/unranked
    /// queues use the alternate identity set.
    pub fn build(
        user: &UserProfile,
        request: &MatchRequest,
        app_version: &str,
        lan_address: &str,
    ) -> Self {
        let identity = user.identity_for(request.mode);
        Self {
            kind: CREATE_TICKET,
            user: WireUser {
                uid: identity.uid.clone(),
                play_key: identity.play_key.clone(),
                connect_code: identity.connect_code.clone(),
                display_name: user.display_name.clone(),
            },
            search: WireSearch {
                mode: request.mode.as_wire(),
                traversal_room_id: request.room_id.clone(),
                connect_code: request.connect_code.clone(),
                game: WireGame {
                    id: request.game.id.clone(),
                    external_id: request.game.external_id.clone(),
                    revision: request.game.revision,
                    kind: request.game.kind.clone(),
                    name: request.game.name.clone(),
                },
            },
            app_version: app_version.to_string(),
            ip_address_lan: lan_address.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serialization of our own derive types cannot fail.
        serde_json::to_vec(self).expect("ticket request serializes")
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketResponse {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetTicketResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "latestVersion", default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub players: Vec<WirePlayer>,
    #[serde(rename = "isHost", default)]
    pub is_host: bool,
    #[serde(default)]
    pub stages: Option<Vec<u16>>,
}

#[derive(Debug, Deserialize)]
pub struct WirePlayer {
    pub uid: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "connectCode")]
    pub connect_code: String,
    /// One-based match slot.
    pub port: u32,
    #[serde(rename = "isLocalPlayer")]
    pub is_local_player: bool,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "ipAddressLan", default)]
    pub ip_address_lan: Option<String>,
}

impl WirePlayer {
    pub fn into_descriptor(self) -> Result<PlayerDescriptor, SearchError> {
        if self.port == 0 {
            return Err(SearchError::DirectoryProtocolError(format!(
                "player {} has port 0",
                self.uid
            )));
        }
        let lan = self.ip_address_lan.filter(|s| !s.is_empty());
        Ok(PlayerDescriptor {
            uid: self.uid,
            display_name: self.display_name,
            connect_code: self.connect_code,
            slot: (self.port - 1) as usize,
            is_local: self.is_local_player,
            external: self.ip_address,
            lan,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Decode a directory message, checking the `type` tag before the body.
pub fn decode<T: DeserializeOwned>(payload: &[u8], expected: &str) -> Result<T, SearchError> {
    let envelope: Envelope = serde_json::from_slice(payload)
        .map_err(|e| SearchError::DirectoryProtocolError(e.to_string()))?;
    match envelope.kind.as_deref() {
        Some(kind) if kind == expected => {}
        other => {
            return Err(SearchError::DirectoryProtocolError(format!(
                "expected {expected}, got {other:?}"
            )))
        }
    }
    serde_json::from_slice(payload).map_err(|e| SearchError::DirectoryProtocolError(e.to_string()))
}

/// A present, non-empty error field. Some servers spell absence as "null".
pub fn server_error(error: &Option<String>) -> Option<&str> {
    match error.as_deref() {
        Some("") | Some("null") | None => None,
        Some(e) => Some(e),
    }
}
