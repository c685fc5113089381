use serde::{Deserialize, Serialize};

use super::models::{Lobby, LobbySnapshot, PlayerId, StopReason};
use crate::layout::Difficulty;

/// Options for a new lobby. Unset fields fall back to the configured defaults
/// (and a random seed).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateLobbyRequest {
    pub difficulty: Option<Difficulty>,
    pub seed: Option<i64>,
    pub capacity: Option<u32>,
}

/// Request payload for creating a lobby over HTTP
#[derive(Debug, Deserialize)]
pub struct CreateLobbyBody {
    pub creator: PlayerId,
    #[serde(flatten)]
    pub options: CreateLobbyRequest,
}

/// Request payload for joining or leaving a lobby
#[derive(Debug, Deserialize)]
pub struct PlayerRequest {
    pub player_id: PlayerId,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: StopReason,
}

/// Request payload for a standalone layout. Unset dimensions use the
/// configured layout defaults.
#[derive(Debug, Deserialize)]
pub struct LayoutRequest {
    pub seed: i64,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub room_count_target: Option<u32>,
}

/// Lobby record as returned to the host
#[derive(Debug, Serialize, Deserialize)]
pub struct LobbyResponse {
    #[serde(flatten)]
    pub lobby: Lobby,
    pub needs_reconciliation: bool,
    /// Room count of the pinned layout, when one is held
    pub room_count: Option<usize>,
}

impl From<LobbySnapshot> for LobbyResponse {
    fn from(snapshot: LobbySnapshot) -> Self {
        Self {
            lobby: snapshot.lobby,
            needs_reconciliation: snapshot.needs_reconciliation,
            room_count: snapshot.layout.map(|layout| layout.room_count()),
        }
    }
}

impl From<Lobby> for LobbyResponse {
    fn from(lobby: Lobby) -> Self {
        Self {
            lobby,
            needs_reconciliation: false,
            room_count: None,
        }
    }
}
