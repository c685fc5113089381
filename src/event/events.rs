use serde::{Deserialize, Serialize};

use crate::layout::LayoutId;
use crate::lobby::models::{CloseReason, LobbyId, LobbyStatus, PlayerId};

/// Events published by lobby actors
///
/// Events represent facts about things that have already happened. The host
/// listens for them to materialize layouts, move players and update any
/// optional integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyEvent {
    LobbyCreated {
        lobby_id: LobbyId,
        creator: PlayerId,
    },

    PlayerJoined {
        lobby_id: LobbyId,
        player: PlayerId,
        players: Vec<PlayerId>,
    },

    PlayerLeft {
        lobby_id: LobbyId,
        player: PlayerId,
        players: Vec<PlayerId>,
    },

    StatusChanged {
        lobby_id: LobbyId,
        from: LobbyStatus,
        to: LobbyStatus,
        reason: Option<CloseReason>,
    },

    /// A layout is ready; the host should build it for these players
    LayoutAssigned {
        lobby_id: LobbyId,
        layout_id: LayoutId,
        players: Vec<PlayerId>,
    },

    /// The store rejected a transition past the retry budget; the lobby was
    /// closed in memory only
    ReconciliationRequired { lobby_id: LobbyId },
}

impl LobbyEvent {
    pub fn lobby_id(&self) -> LobbyId {
        match self {
            LobbyEvent::LobbyCreated { lobby_id, .. }
            | LobbyEvent::PlayerJoined { lobby_id, .. }
            | LobbyEvent::PlayerLeft { lobby_id, .. }
            | LobbyEvent::StatusChanged { lobby_id, .. }
            | LobbyEvent::LayoutAssigned { lobby_id, .. }
            | LobbyEvent::ReconciliationRequired { lobby_id } => *lobby_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            LobbyEvent::LobbyCreated { .. } => "lobby_created",
            LobbyEvent::PlayerJoined { .. } => "player_joined",
            LobbyEvent::PlayerLeft { .. } => "player_left",
            LobbyEvent::StatusChanged { .. } => "status_changed",
            LobbyEvent::LayoutAssigned { .. } => "layout_assigned",
            LobbyEvent::ReconciliationRequired { .. } => "reconciliation_required",
        }
    }
}
