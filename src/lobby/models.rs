use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::layout::{Difficulty, Layout, LayoutId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(pub Uuid);

impl LobbyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LobbyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LobbyId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque player identifier handed over by the host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LobbyStatus {
    Forming,
    /// Kept for stored records; lobbies move from Forming straight to Assigning
    Ready,
    Assigning,
    Active,
    Closing,
    Closed,
}

impl LobbyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LobbyStatus::Closed)
    }

    /// Whether the lobby still holds (or is about to hold) a layout
    pub fn holds_layout(&self) -> bool {
        matches!(self, LobbyStatus::Assigning | LobbyStatus::Active)
    }

    pub fn can_transition_to(&self, next: LobbyStatus) -> bool {
        use LobbyStatus::*;

        if *self == next {
            return !self.is_terminal();
        }
        matches!(
            (*self, next),
            (Forming, Assigning)
                | (Forming, Closed)
                | (Ready, Assigning)
                | (Ready, Closing)
                | (Assigning, Active)
                | (Assigning, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    Stopped,
    Completed,
    InactivityTimeout,
    AllPlayersLeft,
    GenerationFailed,
    StoreUnavailable,
    TeardownTimeout,
}

/// Why the host is stopping a lobby
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Requested,
    /// The players cleared the dungeon
    Completed,
}

impl From<StopReason> for CloseReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Requested => CloseReason::Stopped,
            StopReason::Completed => CloseReason::Completed,
        }
    }
}

/// Durable lobby record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lobby {
    pub id: LobbyId,
    pub status: LobbyStatus,
    pub players: Vec<PlayerId>,
    pub capacity: u32,
    pub difficulty: Difficulty,
    pub seed: i64,
    pub assigned_layout_id: Option<LayoutId>,
    pub close_reason: Option<CloseReason>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Lobby {
    pub fn new(
        creator: PlayerId,
        capacity: u32,
        difficulty: Difficulty,
        seed: i64,
        now: DateTime<Utc>,
    ) -> Self {
        // Microsecond precision survives every store backend unchanged
        let now = now.trunc_subsecs(6);
        Self {
            id: LobbyId::new(),
            status: LobbyStatus::Forming,
            players: vec![creator],
            capacity,
            difficulty,
            seed,
            assigned_layout_id: None,
            close_reason: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn has_player(&self, player: &PlayerId) -> bool {
        self.players.contains(player)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.capacity as usize
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now.trunc_subsecs(6);
    }
}

/// One player's attempt at a dungeon, recorded when an active lobby ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DungeonRun {
    pub lobby_id: LobbyId,
    pub player_id: PlayerId,
    pub layout_id: Option<LayoutId>,
    pub difficulty: Difficulty,
    pub completed: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player_id: PlayerId,
    pub completed: u64,
    pub failed: u64,
}

impl PlayerStats {
    pub fn empty(player_id: PlayerId) -> Self {
        Self {
            player_id,
            completed: 0,
            failed: 0,
        }
    }

    pub fn total_runs(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Live view of a lobby as held by its actor
#[derive(Debug, Clone)]
pub struct LobbySnapshot {
    pub lobby: Lobby,
    pub layout: Option<Arc<Layout>>,
    /// Set when the in-memory state diverged from the store
    pub needs_reconciliation: bool,
}
