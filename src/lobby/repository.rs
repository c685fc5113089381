use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use super::models::{DungeonRun, Lobby, LobbyId, LobbyStatus, PlayerId, PlayerStats};
use crate::shared::AppError;

/// Durable store of lobby records and dungeon run history
///
/// Writes are atomic per record. Saving a record identical to the stored one
/// is a no-op, and a Closed record is never changed again.
#[async_trait]
pub trait LobbyRepository {
    async fn create_lobby(&self, lobby: &Lobby) -> Result<(), AppError>;
    async fn get_lobby(&self, lobby_id: LobbyId) -> Result<Option<Lobby>, AppError>;

    /// Full-record upsert
    async fn save_lobby(&self, lobby: &Lobby) -> Result<(), AppError>;
    async fn delete_lobby(&self, lobby_id: LobbyId) -> Result<(), AppError>;

    /// Every lobby that is not Closed, oldest first
    async fn list_active(&self) -> Result<Vec<Lobby>, AppError>;

    /// Records finished runs; a run already stored for the same lobby and player is skipped
    async fn record_runs(&self, runs: &[DungeonRun]) -> Result<(), AppError>;
    async fn player_stats(&self, player_id: &PlayerId) -> Result<PlayerStats, AppError>;
}

/// Error returned when a write would change a Closed record
pub(crate) fn closed_record_error() -> AppError {
    AppError::InvalidTransition {
        status: LobbyStatus::Closed,
        operation: "update",
    }
}

/// In-memory implementation of LobbyRepository for development and testing
pub struct InMemoryLobbyRepository {
    lobbies: Mutex<HashMap<LobbyId, Lobby>>,
    runs: Mutex<Vec<DungeonRun>>,
}

impl Default for InMemoryLobbyRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLobbyRepository {
    pub fn new() -> Self {
        Self {
            lobbies: Mutex::new(HashMap::new()),
            runs: Mutex::new(Vec::new()),
        }
    }

    fn lobbies(&self) -> Result<MutexGuard<'_, HashMap<LobbyId, Lobby>>, AppError> {
        self.lobbies.lock().map_err(|_| AppError::Internal)
    }

    fn runs(&self) -> Result<MutexGuard<'_, Vec<DungeonRun>>, AppError> {
        self.runs.lock().map_err(|_| AppError::Internal)
    }
}

#[async_trait]
impl LobbyRepository for InMemoryLobbyRepository {
    #[instrument(skip(self, lobby), fields(lobby_id = %lobby.id))]
    async fn create_lobby(&self, lobby: &Lobby) -> Result<(), AppError> {
        let mut lobbies = self.lobbies()?;
        if lobbies.contains_key(&lobby.id) {
            warn!("Lobby already exists in memory");
            return Err(AppError::BadRequest(format!(
                "Lobby {} already exists",
                lobby.id
            )));
        }
        lobbies.insert(lobby.id, lobby.clone());

        debug!("Lobby created in memory");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_lobby(&self, lobby_id: LobbyId) -> Result<Option<Lobby>, AppError> {
        Ok(self.lobbies()?.get(&lobby_id).cloned())
    }

    #[instrument(skip(self, lobby), fields(lobby_id = %lobby.id, status = %lobby.status))]
    async fn save_lobby(&self, lobby: &Lobby) -> Result<(), AppError> {
        let mut lobbies = self.lobbies()?;
        match lobbies.get(&lobby.id) {
            Some(existing) if existing == lobby => {
                debug!("Lobby unchanged, skipping write");
                return Ok(());
            }
            Some(existing) if existing.status.is_terminal() => {
                warn!("Refusing to modify a closed lobby");
                return Err(closed_record_error());
            }
            _ => {}
        }
        lobbies.insert(lobby.id, lobby.clone());

        debug!("Lobby saved in memory");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_lobby(&self, lobby_id: LobbyId) -> Result<(), AppError> {
        match self.lobbies()?.remove(&lobby_id) {
            Some(_) => {
                info!(lobby_id = %lobby_id, "Lobby deleted from memory");
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Lobby {} not found", lobby_id))),
        }
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<Lobby>, AppError> {
        let mut active: Vec<Lobby> = self
            .lobbies()?
            .values()
            .filter(|lobby| !lobby.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|lobby| lobby.created_at);

        debug!(count = active.len(), "Listed active lobbies");
        Ok(active)
    }

    #[instrument(skip(self, runs), fields(count = runs.len()))]
    async fn record_runs(&self, runs: &[DungeonRun]) -> Result<(), AppError> {
        let mut stored = self.runs()?;
        for run in runs {
            let duplicate = stored
                .iter()
                .any(|r| r.lobby_id == run.lobby_id && r.player_id == run.player_id);
            if !duplicate {
                stored.push(run.clone());
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn player_stats(&self, player_id: &PlayerId) -> Result<PlayerStats, AppError> {
        let runs = self.runs()?;
        let mut stats = PlayerStats::empty(player_id.clone());
        for run in runs.iter().filter(|run| &run.player_id == player_id) {
            if run.completed {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
        }
        Ok(stats)
    }
}
