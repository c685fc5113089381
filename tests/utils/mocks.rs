use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dungeon_lobby::lobby::{
    DungeonRun, InMemoryLobbyRepository, Lobby, LobbyId, LobbyRepository, PlayerId, PlayerStats,
};
use dungeon_lobby::AppError;

// ============================================================================
// Mock Infrastructure
// ============================================================================

/// In-memory store whose writes can be switched to fail as unavailable
#[derive(Clone, Default)]
pub struct FlakyLobbyRepository {
    inner: Arc<InMemoryLobbyRepository>,
    failing: Arc<AtomicBool>,
    failed_writes: Arc<AtomicU64>,
}

#[allow(dead_code)]
impl FlakyLobbyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::SeqCst)
    }

    /// Reads the stored record, bypassing the failure switch
    pub async fn stored(&self, lobby_id: LobbyId) -> Option<Lobby> {
        self.inner.get_lobby(lobby_id).await.unwrap()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(AppError::StoreUnavailable("store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LobbyRepository for FlakyLobbyRepository {
    async fn create_lobby(&self, lobby: &Lobby) -> Result<(), AppError> {
        self.check()?;
        self.inner.create_lobby(lobby).await
    }

    async fn get_lobby(&self, lobby_id: LobbyId) -> Result<Option<Lobby>, AppError> {
        self.inner.get_lobby(lobby_id).await
    }

    async fn save_lobby(&self, lobby: &Lobby) -> Result<(), AppError> {
        self.check()?;
        self.inner.save_lobby(lobby).await
    }

    async fn delete_lobby(&self, lobby_id: LobbyId) -> Result<(), AppError> {
        self.check()?;
        self.inner.delete_lobby(lobby_id).await
    }

    async fn list_active(&self) -> Result<Vec<Lobby>, AppError> {
        self.inner.list_active().await
    }

    async fn record_runs(&self, runs: &[DungeonRun]) -> Result<(), AppError> {
        self.check()?;
        self.inner.record_runs(runs).await
    }

    async fn player_stats(&self, player_id: &PlayerId) -> Result<PlayerStats, AppError> {
        self.inner.player_stats(player_id).await
    }
}
