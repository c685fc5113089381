use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::actor::{spawn_lobby, with_store_retry, LobbyContext, LobbyHandle};
use super::clock::Clock;
use super::models::{Lobby, LobbyId, LobbySnapshot, LobbyStatus, PlayerId, PlayerStats, StopReason};
use super::repository::LobbyRepository;
use super::types::CreateLobbyRequest;
use crate::config::EngineConfig;
use crate::event::{EventBus, LobbyEvent};
use crate::layout::{Difficulty, GenerationParameters, GenerationService, Layout};
use crate::shared::AppError;

/// Entry point of the lobby core. Owns the registry of lobby actors and
/// routes host operations to them.
#[derive(Clone)]
pub struct LobbyOrchestrator {
    ctx: Arc<LobbyContext>,
}

impl LobbyOrchestrator {
    pub fn new(
        repository: Arc<dyn LobbyRepository + Send + Sync>,
        generation: GenerationService,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(LobbyContext {
                repository,
                generation,
                event_bus,
                clock,
                lobby_config: config.lobby.clone(),
                layout_config: config.layout.clone(),
                lobbies: RwLock::new(HashMap::new()),
                reconciliation: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn generation(&self) -> &GenerationService {
        &self.ctx.generation
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.ctx.event_bus
    }

    /// Layout parameters a lobby with this seed and difficulty would use
    pub fn layout_parameters(&self, seed: i64, difficulty: Difficulty) -> GenerationParameters {
        self.ctx.layout_config.parameters(seed, difficulty)
    }

    /// Generates (or fetches from cache) a layout outside of any lobby
    pub async fn request_layout(&self, params: GenerationParameters) -> Result<Arc<Layout>, AppError> {
        params.validate()?;
        Ok(self.ctx.generation.request_layout(params).await?)
    }

    #[instrument(skip(self, request), fields(creator = %creator))]
    pub async fn create_lobby(
        &self,
        creator: PlayerId,
        request: CreateLobbyRequest,
    ) -> Result<LobbySnapshot, AppError> {
        let capacity = request.capacity.unwrap_or(self.ctx.lobby_config.capacity);
        if capacity == 0 {
            return Err(AppError::BadRequest("Capacity must be positive".to_string()));
        }
        let difficulty = request.difficulty.unwrap_or(Difficulty::Medium);
        let seed = request.seed.unwrap_or_else(rand::random);

        let lobby = Lobby::new(creator.clone(), capacity, difficulty, seed, self.ctx.clock.now());
        let repository = Arc::clone(&self.ctx.repository);
        with_store_retry(&self.ctx.lobby_config, || repository.create_lobby(&lobby)).await?;

        let lobby_id = lobby.id;
        let full = lobby.is_full();
        let handle = {
            let mut lobbies = self.ctx.lobbies.write().await;
            spawn_lobby(Arc::clone(&self.ctx), lobby, &mut lobbies)
        };

        info!(
            lobby_id = %lobby_id,
            capacity,
            difficulty = %difficulty,
            seed,
            "Lobby created"
        );
        self.ctx
            .event_bus
            .emit(LobbyEvent::LobbyCreated {
                lobby_id,
                creator,
            })
            .await;

        if full {
            handle.start().await?;
        }
        self.get_lobby(lobby_id).await
    }

    #[instrument(skip(self), fields(lobby_id = %lobby_id, player = %player))]
    pub async fn join_lobby(&self, lobby_id: LobbyId, player: PlayerId) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "join", |handle| {
            let player = player.clone();
            async move { handle.join(player).await }
        })
        .await
    }

    #[instrument(skip(self), fields(lobby_id = %lobby_id, player = %player))]
    pub async fn leave_lobby(&self, lobby_id: LobbyId, player: PlayerId) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "leave", |handle| {
            let player = player.clone();
            async move { handle.leave(player).await }
        })
        .await
    }

    #[instrument(skip(self), fields(lobby_id = %lobby_id))]
    pub async fn start_lobby(&self, lobby_id: LobbyId) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "start", |handle| async move { handle.start().await })
            .await
    }

    #[instrument(skip(self), fields(lobby_id = %lobby_id))]
    pub async fn stop_lobby(&self, lobby_id: LobbyId, reason: StopReason) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "stop", |handle| async move { handle.stop(reason).await })
            .await
    }

    #[instrument(skip(self), fields(lobby_id = %lobby_id))]
    pub async fn confirm_materialized(&self, lobby_id: LobbyId) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "confirm materialization", |handle| async move {
            handle.confirm_materialized().await
        })
        .await
    }

    #[instrument(skip(self), fields(lobby_id = %lobby_id))]
    pub async fn confirm_teardown(&self, lobby_id: LobbyId) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "confirm teardown", |handle| async move {
            handle.confirm_teardown().await
        })
        .await
    }

    /// Marks a player of an Assigning or Active lobby as active, deferring
    /// the inactivity timeout
    #[instrument(skip(self), fields(lobby_id = %lobby_id, player = %player))]
    pub async fn record_activity(&self, lobby_id: LobbyId, player: PlayerId) -> Result<Lobby, AppError> {
        self.dispatch(lobby_id, "record activity", |handle| {
            let player = player.clone();
            async move { handle.record_activity(player).await }
        })
        .await
    }

    /// Current view of a lobby: live from its actor, else the pending
    /// reconciliation entry, else the stored record
    pub async fn get_lobby(&self, lobby_id: LobbyId) -> Result<LobbySnapshot, AppError> {
        let handle = self.ctx.lobbies.read().await.get(&lobby_id).cloned();
        if let Some(handle) = handle {
            match handle.snapshot().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(AppError::LobbyUnavailable) => {
                    debug!(lobby_id = %lobby_id, "Lobby actor gone, reading from store")
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(lobby) = self.ctx.reconciliation.lock().await.get(&lobby_id) {
            return Ok(LobbySnapshot {
                lobby: lobby.clone(),
                layout: None,
                needs_reconciliation: true,
            });
        }

        match self.ctx.repository.get_lobby(lobby_id).await? {
            Some(lobby) => Ok(LobbySnapshot {
                lobby,
                layout: None,
                needs_reconciliation: false,
            }),
            None => Err(AppError::NotFound(format!("Lobby {} not found", lobby_id))),
        }
    }

    /// Live lobbies plus those awaiting reconciliation, oldest first
    pub async fn list_lobbies(&self) -> Result<Vec<LobbySnapshot>, AppError> {
        let mut snapshots = Vec::new();
        for handle in self.handles().await {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        for lobby in self.ctx.reconciliation.lock().await.values() {
            snapshots.push(LobbySnapshot {
                lobby: lobby.clone(),
                layout: None,
                needs_reconciliation: true,
            });
        }
        snapshots.sort_by_key(|snapshot| snapshot.lobby.created_at);
        Ok(snapshots)
    }

    /// Events from every lobby
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.ctx.event_bus.subscribe()
    }

    /// Events from one lobby. The stream of a Closed lobby ends immediately.
    pub async fn subscribe_to_lobby(
        &self,
        lobby_id: LobbyId,
    ) -> Result<broadcast::Receiver<LobbyEvent>, AppError> {
        match self.handle_for(lobby_id, "subscribe").await {
            Ok(_) => {}
            Err(AppError::InvalidTransition {
                status: LobbyStatus::Closed,
                ..
            }) => return Ok(closed_receiver()),
            Err(e) => return Err(e),
        }

        // Holding the registry lock orders this subscription before any
        // retirement, which drops the lobby channel after deregistering
        let lobbies = self.ctx.lobbies.read().await;
        if !lobbies.contains_key(&lobby_id) {
            return Ok(closed_receiver());
        }
        Ok(self.ctx.event_bus.subscribe_to_lobby(lobby_id).await)
    }

    pub async fn player_stats(&self, player: &PlayerId) -> Result<PlayerStats, AppError> {
        self.ctx.repository.player_stats(player).await
    }

    /// Applies inactivity and teardown timeouts to every live lobby
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> usize {
        let handles = self.handles().await;
        let mut checked = 0;
        for handle in handles {
            match handle.tick().await {
                Ok(()) => checked += 1,
                Err(e) => debug!(lobby_id = %handle.lobby_id(), error = %e, "Skipped lobby during sweep"),
            }
        }
        checked
    }

    /// Writes force-closed lobbies to the store. Returns how many were
    /// reconciled; entries whose write still fails stay queued.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> usize {
        let pending: Vec<Lobby> = self
            .ctx
            .reconciliation
            .lock()
            .await
            .values()
            .cloned()
            .collect();

        let mut reconciled = 0;
        for lobby in pending {
            match self.ctx.repository.save_lobby(&lobby).await {
                // A record already Closed in the store is final as it stands
                Ok(()) | Err(AppError::InvalidTransition { .. }) => {
                    self.ctx.reconciliation.lock().await.remove(&lobby.id);
                    info!(lobby_id = %lobby.id, "Lobby reconciled with store");
                    reconciled += 1;
                }
                Err(e) => {
                    warn!(lobby_id = %lobby.id, error = %e, "Lobby reconciliation failed");
                }
            }
        }
        reconciled
    }

    pub async fn pending_reconciliation(&self) -> usize {
        self.ctx.reconciliation.lock().await.len()
    }

    /// Restarts actors for every non-Closed lobby in the store. Assigning
    /// and Active lobbies re-request their layout, which regenerates with
    /// the same id.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, AppError> {
        let stored = self.ctx.repository.list_active().await?;
        let mut lobbies = self.ctx.lobbies.write().await;

        let mut recovered = 0;
        for lobby in stored {
            if lobbies.contains_key(&lobby.id) {
                continue;
            }
            info!(lobby_id = %lobby.id, status = %lobby.status, "Recovering lobby");
            spawn_lobby(Arc::clone(&self.ctx), lobby, &mut lobbies);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Sends an operation to the lobby's actor. An actor that retired
    /// between lookup and send is looked up once more, which then resolves
    /// through the store.
    async fn dispatch<F, Fut>(
        &self,
        lobby_id: LobbyId,
        operation: &'static str,
        call: F,
    ) -> Result<Lobby, AppError>
    where
        F: Fn(LobbyHandle) -> Fut,
        Fut: Future<Output = Result<Lobby, AppError>>,
    {
        let handle = self.handle_for(lobby_id, operation).await?;
        match call(handle).await {
            Err(AppError::LobbyUnavailable) => {
                debug!(lobby_id = %lobby_id, operation, "Lobby actor retired, retrying lookup");
                call(self.handle_for(lobby_id, operation).await?).await
            }
            result => result,
        }
    }

    async fn handles(&self) -> Vec<LobbyHandle> {
        self.ctx.lobbies.read().await.values().cloned().collect()
    }

    /// Finds the live actor for a lobby, resuming it from the store when
    /// the lobby is open but has no actor (e.g. after a restart)
    async fn handle_for(&self, lobby_id: LobbyId, operation: &'static str) -> Result<LobbyHandle, AppError> {
        if let Some(handle) = self.ctx.lobbies.read().await.get(&lobby_id) {
            return Ok(handle.clone());
        }

        let closed = || AppError::InvalidTransition {
            status: LobbyStatus::Closed,
            operation,
        };

        if self.ctx.reconciliation.lock().await.contains_key(&lobby_id) {
            return Err(closed());
        }

        let mut lobbies = self.ctx.lobbies.write().await;
        if let Some(handle) = lobbies.get(&lobby_id) {
            return Ok(handle.clone());
        }

        match self.ctx.repository.get_lobby(lobby_id).await? {
            Some(lobby) if lobby.status.is_terminal() => Err(closed()),
            Some(lobby) => {
                info!(lobby_id = %lobby_id, status = %lobby.status, "Resuming lobby from store");
                Ok(spawn_lobby(Arc::clone(&self.ctx), lobby, &mut lobbies))
            }
            None => Err(AppError::NotFound(format!("Lobby {} not found", lobby_id))),
        }
    }
}

fn closed_receiver() -> broadcast::Receiver<LobbyEvent> {
    let (sender, receiver) = broadcast::channel(1);
    drop(sender);
    receiver
}
