//! Lobby actor: one Tokio task per lobby, owning its state machine.
//!
//! All mutations of a lobby go through its command channel, so transitions
//! are strictly serialized per lobby while different lobbies run in
//! parallel. Every transition is written to the store before the actor
//! adopts it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::models::{
    CloseReason, DungeonRun, Lobby, LobbyId, LobbySnapshot, LobbyStatus, PlayerId, StopReason,
};
use super::repository::LobbyRepository;
use crate::config::{LayoutConfig, LobbyConfig};
use crate::event::{EventBus, LobbyEvent};
use crate::layout::{GenerationError, GenerationService, Layout};
use crate::shared::AppError;

/// Dependencies shared by the orchestrator and every lobby actor
pub(crate) struct LobbyContext {
    pub repository: Arc<dyn LobbyRepository + Send + Sync>,
    pub generation: GenerationService,
    pub event_bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub lobby_config: LobbyConfig,
    pub layout_config: LayoutConfig,
    pub lobbies: RwLock<HashMap<LobbyId, LobbyHandle>>,
    /// Lobbies force-closed in memory whose final state never reached the store
    pub reconciliation: Mutex<HashMap<LobbyId, Lobby>>,
}

/// Runs a store operation, retrying `StoreUnavailable` with exponential backoff
pub(crate) async fn with_store_retry<T, F, Fut>(
    config: &LobbyConfig,
    mut operation: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(AppError::StoreUnavailable(message)) if attempt < config.store_retry_budget => {
                let backoff = config.store_backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "Lobby store unavailable, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

pub(crate) enum LobbyCommand {
    Join {
        player: PlayerId,
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    Leave {
        player: PlayerId,
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    Start {
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    Stop {
        reason: StopReason,
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    ConfirmMaterialized {
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    ConfirmTeardown {
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    /// Host-reported player activity, resetting the inactivity timer
    RecordActivity {
        player: PlayerId,
        reply: oneshot::Sender<Result<Lobby, AppError>>,
    },
    Snapshot {
        reply: oneshot::Sender<LobbySnapshot>,
    },
    /// Checks the inactivity and teardown timeouts
    Tick { reply: oneshot::Sender<()> },
    /// Sent by the layout waiter task
    LayoutResolved {
        result: Result<Arc<Layout>, GenerationError>,
    },
}

/// Handle to a running lobby actor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct LobbyHandle {
    lobby_id: LobbyId,
    sender: mpsc::Sender<LobbyCommand>,
}

impl LobbyHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> LobbyCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| AppError::LobbyUnavailable)?;
        reply_rx.await.map_err(|_| AppError::LobbyUnavailable)
    }

    pub async fn join(&self, player: PlayerId) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::Join { player, reply })
            .await?
    }

    pub async fn leave(&self, player: PlayerId) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::Leave { player, reply })
            .await?
    }

    pub async fn start(&self) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::Start { reply }).await?
    }

    pub async fn stop(&self, reason: StopReason) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::Stop { reason, reply })
            .await?
    }

    pub async fn confirm_materialized(&self) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::ConfirmMaterialized { reply })
            .await?
    }

    pub async fn confirm_teardown(&self) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::ConfirmTeardown { reply })
            .await?
    }

    pub async fn record_activity(&self, player: PlayerId) -> Result<Lobby, AppError> {
        self.request(|reply| LobbyCommand::RecordActivity { player, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<LobbySnapshot, AppError> {
        self.request(|reply| LobbyCommand::Snapshot { reply }).await
    }

    pub async fn tick(&self) -> Result<(), AppError> {
        self.request(|reply| LobbyCommand::Tick { reply }).await
    }

    pub fn lobby_id(&self) -> LobbyId {
        self.lobby_id
    }
}

struct LobbyActor {
    lobby: Lobby,
    layout: Option<Arc<Layout>>,
    /// Waiter task forwarding the generation result back to this actor
    pending_layout: Option<JoinHandle<()>>,
    needs_reconciliation: bool,
    retired: bool,
    ctx: Arc<LobbyContext>,
    self_sender: mpsc::WeakSender<LobbyCommand>,
    receiver: mpsc::Receiver<LobbyCommand>,
}

/// Spawns the actor for an already-persisted lobby and registers its handle.
///
/// Lobbies that are Assigning or Active (after a restart) immediately
/// re-request their layout.
pub(crate) fn spawn_lobby(
    ctx: Arc<LobbyContext>,
    lobby: Lobby,
    registry: &mut HashMap<LobbyId, LobbyHandle>,
) -> LobbyHandle {
    let (tx, rx) = mpsc::channel(ctx.lobby_config.command_channel_size);
    let handle = LobbyHandle {
        lobby_id: lobby.id,
        sender: tx.clone(),
    };

    let mut actor = LobbyActor {
        lobby,
        layout: None,
        pending_layout: None,
        needs_reconciliation: false,
        retired: false,
        ctx,
        self_sender: tx.downgrade(),
        receiver: rx,
    };
    if actor.lobby.status.holds_layout() {
        actor.request_layout();
    }

    registry.insert(handle.lobby_id, handle.clone());
    tokio::spawn(actor.run());
    handle
}

impl LobbyActor {
    async fn run(mut self) {
        let lobby_id = self.lobby.id;
        info!(lobby_id = %lobby_id, status = %self.lobby.status, "Lobby actor started");

        while let Some(command) = self.receiver.recv().await {
            match command {
                LobbyCommand::Join { player, reply } => {
                    let result = self.handle_join(player).await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::Leave { player, reply } => {
                    let result = self.handle_leave(player).await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::Start { reply } => {
                    let result = self.handle_start().await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::Stop { reason, reply } => {
                    let result = self.handle_stop(reason).await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::ConfirmMaterialized { reply } => {
                    let result = self.handle_confirm_materialized().await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::ConfirmTeardown { reply } => {
                    let result = self.handle_confirm_teardown().await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::RecordActivity { player, reply } => {
                    let result = self.handle_record_activity(player).await;
                    self.reply(reply, result).await;
                }
                LobbyCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                LobbyCommand::Tick { reply } => {
                    self.handle_tick().await;
                    self.reply(reply, ()).await;
                }
                LobbyCommand::LayoutResolved { result } => {
                    self.handle_layout_resolved(result).await;
                    self.retire_if_closed().await;
                }
            }

            if self.retired {
                break;
            }
        }

        if let Some(waiter) = self.pending_layout.take() {
            waiter.abort();
        }
        info!(lobby_id = %lobby_id, "Lobby actor stopped");
    }

    /// Replies after deregistering a closed lobby, so callers never observe a
    /// stale handle for it
    async fn reply<T>(&mut self, reply: oneshot::Sender<T>, value: T) {
        self.retire_if_closed().await;
        let _ = reply.send(value);
    }

    async fn retire_if_closed(&mut self) {
        if self.retired || !self.lobby.status.is_terminal() {
            return;
        }
        self.retired = true;
        self.ctx.lobbies.write().await.remove(&self.lobby.id);
        self.ctx.event_bus.close_lobby(self.lobby.id).await;
    }

    fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            lobby: self.lobby.clone(),
            layout: self.layout.clone(),
            needs_reconciliation: self.needs_reconciliation,
        }
    }

    fn invalid(&self, operation: &'static str) -> AppError {
        AppError::InvalidTransition {
            status: self.lobby.status,
            operation,
        }
    }

    async fn emit(&self, event: LobbyEvent) {
        self.ctx.event_bus.emit(event).await;
    }

    /// Persists `next` and adopts it. Past the retry budget the lobby is
    /// force-closed in memory and queued for reconciliation.
    async fn commit(&mut self, next: Lobby) -> Result<(), AppError> {
        let repository = Arc::clone(&self.ctx.repository);
        let result = with_store_retry(&self.ctx.lobby_config, || repository.save_lobby(&next)).await;

        match result {
            Ok(()) => {
                self.lobby = next;
                Ok(())
            }
            Err(AppError::StoreUnavailable(message)) => {
                error!(
                    lobby_id = %self.lobby.id,
                    attempted_status = %next.status,
                    error = %message,
                    "Lobby store retry budget exhausted, force-closing lobby"
                );
                self.force_close().await;
                Err(AppError::StoreUnavailable(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn force_close(&mut self) {
        let from = self.lobby.status;
        self.lobby.status = LobbyStatus::Closed;
        self.lobby.close_reason = Some(CloseReason::StoreUnavailable);
        self.lobby.touch(self.ctx.clock.now());
        self.needs_reconciliation = true;
        self.release_layout();

        self.ctx
            .reconciliation
            .lock()
            .await
            .insert(self.lobby.id, self.lobby.clone());

        self.emit(LobbyEvent::StatusChanged {
            lobby_id: self.lobby.id,
            from,
            to: LobbyStatus::Closed,
            reason: Some(CloseReason::StoreUnavailable),
        })
        .await;
        self.emit(LobbyEvent::ReconciliationRequired {
            lobby_id: self.lobby.id,
        })
        .await;
    }

    /// Moves to `to`, persisting first. `reason` is recorded when closing.
    async fn transition(
        &mut self,
        to: LobbyStatus,
        reason: Option<CloseReason>,
        operation: &'static str,
    ) -> Result<(), AppError> {
        let from = self.lobby.status;
        if !from.can_transition_to(to) {
            return Err(self.invalid(operation));
        }

        let mut next = self.lobby.clone();
        next.status = to;
        if reason.is_some() {
            next.close_reason = reason;
        }
        next.touch(self.ctx.clock.now());
        self.commit(next).await?;

        info!(
            lobby_id = %self.lobby.id,
            from = %from,
            to = %to,
            reason = ?reason,
            "Lobby status changed"
        );
        if !to.holds_layout() {
            self.release_layout();
        }
        self.emit(LobbyEvent::StatusChanged {
            lobby_id: self.lobby.id,
            from,
            to,
            reason,
        })
        .await;
        Ok(())
    }

    /// Drops this lobby's interest in its layout and any in-flight generation
    fn release_layout(&mut self) {
        if let Some(waiter) = self.pending_layout.take() {
            waiter.abort();
            debug!(lobby_id = %self.lobby.id, "Cancelled pending layout request");
        }
        self.layout = None;
    }

    fn request_layout(&mut self) {
        let Some(sender) = self.self_sender.upgrade() else {
            return;
        };
        if let Some(previous) = self.pending_layout.take() {
            previous.abort();
        }

        let params = self
            .ctx
            .layout_config
            .parameters(self.lobby.seed, self.lobby.difficulty);
        let generation = self.ctx.generation.clone();
        let lobby_id = self.lobby.id;

        debug!(lobby_id = %lobby_id, cache_key = %params.cache_key(), "Requesting layout");
        self.pending_layout = Some(tokio::spawn(async move {
            let result = generation.request_layout(params).await;
            if sender
                .send(LobbyCommand::LayoutResolved { result })
                .await
                .is_err()
            {
                debug!(lobby_id = %lobby_id, "Lobby gone before layout resolved");
            }
        }));
    }

    async fn begin_assignment(&mut self, operation: &'static str) -> Result<(), AppError> {
        self.transition(LobbyStatus::Assigning, None, operation)
            .await?;
        self.request_layout();
        Ok(())
    }

    async fn record_runs(&self, players: &[PlayerId], completed: bool) {
        if players.is_empty() {
            return;
        }
        let recorded_at = self.ctx.clock.now();
        let runs: Vec<DungeonRun> = players
            .iter()
            .map(|player| DungeonRun {
                lobby_id: self.lobby.id,
                player_id: player.clone(),
                layout_id: self.lobby.assigned_layout_id,
                difficulty: self.lobby.difficulty,
                completed,
                recorded_at,
            })
            .collect();

        if let Err(e) = self.ctx.repository.record_runs(&runs).await {
            warn!(lobby_id = %self.lobby.id, error = %e, "Failed to record dungeon runs");
        }
    }

    async fn handle_join(&mut self, player: PlayerId) -> Result<Lobby, AppError> {
        if self.lobby.status != LobbyStatus::Forming {
            return Err(self.invalid("join"));
        }
        if self.lobby.has_player(&player) {
            return Err(AppError::PlayerAlreadyInLobby(player.to_string()));
        }
        if self.lobby.is_full() {
            return Err(AppError::LobbyFull);
        }

        let mut next = self.lobby.clone();
        next.players.push(player.clone());
        next.touch(self.ctx.clock.now());
        self.commit(next).await?;

        info!(
            lobby_id = %self.lobby.id,
            player = %player,
            players = self.lobby.players.len(),
            "Player joined lobby"
        );
        self.emit(LobbyEvent::PlayerJoined {
            lobby_id: self.lobby.id,
            player,
            players: self.lobby.players.clone(),
        })
        .await;

        if self.lobby.is_full() {
            self.begin_assignment("join").await?;
        }
        Ok(self.lobby.clone())
    }

    async fn handle_leave(&mut self, player: PlayerId) -> Result<Lobby, AppError> {
        let status = self.lobby.status;
        if !matches!(
            status,
            LobbyStatus::Forming | LobbyStatus::Assigning | LobbyStatus::Active
        ) {
            return Err(self.invalid("leave"));
        }
        if !self.lobby.has_player(&player) {
            return Err(AppError::PlayerNotInLobby(player.to_string()));
        }

        let mut next = self.lobby.clone();
        next.players.retain(|p| p != &player);
        next.touch(self.ctx.clock.now());

        // The last player leaving closes the lobby; a Forming lobby has
        // nothing to tear down
        let closing = next.players.is_empty().then(|| match status {
            LobbyStatus::Forming => LobbyStatus::Closed,
            _ => LobbyStatus::Closing,
        });
        if let Some(to) = closing {
            next.status = to;
            next.close_reason = Some(CloseReason::AllPlayersLeft);
        }
        self.commit(next).await?;

        info!(lobby_id = %self.lobby.id, player = %player, "Player left lobby");
        if status == LobbyStatus::Active {
            self.record_runs(std::slice::from_ref(&player), false).await;
        }
        self.emit(LobbyEvent::PlayerLeft {
            lobby_id: self.lobby.id,
            player,
            players: self.lobby.players.clone(),
        })
        .await;

        if let Some(to) = closing {
            info!(lobby_id = %self.lobby.id, from = %status, to = %to, "All players left lobby");
            self.release_layout();
            self.emit(LobbyEvent::StatusChanged {
                lobby_id: self.lobby.id,
                from: status,
                to,
                reason: Some(CloseReason::AllPlayersLeft),
            })
            .await;
        }
        Ok(self.lobby.clone())
    }

    async fn handle_start(&mut self) -> Result<Lobby, AppError> {
        if self.lobby.status != LobbyStatus::Forming || self.lobby.players.is_empty() {
            return Err(self.invalid("start"));
        }
        self.begin_assignment("start").await?;
        Ok(self.lobby.clone())
    }

    async fn handle_stop(&mut self, reason: StopReason) -> Result<Lobby, AppError> {
        match self.lobby.status {
            LobbyStatus::Forming => {
                self.transition(LobbyStatus::Closed, Some(CloseReason::Stopped), "stop")
                    .await?;
            }
            LobbyStatus::Ready | LobbyStatus::Assigning => {
                self.transition(LobbyStatus::Closing, Some(CloseReason::Stopped), "stop")
                    .await?;
            }
            LobbyStatus::Active => {
                self.transition(LobbyStatus::Closing, Some(reason.into()), "stop")
                    .await?;
                let players = self.lobby.players.clone();
                self.record_runs(&players, reason == StopReason::Completed)
                    .await;
            }
            LobbyStatus::Closing | LobbyStatus::Closed => return Err(self.invalid("stop")),
        }
        Ok(self.lobby.clone())
    }

    async fn handle_confirm_materialized(&mut self) -> Result<Lobby, AppError> {
        if self.lobby.status != LobbyStatus::Assigning || self.layout.is_none() {
            return Err(self.invalid("confirm materialization"));
        }
        self.transition(LobbyStatus::Active, None, "confirm materialization")
            .await?;
        Ok(self.lobby.clone())
    }

    async fn handle_confirm_teardown(&mut self) -> Result<Lobby, AppError> {
        if self.lobby.status != LobbyStatus::Closing {
            return Err(self.invalid("confirm teardown"));
        }
        self.transition(LobbyStatus::Closed, None, "confirm teardown")
            .await?;
        Ok(self.lobby.clone())
    }

    async fn handle_record_activity(&mut self, player: PlayerId) -> Result<Lobby, AppError> {
        if !matches!(
            self.lobby.status,
            LobbyStatus::Assigning | LobbyStatus::Active
        ) {
            return Err(self.invalid("record activity"));
        }
        if !self.lobby.has_player(&player) {
            return Err(AppError::PlayerNotInLobby(player.to_string()));
        }

        let mut next = self.lobby.clone();
        next.touch(self.ctx.clock.now());
        self.commit(next).await?;

        debug!(lobby_id = %self.lobby.id, player = %player, "Player activity recorded");
        Ok(self.lobby.clone())
    }

    async fn handle_tick(&mut self) {
        let now = self.ctx.clock.now();
        let idle = now - self.lobby.last_activity_at;
        let inactivity_timeout = self.ctx.lobby_config.inactivity_timeout();
        let teardown_timeout = self.ctx.lobby_config.teardown_timeout();

        let result = match self.lobby.status {
            LobbyStatus::Active if idle >= inactivity_timeout => {
                info!(lobby_id = %self.lobby.id, idle_secs = idle.num_seconds(), "Lobby inactive");
                let players = self.lobby.players.clone();
                let result = self
                    .transition(
                        LobbyStatus::Closing,
                        Some(CloseReason::InactivityTimeout),
                        "time out",
                    )
                    .await;
                if result.is_ok() {
                    self.record_runs(&players, false).await;
                }
                result
            }
            LobbyStatus::Closing if idle >= teardown_timeout => {
                warn!(lobby_id = %self.lobby.id, "Teardown not confirmed in time, forcing close");
                self.transition(
                    LobbyStatus::Closed,
                    Some(CloseReason::TeardownTimeout),
                    "time out",
                )
                .await
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!(lobby_id = %self.lobby.id, error = %e, "Lobby timeout handling failed");
        }
    }

    async fn handle_layout_resolved(&mut self, result: Result<Arc<Layout>, GenerationError>) {
        self.pending_layout = None;

        let outcome = match (self.lobby.status, result) {
            (LobbyStatus::Assigning, Ok(layout)) => self.assign_layout(layout).await,
            (LobbyStatus::Assigning, Err(e)) => {
                warn!(lobby_id = %self.lobby.id, error = %e, "Layout generation failed");
                self.transition(
                    LobbyStatus::Closing,
                    Some(CloseReason::GenerationFailed),
                    "assign layout",
                )
                .await
            }
            (LobbyStatus::Active, Ok(layout)) if self.layout.is_none() => {
                // Re-pinning the layout of a recovered lobby. The host already
                // built the stored one, so the record keeps its id either way.
                recovered_layout_matches(&self.lobby, &layout);
                self.layout = Some(layout);
                Ok(())
            }
            (status, _) => {
                debug!(lobby_id = %self.lobby.id, status = %status, "Ignoring stale layout result");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(lobby_id = %self.lobby.id, error = %e, "Layout assignment failed");
        }
    }

    async fn assign_layout(&mut self, layout: Arc<Layout>) -> Result<(), AppError> {
        let mut next = self.lobby.clone();
        next.assigned_layout_id = Some(layout.id);
        next.touch(self.ctx.clock.now());
        self.commit(next).await?;
        self.layout = Some(Arc::clone(&layout));

        info!(lobby_id = %self.lobby.id, layout_id = %layout.id, "Layout assigned");
        self.emit(LobbyEvent::LayoutAssigned {
            lobby_id: self.lobby.id,
            layout_id: layout.id,
            players: self.lobby.players.clone(),
        })
        .await;

        if self.ctx.lobby_config.require_materialization_ack {
            debug!(lobby_id = %self.lobby.id, "Waiting for host to confirm materialization");
            return Ok(());
        }
        self.transition(LobbyStatus::Active, None, "assign layout")
            .await
    }
}

/// True when a regenerated layout is the one recorded for the lobby. A
/// mismatch means the layout configuration changed since it was assigned.
fn recovered_layout_matches(lobby: &Lobby, layout: &Layout) -> bool {
    if lobby.assigned_layout_id == Some(layout.id) {
        return true;
    }
    warn!(
        lobby_id = %lobby.id,
        assigned_layout_id = ?lobby.assigned_layout_id,
        regenerated_layout_id = %layout.id,
        "Recovered lobby regenerated a different layout than it was assigned"
    );
    false
}
