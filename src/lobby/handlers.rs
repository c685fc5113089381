use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use super::models::{LobbyId, PlayerId, PlayerStats};
use super::types::{CreateLobbyBody, LayoutRequest, LobbyResponse, PlayerRequest, StopRequest};
use crate::layout::{Difficulty, Layout};
use crate::shared::{AppError, AppState};

/// Routes of the host boundary
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/lobbies", post(create_lobby).get(list_lobbies))
        .route("/lobbies/:lobby_id", get(get_lobby))
        .route("/lobbies/:lobby_id/join", post(join_lobby))
        .route("/lobbies/:lobby_id/leave", post(leave_lobby))
        .route("/lobbies/:lobby_id/start", post(start_lobby))
        .route("/lobbies/:lobby_id/stop", post(stop_lobby))
        .route("/lobbies/:lobby_id/materialized", post(confirm_materialized))
        .route("/lobbies/:lobby_id/teardown", post(confirm_teardown))
        .route("/lobbies/:lobby_id/activity", post(record_activity))
        .route("/players/:player_id/stats", get(player_stats))
        .route("/layouts", post(request_layout))
}

/// POST /lobbies
#[instrument(name = "create_lobby", skip(state, request), fields(creator = %request.creator))]
pub async fn create_lobby(
    State(state): State<AppState>,
    Json(request): Json<CreateLobbyBody>,
) -> Result<Json<LobbyResponse>, AppError> {
    let snapshot = state
        .orchestrator
        .create_lobby(request.creator, request.options)
        .await?;

    info!(lobby_id = %snapshot.lobby.id, "Lobby created via HTTP");
    Ok(Json(snapshot.into()))
}

/// GET /lobbies
#[instrument(name = "list_lobbies", skip(state))]
pub async fn list_lobbies(
    State(state): State<AppState>,
) -> Result<Json<Vec<LobbyResponse>>, AppError> {
    let lobbies = state.orchestrator.list_lobbies().await?;

    info!(lobby_count = lobbies.len(), "Lobbies listed");
    Ok(Json(lobbies.into_iter().map(LobbyResponse::from).collect()))
}

/// GET /lobbies/:lobby_id
#[instrument(name = "get_lobby", skip(state))]
pub async fn get_lobby(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
) -> Result<Json<LobbyResponse>, AppError> {
    let snapshot = state.orchestrator.get_lobby(lobby_id).await?;
    Ok(Json(snapshot.into()))
}

#[instrument(name = "join_lobby", skip(state, request), fields(player = %request.player_id))]
pub async fn join_lobby(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
    Json(request): Json<PlayerRequest>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state
        .orchestrator
        .join_lobby(lobby_id, request.player_id)
        .await?;
    Ok(Json(lobby.into()))
}

#[instrument(name = "leave_lobby", skip(state, request), fields(player = %request.player_id))]
pub async fn leave_lobby(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
    Json(request): Json<PlayerRequest>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state
        .orchestrator
        .leave_lobby(lobby_id, request.player_id)
        .await?;
    Ok(Json(lobby.into()))
}

#[instrument(name = "start_lobby", skip(state))]
pub async fn start_lobby(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state.orchestrator.start_lobby(lobby_id).await?;
    Ok(Json(lobby.into()))
}

/// POST /lobbies/:lobby_id/stop
///
/// Body `{"reason": "completed"}` marks the run as cleared; an empty object
/// stops the lobby as requested by the host.
#[instrument(name = "stop_lobby", skip(state, request))]
pub async fn stop_lobby(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
    Json(request): Json<StopRequest>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state
        .orchestrator
        .stop_lobby(lobby_id, request.reason)
        .await?;
    Ok(Json(lobby.into()))
}

#[instrument(name = "confirm_materialized", skip(state))]
pub async fn confirm_materialized(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state.orchestrator.confirm_materialized(lobby_id).await?;
    Ok(Json(lobby.into()))
}

#[instrument(name = "confirm_teardown", skip(state))]
pub async fn confirm_teardown(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state.orchestrator.confirm_teardown(lobby_id).await?;
    Ok(Json(lobby.into()))
}

/// POST /lobbies/:lobby_id/activity
///
/// Reported by the host whenever a player acts inside the dungeon.
#[instrument(name = "record_activity", skip(state, request), fields(player = %request.player_id))]
pub async fn record_activity(
    State(state): State<AppState>,
    Path(lobby_id): Path<LobbyId>,
    Json(request): Json<PlayerRequest>,
) -> Result<Json<LobbyResponse>, AppError> {
    let lobby = state
        .orchestrator
        .record_activity(lobby_id, request.player_id)
        .await?;
    Ok(Json(lobby.into()))
}

/// GET /players/:player_id/stats
#[instrument(name = "player_stats", skip(state))]
pub async fn player_stats(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerStats>, AppError> {
    let stats = state
        .orchestrator
        .player_stats(&PlayerId::new(player_id))
        .await?;
    Ok(Json(stats))
}

/// POST /layouts
///
/// Generates a layout outside of any lobby, sharing the lobby cache.
#[instrument(name = "request_layout", skip(state, request), fields(seed = request.seed))]
pub async fn request_layout(
    State(state): State<AppState>,
    Json(request): Json<LayoutRequest>,
) -> Result<Json<Layout>, AppError> {
    let difficulty = request.difficulty.unwrap_or(Difficulty::Medium);
    let mut params = state
        .orchestrator
        .layout_parameters(request.seed, difficulty);
    if let Some(width) = request.width {
        params.width = width;
    }
    if let Some(height) = request.height {
        params.height = height;
    }
    if let Some(target) = request.room_count_target {
        params.room_count_target = target;
    }

    let layout = state.orchestrator.request_layout(params).await?;

    info!(
        layout_id = %layout.id,
        room_count = layout.room_count(),
        "Layout served"
    );
    Ok(Json(Layout::clone(&layout)))
}
