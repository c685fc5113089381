use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::layout::GenerationError;
use crate::lobby::{LobbyOrchestrator, LobbyStatus};

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: LobbyOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: LobbyOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Lobby store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} while lobby is {status}")]
    InvalidTransition {
        status: LobbyStatus,
        operation: &'static str,
    },

    #[error("Lobby is full")]
    LobbyFull,

    #[error("Player {0} is already in the lobby")]
    PlayerAlreadyInLobby(String),

    #[error("Player {0} is not in the lobby")]
    PlayerNotInLobby(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Lobby actor is not responding")]
    LobbyUnavailable,

    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. }
            | AppError::LobbyFull
            | AppError::PlayerAlreadyInLobby(_) => StatusCode::CONFLICT,
            AppError::PlayerNotInLobby(_)
            | AppError::BadRequest(_)
            | AppError::Generation(GenerationError::InvalidParameters(_)) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Generation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::StoreUnavailable(_) | AppError::LobbyUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Config(_) | AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
