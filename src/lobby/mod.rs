// Lobby lifecycle: one actor per lobby, a durable store behind it and the
// HTTP routes the host drives it with.

pub use cleanup_task::{run_sweep, start_sweeper};
pub use handlers::router;
pub use models::{
    CloseReason, DungeonRun, Lobby, LobbyId, LobbySnapshot, LobbyStatus, PlayerId, PlayerStats,
    StopReason,
};
pub use orchestrator::LobbyOrchestrator;
pub use repository::{InMemoryLobbyRepository, LobbyRepository};
pub use sql::{PostgresLobbyRepository, SqliteLobbyRepository};
pub use types::{CreateLobbyRequest, LobbyResponse};

mod actor;
mod cleanup_task;
pub mod clock;
mod handlers;
pub mod models;
mod orchestrator;
mod repository;
mod sql;
mod types;
