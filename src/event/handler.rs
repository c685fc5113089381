use async_trait::async_trait;
use thiserror::Error;

use super::events::LobbyEvent;

/// Errors that can occur when handling lobby events
#[derive(Debug, Error)]
pub enum LobbyEventError {
    #[error("Handler error: {0}")]
    HandlerError(String),
}

/// Trait for host components that react to lobby events
///
/// Optional integrations (placeholders, economy, world builders) attach here;
/// the lobby core never depends on them.
#[async_trait]
pub trait LobbyEventHandler: Send + Sync {
    async fn handle_lobby_event(&self, event: LobbyEvent) -> Result<(), LobbyEventError>;

    /// Get a human-readable name for this handler (for logging/debugging)
    fn handler_name(&self) -> &'static str;
}
