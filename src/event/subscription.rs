use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{bus::EventBus, handler::LobbyEventHandler};
use crate::lobby::models::LobbyId;

/// Routes lobby events from the bus to a handler
pub struct LobbySubscription {
    /// `None` subscribes to every lobby
    lobby_id: Option<LobbyId>,
    handler: Arc<dyn LobbyEventHandler>,
    event_bus: EventBus,
}

impl LobbySubscription {
    pub fn all(handler: Arc<dyn LobbyEventHandler>, event_bus: EventBus) -> Self {
        Self {
            lobby_id: None,
            handler,
            event_bus,
        }
    }

    pub fn for_lobby(
        lobby_id: LobbyId,
        handler: Arc<dyn LobbyEventHandler>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            lobby_id: Some(lobby_id),
            handler,
            event_bus,
        }
    }

    /// Start the subscription - spawns a background task that listens to
    /// lobby events and routes them to the handler
    pub async fn start(self) -> JoinHandle<()> {
        let handler_name = self.handler.handler_name();
        let mut receiver = match self.lobby_id {
            Some(lobby_id) => self.event_bus.subscribe_to_lobby(lobby_id).await,
            None => self.event_bus.subscribe(),
        };

        info!(
            lobby_id = ?self.lobby_id,
            handler = handler_name,
            "Starting lobby subscription"
        );

        let handler = self.handler;
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        debug!(
                            handler = handler_name,
                            event_type = event.event_type(),
                            lobby_id = %event.lobby_id(),
                            "Routing lobby event"
                        );
                        if let Err(e) = handler.handle_lobby_event(event).await {
                            warn!(handler = handler_name, error = %e, "Lobby event handler failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(handler = handler_name, skipped, "Lobby subscription lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            debug!(handler = handler_name, "Lobby subscription ended");
        })
    }
}
