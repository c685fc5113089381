use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::events::LobbyEvent;
use crate::lobby::models::LobbyId;

const GLOBAL_CAPACITY: usize = 1024;
const LOBBY_CAPACITY: usize = 100;

/// Event bus for distributing lobby events to the host
///
/// Every event goes to the global channel and to the channel of its lobby.
#[derive(Debug, Clone)]
pub struct EventBus {
    global: broadcast::Sender<LobbyEvent>,
    /// Lobby-specific event channels: lobby_id -> sender
    lobby_channels: Arc<RwLock<HashMap<LobbyId, broadcast::Sender<LobbyEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(GLOBAL_CAPACITY);
        Self {
            global,
            lobby_channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn emit(&self, event: LobbyEvent) {
        let lobby_id = event.lobby_id();
        let event_type = event.event_type();

        let global_receivers = self.global.send(event.clone()).unwrap_or(0);

        let lobby_channels = self.lobby_channels.read().await;
        let lobby_receivers = match lobby_channels.get(&lobby_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };

        debug!(
            lobby_id = %lobby_id,
            event_type,
            global_receivers,
            lobby_receivers,
            "Lobby event emitted"
        );
    }

    /// Subscribe to events from every lobby
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.global.subscribe()
    }

    /// Subscribe to events for a specific lobby
    pub async fn subscribe_to_lobby(&self, lobby_id: LobbyId) -> broadcast::Receiver<LobbyEvent> {
        let lobby_channels = self.lobby_channels.read().await;
        if let Some(sender) = lobby_channels.get(&lobby_id) {
            return sender.subscribe();
        }
        drop(lobby_channels);

        debug!(lobby_id = %lobby_id, "Creating new lobby channel for subscription");
        let mut lobby_channels = self.lobby_channels.write().await;
        lobby_channels
            .entry(lobby_id)
            .or_insert_with(|| broadcast::channel(LOBBY_CAPACITY).0)
            .subscribe()
    }

    /// Number of lobbies with an open event channel
    pub async fn lobby_channel_count(&self) -> usize {
        self.lobby_channels.read().await.len()
    }

    /// Drops the channel of a closed lobby; existing receivers see the stream end
    pub async fn close_lobby(&self, lobby_id: LobbyId) {
        if self.lobby_channels.write().await.remove(&lobby_id).is_some() {
            debug!(lobby_id = %lobby_id, "Lobby channel closed");
        }
    }
}
