//! Test assertion helpers for asynchronous lobby state
#![allow(dead_code)] // Test utilities may not all be used in every test

use std::time::Duration;
use tokio::sync::broadcast;

use dungeon_lobby::lobby::{LobbyId, LobbyOrchestrator, LobbySnapshot, LobbyStatus};
use dungeon_lobby::LobbyEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const TIMEOUT: Duration = Duration::from_secs(5);

/// Polls the lobby until it reaches `expected`, panicking after a timeout
pub async fn wait_for_status(
    orchestrator: &LobbyOrchestrator,
    lobby_id: LobbyId,
    expected: LobbyStatus,
) -> LobbySnapshot {
    let poll = async {
        loop {
            let snapshot = orchestrator
                .get_lobby(lobby_id)
                .await
                .expect("lobby should be readable");
            if snapshot.lobby.status == expected {
                return snapshot;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    match tokio::time::timeout(TIMEOUT, poll).await {
        Ok(snapshot) => snapshot,
        Err(_) => {
            let current = orchestrator.get_lobby(lobby_id).await.ok();
            panic!(
                "lobby {} never reached {}; last seen {:?}",
                lobby_id,
                expected,
                current.map(|s| s.lobby.status)
            );
        }
    }
}

/// Receives events until one matches `predicate`, panicking after a timeout
pub async fn wait_for_event<F>(receiver: &mut broadcast::Receiver<LobbyEvent>, predicate: F) -> LobbyEvent
where
    F: Fn(&LobbyEvent) -> bool,
{
    let receive = async {
        loop {
            match receiver.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };

    tokio::time::timeout(TIMEOUT, receive)
        .await
        .expect("expected event was not emitted in time")
}
