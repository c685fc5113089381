use std::sync::Arc;

use dungeon_lobby::lobby::clock::{Clock, ManualClock};
use dungeon_lobby::lobby::{
    CreateLobbyRequest, InMemoryLobbyRepository, Lobby, LobbyOrchestrator, LobbyRepository,
    PlayerId,
};
use dungeon_lobby::{EngineConfig, EventBus, GenerationService};

// ============================================================================
// Test Setup Infrastructure
// ============================================================================

#[allow(dead_code)]
pub struct TestSetup {
    pub orchestrator: LobbyOrchestrator,
    pub clock: Arc<ManualClock>,
    pub config: EngineConfig,
}

pub struct TestSetupBuilder {
    config: EngineConfig,
    repository: Option<Arc<dyn LobbyRepository + Send + Sync>>,
}

#[allow(dead_code)]
impl TestSetupBuilder {
    pub fn new() -> Self {
        let mut config = EngineConfig::default();
        // Keep retries fast in tests
        config.lobby.store_retry_backoff_ms = 1;
        Self {
            config,
            repository: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.config.lobby.capacity = capacity;
        self
    }

    pub fn with_cache_entries(mut self, max_entries: usize) -> Self {
        self.config.cache.max_entries = max_entries;
        self
    }

    /// Overrides the layout dimensions every lobby generates with
    pub fn with_layout(mut self, width: u32, height: u32, room_count_target: u32) -> Self {
        self.config.layout.width = width;
        self.config.layout.height = height;
        self.config.layout.room_count_target = room_count_target;
        self
    }

    pub fn with_materialization_ack(mut self) -> Self {
        self.config.lobby.require_materialization_ack = true;
        self
    }

    pub fn with_store_retry_budget(mut self, budget: u32) -> Self {
        self.config.lobby.store_retry_budget = budget;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn LobbyRepository + Send + Sync>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn build(self) -> TestSetup {
        let clock = Arc::new(ManualClock::default());
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryLobbyRepository::new()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();

        let orchestrator = LobbyOrchestrator::new(
            repository,
            GenerationService::from_config(&self.config),
            EventBus::new(),
            clock_dyn,
            &self.config,
        );

        TestSetup {
            orchestrator,
            clock,
            config: self.config,
        }
    }
}

#[allow(dead_code)]
impl TestSetup {
    /// Creates a Forming lobby with a fixed seed
    pub async fn create_lobby(&self, creator: &str, seed: i64) -> Lobby {
        let request = CreateLobbyRequest {
            seed: Some(seed),
            ..CreateLobbyRequest::default()
        };
        self.orchestrator
            .create_lobby(PlayerId::from(creator), request)
            .await
            .expect("lobby creation should succeed")
            .lobby
    }

    /// Creates a lobby, adds the other players and returns the lobby as the
    /// last join left it
    pub async fn create_full_lobby(&self, players: &[&str], seed: i64) -> Lobby {
        let mut lobby = self.create_lobby(players[0], seed).await;
        for player in &players[1..] {
            lobby = self
                .orchestrator
                .join_lobby(lobby.id, PlayerId::from(*player))
                .await
                .expect("join should succeed");
        }
        lobby
    }
}
