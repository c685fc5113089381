use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dungeon_lobby::lobby::{
    self, clock::SystemClock, InMemoryLobbyRepository, PostgresLobbyRepository,
    SqliteLobbyRepository,
};
use dungeon_lobby::{
    AppError, AppState, EngineConfig, EventBus, GenerationService, LobbyOrchestrator,
    LobbyRepository, StorageConfig,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dungeon_lobby=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Dungeon lobby server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    info!("Starting dungeon lobby server");
    let config = EngineConfig::load()?;

    let repository: Arc<dyn LobbyRepository + Send + Sync> = match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory lobby store");
            Arc::new(InMemoryLobbyRepository::new())
        }
        StorageConfig::Sqlite { url } => Arc::new(SqliteLobbyRepository::connect(url).await?),
        StorageConfig::Postgres { url } => Arc::new(PostgresLobbyRepository::connect(url).await?),
    };

    let orchestrator = LobbyOrchestrator::new(
        repository,
        GenerationService::from_config(&config),
        EventBus::new(),
        Arc::new(SystemClock),
        &config,
    );

    let recovered = orchestrator.recover().await?;
    info!(recovered, "Recovered open lobbies from store");
    lobby::start_sweeper(orchestrator.clone(), config.lobby.sweep_interval());

    let app = lobby::router()
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(orchestrator));

    let bind = std::env::var("DUNGEON_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| AppError::Config(format!("Cannot bind {}: {}", bind, e)))?;
    info!(bind = %bind, "Server running");

    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::Config(format!("Server error: {}", e)))
}
