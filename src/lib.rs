// Library crate for the dungeon lobby engine
// This file exposes the public API for the binary and integration tests

pub mod config;
pub mod event;
pub mod layout;
pub mod lobby;
pub mod shared;

// Re-export commonly used types for easier access in tests
pub use config::{EngineConfig, StorageConfig};
pub use event::{EventBus, LobbyEvent, LobbySubscription};
pub use layout::{GenerationParameters, GenerationService, Layout};
pub use lobby::{LobbyOrchestrator, LobbyRepository};
pub use shared::{AppError, AppState};
