use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::layout::models::{Difficulty, GenerationParameters};
use crate::shared::AppError;

/// Upper bound for every lobby timeout and the sweep interval (30 days)
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Upper bound for the base store retry backoff
pub const MAX_STORE_BACKOFF_MS: u64 = 60_000;

/// Top-level engine configuration
///
/// Every section has defaults, so a partial JSON document (or none at all)
/// is enough to start the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub layout: LayoutConfig,
    pub difficulties: DifficultyPresets,
    pub cache: CacheConfig,
    pub generation: GenerationConfig,
    pub lobby: LobbyConfig,
    pub storage: StorageConfig,
}

/// Default layout bounds used for lobby dungeons
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub width: u32,
    pub height: u32,
    pub room_count_target: u32,
    /// Placement attempts allowed per requested room before giving up
    pub placement_attempts_per_room: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            width: 50,
            height: 50,
            room_count_target: 10,
            placement_attempts_per_room: 30,
        }
    }
}

impl LayoutConfig {
    pub fn parameters(&self, seed: i64, difficulty: Difficulty) -> GenerationParameters {
        GenerationParameters {
            seed,
            width: self.width,
            height: self.height,
            room_count_target: self.room_count_target,
            difficulty,
        }
    }
}

/// Generation tuning for one difficulty level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyPreset {
    pub min_room_size: u32,
    pub max_room_size: u32,
    /// Extra connections added on top of the spanning tree, as a fraction of the room count
    pub loop_fraction: f64,
    pub trap_chance: f64,
    pub treasure_chance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifficultyPresets {
    pub easy: DifficultyPreset,
    pub medium: DifficultyPreset,
    pub hard: DifficultyPreset,
    pub epic: DifficultyPreset,
}

impl Default for DifficultyPresets {
    fn default() -> Self {
        Self {
            easy: DifficultyPreset {
                min_room_size: 4,
                max_room_size: 8,
                loop_fraction: 0.10,
                trap_chance: 0.10,
                treasure_chance: 0.20,
            },
            medium: DifficultyPreset {
                min_room_size: 4,
                max_room_size: 9,
                loop_fraction: 0.15,
                trap_chance: 0.20,
                treasure_chance: 0.15,
            },
            hard: DifficultyPreset {
                min_room_size: 3,
                max_room_size: 10,
                loop_fraction: 0.20,
                trap_chance: 0.50,
                treasure_chance: 0.10,
            },
            epic: DifficultyPreset {
                min_room_size: 3,
                max_room_size: 12,
                loop_fraction: 0.25,
                trap_chance: 0.90,
                treasure_chance: 0.08,
            },
        }
    }
}

impl DifficultyPresets {
    pub fn preset(&self, difficulty: Difficulty) -> &DifficultyPreset {
        match difficulty {
            Difficulty::Easy => &self.easy,
            Difficulty::Medium => &self.medium,
            Difficulty::Hard => &self.hard,
            Difficulty::Epic => &self.epic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Generate/validate attempts before a request fails as exhausted
    pub retry_ceiling: u32,
    /// Concurrent generation jobs on the blocking pool
    pub worker_threads: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 5,
            worker_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    pub capacity: u32,
    pub inactivity_timeout_secs: u64,
    pub teardown_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Hold lobbies in Assigning until the host confirms the layout was built
    pub require_materialization_ack: bool,
    pub store_retry_budget: u32,
    pub store_retry_backoff_ms: u64,
    pub command_channel_size: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            inactivity_timeout_secs: 15 * 60,
            teardown_timeout_secs: 60,
            sweep_interval_secs: 15,
            require_materialization_ack: false,
            store_retry_budget: 5,
            store_retry_backoff_ms: 200,
            command_channel_size: 32,
        }
    }
}

impl LobbyConfig {
    pub fn inactivity_timeout(&self) -> chrono::Duration {
        timeout_delta(self.inactivity_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> chrono::Duration {
        timeout_delta(self.teardown_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.clamp(1, MAX_TIMEOUT_SECS))
    }

    /// Backoff before the given retry (0-based), doubling up to 32x the base
    pub fn store_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms.min(MAX_STORE_BACKOFF_MS))
            .saturating_mul(1 << attempt.min(5))
    }
}

/// Seconds as a chrono delta, clamped so unchecked configs cannot overflow it
fn timeout_delta(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_TIMEOUT_SECS)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs).unwrap_or_else(|| chrono::Duration::days(30))
}

/// Which lobby store backend to use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        url: String,
    },
    Postgres {
        url: String,
    },
}

impl StorageConfig {
    /// Picks a backend from a database URL scheme
    pub fn from_url(url: &str) -> Result<Self, AppError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(StorageConfig::Postgres {
                url: url.to_string(),
            })
        } else if url.starts_with("sqlite:") {
            Ok(StorageConfig::Sqlite {
                url: url.to_string(),
            })
        } else {
            Err(AppError::Config(format!(
                "Unsupported database URL scheme: {}",
                url
            )))
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let config: EngineConfig = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `.env`, `DUNGEON_CONFIG` (path to a JSON file)
    /// and `DATABASE_URL`, in that order of precedence.
    pub fn load() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let mut config = match std::env::var("DUNGEON_CONFIG") {
            Ok(path) => {
                info!(path = %path, "Loading engine configuration file");
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    AppError::Config(format!("Cannot read config file {}: {}", path, e))
                })?;
                Self::from_json(&raw)?
            }
            Err(_) => {
                debug!("DUNGEON_CONFIG not set, using default configuration");
                Self::default()
            }
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.storage = StorageConfig::from_url(&url)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.layout
            .parameters(0, Difficulty::Medium)
            .check()
            .map_err(|reason| AppError::Config(format!("Invalid layout defaults: {}", reason)))?;
        if self.layout.placement_attempts_per_room == 0 {
            return Err(AppError::Config(
                "placement_attempts_per_room must be positive".to_string(),
            ));
        }
        for difficulty in [
            Difficulty::Easy,
            Difficulty::Medium,
            Difficulty::Hard,
            Difficulty::Epic,
        ] {
            let preset = self.difficulties.preset(difficulty);
            if preset.min_room_size == 0 || preset.min_room_size > preset.max_room_size {
                return Err(AppError::Config(format!(
                    "Room size range for {} is invalid",
                    difficulty
                )));
            }
            for chance in [preset.loop_fraction, preset.trap_chance, preset.treasure_chance] {
                if !(0.0..=1.0).contains(&chance) {
                    return Err(AppError::Config(format!(
                        "Chances for {} must lie in [0, 1]",
                        difficulty
                    )));
                }
            }
        }
        if self.cache.max_entries == 0 {
            return Err(AppError::Config("cache.max_entries must be positive".to_string()));
        }
        if self.generation.retry_ceiling == 0 || self.generation.worker_threads == 0 {
            return Err(AppError::Config(
                "generation.retry_ceiling and generation.worker_threads must be positive"
                    .to_string(),
            ));
        }
        if self.lobby.capacity == 0 || self.lobby.command_channel_size == 0 {
            return Err(AppError::Config(
                "lobby.capacity and lobby.command_channel_size must be positive".to_string(),
            ));
        }
        for (name, secs) in [
            ("inactivity_timeout_secs", self.lobby.inactivity_timeout_secs),
            ("teardown_timeout_secs", self.lobby.teardown_timeout_secs),
            ("sweep_interval_secs", self.lobby.sweep_interval_secs),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(AppError::Config(format!(
                    "lobby.{} must lie in [1, {}]",
                    name, MAX_TIMEOUT_SECS
                )));
            }
        }
        if self.lobby.store_retry_backoff_ms > MAX_STORE_BACKOFF_MS {
            return Err(AppError::Config(format!(
                "lobby.store_retry_backoff_ms must not exceed {}",
                MAX_STORE_BACKOFF_MS
            )));
        }
        Ok(())
    }
}
