//! SQL-backed lobby stores.
//!
//! SQLite and PostgreSQL share one schema shape and one set of statements,
//! differing only in column types and placeholder syntax. Both implement the
//! full-record upsert as a single statement and refuse to touch a Closed row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, error, info, instrument, warn};

use super::models::{DungeonRun, Lobby, LobbyId, PlayerId, PlayerStats};
use super::repository::{closed_record_error, LobbyRepository};
use crate::shared::AppError;

/// Flat row shape shared by both backends
#[derive(Debug, sqlx::FromRow)]
struct LobbyRecord {
    id: String,
    status: String,
    players: String,
    capacity: i64,
    difficulty: String,
    seed: i64,
    assigned_layout_id: Option<String>,
    close_reason: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl LobbyRecord {
    fn from_lobby(lobby: &Lobby) -> Result<Self, AppError> {
        Ok(Self {
            id: lobby.id.to_string(),
            status: lobby.status.to_string(),
            players: serde_json::to_string(&lobby.players).map_err(|_| AppError::Internal)?,
            capacity: i64::from(lobby.capacity),
            difficulty: lobby.difficulty.to_string(),
            seed: lobby.seed,
            assigned_layout_id: lobby.assigned_layout_id.map(|id| id.to_string()),
            close_reason: lobby.close_reason.map(|reason| reason.to_string()),
            created_at: lobby.created_at,
            last_activity_at: lobby.last_activity_at,
        })
    }
}

impl TryFrom<LobbyRecord> for Lobby {
    type Error = AppError;

    fn try_from(record: LobbyRecord) -> Result<Self, Self::Error> {
        let corrupt = |field: &str| {
            // Retrying cannot repair a bad row
            error!(lobby_id = %record.id, field, "Corrupt lobby row");
            AppError::Internal
        };

        Ok(Lobby {
            id: record.id.parse().map_err(|_| corrupt("id"))?,
            status: record.status.parse().map_err(|_| corrupt("status"))?,
            players: serde_json::from_str(&record.players).map_err(|_| corrupt("players"))?,
            capacity: u32::try_from(record.capacity).map_err(|_| corrupt("capacity"))?,
            difficulty: record.difficulty.parse().map_err(|_| corrupt("difficulty"))?,
            seed: record.seed,
            assigned_layout_id: record
                .assigned_layout_id
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|_| corrupt("assigned_layout_id"))?,
            close_reason: record
                .close_reason
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|_| corrupt("close_reason"))?,
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
        })
    }
}

fn store_error(e: sqlx::Error) -> AppError {
    warn!(error = %e, "Lobby store query failed");
    AppError::StoreUnavailable(e.to_string())
}

fn insert_error(lobby_id: LobbyId, e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::BadRequest(format!("Lobby {} already exists", lobby_id))
        }
        _ => store_error(e),
    }
}

struct Statements {
    schema: &'static [&'static str],
    insert: &'static str,
    select: &'static str,
    upsert: &'static str,
    delete: &'static str,
    list_active: &'static str,
    insert_run: &'static str,
    player_stats: &'static str,
}

const SQLITE: Statements = Statements {
    schema: &[
        "CREATE TABLE IF NOT EXISTS lobbies (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            players TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            difficulty TEXT NOT NULL,
            seed INTEGER NOT NULL,
            assigned_layout_id TEXT,
            close_reason TEXT,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS dungeon_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            lobby_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            layout_id TEXT,
            difficulty TEXT NOT NULL,
            completed BOOLEAN NOT NULL,
            recorded_at TEXT NOT NULL,
            UNIQUE (lobby_id, player_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_dungeon_runs_player ON dungeon_runs (player_id)",
    ],
    insert: "INSERT INTO lobbies (id, status, players, capacity, difficulty, seed, \
        assigned_layout_id, close_reason, created_at, last_activity_at) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    select: "SELECT id, status, players, capacity, difficulty, seed, assigned_layout_id, \
        close_reason, created_at, last_activity_at FROM lobbies WHERE id = ?",
    upsert: "INSERT INTO lobbies (id, status, players, capacity, difficulty, seed, \
        assigned_layout_id, close_reason, created_at, last_activity_at) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
        ON CONFLICT (id) DO UPDATE SET status = excluded.status, players = excluded.players, \
        capacity = excluded.capacity, difficulty = excluded.difficulty, seed = excluded.seed, \
        assigned_layout_id = excluded.assigned_layout_id, close_reason = excluded.close_reason, \
        last_activity_at = excluded.last_activity_at \
        WHERE lobbies.status <> 'closed'",
    delete: "DELETE FROM lobbies WHERE id = ?",
    list_active: "SELECT id, status, players, capacity, difficulty, seed, assigned_layout_id, \
        close_reason, created_at, last_activity_at FROM lobbies \
        WHERE status <> 'closed' ORDER BY created_at",
    insert_run: "INSERT INTO dungeon_runs (lobby_id, player_id, layout_id, difficulty, \
        completed, recorded_at) VALUES (?, ?, ?, ?, ?, ?) \
        ON CONFLICT (lobby_id, player_id) DO NOTHING",
    player_stats: "SELECT \
        COALESCE(SUM(CASE WHEN completed THEN 1 ELSE 0 END), 0) AS completed, \
        COALESCE(SUM(CASE WHEN completed THEN 0 ELSE 1 END), 0) AS failed \
        FROM dungeon_runs WHERE player_id = ?",
};

const POSTGRES: Statements = Statements {
    schema: &[
        "CREATE TABLE IF NOT EXISTS lobbies (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            players TEXT NOT NULL,
            capacity BIGINT NOT NULL,
            difficulty TEXT NOT NULL,
            seed BIGINT NOT NULL,
            assigned_layout_id TEXT,
            close_reason TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            last_activity_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS dungeon_runs (
            id BIGSERIAL PRIMARY KEY,
            lobby_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            layout_id TEXT,
            difficulty TEXT NOT NULL,
            completed BOOLEAN NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL,
            UNIQUE (lobby_id, player_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_dungeon_runs_player ON dungeon_runs (player_id)",
    ],
    insert: "INSERT INTO lobbies (id, status, players, capacity, difficulty, seed, \
        assigned_layout_id, close_reason, created_at, last_activity_at) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    select: "SELECT id, status, players, capacity, difficulty, seed, assigned_layout_id, \
        close_reason, created_at, last_activity_at FROM lobbies WHERE id = $1",
    upsert: "INSERT INTO lobbies (id, status, players, capacity, difficulty, seed, \
        assigned_layout_id, close_reason, created_at, last_activity_at) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
        ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, players = EXCLUDED.players, \
        capacity = EXCLUDED.capacity, difficulty = EXCLUDED.difficulty, seed = EXCLUDED.seed, \
        assigned_layout_id = EXCLUDED.assigned_layout_id, close_reason = EXCLUDED.close_reason, \
        last_activity_at = EXCLUDED.last_activity_at \
        WHERE lobbies.status <> 'closed'",
    delete: "DELETE FROM lobbies WHERE id = $1",
    list_active: "SELECT id, status, players, capacity, difficulty, seed, assigned_layout_id, \
        close_reason, created_at, last_activity_at FROM lobbies \
        WHERE status <> 'closed' ORDER BY created_at",
    insert_run: "INSERT INTO dungeon_runs (lobby_id, player_id, layout_id, difficulty, \
        completed, recorded_at) VALUES ($1, $2, $3, $4, $5, $6) \
        ON CONFLICT (lobby_id, player_id) DO NOTHING",
    player_stats: "SELECT \
        COALESCE(SUM(CASE WHEN completed THEN 1 ELSE 0 END), 0) AS completed, \
        COALESCE(SUM(CASE WHEN completed THEN 0 ELSE 1 END), 0) AS failed \
        FROM dungeon_runs WHERE player_id = $1",
};

/// Implements [`LobbyRepository`] for a pool-backed store. The statement set
/// supplies the backend's SQL dialect.
macro_rules! sql_lobby_repository {
    ($repo:ident, $statements:ident, $backend:literal) => {
        #[async_trait]
        impl LobbyRepository for $repo {
            #[instrument(skip(self, lobby), fields(lobby_id = %lobby.id, backend = $backend))]
            async fn create_lobby(&self, lobby: &Lobby) -> Result<(), AppError> {
                let record = LobbyRecord::from_lobby(lobby)?;
                sqlx::query($statements.insert)
                    .bind(&record.id)
                    .bind(&record.status)
                    .bind(&record.players)
                    .bind(record.capacity)
                    .bind(&record.difficulty)
                    .bind(record.seed)
                    .bind(&record.assigned_layout_id)
                    .bind(&record.close_reason)
                    .bind(record.created_at)
                    .bind(record.last_activity_at)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| insert_error(lobby.id, e))?;

                debug!("Lobby created in database");
                Ok(())
            }

            #[instrument(skip(self), fields(backend = $backend))]
            async fn get_lobby(&self, lobby_id: LobbyId) -> Result<Option<Lobby>, AppError> {
                let record: Option<LobbyRecord> = sqlx::query_as($statements.select)
                    .bind(lobby_id.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_error)?;

                record.map(Lobby::try_from).transpose()
            }

            #[instrument(
                skip(self, lobby),
                fields(lobby_id = %lobby.id, status = %lobby.status, backend = $backend)
            )]
            async fn save_lobby(&self, lobby: &Lobby) -> Result<(), AppError> {
                let record = LobbyRecord::from_lobby(lobby)?;
                let result = sqlx::query($statements.upsert)
                    .bind(&record.id)
                    .bind(&record.status)
                    .bind(&record.players)
                    .bind(record.capacity)
                    .bind(&record.difficulty)
                    .bind(record.seed)
                    .bind(&record.assigned_layout_id)
                    .bind(&record.close_reason)
                    .bind(record.created_at)
                    .bind(record.last_activity_at)
                    .execute(&self.pool)
                    .await
                    .map_err(store_error)?;

                if result.rows_affected() == 0 {
                    // The stored row is closed; only an identical replay is accepted
                    return match self.get_lobby(lobby.id).await? {
                        Some(existing) if existing == *lobby => Ok(()),
                        _ => {
                            warn!("Refusing to modify a closed lobby");
                            Err(closed_record_error())
                        }
                    };
                }

                debug!("Lobby saved in database");
                Ok(())
            }

            #[instrument(skip(self), fields(backend = $backend))]
            async fn delete_lobby(&self, lobby_id: LobbyId) -> Result<(), AppError> {
                let result = sqlx::query($statements.delete)
                    .bind(lobby_id.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(store_error)?;

                if result.rows_affected() == 0 {
                    return Err(AppError::NotFound(format!("Lobby {} not found", lobby_id)));
                }
                info!(lobby_id = %lobby_id, "Lobby deleted from database");
                Ok(())
            }

            #[instrument(skip(self), fields(backend = $backend))]
            async fn list_active(&self) -> Result<Vec<Lobby>, AppError> {
                let records: Vec<LobbyRecord> = sqlx::query_as($statements.list_active)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(store_error)?;

                debug!(count = records.len(), "Listed active lobbies");
                records.into_iter().map(Lobby::try_from).collect()
            }

            #[instrument(skip(self, runs), fields(count = runs.len(), backend = $backend))]
            async fn record_runs(&self, runs: &[DungeonRun]) -> Result<(), AppError> {
                let mut tx = self.pool.begin().await.map_err(store_error)?;
                for run in runs {
                    sqlx::query($statements.insert_run)
                        .bind(run.lobby_id.to_string())
                        .bind(run.player_id.as_str())
                        .bind(run.layout_id.map(|id| id.to_string()))
                        .bind(run.difficulty.to_string())
                        .bind(run.completed)
                        .bind(run.recorded_at)
                        .execute(&mut *tx)
                        .await
                        .map_err(store_error)?;
                }
                tx.commit().await.map_err(store_error)?;

                debug!("Dungeon runs recorded");
                Ok(())
            }

            #[instrument(skip(self), fields(backend = $backend))]
            async fn player_stats(&self, player_id: &PlayerId) -> Result<PlayerStats, AppError> {
                let (completed, failed): (i64, i64) = sqlx::query_as($statements.player_stats)
                    .bind(player_id.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(store_error)?;

                Ok(PlayerStats {
                    player_id: player_id.clone(),
                    completed: completed.max(0) as u64,
                    failed: failed.max(0) as u64,
                })
            }
        }
    };
}

/// An in-memory database lives and dies with its one connection, so that
/// connection is never recycled
fn sqlite_pool_options(url: &str) -> SqlitePoolOptions {
    if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    }
}

pub struct SqliteLobbyRepository {
    pool: SqlitePool,
}

impl SqliteLobbyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `url` and applies the schema
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_error)?
            .create_if_missing(true);
        let pool = sqlite_pool_options(url)
            .connect_with(options)
            .await
            .map_err(store_error)?;

        let repository = Self::new(pool);
        repository.migrate().await?;
        info!(url = %url, "Connected to SQLite lobby store");
        Ok(repository)
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        for statement in SQLITE.schema {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }
}

sql_lobby_repository!(SqliteLobbyRepository, SQLITE, "sqlite");

pub struct PostgresLobbyRepository {
    pool: PgPool,
}

impl PostgresLobbyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(store_error)?;

        let repository = Self::new(pool);
        repository.migrate().await?;
        info!("Connected to PostgreSQL lobby store");
        Ok(repository)
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        for statement in POSTGRES.schema {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }
}

sql_lobby_repository!(PostgresLobbyRepository, POSTGRES, "postgres");
