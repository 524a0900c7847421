// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable origin identities and replay positions.
//!
//! An origin maps a remote identity tuple (node id, timeline, database id,
//! origin name) to a small local numeric id, created at most once per tuple.
//! Each origin carries the last acknowledged stream position so replay can
//! resume exactly where it left off after a restart.
//!
//! # Storage
//!
//! Origins and positions live in SQLite. Positions are loaded into an
//! in-memory cache once at startup (the start position a worker resumes
//! from) and written through on every acknowledgment. A worker acknowledges
//! at most once per drain pass, so there is no write pressure worth
//! debouncing.
//!
//! # Durability
//!
//! Origin creation is forced onto stable storage (WAL checkpoint) before the
//! caller asks the remote side for a slot: a remote slot must never exist
//! without its local origin surviving a crash. Position updates follow the
//! configured [`CommitDurability`] level; losing the tail of position
//! updates only means re-applying already-replayed changes after a restart.

use crate::config::{CommitDurability, PositionStoreConfig};
use crate::error::{ApplyError, Result};
use crate::protocol::{StreamPosition, INVALID_POSITION};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identity tuple naming one remote change source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginIdentity {
    /// Remote node identifier.
    pub remote_node_id: u64,
    /// Remote timeline identifier.
    pub remote_timeline: u32,
    /// Remote database identifier.
    pub remote_database_id: u32,
    /// Origin name; empty for the default stream.
    pub origin_name: String,
}

/// Local numeric identifier assigned to an origin, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId(pub u32);

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interface for origin identity and position tracking.
///
/// The negotiator uses `lookup`/`create`/`delete` during identity
/// acquisition; the run loop uses `start_position` once at startup and
/// `set_position` after each acknowledged advance.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Find the origin id for an identity tuple, if one was ever created.
    async fn lookup(&self, identity: &OriginIdentity) -> Result<Option<OriginId>>;

    /// Create a new origin for an identity tuple, durably.
    ///
    /// Fails if the tuple already has an origin.
    async fn create(&self, identity: &OriginIdentity) -> Result<OriginId>;

    /// Remove an origin and its position.
    ///
    /// Used as the compensating step when remote slot initialization fails
    /// after a local create.
    async fn delete(&self, origin: OriginId) -> Result<()>;

    /// The position replay should resume from; [`INVALID_POSITION`] if the
    /// origin has never acknowledged anything.
    async fn start_position(&self, origin: OriginId) -> Result<StreamPosition>;

    /// Record the last acknowledged position for an origin.
    async fn set_position(&self, origin: OriginId, position: StreamPosition) -> Result<()>;
}

/// Persistent origin/position storage backed by SQLite.
pub struct SqlitePositionStore {
    pool: SqlitePool,
    /// Position cache, loaded once at startup.
    cache: RwLock<HashMap<OriginId, StreamPosition>>,
    path: String,
}

impl SqlitePositionStore {
    /// Open (or create) the store at the configured path.
    pub async fn new(config: &PositionStoreConfig, durability: CommitDurability) -> Result<Self> {
        info!(path = %config.sqlite_path, "initializing position store");

        let options = if config.sqlite_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
        }
        .map_err(|e| ApplyError::Config(format!("invalid SQLite path: {}", e)))?;

        let options = options
            .journal_mode(if config.wal_mode {
                sqlx::sqlite::SqliteJournalMode::Wal
            } else {
                sqlx::sqlite::SqliteJournalMode::Delete
            })
            .synchronous(match durability {
                CommitDurability::Durable => sqlx::sqlite::SqliteSynchronous::Full,
                CommitDurability::Relaxed => sqlx::sqlite::SqliteSynchronous::Normal,
            });

        // A single connection that is never recycled: memory databases are
        // per-connection, and the store sees at most one writer per worker
        // anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS origins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_node_id INTEGER NOT NULL,
                remote_timeline INTEGER NOT NULL,
                remote_database_id INTEGER NOT NULL,
                origin_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(remote_node_id, remote_timeline, remote_database_id, origin_name)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                origin_id INTEGER PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Read the origin-to-position mapping once; workers resume from this.
        let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT origin_id, position FROM positions")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (origin_id, position) in rows {
            debug!(origin = origin_id, position, "loaded position from disk");
            cache.insert(OriginId(origin_id as u32), position as StreamPosition);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "restored positions from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path: config.sqlite_path.clone(),
        })
    }

    /// Open an in-memory store (for testing/standalone mode).
    pub async fn in_memory() -> Result<Self> {
        Self::new(&PositionStoreConfig::in_memory(), CommitDurability::Relaxed).await
    }

    /// Get the database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force the WAL onto the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            tracing::warn!(error = %e, "failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("position store closed");
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn lookup(&self, identity: &OriginIdentity) -> Result<Option<OriginId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM origins
            WHERE remote_node_id = ? AND remote_timeline = ?
              AND remote_database_id = ? AND origin_name = ?
            "#,
        )
        .bind(identity.remote_node_id as i64)
        .bind(identity.remote_timeline as i64)
        .bind(identity.remote_database_id as i64)
        .bind(&identity.origin_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| OriginId(id as u32)))
    }

    async fn create(&self, identity: &OriginIdentity) -> Result<OriginId> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO origins
                (remote_node_id, remote_timeline, remote_database_id, origin_name, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(identity.remote_node_id as i64)
        .bind(identity.remote_timeline as i64)
        .bind(identity.remote_database_id as i64)
        .bind(&identity.origin_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let origin = OriginId(result.last_insert_rowid() as u32);

        // The new identity must be on stable storage before the caller asks
        // the remote side for a slot.
        self.checkpoint().await?;

        info!(origin = %origin, remote_node_id = identity.remote_node_id, "created origin");
        Ok(origin)
    }

    async fn delete(&self, origin: OriginId) -> Result<()> {
        sqlx::query("DELETE FROM positions WHERE origin_id = ?")
            .bind(origin.0 as i64)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM origins WHERE id = ?")
            .bind(origin.0 as i64)
            .execute(&self.pool)
            .await?;
        self.cache.write().await.remove(&origin);
        info!(origin = %origin, "deleted origin");
        Ok(())
    }

    async fn start_position(&self, origin: OriginId) -> Result<StreamPosition> {
        Ok(self
            .cache
            .read()
            .await
            .get(&origin)
            .copied()
            .unwrap_or(INVALID_POSITION))
    }

    async fn set_position(&self, origin: OriginId, position: StreamPosition) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO positions (origin_id, position, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(origin_id) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(origin.0 as i64)
        .bind(position as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.cache.write().await.insert(origin, position);
        debug!(origin = %origin, position, "position recorded");
        Ok(())
    }
}
