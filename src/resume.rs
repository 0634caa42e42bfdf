// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resume-token persistence.
//!
//! Opt-in: with `SYNC_RESUME_DB` set, each sync direction's last applied
//! change stream position is kept in SQLite, and a restarted worker resumes
//! from it instead of from "now". Without it, the reconciliation job is the
//! only thing that covers changes made while the engine was down.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache and marks the direction dirty
//! - `flush_dirty()` writes every dirty token in one pass
//! - The coordinator flushes on an interval and again on stop
//!
//! A crash between `set()` and the next flush replays at most one flush
//! interval of events on restart. Replayed events hit the "already current"
//! and insert-if-absent checks, so they are harmless.
//!
//! ```text
//! event applied ──► set(direction, token) ──(every few seconds)──► SQLite
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY / SQLITE_LOCKED are retried with capped exponential backoff.
//! The cache is always updated first, so a failed disk write only delays
//! persistence until the next flush.

use crate::coordinator::Direction;
use crate::error::{Result, SyncError};
use crate::feed::ResumeToken;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::resume_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Last applied stream position per sync direction, backed by SQLite.
pub struct ResumeTokenStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<Direction, ResumeToken>>,
    dirty: RwLock<HashSet<Direction>>,
    path: String,
}

impl ResumeTokenStore {
    /// Open (or create) the store and load existing tokens.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening resume token store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resume_tokens (
                direction TEXT PRIMARY KEY,
                token BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT direction, token FROM resume_tokens")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (label, token) in rows {
            match Direction::from_label(&label) {
                Some(direction) => {
                    cache.insert(direction, ResumeToken::from_bytes(token));
                }
                None => warn!(direction = %label, "Ignoring resume token for unknown direction"),
            }
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored resume tokens from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            dirty: RwLock::new(HashSet::new()),
            path: path_str,
        })
    }

    pub async fn get(&self, direction: Direction) -> Option<ResumeToken> {
        self.cache.read().await.get(&direction).cloned()
    }

    /// Record a new position (debounced; see `flush_dirty`).
    pub async fn set(&self, direction: Direction, token: ResumeToken) {
        self.cache.write().await.insert(direction, token);
        self.dirty.write().await.insert(direction);
    }

    /// Forget a direction's position, on disk too.
    ///
    /// Used when the server rejects the stored token.
    pub async fn clear(&self, direction: Direction) -> Result<()> {
        self.cache.write().await.remove(&direction);
        self.dirty.write().await.remove(&direction);

        let pool = &self.pool;
        let label = direction.label();
        execute_with_retry("resume_clear", || async {
            sqlx::query("DELETE FROM resume_tokens WHERE direction = ?")
                .bind(label)
                .execute(pool)
                .await
        })
        .await?;

        info!(direction = label, "Cleared resume token");
        Ok(())
    }

    /// Persist every dirty token. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<Direction> = self.dirty.write().await.drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(Direction, Vec<u8>)> = {
            let cache = self.cache.read().await;
            dirty
                .iter()
                .filter_map(|d| cache.get(d).map(|t| (*d, t.as_bytes().to_vec())))
                .collect()
        };

        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for (direction, token) in snapshot {
            let label = direction.label();
            let result = execute_with_retry("resume_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO resume_tokens (direction, token, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(direction) DO UPDATE SET
                        token = excluded.token,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(label)
                .bind(&token)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(direction = label, error = %e, "Failed to flush resume token");
                    self.dirty.write().await.insert(direction);
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed resume tokens");
            crate::metrics::record_resume_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(SyncError::Internal(format!(
                "Failed to flush {} resume tokens",
                errors
            )));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fold the WAL into the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("resume_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => info!(count, "Flushed resume tokens on close"),
                Err(e) => warn!(error = %e, "Failed to flush resume tokens on close"),
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Resume token store closed");
    }
}
