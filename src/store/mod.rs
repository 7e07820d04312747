//! SQLite store management.
//!
//! Every persistent artifact is one SQLite file: the shared `sites` registry,
//! one store per crawled site (`<site-uuid>.db`), the merged catalog
//! (`index.db`), and the diff output (`diff.db`). This module provides the
//! common connection wrapper with:
//! - Connection pool management
//! - WAL mode so a reader can coexist with a build in progress
//! - Busy timeout to ride out short lock contention
//!
//! Schemas are created idempotently at open time by each store type; store
//! files are minted at runtime paths, so there is no compile-time migration
//! set.

pub mod catalog;
pub mod diff;
pub mod registry;
pub mod site;

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Maximum pool connections. Kept low for SQLite file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Store-related errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open or query a store.
    #[error("store error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted column held a value that could not be decoded.
    #[error("corrupt column {column}: {source}")]
    Decode {
        /// Column that failed to decode.
        column: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Writing an export stream failed.
    #[error("export write failed: {0}")]
    Export(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// SQLite connection wrapper shared by all store types.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the store file at `path`.
    ///
    /// Enables WAL mode and a busy timeout so a concurrent reader can
    /// coexist with a writer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory store for testing.
    ///
    /// WAL mode is skipped; it provides no benefit without a file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes all connections.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Decodes a JSON-encoded TEXT column, treating NULL/empty as the default.
pub(crate) fn decode_json_column<T>(column: &'static str, raw: Option<&str>) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match raw {
        None | Some("") => Ok(T::default()),
        Some(text) => {
            serde_json::from_str(text).map_err(|source| StoreError::Decode { column, source })
        }
    }
}
