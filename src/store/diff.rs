//! Diff output store.
//!
//! `diff.db` records what changed between two catalog snapshots: books that
//! moved to a different location and books that are new to the fleet. Rows
//! mirror the catalog summary shape plus a change status and, for moved
//! books, the previous location.

use std::fmt;
use std::path::Path;

use sqlx::FromRow;
use tracing::instrument;

use super::catalog::CatalogEntry;
use super::{Result, Store, StoreError, decode_json_column};

/// How an entry changed between snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    /// Present in both snapshots, but the title link moved.
    Moved,
    /// Present only in the newer snapshot.
    New,
}

impl DiffStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Moved => "MOVED",
            Self::New => "NEW",
        }
    }
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DiffStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "MOVED" => Ok(Self::Moved),
            "NEW" => Ok(Self::New),
            _ => Err(format!("invalid diff status: {s}")),
        }
    }
}

/// One changed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRecord {
    /// The entry as it appears in the newer snapshot.
    pub entry: CatalogEntry,
    /// The kind of change.
    pub status: DiffStatus,
    /// Title href from the older snapshot; set only for moved entries.
    pub old_location: Option<String>,
}

#[derive(Debug, FromRow)]
struct DiffRow {
    uuid: String,
    title: Option<String>,
    authors: Option<String>,
    year: String,
    series: Option<String>,
    language: String,
    links: Option<String>,
    publisher: Option<String>,
    tags: Option<String>,
    identifiers: Option<String>,
    formats: Option<String>,
    status: String,
    old_location: Option<String>,
}

impl TryFrom<DiffRow> for DiffRecord {
    type Error = StoreError;

    fn try_from(row: DiffRow) -> Result<Self> {
        let entry = CatalogEntry {
            uuid: row.uuid,
            title: decode_json_column("title", row.title.as_deref())?,
            cover: None,
            authors: decode_json_column("authors", row.authors.as_deref())?,
            year: row.year,
            series: row.series,
            language: row.language,
            links: decode_json_column("links", row.links.as_deref())?,
            publisher: row.publisher,
            tags: decode_json_column("tags", row.tags.as_deref())?,
            identifiers: decode_json_column("identifiers", row.identifiers.as_deref())?,
            formats: decode_json_column("formats", row.formats.as_deref())?,
        };
        let status = row
            .status
            .parse()
            .map_err(|_| StoreError::Decode {
                column: "status",
                source: serde::de::Error::custom("unrecognized diff status"),
            })?;
        Ok(Self {
            entry,
            status,
            old_location: row.old_location,
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// The diff output store.
#[derive(Debug, Clone)]
pub struct DiffStore {
    store: Store,
}

impl DiffStore {
    /// Opens (creating if missing) the diff store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on connection or schema failure.
    pub async fn open(path: &Path) -> Result<Self> {
        let store = Store::open(path).await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    /// Opens an in-memory diff store for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on connection or schema failure.
    pub async fn open_in_memory() -> Result<Self> {
        let store = Store::open_in_memory().await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    async fn init_schema(store: &Store) -> Result<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS summary (
                uuid TEXT PRIMARY KEY,
                title TEXT,
                authors TEXT,
                year TEXT NOT NULL DEFAULT '',
                series TEXT,
                language TEXT NOT NULL DEFAULT '',
                links TEXT,
                publisher TEXT,
                tags TEXT,
                identifiers TEXT,
                formats TEXT,
                status TEXT NOT NULL,
                old_location TEXT
            )",
        )
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Inserts a batch of change records in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    #[instrument(skip(self, records), fields(batch = records.len()))]
    pub async fn insert_records(&self, records: &[DiffRecord]) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        for record in records {
            let entry = &record.entry;
            sqlx::query(
                r"INSERT OR REPLACE INTO summary (
                    uuid, title, authors, year, series, language, links,
                    publisher, tags, identifiers, formats, status, old_location
                  ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.uuid)
            .bind(encode_json(&entry.title))
            .bind(encode_json(&entry.authors))
            .bind(&entry.year)
            .bind(&entry.series)
            .bind(&entry.language)
            .bind(encode_json(&entry.links))
            .bind(&entry.publisher)
            .bind(encode_json(&entry.tags))
            .bind(encode_json(&entry.identifiers))
            .bind(encode_json(&entry.formats))
            .bind(record.status.as_str())
            .bind(&record.old_location)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetches every change record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn all_records(&self) -> Result<Vec<DiffRecord>> {
        let rows = sqlx::query_as::<_, DiffRow>(r"SELECT * FROM summary ORDER BY uuid")
            .fetch_all(self.store.pool())
            .await?;
        rows.into_iter().map(DiffRecord::try_from).collect()
    }

    /// Counts change records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(r"SELECT COUNT(*) FROM summary")
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }

    /// Closes the underlying store.
    pub async fn close(self) {
        self.store.close().await;
    }
}
