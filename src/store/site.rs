//! Per-site book store.
//!
//! Each crawled server gets its own `<site-uuid>.db` holding the site's
//! identity, its libraries with per-library count deltas, and one row per
//! book. Text columns carrying lists or maps are JSON-encoded and decoded at
//! the storage boundary into typed records.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, decode_json_column};

/// Site identity row of a per-site store.
#[derive(Debug, Clone)]
pub struct SiteMeta {
    /// Registry uuid of the site this store belongs to.
    pub uuid: String,
    /// Base URLs the site has been crawled under.
    pub urls: Vec<String>,
    /// Raw server version header, when the server disclosed one.
    pub version: Option<String>,
    /// Major server version parsed from the header; 0 when unknown.
    pub major: i64,
}

/// Per-library book counts with the delta from the previous crawl.
#[derive(Debug, Clone, FromRow)]
pub struct LibraryCounts {
    /// Remote library identifier.
    pub name: String,
    /// Count reported by the latest crawl.
    pub book_count: i64,
    /// Count reported by the previous crawl.
    pub last_book_count: i64,
    /// `max(0, book_count - last_book_count)`.
    pub new_books: i64,
}

/// One normalized book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    /// Book uuid as reported by the remote server.
    pub uuid: String,
    /// Numeric id within the remote library.
    pub id: i64,
    /// Remote library identifier the book belongs to.
    pub library: String,
    /// Transliterated title.
    pub title: String,
    /// Transliterated author list.
    pub authors: Vec<String>,
    /// Transliterated series name, if any.
    pub series: Option<String>,
    /// Position within the series.
    pub series_index: Option<f64>,
    /// ISO 639-2/B language code; empty when unknown.
    pub language: String,
    /// Free-text description.
    pub description: Option<String>,
    /// External identifiers (isbn, goodreads, ...).
    pub identifiers: BTreeMap<String, String>,
    /// Transliterated tags.
    pub tags: Vec<String>,
    /// Publisher name.
    pub publisher: Option<String>,
    /// Publication date as reported.
    pub pubdate: Option<String>,
    /// Remote last-modified timestamp.
    pub last_modified: Option<String>,
    /// Remote ingestion timestamp.
    pub timestamp: Option<String>,
    /// Available format names, uppercased.
    pub formats: Vec<String>,
    /// Format name to byte size, where the server disclosed sizes.
    pub sizes: BTreeMap<String, i64>,
    /// Whether the server advertises a cover image.
    pub cover: bool,
}

/// Raw row shape; JSON columns decode into [`BookRecord`].
#[derive(Debug, FromRow)]
struct BookRow {
    uuid: String,
    id: i64,
    library: String,
    title: String,
    authors: Option<String>,
    series: Option<String>,
    series_index: Option<f64>,
    language: String,
    description: Option<String>,
    identifiers: Option<String>,
    tags: Option<String>,
    publisher: Option<String>,
    pubdate: Option<String>,
    last_modified: Option<String>,
    timestamp: Option<String>,
    formats: Option<String>,
    sizes: Option<String>,
    cover: i64,
}

impl TryFrom<BookRow> for BookRecord {
    type Error = super::StoreError;

    fn try_from(row: BookRow) -> Result<Self> {
        Ok(Self {
            uuid: row.uuid,
            id: row.id,
            library: row.library,
            title: row.title,
            authors: decode_json_column("authors", row.authors.as_deref())?,
            series: row.series,
            series_index: row.series_index,
            language: row.language,
            description: row.description,
            identifiers: decode_json_column("identifiers", row.identifiers.as_deref())?,
            tags: decode_json_column("tags", row.tags.as_deref())?,
            publisher: row.publisher,
            pubdate: row.pubdate,
            last_modified: row.last_modified,
            timestamp: row.timestamp,
            formats: decode_json_column("formats", row.formats.as_deref())?,
            sizes: decode_json_column("sizes", row.sizes.as_deref())?,
            cover: row.cover != 0,
        })
    }
}

fn encode_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// One per-site store file.
#[derive(Debug, Clone)]
pub struct SiteStore {
    store: Store,
}

impl SiteStore {
    /// Opens (creating if missing) the per-site store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on connection or schema
    /// failure.
    pub async fn open(path: &Path) -> Result<Self> {
        let store = Store::open(path).await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    /// Opens an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on connection or schema
    /// failure.
    pub async fn open_in_memory() -> Result<Self> {
        let store = Store::open_in_memory().await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    async fn init_schema(store: &Store) -> Result<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS site (
                uuid TEXT PRIMARY KEY,
                urls TEXT NOT NULL DEFAULT '[]',
                version TEXT,
                major INTEGER NOT NULL DEFAULT 0,
                schema_version INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(store.pool())
        .await?;

        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS libraries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                book_count INTEGER NOT NULL DEFAULT 0,
                last_book_count INTEGER NOT NULL DEFAULT 0,
                new_books INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(store.pool())
        .await?;

        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS ebooks (
                uuid TEXT PRIMARY KEY,
                id INTEGER NOT NULL,
                library TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                authors TEXT,
                series TEXT,
                series_index REAL,
                language TEXT NOT NULL DEFAULT '',
                description TEXT,
                identifiers TEXT,
                tags TEXT,
                publisher TEXT,
                pubdate TEXT,
                last_modified TEXT,
                timestamp TEXT,
                formats TEXT,
                sizes TEXT,
                cover INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Records the site identity, appending `url` to the known URL list if
    /// it is not already present.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] on query or decode failure.
    #[instrument(skip(self))]
    pub async fn ensure_site(&self, uuid: &str, url: &str) -> Result<()> {
        sqlx::query(r"INSERT OR IGNORE INTO site (uuid, urls) VALUES (?, '[]')")
            .bind(uuid)
            .execute(self.store.pool())
            .await?;

        let row: Option<(Option<String>,)> =
            sqlx::query_as(r"SELECT urls FROM site WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(self.store.pool())
                .await?;
        let mut urls: Vec<String> =
            decode_json_column("urls", row.and_then(|(urls,)| urls).as_deref())?;
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
            sqlx::query(r"UPDATE site SET urls = ? WHERE uuid = ?")
                .bind(encode_json(&urls))
                .bind(uuid)
                .execute(self.store.pool())
                .await?;
        }
        Ok(())
    }

    /// Stores the server version header and its parsed major version.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn set_server_version(&self, version: &str, major: i64) -> Result<()> {
        sqlx::query(r"UPDATE site SET version = ?, major = ?")
            .bind(version)
            .bind(major)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Reads the site identity row, if the store has been initialized.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] on query or decode failure.
    pub async fn meta(&self) -> Result<Option<SiteMeta>> {
        let row: Option<(String, Option<String>, Option<String>, i64)> =
            sqlx::query_as(r"SELECT uuid, urls, version, major FROM site LIMIT 1")
                .fetch_optional(self.store.pool())
                .await?;
        match row {
            None => Ok(None),
            Some((uuid, urls, version, major)) => Ok(Some(SiteMeta {
                uuid,
                urls: decode_json_column("urls", urls.as_deref())?,
                version,
                major,
            })),
        }
    }

    /// Records the reported count for one library, shifting the previous
    /// count and computing the non-negative delta.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn upsert_library(&self, name: &str, book_count: i64) -> Result<()> {
        sqlx::query(
            r"INSERT INTO libraries (name, book_count, last_book_count, new_books)
              VALUES (?, ?, 0, ?)
              ON CONFLICT(name) DO UPDATE SET
                last_book_count = libraries.book_count,
                new_books = MAX(0, excluded.book_count - libraries.book_count),
                book_count = excluded.book_count",
        )
        .bind(name)
        .bind(book_count)
        .bind(book_count)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Lists the per-library counts.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn libraries(&self) -> Result<Vec<LibraryCounts>> {
        let rows = sqlx::query_as::<_, LibraryCounts>(
            r"SELECT name, book_count, last_book_count, new_books
              FROM libraries ORDER BY name",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    /// Upserts a batch of books in one transaction, keyed by uuid.
    ///
    /// Re-crawling the same books replaces their rows in place.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self, books), fields(batch = books.len()))]
    pub async fn upsert_books(&self, books: &[BookRecord]) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        for book in books {
            sqlx::query(
                r"INSERT OR REPLACE INTO ebooks (
                    uuid, id, library, title, authors, series, series_index,
                    language, description, identifiers, tags, publisher,
                    pubdate, last_modified, timestamp, formats, sizes, cover
                  ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&book.uuid)
            .bind(book.id)
            .bind(&book.library)
            .bind(&book.title)
            .bind(encode_json(&book.authors))
            .bind(&book.series)
            .bind(book.series_index)
            .bind(&book.language)
            .bind(&book.description)
            .bind(encode_json(&book.identifiers))
            .bind(encode_json(&book.tags))
            .bind(&book.publisher)
            .bind(&book.pubdate)
            .bind(&book.last_modified)
            .bind(&book.timestamp)
            .bind(encode_json(&book.formats))
            .bind(encode_json(&book.sizes))
            .bind(i64::from(book.cover))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Counts stored books.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn book_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(r"SELECT COUNT(*) FROM ebooks")
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }

    /// Fetches every stored book.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError`] on query or decode failure.
    pub async fn all_books(&self) -> Result<Vec<BookRecord>> {
        let rows = sqlx::query_as::<_, BookRow>(r"SELECT * FROM ebooks ORDER BY uuid")
            .fetch_all(self.store.pool())
            .await?;
        rows.into_iter().map(BookRecord::try_from).collect()
    }

    /// Closes the underlying store.
    pub async fn close(self) {
        self.store.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_book(uuid: &str) -> BookRecord {
        BookRecord {
            uuid: uuid.to_string(),
            id: 7,
            library: "main".to_string(),
            title: "The Master and Margarita".to_string(),
            authors: vec!["Mikhail Bulgakov".to_string()],
            language: "eng".to_string(),
            formats: vec!["EPUB".to_string(), "PDF".to_string()],
            sizes: BTreeMap::from([("EPUB".to_string(), 512_000), ("PDF".to_string(), 1_048_576)]),
            cover: true,
            ..BookRecord::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_site_accumulates_urls() {
        let store = SiteStore::open_in_memory().await.unwrap();
        store.ensure_site("abc", "http://10.0.0.1:8080").await.unwrap();
        store.ensure_site("abc", "http://10.0.0.1:8080").await.unwrap();
        store.ensure_site("abc", "https://10.0.0.1:8443").await.unwrap();

        let meta = store.meta().await.unwrap().unwrap();
        assert_eq!(meta.uuid, "abc");
        assert_eq!(
            meta.urls,
            vec![
                "http://10.0.0.1:8080".to_string(),
                "https://10.0.0.1:8443".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_set_server_version_roundtrips() {
        let store = SiteStore::open_in_memory().await.unwrap();
        store.ensure_site("abc", "http://10.0.0.1:8080").await.unwrap();
        store.set_server_version("calibre/3.39.1", 3).await.unwrap();

        let meta = store.meta().await.unwrap().unwrap();
        assert_eq!(meta.version.as_deref(), Some("calibre/3.39.1"));
        assert_eq!(meta.major, 3);
    }

    #[tokio::test]
    async fn test_upsert_books_replaces_by_uuid() {
        let store = SiteStore::open_in_memory().await.unwrap();
        store.upsert_books(&[sample_book("u1")]).await.unwrap();

        let mut updated = sample_book("u1");
        updated.title = "Revised Title".to_string();
        store.upsert_books(&[updated, sample_book("u2")]).await.unwrap();

        assert_eq!(store.book_count().await.unwrap(), 2);
        let books = store.all_books().await.unwrap();
        assert_eq!(books[0].title, "Revised Title");
        assert_eq!(books[0].sizes.get("EPUB"), Some(&512_000));
        assert!(books[0].cover);
    }

    #[tokio::test]
    async fn test_upsert_library_tracks_delta() {
        let store = SiteStore::open_in_memory().await.unwrap();
        store.upsert_library("main", 100).await.unwrap();
        store.upsert_library("main", 120).await.unwrap();

        let libs = store.libraries().await.unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].book_count, 120);
        assert_eq!(libs[0].last_book_count, 100);
        assert_eq!(libs[0].new_books, 20);
    }

    #[tokio::test]
    async fn test_all_books_decodes_json_columns() {
        let store = SiteStore::open_in_memory().await.unwrap();
        store.upsert_books(&[sample_book("u1")]).await.unwrap();

        let books = store.all_books().await.unwrap();
        assert_eq!(books[0].authors, vec!["Mikhail Bulgakov".to_string()]);
        assert_eq!(
            books[0].formats,
            vec!["EPUB".to_string(), "PDF".to_string()]
        );
    }
}
