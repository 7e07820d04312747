//! Merged catalog store with full-text search.
//!
//! `index.db` holds one summary row per book across all crawled sites,
//! projected into a presentation-oriented shape (title link, cover thumbnail,
//! per-format download links), plus an FTS5 shadow table rebuilt after each
//! catalog build.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Store, StoreError, decode_json_column};

/// Hyperlink with display text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Target URL.
    pub href: String,
    /// Display label.
    pub label: String,
}

/// Cover thumbnail reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cover {
    /// Thumbnail URL.
    pub img_src: String,
    /// Display width in pixels.
    pub width: u32,
}

/// One catalog summary row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Book uuid; the catalog-wide key.
    pub uuid: String,
    /// Title as a link to the remote book page.
    pub title: Link,
    /// Cover thumbnail, when the remote advertises one.
    pub cover: Option<Cover>,
    /// Author list.
    pub authors: Vec<String>,
    /// Publication year; empty when unknown.
    pub year: String,
    /// Series name, if any.
    pub series: Option<String>,
    /// ISO 639-2/B language code; empty when unknown.
    pub language: String,
    /// One download link per available format, labeled `FMT (size)`.
    pub links: Vec<Link>,
    /// Publisher name.
    pub publisher: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// External identifiers.
    pub identifiers: BTreeMap<String, String>,
    /// Available format names.
    pub formats: Vec<String>,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    uuid: String,
    title: Option<String>,
    cover: Option<String>,
    authors: Option<String>,
    year: String,
    series: Option<String>,
    language: String,
    links: Option<String>,
    publisher: Option<String>,
    tags: Option<String>,
    identifiers: Option<String>,
    formats: Option<String>,
}

impl TryFrom<SummaryRow> for CatalogEntry {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self> {
        let cover: Option<Cover> = match row.cover.as_deref() {
            None | Some("") => None,
            Some(text) => Some(
                serde_json::from_str(text)
                    .map_err(|source| StoreError::Decode { column: "cover", source })?,
            ),
        };
        Ok(Self {
            uuid: row.uuid,
            title: decode_json_column("title", row.title.as_deref())?,
            cover,
            authors: decode_json_column("authors", row.authors.as_deref())?,
            year: row.year,
            series: row.series,
            language: row.language,
            links: decode_json_column("links", row.links.as_deref())?,
            publisher: row.publisher,
            tags: decode_json_column("tags", row.tags.as_deref())?,
            identifiers: decode_json_column("identifiers", row.identifiers.as_deref())?,
            formats: decode_json_column("formats", row.formats.as_deref())?,
        })
    }
}

fn encode_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Outcome of one batch upsert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Rows newly inserted.
    pub inserted: usize,
    /// Rows replaced with a newer row from the same source site.
    pub refreshed: usize,
    /// Rows that replaced a row from a different source site.
    pub collisions: usize,
}

/// The merged catalog store.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    store: Store,
}

impl CatalogStore {
    /// Opens (creating if missing) the catalog at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on connection or schema failure.
    pub async fn open(path: &Path) -> Result<Self> {
        let store = Store::open(path).await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    /// Opens an in-memory catalog for testing.
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
                site TEXT NOT NULL DEFAULT '',
                title TEXT,
                cover TEXT,
                authors TEXT,
                year TEXT NOT NULL DEFAULT '',
                series TEXT,
                language TEXT NOT NULL DEFAULT '',
                links TEXT,
                publisher TEXT,
                tags TEXT,
                identifiers TEXT,
                formats TEXT
            )",
        )
        .execute(store.pool())
        .await?;

        sqlx::query(
            r"CREATE VIRTUAL TABLE IF NOT EXISTS summary_fts USING fts5 (
                uuid UNINDEXED,
                title,
                authors,
                series,
                language,
                year,
                identifiers,
                tags,
                publisher,
                formats
            )",
        )
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Upserts a batch of entries from one source site in one transaction,
    /// keyed by uuid.
    ///
    /// Re-upserting a site's own rows counts as a refresh; replacing a row
    /// another site contributed counts as a collision, so the builder can
    /// surface genuine cross-site uuid clashes without flagging idempotent
    /// rebuilds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    #[instrument(skip(self, entries), fields(site = source_site, batch = entries.len()))]
    pub async fn upsert_entries(
        &self,
        entries: &[CatalogEntry],
        source_site: &str,
    ) -> Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        let mut tx = self.store.pool().begin().await?;
        for entry in entries {
            let existing: Option<(String,)> =
                sqlx::query_as(r"SELECT site FROM summary WHERE uuid = ?")
                    .bind(&entry.uuid)
                    .fetch_optional(&mut *tx)
                    .await?;
            match existing {
                None => summary.inserted += 1,
                Some((site,)) if site == source_site => summary.refreshed += 1,
                Some(_) => summary.collisions += 1,
            }

            sqlx::query(
                r"INSERT OR REPLACE INTO summary (
                    uuid, site, title, cover, authors, year, series, language,
                    links, publisher, tags, identifiers, formats
                  ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.uuid)
            .bind(source_site)
            .bind(encode_json(&entry.title))
            .bind(entry.cover.as_ref().map(encode_json))
            .bind(encode_json(&entry.authors))
            .bind(&entry.year)
            .bind(&entry.series)
            .bind(&entry.language)
            .bind(encode_json(&entry.links))
            .bind(&entry.publisher)
            .bind(encode_json(&entry.tags))
            .bind(encode_json(&entry.identifiers))
            .bind(encode_json(&entry.formats))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(summary)
    }

    /// Rebuilds the FTS5 shadow table from the summary rows.
    ///
    /// Dropping and refilling keeps the rebuild idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn rebuild_fts(&self) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        sqlx::query(r"DELETE FROM summary_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r"INSERT INTO summary_fts (
                uuid, title, authors, series, language, year,
                identifiers, tags, publisher, formats
              )
              SELECT
                uuid,
                json_extract(title, '$.label'),
                authors, series, language, year,
                identifiers, tags, publisher, formats
              FROM summary",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Runs an FTS5 match over the searchable fields.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r"SELECT * FROM summary
              WHERE uuid IN (SELECT uuid FROM summary_fts WHERE summary_fts MATCH ?)
              ORDER BY uuid",
        )
        .bind(query)
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    /// Fetches one entry by uuid.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn entry(&self, uuid: &str) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query_as::<_, SummaryRow>(r"SELECT * FROM summary WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(CatalogEntry::try_from).transpose()
    }

    /// Fetches every entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub async fn all_entries(&self) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query_as::<_, SummaryRow>(r"SELECT * FROM summary ORDER BY uuid")
            .fetch_all(self.store.pool())
            .await?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    /// Fetches entries whose download links reference `host`, optionally
    /// narrowed by substring filters on authors and title.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    #[instrument(skip(self))]
    pub async fn entries_for_host(
        &self,
        host: &str,
        author_filter: Option<&str>,
        title_filter: Option<&str>,
    ) -> Result<Vec<CatalogEntry>> {
        let author = author_filter.map_or_else(|| "%".to_string(), |f| format!("%{f}%"));
        let title = title_filter.map_or_else(|| "%".to_string(), |f| format!("%{f}%"));
        let rows = sqlx::query_as::<_, SummaryRow>(
            r"SELECT * FROM summary
              WHERE links LIKE ?
                AND authors LIKE ?
                AND json_extract(title, '$.label') LIKE ?
              ORDER BY uuid",
        )
        .bind(format!("%{host}%"))
        .bind(author)
        .bind(title)
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    /// Counts catalog entries.
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

    /// Writes every entry to `out` as concatenated JSON objects, one per
    /// line, with no surrounding array brackets.
    ///
    /// Returns the number of objects written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query/decode failure, or
    /// [`StoreError::Export`] on a write failure.
    #[instrument(skip(self, out))]
    pub async fn export_json<W: Write>(&self, out: &mut W) -> Result<usize> {
        let entries = self.all_entries().await?;
        let mut written = 0;
        for entry in &entries {
            let line =
                serde_json::to_string(entry).map_err(|source| StoreError::Decode {
                    column: "summary",
                    source,
                })?;
            out.write_all(line.as_bytes()).map_err(StoreError::Export)?;
            out.write_all(b"\n").map_err(StoreError::Export)?;
            written += 1;
        }
        Ok(written)
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

    fn entry(uuid: &str, title: &str, author: &str) -> CatalogEntry {
        CatalogEntry {
            uuid: uuid.to_string(),
            title: Link {
                href: format!("http://10.0.0.1:8080#book_id={uuid}"),
                label: title.to_string(),
            },
            authors: vec![author.to_string()],
            year: "1967".to_string(),
            language: "eng".to_string(),
            links: vec![Link {
                href: format!("http://10.0.0.1:8080/get/EPUB/{uuid}/main"),
                label: "EPUB (512.0 kB)".to_string(),
            }],
            formats: vec!["EPUB".to_string()],
            ..CatalogEntry::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_refreshes_same_site_rows() {
        let catalog = CatalogStore::open_in_memory().await.unwrap();
        let first = catalog
            .upsert_entries(&[entry("u1", "One", "A"), entry("u2", "Two", "B")], "site-a")
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.refreshed, 0);
        assert_eq!(first.collisions, 0);

        let second = catalog
            .upsert_entries(&[entry("u1", "One Again", "A")], "site-a")
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.refreshed, 1);
        assert_eq!(second.collisions, 0);
        assert_eq!(catalog.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_reports_cross_site_collisions() {
        let catalog = CatalogStore::open_in_memory().await.unwrap();
        catalog
            .upsert_entries(&[entry("u1", "One", "A")], "site-a")
            .await
            .unwrap();

        let clash = catalog
            .upsert_entries(&[entry("u1", "One Elsewhere", "A")], "site-b")
            .await
            .unwrap();
        assert_eq!(clash.inserted, 0);
        assert_eq!(clash.refreshed, 0);
        assert_eq!(clash.collisions, 1);
        assert_eq!(catalog.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_matches_title_after_fts_rebuild() {
        let catalog = CatalogStore::open_in_memory().await.unwrap();
        catalog
            .upsert_entries(
                &[
                    entry("u1", "The Master and Margarita", "Bulgakov"),
                    entry("u2", "War and Peace", "Tolstoy"),
                ],
                "site-a",
            )
            .await
            .unwrap();
        catalog.rebuild_fts().await.unwrap();

        let hits = catalog.search("margarita").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uuid, "u1");

        let hits = catalog.search("tolstoy").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uuid, "u2");
    }

    #[tokio::test]
    async fn test_fts_rebuild_is_idempotent() {
        let catalog = CatalogStore::open_in_memory().await.unwrap();
        catalog
            .upsert_entries(&[entry("u1", "Solaris", "Lem")], "site-a")
            .await
            .unwrap();
        catalog.rebuild_fts().await.unwrap();
        catalog.rebuild_fts().await.unwrap();

        let hits = catalog.search("solaris").await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_for_host_applies_filters() {
        let catalog = CatalogStore::open_in_memory().await.unwrap();
        let mut other = entry("u2", "War and Peace", "Tolstoy");
        other.links[0].href = "http://10.9.9.9:8080/get/EPUB/u2/main".to_string();
        catalog
            .upsert_entries(&[entry("u1", "Solaris", "Lem"), other], "site-a")
            .await
            .unwrap();

        let hits = catalog
            .entries_for_host("10.0.0.1", None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uuid, "u1");

        let hits = catalog
            .entries_for_host("10.0.0.1", Some("Tolstoy"), None)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = catalog
            .entries_for_host("10.0.0.1", None, Some("Solaris"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_export_json_emits_concatenated_objects() {
        let catalog = CatalogStore::open_in_memory().await.unwrap();
        catalog
            .upsert_entries(&[entry("u1", "Solaris", "Lem"), entry("u2", "Fiasco", "Lem")], "site-a")
            .await
            .unwrap();

        let mut out = Vec::new();
        let written = catalog.export_json(&mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        assert!(!text.starts_with('['));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("uuid").is_some());
            assert!(value["title"].get("href").is_some());
        }
    }
}
