//! Registry of known e-book servers.
//!
//! One shared `sites.db` file holds a row per discovered server: canonical
//! URL, health status, book/library counts, failure counters, and the active
//! flag controlling whether the site participates in crawling and scraping.
//! URL is unique per site; candidate URLs deduplicate by hostname.
//!
//! The registry enforces the eviction policy: a site whose `failed_attempts`
//! reaches the configured threshold is deleted rather than retried further.

use std::fmt;

use sqlx::FromRow;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::{Result, Store, decode_json_column};

/// Health classification of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    /// Never successfully classified, or reachable with zero enumerable
    /// libraries.
    Unknown,
    /// Catalog root reachable and item count retrievable.
    Online,
    /// Server answered HTTP 401.
    Unauthorized,
    /// Transport failure or non-auth HTTP error.
    Down,
    /// Reachable but returned an unexpected payload shape.
    Error,
}

impl SiteStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Unauthorized => "unauthorized",
            Self::Down => "down",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SiteStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "online" => Ok(Self::Online),
            "unauthorized" => Ok(Self::Unauthorized),
            "down" => Ok(Self::Down),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid site status: {s}")),
        }
    }
}

/// One registered e-book server.
#[derive(Debug, Clone, FromRow)]
pub struct Site {
    /// Stable identity; also names the per-site store file.
    pub uuid: String,
    /// Canonical base URL (scheme + host + port, no path).
    pub url: String,
    /// JSON-encoded hostname list.
    pub hostnames: String,
    /// JSON-encoded port list.
    pub ports: String,
    /// Optional country code supplied at discovery time.
    pub country: Option<String>,
    /// Optional ISP name supplied at discovery time.
    pub isp: Option<String>,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Last error context, if any.
    pub error: Option<String>,
    /// Books counted on the most recent successful contact.
    pub book_count: i64,
    /// Books counted on the previous successful contact.
    pub last_book_count: i64,
    /// `max(0, book_count - last_book_count)` from the latest update.
    pub new_books: i64,
    /// Libraries enumerated on the most recent successful contact.
    pub libraries_count: i64,
    /// Consecutive non-online classifications since the last success.
    pub failed_attempts: i64,
    /// Timestamp of the most recent check of any outcome.
    pub last_check: Option<String>,
    /// Timestamp of the most recent online classification.
    pub last_online: Option<String>,
    /// Timestamp of the most recent failed check.
    pub last_failed: Option<String>,
    /// Timestamp of the most recent successful check.
    pub last_success: Option<String>,
    /// Completed scrape batches against this site.
    pub scrapes: i64,
    /// Files downloaded from this site.
    pub downloads: i64,
    /// Timestamp of the most recent scrape batch.
    pub last_scrape: Option<String>,
    /// Timestamp of the most recent successful download.
    pub last_download: Option<String>,
    /// Whether crawling/scraping is enabled (0/1).
    pub active: i64,
}

impl Site {
    /// Parses the stored status string.
    #[must_use]
    pub fn status(&self) -> SiteStatus {
        self.status_str.parse().unwrap_or(SiteStatus::Unknown)
    }

    /// Decodes the hostname list.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Decode`] if the stored JSON is corrupt.
    pub fn hostnames(&self) -> Result<Vec<String>> {
        decode_json_column("hostnames", Some(&self.hostnames))
    }

    /// Returns `true` if crawling/scraping is enabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active != 0
    }
}

/// Outcome of registering a candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new site row was created with this uuid.
    Added(String),
    /// A site with the same hostname already exists.
    AlreadyKnown,
    /// The URL was malformed (missing scheme or host) and was skipped.
    Invalid,
}

/// Counters from a bulk URL import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// New sites created.
    pub added: usize,
    /// Lines skipped because the hostname was already registered.
    pub known: usize,
    /// Lines skipped as malformed.
    pub invalid: usize,
}

/// Canonicalizes a candidate URL to scheme + host + optional explicit port.
///
/// Path, query, and fragment are stripped. Returns `None` for input without a
/// parseable scheme and host.
#[must_use]
pub fn canonicalize_url(raw: &str) -> Option<(String, String, Option<u16>)> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_string();
    let canonical = match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    };
    Some((canonical, host, parsed.port()))
}

/// The shared `sites` store.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    store: Store,
}

impl RegistryStore {
    /// Opens (creating if missing) the registry at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on connection or schema failure.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let store = Store::open(path).await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    /// Opens an in-memory registry for testing.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on connection or schema failure.
    pub async fn open_in_memory() -> Result<Self> {
        let store = Store::open_in_memory().await?;
        Self::init_schema(&store).await?;
        Ok(Self { store })
    }

    async fn init_schema(store: &Store) -> Result<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS sites (
                uuid TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                hostnames TEXT NOT NULL DEFAULT '[]',
                ports TEXT NOT NULL DEFAULT '[]',
                country TEXT,
                isp TEXT,
                status TEXT NOT NULL DEFAULT 'unknown',
                error TEXT,
                book_count INTEGER NOT NULL DEFAULT 0,
                last_book_count INTEGER NOT NULL DEFAULT 0,
                new_books INTEGER NOT NULL DEFAULT 0,
                libraries_count INTEGER NOT NULL DEFAULT 0,
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                last_check TEXT,
                last_online TEXT,
                last_failed TEXT,
                last_success TEXT,
                scrapes INTEGER NOT NULL DEFAULT 0,
                downloads INTEGER NOT NULL DEFAULT 0,
                last_scrape TEXT,
                last_download TEXT,
                active INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(store.pool())
        .await?;
        Ok(())
    }

    /// Registers a candidate URL.
    ///
    /// The URL is canonicalized (path stripped); malformed input is rejected
    /// without raising; a site whose hostname is already registered is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn register_url(
        &self,
        raw_url: &str,
        country: Option<&str>,
    ) -> Result<RegisterOutcome> {
        let Some((canonical, host, port)) = canonicalize_url(raw_url) else {
            warn!(url = raw_url, "skipping malformed candidate URL");
            return Ok(RegisterOutcome::Invalid);
        };

        let existing: Option<(String,)> = sqlx::query_as(
            r"SELECT uuid FROM sites
              WHERE EXISTS (
                  SELECT 1 FROM json_each(sites.hostnames)
                  WHERE json_each.value = ?
              )",
        )
        .bind(&host)
        .fetch_optional(self.store.pool())
        .await?;

        if existing.is_some() {
            debug!(url = %canonical, "hostname already registered");
            return Ok(RegisterOutcome::AlreadyKnown);
        }

        let uuid = Uuid::new_v4().to_string();
        let hostnames = serde_json::to_string(&[&host]).unwrap_or_else(|_| "[]".to_string());
        let ports: Vec<String> = port.map(|p| p.to_string()).into_iter().collect();
        let ports = serde_json::to_string(&ports).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r"INSERT INTO sites (uuid, url, hostnames, ports, country, status)
              VALUES (?, ?, ?, ?, ?, 'unknown')",
        )
        .bind(&uuid)
        .bind(&canonical)
        .bind(&hostnames)
        .bind(&ports)
        .bind(country)
        .execute(self.store.pool())
        .await?;

        debug!(url = %canonical, uuid = %uuid, "registered new site");
        Ok(RegisterOutcome::Added(uuid))
    }

    /// Imports a newline-delimited list of candidate URLs.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self, text))]
    pub async fn import_urls(&self, text: &str, country: Option<&str>) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.register_url(line, country).await? {
                RegisterOutcome::Added(_) => summary.added += 1,
                RegisterOutcome::AlreadyKnown => summary.known += 1,
                RegisterOutcome::Invalid => summary.invalid += 1,
            }
        }
        Ok(summary)
    }

    /// Fetches one site by uuid.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn get(&self, uuid: &str) -> Result<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(r"SELECT * FROM sites WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(site)
    }

    /// Lists every registered site.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn list_all(&self) -> Result<Vec<Site>> {
        let sites = sqlx::query_as::<_, Site>(r"SELECT * FROM sites ORDER BY url")
            .fetch_all(self.store.pool())
            .await?;
        Ok(sites)
    }

    /// Lists sites that are enabled and online: the set eligible for
    /// crawling and scraping.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn list_enabled_online(&self) -> Result<Vec<Site>> {
        let sites = sqlx::query_as::<_, Site>(
            r"SELECT * FROM sites WHERE status = 'online' AND active = 1 ORDER BY url",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(sites)
    }

    /// Records a successful contact reporting `total_books` items.
    ///
    /// Resets the failure counter, shifts `book_count` into
    /// `last_book_count`, and computes `new_books = max(0, total - previous)`.
    /// Fields not part of the update are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn record_online(
        &self,
        uuid: &str,
        total_books: i64,
        libraries_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE sites SET
                status = 'online',
                error = NULL,
                failed_attempts = 0,
                last_book_count = book_count,
                new_books = MAX(0, ? - book_count),
                book_count = ?,
                libraries_count = ?,
                last_check = datetime('now'),
                last_online = datetime('now'),
                last_success = datetime('now')
              WHERE uuid = ?",
        )
        .bind(total_books)
        .bind(total_books)
        .bind(libraries_count)
        .bind(uuid)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Records a non-online classification.
    ///
    /// Increments the failure counter; once it reaches `max_failures` the
    /// site is purged and `true` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn record_failure(
        &self,
        uuid: &str,
        status: SiteStatus,
        error: Option<&str>,
        max_failures: u32,
    ) -> Result<bool> {
        sqlx::query(
            r"UPDATE sites SET
                status = ?,
                error = ?,
                failed_attempts = failed_attempts + 1,
                last_check = datetime('now'),
                last_failed = datetime('now')
              WHERE uuid = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(uuid)
        .execute(self.store.pool())
        .await?;

        let attempts: Option<(i64,)> =
            sqlx::query_as(r"SELECT failed_attempts FROM sites WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(self.store.pool())
                .await?;

        if let Some((attempts,)) = attempts
            && attempts >= i64::from(max_failures)
        {
            sqlx::query(r"DELETE FROM sites WHERE uuid = ?")
                .bind(uuid)
                .execute(self.store.pool())
                .await?;
            warn!(uuid, attempts, "site purged after repeated failures");
            return Ok(true);
        }
        Ok(false)
    }

    /// Enables crawling/scraping for one site. Returns `false` if the uuid
    /// is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn enable(&self, uuid: &str) -> Result<bool> {
        let result = sqlx::query(r"UPDATE sites SET active = 1 WHERE uuid = ?")
            .bind(uuid)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Disables crawling/scraping for one site. Returns `false` if the uuid
    /// is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn disable(&self, uuid: &str) -> Result<bool> {
        let result = sqlx::query(r"UPDATE sites SET active = 0 WHERE uuid = ?")
            .bind(uuid)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enables every site currently classified online. Returns the number of
    /// sites toggled.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn enable_all_online(&self) -> Result<u64> {
        let result =
            sqlx::query(r"UPDATE sites SET active = 1 WHERE status = 'online' AND active = 0")
                .execute(self.store.pool())
                .await?;
        Ok(result.rows_affected())
    }

    /// Disables every active site. Returns the number of sites toggled.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn disable_all(&self) -> Result<u64> {
        let result = sqlx::query(r"UPDATE sites SET active = 0 WHERE active = 1")
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Removes one site. Returns `false` if the uuid is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    pub async fn remove(&self, uuid: &str) -> Result<bool> {
        let result = sqlx::query(r"DELETE FROM sites WHERE uuid = ?")
            .bind(uuid)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records the outcome of one completed scrape batch against a site.
    ///
    /// Called once per site after the whole batch finishes, never per item.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] on query failure.
    #[instrument(skip(self))]
    pub async fn record_scrape(&self, uuid: &str, new_downloads: i64) -> Result<()> {
        sqlx::query(
            r"UPDATE sites SET
                downloads = downloads + ?,
                scrapes = scrapes + 1,
                last_scrape = datetime('now')
              WHERE uuid = ?",
        )
        .bind(new_downloads)
        .bind(uuid)
        .execute(self.store.pool())
        .await?;

        if new_downloads > 0 {
            sqlx::query(r"UPDATE sites SET last_download = datetime('now') WHERE uuid = ?")
                .bind(uuid)
                .execute(self.store.pool())
                .await?;
        }
        Ok(())
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

    async fn registry() -> RegistryStore {
        RegistryStore::open_in_memory().await.unwrap()
    }

    #[test]
    fn test_canonicalize_url_strips_path_and_query() {
        let (url, host, port) = canonicalize_url("http://1.2.3.4:8080/browse?x=1").unwrap();
        assert_eq!(url, "http://1.2.3.4:8080");
        assert_eq!(host, "1.2.3.4");
        assert_eq!(port, Some(8080));
    }

    #[test]
    fn test_canonicalize_url_default_port_omitted() {
        let (url, _, port) = canonicalize_url("https://books.example.org/").unwrap();
        assert_eq!(url, "https://books.example.org");
        assert_eq!(port, None);
    }

    #[test]
    fn test_canonicalize_url_rejects_malformed() {
        assert!(canonicalize_url("books.example.org").is_none());
        assert!(canonicalize_url("ftp://books.example.org").is_none());
        assert!(canonicalize_url("http://").is_none());
        assert!(canonicalize_url("").is_none());
    }

    #[tokio::test]
    async fn test_register_url_creates_site_with_unknown_status() {
        let registry = registry().await;
        let outcome = registry
            .register_url("http://10.0.0.1:8080/some/path", Some("US"))
            .await
            .unwrap();

        let RegisterOutcome::Added(uuid) = outcome else {
            panic!("expected Added, got {outcome:?}");
        };
        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.url, "http://10.0.0.1:8080");
        assert_eq!(site.status(), SiteStatus::Unknown);
        assert_eq!(site.country.as_deref(), Some("US"));
        assert_eq!(site.hostnames().unwrap(), vec!["10.0.0.1".to_string()]);
        assert_eq!(site.failed_attempts, 0);
        assert!(!site.is_active());
    }

    #[tokio::test]
    async fn test_register_url_same_hostname_is_noop() {
        let registry = registry().await;
        registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap();
        let outcome = registry
            .register_url("http://10.0.0.1:8080/other", None)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::AlreadyKnown);
        assert_eq!(registry.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_url_rejects_malformed_without_raising() {
        let registry = registry().await;
        let outcome = registry.register_url("not a url", None).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Invalid);
        assert!(registry.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_urls_counts_outcomes() {
        let registry = registry().await;
        let text = "http://10.0.0.1:8080\n\nhttp://10.0.0.1:8080\nbogus\nhttp://10.0.0.2\n";
        let summary = registry.import_urls(text, None).await.unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.known, 1);
        assert_eq!(summary.invalid, 1);
    }

    #[tokio::test]
    async fn test_record_online_computes_new_books_delta() {
        let registry = registry().await;
        let RegisterOutcome::Added(uuid) = registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };

        registry.record_online(&uuid, 100, 1).await.unwrap();
        registry.record_online(&uuid, 120, 1).await.unwrap();

        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.last_book_count, 100);
        assert_eq!(site.new_books, 20);
        assert_eq!(site.book_count, 120);
        assert_eq!(site.status(), SiteStatus::Online);
    }

    #[tokio::test]
    async fn test_record_online_new_books_never_negative() {
        let registry = registry().await;
        let RegisterOutcome::Added(uuid) = registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };

        registry.record_online(&uuid, 100, 1).await.unwrap();
        registry.record_online(&uuid, 80, 1).await.unwrap();

        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.new_books, 0);
        assert_eq!(site.book_count, 80);
    }

    #[tokio::test]
    async fn test_failed_attempts_increment_and_reset() {
        let registry = registry().await;
        let RegisterOutcome::Added(uuid) = registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };

        for expected in 1..=3 {
            let evicted = registry
                .record_failure(&uuid, SiteStatus::Down, Some("timeout"), 5)
                .await
                .unwrap();
            assert!(!evicted);
            let site = registry.get(&uuid).await.unwrap().unwrap();
            assert_eq!(site.failed_attempts, expected);
            assert_eq!(site.status(), SiteStatus::Down);
        }

        registry.record_online(&uuid, 10, 1).await.unwrap();
        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_site_purged_at_failure_threshold() {
        let registry = registry().await;
        let RegisterOutcome::Added(uuid) = registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };

        for _ in 0..4 {
            let evicted = registry
                .record_failure(&uuid, SiteStatus::Down, None, 5)
                .await
                .unwrap();
            assert!(!evicted);
        }
        let evicted = registry
            .record_failure(&uuid, SiteStatus::Down, None, 5)
            .await
            .unwrap();
        assert!(evicted);
        assert!(registry.get(&uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enable_disable_and_eligibility() {
        let registry = registry().await;
        let RegisterOutcome::Added(uuid) = registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };

        assert!(registry.list_enabled_online().await.unwrap().is_empty());

        registry.record_online(&uuid, 5, 1).await.unwrap();
        assert_eq!(registry.enable_all_online().await.unwrap(), 1);
        assert_eq!(registry.list_enabled_online().await.unwrap().len(), 1);

        assert!(registry.disable(&uuid).await.unwrap());
        assert!(registry.list_enabled_online().await.unwrap().is_empty());
        assert!(!registry.enable("no-such-uuid").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_scrape_updates_counters_once_per_batch() {
        let registry = registry().await;
        let RegisterOutcome::Added(uuid) = registry
            .register_url("http://10.0.0.1:8080", None)
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };

        registry.record_scrape(&uuid, 3).await.unwrap();
        registry.record_scrape(&uuid, 0).await.unwrap();

        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.downloads, 3);
        assert_eq!(site.scrapes, 2);
        assert!(site.last_scrape.is_some());
        assert!(site.last_download.is_some());
    }
}
