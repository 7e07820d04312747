//! Library crawling: full metadata enumeration into per-site stores.
//!
//! A site pass enumerates every library, pages through book ids newest first,
//! fetches details in batches, normalizes them, and upserts into the site's
//! own store file. A transport failure aborts the whole site pass; the next
//! pass restarts from scratch and re-upserts, so partial passes never corrupt
//! the store. Fleet passes run sites on a bounded pool and never let one bad
//! site fail the run.

pub mod protocol;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::http::{HttpError, build_client};
use crate::normalize::{classify_language, iso639_2, transliterate};
use crate::store::StoreError;
use crate::store::registry::{RegistryStore, Site};
use crate::store::site::{BookRecord, SiteStore};
use self::protocol::{CatalogClient, ProtocolError, RemoteBook, parse_major_version};

/// Crawl errors.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The remote conversation failed; the site pass is aborted.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The per-site store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The HTTP client could not be constructed.
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Outcome of one site pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Libraries enumerated.
    pub libraries: usize,
    /// Books upserted across all libraries.
    pub books: usize,
}

/// Aggregate counters from a fleet pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlRunSummary {
    /// Sites crawled to completion.
    pub sites: usize,
    /// Sites whose pass aborted on a failure.
    pub failed: usize,
    /// Books upserted across all sites.
    pub books: usize,
}

/// Normalizes one remote book, or drops it.
///
/// Books without a uuid cannot be keyed and books without formats cannot be
/// downloaded; both are skipped. Text fields are transliterated; a missing
/// language is classified from the description, then the title, accepted only
/// above the confidence floor.
#[must_use]
pub fn normalize_book(raw: &RemoteBook, id: i64, library: &str) -> Option<BookRecord> {
    let uuid = raw.uuid.as_deref().unwrap_or("").trim();
    if uuid.is_empty() {
        return None;
    }
    if raw.formats.is_empty() {
        return None;
    }

    let formats: Vec<String> = raw.formats.iter().map(|f| f.to_uppercase()).collect();
    let sizes = raw
        .format_metadata
        .iter()
        .filter_map(|(format, meta)| {
            let size = meta.size?;
            if size.is_finite() && size >= 0.0 {
                #[allow(clippy::cast_possible_truncation)]
                let bytes = size as i64;
                Some((format.to_uppercase(), bytes))
            } else {
                None
            }
        })
        .collect();

    let title = transliterate(raw.title.as_deref().unwrap_or("")).trim().to_string();
    let description = raw.comments.clone();

    let language = raw
        .languages
        .first()
        .and_then(|tag| iso639_2(tag))
        .or_else(|| description.as_deref().and_then(classify_language))
        .or_else(|| classify_language(&title))
        .unwrap_or_default();

    Some(BookRecord {
        uuid: uuid.to_string(),
        id,
        library: library.to_string(),
        title,
        authors: raw.authors.iter().map(|a| transliterate(a)).collect(),
        series: raw.series.as_deref().map(transliterate),
        series_index: raw.series_index,
        language,
        description,
        identifiers: raw.identifiers.clone(),
        tags: raw.tags.iter().map(|t| transliterate(t)).collect(),
        publisher: raw.publisher.as_deref().map(transliterate),
        pubdate: raw.pubdate.clone(),
        last_modified: raw.last_modified.clone(),
        timestamp: raw.timestamp.clone(),
        formats,
        sizes,
        cover: raw.cover.is_some(),
    })
}

/// Returns the path of a site's store file under `data_dir`.
#[must_use]
pub fn site_store_path(data_dir: &Path, site_uuid: &str) -> PathBuf {
    data_dir.join(format!("{site_uuid}.db"))
}

async fn crawl_library(
    config: &Config,
    client: &CatalogClient,
    store: &SiteStore,
    base: &str,
    library: Option<&str>,
) -> Result<usize, CrawlError> {
    let lib_name = library.unwrap_or("");
    let count = client.item_count(base, library).await?;
    if let Some(server) = &count.server
        && let Some(major) = parse_major_version(server)
    {
        store.set_server_version(server, major).await?;
    }
    store.upsert_library(lib_name, count.total).await?;

    let page_size = i64::from(config.effective_page_size());
    let mut offset = 0;
    let mut books = 0;
    while offset < count.total {
        let ids = client.page_ids(base, library, offset, page_size).await?;
        if ids.is_empty() {
            break;
        }
        let details = client.book_details(base, library, &ids).await?;
        let mut batch = Vec::with_capacity(details.len());
        for (id_text, raw) in &details {
            let id = id_text.parse().unwrap_or(0);
            match normalize_book(raw, id, lib_name) {
                Some(book) => batch.push(book),
                None => debug!(id = %id_text, "skipping book without uuid or formats"),
            }
        }
        store.upsert_books(&batch).await?;
        books += batch.len();
        offset += page_size;
    }
    Ok(books)
}

/// Crawls one site into its store file.
///
/// Any remote failure aborts the pass and surfaces as an error; already
/// upserted pages stay in place for the next pass to refresh.
///
/// # Errors
///
/// Returns [`CrawlError`] on remote or store failure.
#[instrument(skip(config, client, registry, data_dir, site), fields(url = %site.url))]
pub async fn crawl_site(
    config: &Config,
    client: &CatalogClient,
    registry: &RegistryStore,
    data_dir: &Path,
    site: &Site,
) -> Result<CrawlSummary, CrawlError> {
    let store = SiteStore::open(&site_store_path(data_dir, &site.uuid)).await?;
    store.ensure_site(&site.uuid, &site.url).await?;

    // Servers predating multi-library support answer 404 here; they still
    // have the single default library.
    let libraries: Vec<Option<String>> = match client.library_map(&site.url).await {
        Ok(map) if map.is_empty() => vec![None],
        Ok(map) => map.into_keys().map(Some).collect(),
        Err(ProtocolError::HttpStatus { status, .. })
            if status == reqwest::StatusCode::NOT_FOUND =>
        {
            vec![None]
        }
        Err(err) => return Err(err.into()),
    };

    let mut summary = CrawlSummary {
        libraries: libraries.len(),
        books: 0,
    };
    for library in &libraries {
        summary.books +=
            crawl_library(config, client, &store, &site.url, library.as_deref()).await?;
    }

    let total = store.book_count().await?;
    let libraries_count = i64::try_from(summary.libraries).unwrap_or(i64::MAX);
    registry.record_online(&site.uuid, total, libraries_count).await?;
    info!(books = summary.books, libraries = summary.libraries, "site pass complete");
    Ok(summary)
}

/// Crawls every enabled, online site on a bounded concurrent pool.
///
/// One bad site never fails the run: its pass is logged and skipped.
/// Cancellation is consulted before each site pass.
///
/// # Errors
///
/// Returns [`CrawlError`] when the HTTP client cannot be built or the
/// registry cannot be read.
#[instrument(skip_all)]
pub async fn crawl_all(
    config: &Config,
    registry: &RegistryStore,
    data_dir: &Path,
    cancel: &CancelToken,
) -> Result<CrawlRunSummary, CrawlError> {
    let client = CatalogClient::new(build_client(config.fetch_timeout)?);
    let sites = registry.list_enabled_online().await?;
    let semaphore = Arc::new(Semaphore::new(config.crawl_pool));

    let mut handles = Vec::with_capacity(sites.len());
    for site in sites {
        if cancel.is_cancelled() {
            info!("crawl pass cancelled");
            break;
        }
        let semaphore = Arc::clone(&semaphore);
        let client = client.clone();
        let registry = registry.clone();
        let config = config.clone();
        let data_dir = data_dir.to_path_buf();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return None;
            };
            let outcome = crawl_site(&config, &client, &registry, &data_dir, &site).await;
            Some((site.url, outcome))
        }));
    }

    let mut summary = CrawlRunSummary::default();
    for handle in handles {
        let Ok(Some((url, outcome))) = handle.await else {
            continue;
        };
        match outcome {
            Ok(site_summary) => {
                summary.sites += 1;
                summary.books += site_summary.books;
            }
            Err(err) => {
                summary.failed += 1;
                warn!(url = %url, error = %err, "site pass aborted");
            }
        }
    }
    info!(
        sites = summary.sites,
        failed = summary.failed,
        books = summary.books,
        "crawl pass complete"
    );
    Ok(summary)
}
