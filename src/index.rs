//! Catalog building: merging per-site stores into the searchable catalog.
//!
//! The builder scans the data directory for per-site store files, projects
//! every book into the presentation-oriented summary shape (title link, cover
//! thumbnail, labeled download links), and upserts into `index.db`. The URL
//! shapes depend on the remote server generation recorded at crawl time.
//! Rebuilding over an existing catalog is idempotent.

use std::path::Path;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::store::StoreError;
use crate::store::catalog::{CatalogEntry, CatalogStore, Cover, Link};
use crate::store::site::{BookRecord, SiteStore};

/// Thumbnail display width in pixels.
const COVER_WIDTH: u32 = 90;

/// Store files that are never per-site stores.
const RESERVED_STORES: [&str; 3] = ["index.db", "sites.db", "diff.db"];

/// Catalog build errors.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Scanning the data directory failed.
    #[error("failed to scan data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Language predicate applied while building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageFilter {
    /// Keep every book.
    Any,
    /// Keep only books in the given ISO 639-2/B language.
    Only(String),
    /// Keep every book except the given ISO 639-2/B language.
    Exclude(String),
}

impl LanguageFilter {
    /// Returns `true` if a book in `language` passes the filter.
    #[must_use]
    pub fn matches(&self, language: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(code) => language == code,
            Self::Exclude(code) => language != code,
        }
    }
}

/// Aggregate counters from one catalog build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    /// Site stores merged.
    pub sites: usize,
    /// Entries upserted.
    pub entries: usize,
    /// Entries that replaced a row from another store (uuid collisions).
    pub collisions: usize,
}

/// Formats a byte count for link labels, decimal units.
#[must_use]
pub fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["kB", "MB", "GB", "TB"];
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Extracts a four-digit year prefix from a publication date, or empty.
#[must_use]
pub fn year_of(pubdate: Option<&str>) -> String {
    let Some(date) = pubdate else {
        return String::new();
    };
    let prefix: String = date.chars().take(4).collect();
    if prefix.len() == 4 && prefix.chars().all(|c| c.is_ascii_digit()) && prefix != "0101" {
        prefix
    } else {
        String::new()
    }
}

fn book_page_url(base: &str, major: i64, id: i64, library: &str) -> String {
    let base = base.trim_end_matches('/');
    if major >= 3 {
        format!("{base}/#book_id={id}&library_id={library}&panel=book_details")
    } else {
        format!("{base}/browse/book/{id}")
    }
}

fn thumb_url(base: &str, major: i64, id: i64, library: &str) -> String {
    let base = base.trim_end_matches('/');
    if major >= 3 {
        format!("{base}/get/thumb/{id}/{library}?sz=600x800")
    } else {
        format!("{base}/get/thumb_90_120/{id}")
    }
}

fn download_url(base: &str, format: &str, id: i64, library: &str) -> String {
    // Same shape on every server generation.
    let base = base.trim_end_matches('/');
    format!("{base}/get/{format}/{id}/{library}")
}

/// Projects one stored book into its catalog summary row.
///
/// Returns `None` for books with no formats: they have nothing to link to.
#[must_use]
pub fn project(book: &BookRecord, base: &str, major: i64) -> Option<CatalogEntry> {
    if book.formats.is_empty() {
        return None;
    }

    let links = book
        .formats
        .iter()
        .map(|format| {
            let label = match book.sizes.get(format) {
                Some(size) => format!("{format} ({})", human_size(*size)),
                None => format.clone(),
            };
            Link {
                href: download_url(base, format, book.id, &book.library),
                label,
            }
        })
        .collect();

    let cover = book.cover.then(|| Cover {
        img_src: thumb_url(base, major, book.id, &book.library),
        width: COVER_WIDTH,
    });

    Some(CatalogEntry {
        uuid: book.uuid.clone(),
        title: Link {
            href: book_page_url(base, major, book.id, &book.library),
            label: book.title.clone(),
        },
        cover,
        authors: book.authors.clone(),
        year: year_of(book.pubdate.as_deref()),
        series: book.series.clone(),
        language: book.language.clone(),
        links,
        publisher: book.publisher.clone(),
        tags: book.tags.clone(),
        identifiers: book.identifiers.clone(),
        formats: book.formats.clone(),
    })
}

fn is_site_store(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".db") && !RESERVED_STORES.contains(&name)
}

/// Merges every per-site store under `data_dir` into the catalog at
/// `data_dir/index.db` and rebuilds the full-text index.
///
/// # Errors
///
/// Returns [`IndexError`] on store or directory-scan failure.
#[instrument(skip(data_dir, filter), fields(data_dir = %data_dir.display()))]
pub async fn build_catalog(
    data_dir: &Path,
    filter: &LanguageFilter,
) -> Result<BuildSummary, IndexError> {
    let catalog = CatalogStore::open(&data_dir.join("index.db")).await?;
    let mut summary = BuildSummary::default();

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if is_site_store(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let store = SiteStore::open(&path).await?;
        let Some(meta) = store.meta().await? else {
            warn!(path = %path.display(), "store has no site identity, skipping");
            continue;
        };
        let Some(base) = meta.urls.last() else {
            warn!(path = %path.display(), "store has no known URL, skipping");
            continue;
        };

        let mut batch = Vec::new();
        for book in store.all_books().await? {
            if !filter.matches(&book.language) {
                continue;
            }
            if let Some(entry) = project(&book, base, meta.major) {
                batch.push(entry);
            }
        }
        let upserted = catalog.upsert_entries(&batch, &meta.uuid).await?;
        if upserted.collisions > 0 {
            warn!(
                site = %meta.uuid,
                collisions = upserted.collisions,
                "uuid collisions with previously merged stores"
            );
        }
        summary.sites += 1;
        summary.entries += batch.len();
        summary.collisions += upserted.collisions;
    }

    catalog.rebuild_fts().await?;
    info!(
        sites = summary.sites,
        entries = summary.entries,
        collisions = summary.collisions,
        "catalog build complete"
    );
    Ok(summary)
}
