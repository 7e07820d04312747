//! Fleet statistics: per-format counts and sizes across all site stores.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::instrument;

use crate::index::human_size;
use crate::store::StoreError;
use crate::store::site::SiteStore;

/// Statistics errors.
#[derive(Debug, Error)]
pub enum StatsError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Scanning the data directory failed.
    #[error("failed to scan data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Aggregated numbers for one format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FormatStats {
    /// Books carrying the format.
    pub count: u64,
    /// Total disclosed bytes for the format.
    pub total_bytes: i64,
}

/// Fleet-wide statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FleetStats {
    /// Site stores scanned.
    pub sites: usize,
    /// Books across all stores.
    pub books: u64,
    /// Per-format aggregates, keyed by format name.
    pub formats: BTreeMap<String, FormatStats>,
}

impl FleetStats {
    /// Renders the statistics as an aligned text table.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("{} books across {} sites\n", self.books, self.sites);
        for (format, stats) in &self.formats {
            out.push_str(&format!(
                "{format:<8} {:>8} {:>12}\n",
                stats.count,
                human_size(stats.total_bytes)
            ));
        }
        out
    }
}

fn is_site_store(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".db") && !["index.db", "sites.db", "diff.db"].contains(&name)
}

/// Aggregates per-format counts and sizes over every site store under
/// `data_dir`.
///
/// # Errors
///
/// Returns [`StatsError`] on store or directory-scan failure.
#[instrument(skip(data_dir), fields(data_dir = %data_dir.display()))]
pub async fn collect_stats(data_dir: &Path) -> Result<FleetStats, StatsError> {
    let mut stats = FleetStats::default();
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
        stats.sites += 1;
        for book in store.all_books().await? {
            stats.books += 1;
            for format in &book.formats {
                let entry = stats.formats.entry(format.clone()).or_default();
                entry.count += 1;
                entry.total_bytes += book.sizes.get(format).copied().unwrap_or(0);
            }
        }
    }
    Ok(stats)
}
