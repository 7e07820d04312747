//! Catalog snapshot comparison.
//!
//! Compares an older and a newer catalog and records what changed: entries
//! whose title link moved to a different location, and entries that are new
//! to the fleet. Removals are not tracked; sites drop off and return too
//! often for absence to mean anything.

use std::path::Path;

use tracing::{info, instrument};

use crate::store::StoreError;
use crate::store::catalog::CatalogStore;
use crate::store::diff::{DiffRecord, DiffStatus, DiffStore};

/// Aggregate counters from one comparison.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffSummary {
    /// Entries present in both snapshots whose location changed.
    pub moved: usize,
    /// Entries present only in the newer snapshot.
    pub new: usize,
}

/// Compares two catalog snapshots and writes the changes to `diff_path`.
///
/// Comparing a snapshot against itself yields no records.
///
/// # Errors
///
/// Returns [`StoreError`] on any store failure.
#[instrument(skip_all, fields(old = %old_path.display(), new = %new_path.display()))]
pub async fn diff_catalogs(
    old_path: &Path,
    new_path: &Path,
    diff_path: &Path,
) -> Result<DiffSummary, StoreError> {
    let old = CatalogStore::open(old_path).await?;
    let new = CatalogStore::open(new_path).await?;
    let out = DiffStore::open(diff_path).await?;

    let mut summary = DiffSummary::default();
    let mut batch = Vec::new();
    for entry in new.all_entries().await? {
        match old.entry(&entry.uuid).await? {
            Some(previous) => {
                if previous.title.href != entry.title.href {
                    summary.moved += 1;
                    batch.push(DiffRecord {
                        old_location: Some(previous.title.href),
                        entry,
                        status: DiffStatus::Moved,
                    });
                }
            }
            None => {
                summary.new += 1;
                batch.push(DiffRecord {
                    entry,
                    status: DiffStatus::New,
                    old_location: None,
                });
            }
        }
    }
    out.insert_records(&batch).await?;
    info!(moved = summary.moved, new = summary.new, "diff complete");
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::catalog::{CatalogEntry, Link};

    fn entry(uuid: &str, href: &str) -> CatalogEntry {
        CatalogEntry {
            uuid: uuid.to_string(),
            title: Link {
                href: href.to_string(),
                label: "Solaris".to_string(),
            },
            language: "eng".to_string(),
            formats: vec!["EPUB".to_string()],
            ..CatalogEntry::default()
        }
    }

    async fn snapshot(path: &Path, entries: &[CatalogEntry]) {
        let catalog = CatalogStore::open(path).await.unwrap();
        catalog.upsert_entries(entries, "site-a").await.unwrap();
        catalog.close().await;
    }

    #[tokio::test]
    async fn test_diff_against_itself_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = dir.path().join("index.db");
        snapshot(&snap, &[entry("u1", "http://10.0.0.1:8080#book_id=1")]).await;

        let summary = diff_catalogs(&snap, &snap, &dir.path().join("diff.db"))
            .await
            .unwrap();
        assert_eq!(summary, DiffSummary::default());

        let out = DiffStore::open(&dir.path().join("diff.db")).await.unwrap();
        assert_eq!(out.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_diff_detects_new_and_moved() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.db");
        let new = dir.path().join("new.db");
        snapshot(
            &old,
            &[
                entry("u1", "http://10.0.0.1:8080#book_id=1"),
                entry("u2", "http://10.0.0.2:8080#book_id=5"),
            ],
        )
        .await;
        snapshot(
            &new,
            &[
                entry("u1", "http://10.0.0.9:8080#book_id=3"),
                entry("u2", "http://10.0.0.2:8080#book_id=5"),
                entry("u3", "http://10.0.0.3:8080#book_id=7"),
            ],
        )
        .await;

        let diff_path = dir.path().join("diff.db");
        let summary = diff_catalogs(&old, &new, &diff_path).await.unwrap();
        assert_eq!(summary.moved, 1);
        assert_eq!(summary.new, 1);

        let out = DiffStore::open(&diff_path).await.unwrap();
        let records = out.all_records().await.unwrap();
        assert_eq!(records.len(), 2);

        let moved = records
            .iter()
            .find(|r| r.status == DiffStatus::Moved)
            .unwrap();
        assert_eq!(moved.entry.uuid, "u1");
        assert_eq!(
            moved.old_location.as_deref(),
            Some("http://10.0.0.1:8080#book_id=1")
        );

        let fresh = records.iter().find(|r| r.status == DiffStatus::New).unwrap();
        assert_eq!(fresh.entry.uuid, "u3");
        assert!(fresh.old_location.is_none());
    }
}
