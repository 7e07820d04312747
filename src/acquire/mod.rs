//! Acquisition pipeline: bulk file downloads from cataloged sites.
//!
//! A scrape run walks the enabled, online sites, selects download targets for
//! each from the catalog (by link host, optional author/title filters, and a
//! requested extension or the `all` wildcard), and downloads them on a narrow
//! bounded pool. One failed item never aborts the batch; site counters are
//! updated once per site after its batch completes.

pub mod extension;
pub mod filename;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::http::{HttpError, build_client};
use crate::store::StoreError;
use crate::store::catalog::{CatalogEntry, CatalogStore};
use crate::store::registry::RegistryStore;

/// Pipeline-level errors. Per-item download failures are counted, not
/// propagated.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The HTTP client could not be constructed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The output directory could not be created.
    #[error("failed to prepare output directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One failed download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport failure mid-request or mid-body.
    #[error("download failed for {url}: {source}")]
    Network {
        /// Request URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server refused the download.
    #[error("{url} answered HTTP {status}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// The HTTP status received.
        status: StatusCode,
    },

    /// Writing the output file failed.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Output path.
        path: PathBuf,
        /// The underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
}

/// Options for one scrape run.
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    /// Requested extension, or a wildcard (`all`, `*`, `any`, empty).
    pub extension: String,
    /// Directory downloads land in.
    pub output_dir: PathBuf,
    /// Substring filter on the author list.
    pub author_filter: Option<String>,
    /// Substring filter on the title.
    pub title_filter: Option<String>,
}

/// One selected download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Book uuid the link belongs to.
    pub uuid: String,
    /// Download URL.
    pub href: String,
    /// Link label as cataloged.
    pub label: String,
    /// Catalog title, for filename derivation.
    pub title: String,
    /// Catalog authors, for filename derivation.
    pub authors: Vec<String>,
}

/// Outcome of one download attempt.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// File written.
    Saved(PathBuf),
    /// File already present; nothing fetched.
    SkippedExisting(PathBuf),
}

/// Aggregate counters from one scrape run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeSummary {
    /// Sites visited.
    pub sites: usize,
    /// Files downloaded.
    pub downloaded: usize,
    /// Targets skipped because the file already existed.
    pub skipped: usize,
    /// Targets that failed.
    pub failed: usize,
}

/// Selects the download targets for one site's entries.
///
/// Only links whose URL references `host` are considered. With a wildcard
/// extension every distinct format of a book is taken; otherwise only links
/// matching the requested extension by label token or URL suffix.
#[must_use]
pub fn select_targets(entries: &[CatalogEntry], host: &str, requested: &str) -> Vec<Target> {
    let wildcard = extension::is_wildcard(requested);
    let requested_lower = requested.trim().to_lowercase();
    let mut targets = Vec::new();

    for entry in entries {
        let mut seen = Vec::new();
        for link in &entry.links {
            if !link.href.contains(host) {
                continue;
            }
            let inferred = extension::from_url(&link.href)
                .or_else(|| extension::from_label(&link.label))
                .unwrap_or_else(|| link.label.to_lowercase());
            if wildcard {
                if seen.contains(&inferred) {
                    continue;
                }
                seen.push(inferred);
            } else if inferred != requested_lower {
                continue;
            }
            targets.push(Target {
                uuid: entry.uuid.clone(),
                href: link.href.clone(),
                label: link.label.clone(),
                title: entry.title.label.clone(),
                authors: entry.authors.clone(),
            });
            if !wildcard {
                break;
            }
        }
    }
    targets
}

/// Downloads one target into `output_dir`, streaming the body to disk.
///
/// # Errors
///
/// Returns [`DownloadError`] on transport, HTTP, or filesystem failure.
#[instrument(skip(client, target, output_dir), fields(url = %target.href))]
pub async fn download_target(
    client: &Client,
    target: &Target,
    output_dir: &Path,
    requested: &str,
) -> Result<DownloadOutcome, DownloadError> {
    let response = client
        .get(&target.href)
        .send()
        .await
        .map_err(|source| DownloadError::Network {
            url: target.href.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus {
            url: target.href.clone(),
            status,
        });
    }

    let headers = response.headers();
    let disposition = headers
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let ext = extension::resolve(
        &target.href,
        &target.label,
        disposition.as_deref(),
        content_type.as_deref(),
        requested,
    );
    let name = filename::derive(&target.uuid, &target.title, &target.authors, &target.label, &ext);
    let path = output_dir.join(name);

    if path.exists() {
        debug!(path = %path.display(), "already downloaded, skipping");
        return Ok(DownloadOutcome::SkippedExisting(path));
    }

    // Stream into a scratch file first: an interrupted body must never
    // leave a truncated file under the final name for the skip check above
    // to find on the next run.
    let partial = path.with_extension(format!("{ext}.part"));
    if let Err(err) = write_body(response, &partial, &target.href).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, &path)
        .await
        .map_err(|source| DownloadError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(DownloadOutcome::Saved(path))
}

async fn write_body(
    response: reqwest::Response,
    path: &Path,
    url: &str,
) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|source| DownloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| DownloadError::Network {
            url: url.to_string(),
            source,
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|source| DownloadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }
    file.flush().await.map_err(|source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs one scrape pass over every enabled, online site.
///
/// Cancellation is consulted before each site and before each download;
/// in-flight downloads complete. A site whose targets cannot be enumerated is
/// logged and skipped.
///
/// # Errors
///
/// Returns [`AcquireError`] when the output directory, HTTP client, registry,
/// or catalog is unusable.
#[instrument(skip_all)]
pub async fn scrape_run(
    config: &Config,
    registry: &RegistryStore,
    catalog_path: &Path,
    options: &ScrapeOptions,
    cancel: &CancelToken,
) -> Result<ScrapeSummary, AcquireError> {
    std::fs::create_dir_all(&options.output_dir)?;
    let client = build_client(config.fetch_timeout)?;
    let catalog = CatalogStore::open(catalog_path).await?;
    let sites = registry.list_enabled_online().await?;

    let mut summary = ScrapeSummary::default();
    for site in sites {
        if cancel.is_cancelled() {
            info!("scrape run cancelled");
            break;
        }
        let Some(host) = url::Url::parse(&site.url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
        else {
            warn!(url = %site.url, "site URL has no host, skipping");
            continue;
        };

        let entries = match catalog
            .entries_for_host(
                &host,
                options.author_filter.as_deref(),
                options.title_filter.as_deref(),
            )
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(url = %site.url, error = %err, "cannot enumerate targets, skipping site");
                continue;
            }
        };
        let targets = select_targets(&entries, &host, &options.extension);
        summary.sites += 1;
        if targets.is_empty() {
            continue;
        }

        let semaphore = Arc::new(Semaphore::new(config.download_pool));
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            if cancel.is_cancelled() {
                break;
            }
            let semaphore = Arc::clone(&semaphore);
            let client = client.clone();
            let output_dir = options.output_dir.clone();
            let requested = options.extension.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return None;
                };
                Some(download_target(&client, &target, &output_dir, &requested).await)
            }));
        }

        let mut downloaded = 0_i64;
        for handle in handles {
            let Ok(Some(outcome)) = handle.await else {
                continue;
            };
            match outcome {
                Ok(DownloadOutcome::Saved(path)) => {
                    downloaded += 1;
                    summary.downloaded += 1;
                    debug!(path = %path.display(), "saved");
                }
                Ok(DownloadOutcome::SkippedExisting(_)) => summary.skipped += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(error = %err, "download failed");
                }
            }
        }
        // Counters move once per site batch, never per item.
        registry.record_scrape(&site.uuid, downloaded).await?;
    }
    info!(
        sites = summary.sites,
        downloaded = summary.downloaded,
        skipped = summary.skipped,
        failed = summary.failed,
        "scrape run complete"
    );
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::store::catalog::Link;

    fn entry(uuid: &str, links: Vec<Link>) -> CatalogEntry {
        CatalogEntry {
            uuid: uuid.to_string(),
            title: Link {
                href: String::new(),
                label: "Solaris".to_string(),
            },
            authors: vec!["Stanislaw Lem".to_string()],
            links,
            ..CatalogEntry::default()
        }
    }

    fn link(href: &str, label: &str) -> Link {
        Link {
            href: href.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn test_select_targets_filters_by_host() {
        let entries = vec![entry(
            "u1",
            vec![
                link("http://10.0.0.1:8080/get/EPUB/1/main", "EPUB (1.0 MB)"),
                link("http://10.9.9.9:8080/get/EPUB/1/main", "EPUB (1.0 MB)"),
            ],
        )];
        let targets = select_targets(&entries, "10.0.0.1", "all");
        assert_eq!(targets.len(), 1);
        assert!(targets[0].href.contains("10.0.0.1"));
    }

    #[test]
    fn test_select_targets_wildcard_dedupes_formats() {
        let entries = vec![entry(
            "u1",
            vec![
                link("http://10.0.0.1:8080/get/EPUB/1/main", "EPUB (1.0 MB)"),
                link("http://10.0.0.1:8080/download/EPUB/1", "EPUB"),
                link("http://10.0.0.1:8080/get/PDF/1/main", "PDF (2.0 MB)"),
            ],
        )];
        let targets = select_targets(&entries, "10.0.0.1", "all");
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_select_targets_specific_extension() {
        let entries = vec![entry(
            "u1",
            vec![
                link("http://10.0.0.1:8080/get/EPUB/1/main", "EPUB (1.0 MB)"),
                link("http://10.0.0.1:8080/get/PDF/1/main", "PDF (2.0 MB)"),
            ],
        )];
        let targets = select_targets(&entries, "10.0.0.1", "pdf");
        assert_eq!(targets.len(), 1);
        assert!(targets[0].href.contains("PDF"));
    }

    fn target_for(server: &MockServer, route: &str, label: &str) -> Target {
        Target {
            uuid: "u1".to_string(),
            href: format!("{}{route}", server.uri()),
            label: label.to_string(),
            title: "Solaris".to_string(),
            authors: vec!["Stanislaw Lem".to_string()],
        }
    }

    #[tokio::test]
    async fn test_download_target_streams_to_named_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/EPUB/1/main"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/epub+zip")
                    .set_body_bytes(b"book-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = build_client(std::time::Duration::from_secs(5)).unwrap();
        let target = target_for(&server, "/get/EPUB/1/main", "Download");
        let outcome = download_target(&client, &target, dir.path(), "all")
            .await
            .unwrap();

        let DownloadOutcome::Saved(saved) = outcome else {
            panic!("expected Saved");
        };
        // URL and label say nothing; the epub MIME type decides.
        assert_eq!(
            saved.file_name().unwrap().to_str().unwrap(),
            "Solaris_Stanislaw_Lem.epub"
        );
        assert_eq!(std::fs::read(&saved).unwrap(), b"book-bytes");
    }

    #[tokio::test]
    async fn test_download_target_skips_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/book.epub"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Solaris_Stanislaw_Lem.epub"), b"old").unwrap();

        let client = build_client(std::time::Duration::from_secs(5)).unwrap();
        let target = target_for(&server, "/get/book.epub", "EPUB");
        let outcome = download_target(&client, &target, dir.path(), "all")
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::SkippedExisting(_)));
        assert_eq!(
            std::fs::read(dir.path().join("Solaris_Stanislaw_Lem.epub")).unwrap(),
            b"old"
        );
    }

    #[tokio::test]
    async fn test_download_target_surfaces_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/book.epub"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = build_client(std::time::Duration::from_secs(5)).unwrap();
        let target = target_for(&server, "/get/book.epub", "EPUB");
        let err = download_target(&client, &target, dir.path(), "all")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { .. }));
    }

    #[tokio::test]
    async fn test_download_target_discards_truncated_body() {
        use tokio::io::AsyncReadExt;

        // Advertises 100 bytes, sends 7, then closes the connection.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0_u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/epub+zip\r\n\
                      Content-Length: 100\r\n\r\npartial",
                )
                .await
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let client = build_client(std::time::Duration::from_secs(5)).unwrap();
        let target = Target {
            uuid: "u1".to_string(),
            href: format!("http://{addr}/get/EPUB/1/main"),
            label: "EPUB".to_string(),
            title: "Solaris".to_string(),
            authors: vec!["Stanislaw Lem".to_string()],
        };
        let err = download_target(&client, &target, dir.path(), "all")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Network { .. }));

        // No truncated file survives under the final or the scratch name,
        // so a retry is not skipped as already downloaded.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

        let retry = download_target(&client, &target, dir.path(), "all").await;
        assert!(!matches!(retry, Ok(DownloadOutcome::SkippedExisting(_))));
    }

    #[tokio::test]
    async fn test_scrape_run_downloads_and_updates_counters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/EPUB/1/main"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/epub+zip")
                    .set_body_bytes(b"book".to_vec()),
            )
            .mount(&server)
            .await;

        let registry = RegistryStore::open_in_memory().await.unwrap();
        let crate::store::registry::RegisterOutcome::Added(uuid) =
            registry.register_url(&server.uri(), None).await.unwrap()
        else {
            panic!("expected Added");
        };
        registry.record_online(&uuid, 1, 1).await.unwrap();
        registry.enable(&uuid).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("index.db");
        let catalog = CatalogStore::open(&catalog_path).await.unwrap();
        catalog
            .upsert_entries(
                &[entry(
                    "u1",
                    vec![link(
                        &format!("{}/get/EPUB/1/main", server.uri()),
                        "EPUB (4 B)",
                    )],
                )],
                "site-a",
            )
            .await
            .unwrap();
        catalog.close().await;

        let options = ScrapeOptions {
            extension: "all".to_string(),
            output_dir: dir.path().join("out"),
            author_filter: None,
            title_filter: None,
        };
        let summary = scrape_run(
            &Config::default(),
            &registry,
            &catalog_path,
            &options,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.sites, 1);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.failed, 0);
        assert!(options.output_dir.join("Solaris_Stanislaw_Lem.epub").exists());

        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.downloads, 1);
        assert_eq!(site.scrapes, 1);
    }

    #[tokio::test]
    async fn test_scrape_run_isolates_failed_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get/EPUB/1/main"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/epub+zip")
                    .set_body_bytes(b"book".to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get/EPUB/2/main"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = RegistryStore::open_in_memory().await.unwrap();
        let crate::store::registry::RegisterOutcome::Added(uuid) =
            registry.register_url(&server.uri(), None).await.unwrap()
        else {
            panic!("expected Added");
        };
        registry.record_online(&uuid, 2, 1).await.unwrap();
        registry.enable(&uuid).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("index.db");
        let catalog = CatalogStore::open(&catalog_path).await.unwrap();
        catalog
            .upsert_entries(
                &[
                    entry(
                        "u1",
                        vec![link(&format!("{}/get/EPUB/1/main", server.uri()), "EPUB")],
                    ),
                    entry(
                        "u2",
                        vec![link(&format!("{}/get/EPUB/2/main", server.uri()), "EPUB")],
                    ),
                ],
                "site-a",
            )
            .await
            .unwrap();
        catalog.close().await;

        let options = ScrapeOptions {
            extension: "epub".to_string(),
            output_dir: dir.path().join("out"),
            author_filter: None,
            title_filter: None,
        };
        let summary = scrape_run(
            &Config::default(),
            &registry,
            &catalog_path,
            &options,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.failed, 1);

        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.downloads, 1);
    }
}
