//! Site health checking.
//!
//! A check probes the catalog API and classifies the site: `online` when the
//! item count is retrievable, `unauthorized` on HTTP 401, `down` on transport
//! failures or other HTTP errors, `error` when the server answers with an
//! unexpected payload, and `unknown` when it is reachable but enumerates zero
//! libraries. Checks run across the whole registry on a wide bounded pool;
//! classifications feed the registry's failure counters and eviction policy.

use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::crawler::protocol::{CatalogClient, ProtocolError};
use crate::http::{HttpError, build_client};
use crate::store::registry::{RegistryStore, Site, SiteStatus};
use crate::store::StoreError;

/// Health check errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    /// The HTTP client could not be constructed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A registry operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of probing one site.
#[derive(Debug, Clone)]
pub struct HealthResult {
    /// Registry uuid of the probed site.
    pub uuid: String,
    /// Classification.
    pub status: SiteStatus,
    /// Item count, when retrievable.
    pub total_books: Option<i64>,
    /// Number of enumerated libraries, when retrievable.
    pub libraries_count: Option<i64>,
    /// Error context for non-online classifications.
    pub error: Option<String>,
}

/// Aggregate counters from a registry-wide check pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckSummary {
    /// Sites probed.
    pub checked: usize,
    /// Sites classified online.
    pub online: usize,
    /// Sites purged for reaching the failure threshold.
    pub evicted: usize,
}

fn classify_failure(uuid: &str, err: &ProtocolError) -> HealthResult {
    let status = match err.status() {
        Some(StatusCode::UNAUTHORIZED) => SiteStatus::Unauthorized,
        Some(_) => SiteStatus::Down,
        None => match err {
            ProtocolError::Payload { .. } => SiteStatus::Error,
            _ => SiteStatus::Down,
        },
    };
    HealthResult {
        uuid: uuid.to_string(),
        status,
        total_books: None,
        libraries_count: None,
        error: Some(err.to_string()),
    }
}

/// Probes one site and classifies it. Never fails: every outcome is a
/// classification.
#[instrument(skip(client, site), fields(url = %site.url))]
pub async fn check_site(client: &CatalogClient, site: &Site) -> HealthResult {
    let count = match client.item_count(&site.url, None).await {
        Ok(count) => count,
        Err(err) => return classify_failure(&site.uuid, &err),
    };

    // The count already proved the catalog reachable. Pre-multi-library
    // servers have no library-info endpoint at all, so a 404 there means a
    // single unnamed library, not a failure.
    match client.library_map(&site.url).await {
        Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => HealthResult {
            uuid: site.uuid.clone(),
            status: SiteStatus::Online,
            total_books: Some(count.total),
            libraries_count: Some(1),
            error: None,
        },
        Ok(map) if map.is_empty() => HealthResult {
            uuid: site.uuid.clone(),
            status: SiteStatus::Unknown,
            total_books: Some(count.total),
            libraries_count: Some(0),
            error: Some("no enumerable libraries".to_string()),
        },
        Ok(map) => HealthResult {
            uuid: site.uuid.clone(),
            status: SiteStatus::Online,
            total_books: Some(count.total),
            libraries_count: Some(i64::try_from(map.len()).unwrap_or(i64::MAX)),
            error: None,
        },
        Err(err) => classify_failure(&site.uuid, &err),
    }
}

/// Applies a classification to the registry: successes reset the failure
/// counter and update counts, failures increment it and may evict the site.
///
/// Returns `true` when the site was evicted.
///
/// # Errors
///
/// Returns [`HealthError::Store`] on a registry failure.
pub async fn apply_result(
    registry: &RegistryStore,
    result: &HealthResult,
    max_failures: u32,
) -> Result<bool, HealthError> {
    if result.status == SiteStatus::Online {
        registry
            .record_online(
                &result.uuid,
                result.total_books.unwrap_or(0),
                result.libraries_count.unwrap_or(0),
            )
            .await?;
        Ok(false)
    } else {
        let evicted = registry
            .record_failure(
                &result.uuid,
                result.status,
                result.error.as_deref(),
                max_failures,
            )
            .await?;
        Ok(evicted)
    }
}

/// Checks every registered site on a bounded concurrent pool.
///
/// Cancellation is consulted before each site; in-flight probes complete.
///
/// # Errors
///
/// Returns [`HealthError`] when the HTTP client cannot be built or the
/// registry cannot be read. Individual probe failures are classifications,
/// not errors.
#[instrument(skip_all)]
pub async fn check_all(
    config: &Config,
    registry: &RegistryStore,
    cancel: &CancelToken,
) -> Result<CheckSummary, HealthError> {
    let client = CatalogClient::new(build_client(config.check_timeout)?);
    let sites = registry.list_all().await?;
    let semaphore = Arc::new(Semaphore::new(config.check_pool));

    let mut handles = Vec::with_capacity(sites.len());
    for site in sites {
        if cancel.is_cancelled() {
            info!("check pass cancelled");
            break;
        }
        let semaphore = Arc::clone(&semaphore);
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            // Closed only on runtime shutdown; treat as a skipped probe.
            let Ok(_permit) = semaphore.acquire().await else {
                return None;
            };
            Some(check_site(&client, &site).await)
        }));
    }

    let mut summary = CheckSummary::default();
    for handle in handles {
        let Ok(Some(result)) = handle.await else {
            continue;
        };
        summary.checked += 1;
        if result.status == SiteStatus::Online {
            summary.online += 1;
        }
        if apply_result(registry, &result, config.max_failures).await? {
            summary.evicted += 1;
        }
        if result.status != SiteStatus::Online {
            warn!(
                uuid = %result.uuid,
                status = %result.status,
                error = result.error.as_deref().unwrap_or(""),
                "site not online"
            );
        }
    }
    info!(
        checked = summary.checked,
        online = summary.online,
        evicted = summary.evicted,
        "check pass complete"
    );
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::store::registry::RegisterOutcome;

    fn site_for(url: &str) -> Site {
        Site {
            uuid: "test-uuid".to_string(),
            url: url.trim_end_matches('/').to_string(),
            hostnames: "[]".to_string(),
            ports: "[]".to_string(),
            country: None,
            isp: None,
            status_str: "unknown".to_string(),
            error: None,
            book_count: 0,
            last_book_count: 0,
            new_books: 0,
            libraries_count: 0,
            failed_attempts: 0,
            last_check: None,
            last_online: None,
            last_failed: None,
            last_success: None,
            scrapes: 0,
            downloads: 0,
            last_scrape: None,
            last_download: None,
            active: 0,
        }
    }

    fn client() -> CatalogClient {
        CatalogClient::new(
            crate::http::build_client(std::time::Duration::from_secs(5)).unwrap(),
        )
    }

    async fn mock_online_server(total: i64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"total_num": total, "book_ids": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ajax/library-info"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"library_map": {"main": "Main"}})),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_check_site_online_when_count_retrievable() {
        let server = mock_online_server(42).await;
        let result = check_site(&client(), &site_for(&server.uri())).await;
        assert_eq!(result.status, SiteStatus::Online);
        assert_eq!(result.total_books, Some(42));
        assert_eq!(result.libraries_count, Some(1));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_check_site_online_when_library_info_missing() {
        // Pre-multi-library servers answer the count but 404 library-info.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"total_num": 42, "book_ids": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ajax/library-info"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = check_site(&client(), &site_for(&server.uri())).await;
        assert_eq!(result.status, SiteStatus::Online);
        assert_eq!(result.total_books, Some(42));
        assert_eq!(result.libraries_count, Some(1));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_check_site_unauthorized_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/search"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = check_site(&client(), &site_for(&server.uri())).await;
        assert_eq!(result.status, SiteStatus::Unauthorized);
    }

    #[tokio::test]
    async fn test_check_site_down_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = check_site(&client(), &site_for(&server.uri())).await;
        assert_eq!(result.status, SiteStatus::Down);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_check_site_down_on_transport_failure() {
        // Nothing listens on this address.
        let result = check_site(&client(), &site_for("http://127.0.0.1:1")).await;
        assert_eq!(result.status, SiteStatus::Down);
    }

    #[tokio::test]
    async fn test_check_site_error_on_bad_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .mount(&server)
            .await;

        let result = check_site(&client(), &site_for(&server.uri())).await;
        assert_eq!(result.status, SiteStatus::Error);
    }

    #[tokio::test]
    async fn test_check_site_unknown_with_zero_libraries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ajax/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"total_num": 5, "book_ids": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ajax/library-info"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"library_map": {}})),
            )
            .mount(&server)
            .await;

        let result = check_site(&client(), &site_for(&server.uri())).await;
        assert_eq!(result.status, SiteStatus::Unknown);
        assert_eq!(result.libraries_count, Some(0));
    }

    #[tokio::test]
    async fn test_check_all_updates_registry() {
        let server = mock_online_server(10).await;
        let registry = RegistryStore::open_in_memory().await.unwrap();
        let RegisterOutcome::Added(uuid) =
            registry.register_url(&server.uri(), None).await.unwrap()
        else {
            panic!("expected Added");
        };

        let config = Config::default();
        let summary = check_all(&config, &registry, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.online, 1);
        assert_eq!(summary.evicted, 0);

        let site = registry.get(&uuid).await.unwrap().unwrap();
        assert_eq!(site.status(), SiteStatus::Online);
        assert_eq!(site.book_count, 10);
    }
}
