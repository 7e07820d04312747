//! Runtime configuration for pool widths, timeouts, and eviction policy.
//!
//! All thresholds that used to be scattered inline live here and are injected
//! at startup, so callers (and tests) can tighten or relax them without
//! touching the engines.

use std::time::Duration;

/// Default health-check read timeout.
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for bulk metadata fetches (large payloads).
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime configuration shared by the health checker, crawler, and
/// acquisition pipeline.
///
/// Pool widths decrease as per-request cost on the remote server increases:
/// health checks are cheap (wide), metadata pages are moderate, and file
/// downloads are expensive (narrow).
#[derive(Debug, Clone)]
pub struct Config {
    /// Consecutive failed checks after which a site is purged from the
    /// registry.
    pub max_failures: u32,
    /// Connect/read timeout for health checks and catalog pages.
    pub check_timeout: Duration,
    /// Read timeout for bulk detail fetches and file downloads.
    pub fetch_timeout: Duration,
    /// Worker-pool width for site health checks.
    pub check_pool: usize,
    /// Worker-pool width for library crawling.
    pub crawl_pool: usize,
    /// Worker-pool width for file downloads.
    pub download_pool: usize,
    /// Page size for catalog enumeration, clamped to 1000 by the crawler.
    pub page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_failures: 5,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            check_pool: 100,
            crawl_pool: 40,
            download_pool: 5,
            page_size: 1000,
        }
    }
}

impl Config {
    /// Returns the effective page size, clamped to the remote protocol's
    /// maximum of 1000 items per page.
    #[must_use]
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, 1000)
    }
}
