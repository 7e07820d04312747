//! Remote catalog wire protocol.
//!
//! E-book servers expose a JSON API under `/ajax/`: `library-info` enumerates
//! libraries, `search` reports the item count and pages through book ids, and
//! `books` returns per-book metadata. Multi-library servers take the library
//! id as a path suffix (`/ajax/search/libname`). The `Server` response header
//! discloses the server generation, which changes the URL shapes the catalog
//! builder emits.

use std::collections::BTreeMap;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Protocol-level errors, separated so callers can classify a site from the
/// failure mode.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connection, TLS, or timeout failure before an HTTP status arrived.
    #[error("transport failure for {url}: {source}")]
    Transport {
        /// Request URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success HTTP status.
    #[error("{url} answered HTTP {status}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// The HTTP status received.
        status: StatusCode,
    },

    /// The server answered 200 with a payload that does not match the
    /// protocol shape.
    #[error("unexpected payload from {url}: {source}")]
    Payload {
        /// Request URL.
        url: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },
}

impl ProtocolError {
    /// Returns the HTTP status, when the failure carried one.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport { .. } | Self::Payload { .. } => None,
        }
    }
}

/// Item count response, with the raw `Server` header when disclosed.
#[derive(Debug, Clone)]
pub struct ItemCount {
    /// Total number of items in the library.
    pub total: i64,
    /// Raw `Server` response header.
    pub server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LibraryInfoResponse {
    #[serde(default)]
    library_map: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    total_num: i64,
    #[serde(default)]
    book_ids: Vec<i64>,
}

/// Per-format metadata; only the size is consumed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatMetadata {
    /// Byte size of the file, when disclosed.
    #[serde(default)]
    pub size: Option<f64>,
}

/// One book as the remote server reports it. Every field is lenient: remote
/// metadata is user-entered and frequently absent or malformed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteBook {
    /// Book uuid; books without one are unusable and skipped.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Title.
    #[serde(default)]
    pub title: Option<String>,
    /// Author list.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Series name.
    #[serde(default)]
    pub series: Option<String>,
    /// Position within the series.
    #[serde(default)]
    pub series_index: Option<f64>,
    /// Free-text description.
    #[serde(default)]
    pub comments: Option<String>,
    /// External identifiers.
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Publisher name.
    #[serde(default)]
    pub publisher: Option<String>,
    /// Publication date.
    #[serde(default)]
    pub pubdate: Option<String>,
    /// Declared language tags.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Cover path; presence signals a cover exists.
    #[serde(default)]
    pub cover: Option<String>,
    /// Remote last-modified timestamp.
    #[serde(default)]
    pub last_modified: Option<String>,
    /// Remote ingestion timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Available format names.
    #[serde(default)]
    pub formats: Vec<String>,
    /// Per-format metadata keyed by format name.
    #[serde(default)]
    pub format_metadata: BTreeMap<String, FormatMetadata>,
}

/// Parses the major server generation from a raw `Server` header, e.g.
/// `calibre/3.39.1` or `calibre 2.85`.
#[must_use]
pub fn parse_major_version(server: &str) -> Option<i64> {
    server
        .chars()
        .find(char::is_ascii_digit)
        .and_then(|c| c.to_digit(10))
        .map(i64::from)
}

fn endpoint(base: &str, path: &str, library: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match library {
        Some(lib) if !lib.is_empty() => format!("{base}/ajax/{path}/{lib}"),
        _ => format!("{base}/ajax/{path}"),
    }
}

/// JSON API client over a shared HTTP client.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
}

impl CatalogClient {
    /// Wraps an already-configured HTTP client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<(T, Option<String>), ProtocolError> {
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|source| ProtocolError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProtocolError::HttpStatus { url, status });
        }

        let server = response
            .headers()
            .get(reqwest::header::SERVER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let payload = response
            .json()
            .await
            .map_err(|source| ProtocolError::Payload { url, source })?;
        Ok((payload, server))
    }

    /// Enumerates the server's libraries as id-to-display-name pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on transport, HTTP, or payload failure.
    #[instrument(skip(self))]
    pub async fn library_map(
        &self,
        base: &str,
    ) -> Result<BTreeMap<String, String>, ProtocolError> {
        let url = endpoint(base, "library-info", None);
        let (info, _): (LibraryInfoResponse, _) = self.get_json(url, &[]).await?;
        debug!(libraries = info.library_map.len(), "enumerated libraries");
        Ok(info.library_map)
    }

    /// Retrieves the item count for one library (`num=0` search).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on transport, HTTP, or payload failure.
    #[instrument(skip(self))]
    pub async fn item_count(
        &self,
        base: &str,
        library: Option<&str>,
    ) -> Result<ItemCount, ProtocolError> {
        let url = endpoint(base, "search", library);
        let (search, server): (SearchResponse, _) =
            self.get_json(url, &[("num", "0".to_string())]).await?;
        Ok(ItemCount {
            total: search.total_num,
            server,
        })
    }

    /// Fetches one page of book ids, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on transport, HTTP, or payload failure.
    #[instrument(skip(self))]
    pub async fn page_ids(
        &self,
        base: &str,
        library: Option<&str>,
        offset: i64,
        num: i64,
    ) -> Result<Vec<i64>, ProtocolError> {
        let url = endpoint(base, "search", library);
        let query = [
            ("num", num.to_string()),
            ("offset", offset.to_string()),
            ("sort", "timestamp".to_string()),
            ("sort_order", "desc".to_string()),
        ];
        let (search, _): (SearchResponse, _) = self.get_json(url, &query).await?;
        Ok(search.book_ids)
    }

    /// Fetches metadata for a batch of book ids, keyed by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on transport, HTTP, or payload failure.
    #[instrument(skip(self, ids), fields(batch = ids.len()))]
    pub async fn book_details(
        &self,
        base: &str,
        library: Option<&str>,
        ids: &[i64],
    ) -> Result<BTreeMap<String, RemoteBook>, ProtocolError> {
        let url = endpoint(base, "books", library);
        let joined = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let (books, _): (BTreeMap<String, RemoteBook>, _) =
            self.get_json(url, &[("ids", joined)]).await?;
        Ok(books)
    }
}
