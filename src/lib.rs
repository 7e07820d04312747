//! Openshelf Core Library
//!
//! This library discovers, crawls, and catalogs e-book libraries exposed by
//! open web-based e-book servers, building a searchable, deduplicated catalog
//! and a bounded, retryable download pipeline.
//!
//! # Architecture
//!
//! - [`store`] - SQLite-backed stores (registry, per-site, catalog, diff)
//! - [`health`] - Site health checks with failure-based eviction
//! - [`crawler`] - Paginated per-site metadata harvester
//! - [`index`] - Catalog builder merging per-site stores with full-text search
//! - [`diff`] - Snapshot comparison (moved/new entries)
//! - [`acquire`] - Concurrent download pipeline with extension inference
//! - [`normalize`] - Transliteration and language classification

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acquire;
pub mod cancel;
pub mod config;
pub mod crawler;
pub mod diff;
pub mod health;
pub mod http;
pub mod index;
pub mod normalize;
pub mod stats;
pub mod store;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::Config;
pub use store::registry::{RegistryStore, Site, SiteStatus};
pub use store::site::{BookRecord, SiteStore};
pub use store::catalog::{CatalogEntry, CatalogStore};
pub use store::{Store, StoreError};
