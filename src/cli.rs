//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Discover, crawl and catalog open web e-book servers.
///
/// Openshelf keeps a registry of discovered servers, checks their health,
/// crawls their metadata into per-site stores, merges everything into a
/// searchable catalog, and can bulk-download files from it.
#[derive(Parser, Debug)]
#[command(name = "openshelf")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding the registry, site stores, and catalog
    #[arg(short = 'd', long, default_value = ".", global = true)]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register candidate server URLs from a file ("-" for stdin)
    Import {
        /// File with one URL per line
        file: PathBuf,

        /// Country code recorded on every imported site
        #[arg(short, long)]
        country: Option<String>,
    },

    /// Probe every registered site and update its status
    Check,

    /// Crawl every enabled, online site into its own store
    Crawl {
        /// Crawl only the site registered under this URL
        #[arg(short, long)]
        site: Option<String>,
    },

    /// Merge the site stores into the searchable catalog
    BuildIndex {
        /// Keep only this ISO 639-2/B language
        #[arg(short, long, conflicts_with = "exclude_language")]
        language: Option<String>,

        /// Drop this ISO 639-2/B language
        #[arg(short = 'x', long)]
        exclude_language: Option<String>,
    },

    /// Full-text search over the catalog
    Search {
        /// FTS5 match expression
        query: String,
    },

    /// Compare two catalog snapshots and record what moved or appeared
    Diff {
        /// Older catalog snapshot
        old: PathBuf,

        /// Newer catalog snapshot
        new: PathBuf,

        /// Output store (defaults to diff.db in the data directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the catalog to stdout as one JSON object per line
    ExportJson,

    /// Per-format statistics across all site stores
    Stats,

    /// Manage which sites participate in crawling and scraping
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },

    /// Bulk file downloads from cataloged sites
    Scrape {
        #[command(subcommand)]
        command: ScrapeCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostCommand {
    /// Register one or more server URLs
    Add {
        /// Server URLs
        urls: Vec<String>,

        /// Country code recorded on the new sites
        #[arg(short, long)]
        country: Option<String>,
    },

    /// Remove a site from the registry
    Rm {
        /// Site uuid
        uuid: String,
    },

    /// Enable crawling/scraping for a site, or every online site
    Enable {
        /// Site uuid
        uuid: Option<String>,

        /// Enable every site currently online
        #[arg(long)]
        all: bool,
    },

    /// Disable crawling/scraping for a site, or every active site
    Disable {
        /// Site uuid
        uuid: Option<String>,

        /// Disable every active site
        #[arg(long)]
        all: bool,
    },

    /// List registered sites
    List {
        /// Include sites that are not active
        #[arg(long)]
        all: bool,
    },

    /// Show one site's counters
    Stats {
        /// Site uuid
        uuid: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScrapeCommand {
    /// Download files from every enabled, online site
    Run {
        /// Extension to download, or "all" for every format
        #[arg(short, long, default_value = "all")]
        extension: String,

        /// Directory downloads land in
        #[arg(short, long, default_value = "downloads")]
        output_dir: PathBuf,

        /// Only books whose author list contains this text
        #[arg(short, long)]
        author: Option<String>,

        /// Only books whose title contains this text
        #[arg(short, long)]
        title: Option<String>,
    },
}
