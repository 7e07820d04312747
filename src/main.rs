//! CLI entry point for the openshelf tool.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use openshelf_core::acquire::{self, ScrapeOptions};
use openshelf_core::index::{self, LanguageFilter};
use openshelf_core::store::catalog::CatalogStore;
use openshelf_core::store::registry::{RegisterOutcome, RegistryStore, canonicalize_url};
use openshelf_core::{CancelToken, Config, crawler, diff, health, stats};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command, HostCommand, ScrapeCommand};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("cannot create data directory {}", args.data_dir.display()))?;

    let config = Config::default();
    let registry = RegistryStore::open(&args.data_dir.join("sites.db"))
        .await
        .context("cannot open site registry")?;

    // First Ctrl-C requests a graceful stop; in-flight requests complete.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Command::Import { file, country } => {
            let text = read_input(&file)?;
            let summary = registry.import_urls(&text, country.as_deref()).await?;
            info!(
                added = summary.added,
                known = summary.known,
                invalid = summary.invalid,
                "import complete"
            );
        }

        Command::Check => {
            let summary = health::check_all(&config, &registry, &cancel).await?;
            info!(
                checked = summary.checked,
                online = summary.online,
                evicted = summary.evicted,
                "check complete"
            );
        }

        Command::Crawl { site: None } => {
            let summary = crawler::crawl_all(&config, &registry, &args.data_dir, &cancel).await?;
            info!(
                sites = summary.sites,
                failed = summary.failed,
                books = summary.books,
                "crawl complete"
            );
        }

        Command::Crawl { site: Some(url) } => {
            let Some((canonical, _, _)) = canonicalize_url(&url) else {
                bail!("malformed site URL: {url}");
            };
            let sites = registry.list_all().await?;
            let Some(site) = sites.iter().find(|s| s.url == canonical) else {
                bail!("no registered site with URL {canonical}");
            };
            let client = openshelf_core::crawler::protocol::CatalogClient::new(
                openshelf_core::http::build_client(config.fetch_timeout)?,
            );
            let summary =
                crawler::crawl_site(&config, &client, &registry, &args.data_dir, site).await?;
            info!(
                libraries = summary.libraries,
                books = summary.books,
                "site crawl complete"
            );
        }

        Command::BuildIndex {
            language,
            exclude_language,
        } => {
            let filter = match (language, exclude_language) {
                (Some(code), _) => LanguageFilter::Only(code),
                (None, Some(code)) => LanguageFilter::Exclude(code),
                (None, None) => LanguageFilter::Any,
            };
            let summary = index::build_catalog(&args.data_dir, &filter).await?;
            info!(
                sites = summary.sites,
                entries = summary.entries,
                collisions = summary.collisions,
                "catalog build complete"
            );
        }

        Command::Search { query } => {
            let catalog = open_catalog(&args.data_dir).await?;
            let hits = catalog.search(&query).await?;
            for hit in &hits {
                println!(
                    "{} | {} | {} | {}",
                    hit.title.label,
                    hit.authors.join(", "),
                    hit.language,
                    hit.title.href
                );
            }
            info!(hits = hits.len(), "search complete");
        }

        Command::Diff { old, new, output } => {
            let output = output.unwrap_or_else(|| args.data_dir.join("diff.db"));
            let summary = diff::diff_catalogs(&old, &new, &output).await?;
            info!(moved = summary.moved, new = summary.new, "diff complete");
        }

        Command::ExportJson => {
            let catalog = open_catalog(&args.data_dir).await?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let written = catalog.export_json(&mut out).await?;
            out.flush()?;
            info!(entries = written, "export complete");
        }

        Command::Stats => {
            let fleet = stats::collect_stats(&args.data_dir).await?;
            print!("{}", fleet.render());
        }

        Command::Host { command } => run_host(&registry, command).await?,

        Command::Scrape {
            command:
                ScrapeCommand::Run {
                    extension,
                    output_dir,
                    author,
                    title,
                },
        } => {
            let options = ScrapeOptions {
                extension,
                output_dir,
                author_filter: author,
                title_filter: title,
            };
            let summary = acquire::scrape_run(
                &config,
                &registry,
                &args.data_dir.join("index.db"),
                &options,
                &cancel,
            )
            .await?;
            info!(
                sites = summary.sites,
                downloaded = summary.downloaded,
                skipped = summary.skipped,
                failed = summary.failed,
                "scrape complete"
            );
        }
    }

    Ok(())
}

async fn run_host(registry: &RegistryStore, command: HostCommand) -> Result<()> {
    match command {
        HostCommand::Add { urls, country } => {
            for url in &urls {
                match registry.register_url(url, country.as_deref()).await? {
                    RegisterOutcome::Added(uuid) => println!("{uuid}  {url}"),
                    RegisterOutcome::AlreadyKnown => println!("known  {url}"),
                    RegisterOutcome::Invalid => println!("invalid  {url}"),
                }
            }
        }

        HostCommand::Rm { uuid } => {
            if !registry.remove(&uuid).await? {
                bail!("no site with uuid {uuid}");
            }
            info!(uuid = %uuid, "site removed");
        }

        HostCommand::Enable { uuid, all } => {
            if all {
                let toggled = registry.enable_all_online().await?;
                info!(toggled, "enabled all online sites");
            } else {
                let Some(uuid) = uuid else {
                    bail!("pass a site uuid or --all");
                };
                if !registry.enable(&uuid).await? {
                    bail!("no site with uuid {uuid}");
                }
                info!(uuid = %uuid, "site enabled");
            }
        }

        HostCommand::Disable { uuid, all } => {
            if all {
                let toggled = registry.disable_all().await?;
                info!(toggled, "disabled all active sites");
            } else {
                let Some(uuid) = uuid else {
                    bail!("pass a site uuid or --all");
                };
                if !registry.disable(&uuid).await? {
                    bail!("no site with uuid {uuid}");
                }
                info!(uuid = %uuid, "site disabled");
            }
        }

        HostCommand::Stats { uuid } => {
            let Some(site) = registry.get(&uuid).await? else {
                bail!("no site with uuid {uuid}");
            };
            println!("url             {}", site.url);
            println!("status          {}", site.status().as_str());
            println!("books           {}", site.book_count);
            println!("new books       {}", site.new_books);
            println!("libraries       {}", site.libraries_count);
            println!("failed checks   {}", site.failed_attempts);
            println!("scrapes         {}", site.scrapes);
            println!("downloads       {}", site.downloads);
            println!("last online     {}", site.last_online.as_deref().unwrap_or("never"));
            println!("last scrape     {}", site.last_scrape.as_deref().unwrap_or("never"));
        }

        HostCommand::List { all } => {
            for site in registry.list_all().await? {
                if !all && !site.is_active() {
                    continue;
                }
                println!(
                    "{}  {:<12} {:>8} books  active={}  {}",
                    site.uuid,
                    site.status().as_str(),
                    site.book_count,
                    i32::from(site.is_active()),
                    site.url
                );
            }
        }
    }
    Ok(())
}

async fn open_catalog(data_dir: &Path) -> Result<CatalogStore> {
    let path = data_dir.join("index.db");
    CatalogStore::open(&path)
        .await
        .with_context(|| format!("cannot open catalog {}", path.display()))
}

fn read_input(file: &PathBuf) -> Result<String> {
    if file == &PathBuf::from("-") {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))
    }
}
