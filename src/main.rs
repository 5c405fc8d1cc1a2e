use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_scrape_lib::config::AppConfig;
use event_scrape_lib::db::{EventFilter, Store};
use event_scrape_lib::models::{CrawlReport, EventRecord, EventStatus};
use event_scrape_lib::scheduler::{Scheduler, DEFAULT_PERIOD};
use event_scrape_lib::scraping;

#[derive(Parser)]
#[command(name = "event-scrape")]
#[command(about = "Crawl event listing sites into a local event store")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawl now
    Crawl {
        /// Only crawl this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Crawl periodically until interrupted
    Schedule {
        #[arg(long, default_value_t = DEFAULT_PERIOD.as_secs() / 60)]
        interval_mins: u64,
    },

    /// List configured sources
    Sources,

    /// List stored events, most recently scraped first
    List {
        #[arg(long)]
        status: Option<EventStatus>,
        /// Substring match on city
        #[arg(long)]
        city: Option<String>,
        /// Substring match on title, venue or description
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark an event as imported by a curator
    Import {
        /// The event's original URL
        url: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "event_scrape_lib=debug,event_scrape=debug"
    } else {
        "event_scrape_lib=info,event_scrape=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Crawl { source } => crawl(&config, source.as_deref()).await,
        Commands::Schedule { interval_mins } => schedule(config, interval_mins).await,
        Commands::Sources => {
            for source in scraping::list_sources() {
                println!("{:<16} {:<18} {}", source.id, source.name, source.url);
            }
            Ok(())
        }
        Commands::List {
            status,
            city,
            keyword,
            limit,
            json,
        } => {
            let store = Store::open(&config.database_location()).context("failed to open store")?;
            let filter = EventFilter {
                status,
                city,
                keyword,
                limit: Some(limit),
                ..EventFilter::default()
            };
            let events = store.list_events(&filter).context("failed to list events")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                print_events(&events);
            }
            Ok(())
        }
        Commands::Import { url, by, notes } => {
            let store = Store::open(&config.database_location()).context("failed to open store")?;
            match store
                .mark_imported(&url, &by, notes.as_deref(), Utc::now())
                .context("failed to mark event imported")?
            {
                Some(record) => {
                    println!("imported {} ({})", record.title, record.original_url);
                    Ok(())
                }
                None => bail!("no event stored for {url}"),
            }
        }
    }
}

async fn crawl(config: &AppConfig, source: Option<&str>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = match source {
        Some(id) => event_scrape_lib::run_crawl_source(config, id, &cancel).await,
        None => event_scrape_lib::run_crawl(config, &cancel).await,
    }
    .context("crawl failed")?;

    print_report(&report);
    Ok(())
}

async fn schedule(config: AppConfig, interval_mins: u64) -> anyhow::Result<()> {
    if interval_mins == 0 {
        bail!("--interval-mins must be at least 1");
    }
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let scheduler = Scheduler::new(config, Duration::from_secs(interval_mins * 60));
    scheduler.run_until(shutdown).await;
    Ok(())
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, finishing current page");
                token.cancel();
            }
            Err(err) => warn!("could not listen for ctrl-c: {err}"),
        }
    });
}

fn print_report(report: &CrawlReport) {
    for source in &report.sources {
        match source.listing_error.as_deref() {
            Some(err) => println!("{:<16} listing failed: {err}", source.source_id),
            None => println!(
                "{:<16} links={} ok={} new={} updated={} failed={} skipped={} inactive={}",
                source.source_id,
                source.links_found,
                source.succeeded,
                source.created,
                source.updated,
                source.failed,
                source.skipped,
                source.marked_inactive
            ),
        }
    }
    println!(
        "visited={} succeeded={} failed={}{}",
        report.visited,
        report.succeeded,
        report.failed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

fn print_events(events: &[EventRecord]) {
    for event in events {
        println!(
            "{:<9} {:<20} {:<40} {}",
            event.status.as_str(),
            event.date.as_deref().unwrap_or("-"),
            event.title,
            event.original_url
        );
    }
}
