pub mod config;
pub mod crawl;
pub mod db;
pub mod fetch;
pub mod models;
pub mod reconcile;
pub mod scheduler;
pub mod scraping;
mod utils;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config::AppConfig;
use crawl::CrawlError;
use db::Store;
use fetch::BrowserSession;
use models::CrawlReport;
use scraping::SourceDriver;

/// One full crawl over every configured source. Safe to call repeatedly; a
/// call that overlaps a run in progress fails with `RunInProgress`.
pub async fn run_crawl(
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<CrawlReport, CrawlError> {
    crawl_sources(config, scraping::active_sources(), cancel).await
}

pub async fn run_crawl_source(
    config: &AppConfig,
    source_id: &str,
    cancel: &CancellationToken,
) -> Result<CrawlReport, CrawlError> {
    let source = scraping::find_source(source_id)
        .ok_or_else(|| CrawlError::UnknownSource(source_id.to_string()))?;
    crawl_sources(config, vec![source], cancel).await
}

async fn crawl_sources(
    config: &AppConfig,
    sources: Vec<Box<dyn SourceDriver>>,
    cancel: &CancellationToken,
) -> Result<CrawlReport, CrawlError> {
    let store = Arc::new(Store::open(&config.database_location())?);
    crawl::run_locked(store, sources, cancel, || BrowserSession::launch(config)).await
}
