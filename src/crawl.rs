//! Crawl orchestration: sources in a fixed order, links one at a time,
//! every per-link failure contained at the link.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::Store;
use crate::fetch::{fetch_with_retry, FetchError, FetchOptions, FetchSession, PageFetcher};
use crate::models::{CrawlReport, SourceReport};
use crate::reconcile::Reconciler;
use crate::scraping::SourceDriver;

/// Records not seen in this many successful listing crawls go inactive.
pub const STALE_AFTER_RUNS: usize = 3;
/// An unfinished run older than this no longer blocks new runs.
pub const RUN_LOCK_EXPIRY_HOURS: i64 = 2;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("browser session could not start: {0}")]
    Launch(#[source] FetchError),
    #[error("event store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("another crawl run is already in progress")]
    RunInProgress,
    #[error("unknown source id: {0}")]
    UnknownSource(String),
}

enum LinkOutcome {
    Created,
    Updated,
    Skipped,
    Failed,
}

pub struct Crawler {
    store: Arc<Store>,
    sources: Vec<Box<dyn SourceDriver>>,
    run_id: Option<i64>,
}

impl Crawler {
    pub fn new(store: Arc<Store>, sources: Vec<Box<dyn SourceDriver>>) -> Self {
        Self {
            store,
            sources,
            run_id: None,
        }
    }

    /// Attributes sightings to `run_id`, which enables the staleness sweep.
    pub fn with_run(mut self, run_id: i64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub async fn run(&self, fetcher: &dyn PageFetcher, cancel: &CancellationToken) -> CrawlReport {
        let mut report = CrawlReport {
            run_id: self.run_id,
            started_at: Some(Utc::now()),
            ..CrawlReport::default()
        };

        for source in &self.sources {
            if cancel.is_cancelled() {
                break;
            }
            let source_report = self.crawl_source(source.as_ref(), fetcher, cancel).await;
            report.absorb(source_report);
        }

        report.cancelled = cancel.is_cancelled();
        report.finished_at = Some(Utc::now());
        info!(
            "crawl finished: visited={} succeeded={} failed={} skipped={} created={} updated={} inactive={} cancelled={}",
            report.visited,
            report.succeeded,
            report.failed,
            report.skipped,
            report.created,
            report.updated,
            report.marked_inactive,
            report.cancelled
        );
        report
    }

    async fn crawl_source(
        &self,
        source: &dyn SourceDriver,
        fetcher: &dyn PageFetcher,
        cancel: &CancellationToken,
    ) -> SourceReport {
        let mut report = SourceReport {
            source_id: source.source_id().to_string(),
            ..SourceReport::default()
        };
        let listing_url = source.listing_url();
        info!("crawling {} ({listing_url})", source.source_name());

        let options = FetchOptions::listing();
        let listing_fetch = fetch_with_retry(fetcher, listing_url, &options);
        let listing_html = match until_cancelled(cancel, listing_fetch).await {
            None => return report,
            Some(Ok(html)) => html,
            Some(Err(err)) => {
                warn!("listing for {} failed: {err}", source.source_id());
                report.listing_error = Some(err.to_string());
                return report;
            }
        };

        let mut links = source.discover_links(&listing_html);
        report.links_found = links.len();
        if let Some(run_id) = self.run_id {
            if let Err(err) = self.store.mark_seen(&links, run_id) {
                warn!("could not stamp sightings for {}: {err}", source.source_id());
            }
        }
        let cap = source.link_cap();
        if links.len() > cap {
            info!(
                "{}: visiting first {cap} of {} links",
                source.source_id(),
                links.len()
            );
            links.truncate(cap);
        }

        let reconciler = match self.run_id {
            Some(run_id) => Reconciler::for_run(self.store.clone(), run_id),
            None => Reconciler::new(self.store.clone()),
        };
        let delay = source.delay();

        for (index, link) in links.iter().enumerate() {
            if index > 0 {
                let pause = delay.next_delay();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = sleep(pause) => {}
                }
            }
            if cancel.is_cancelled() {
                info!(
                    "{}: cancelled with {} links left",
                    source.source_id(),
                    links.len() - index
                );
                break;
            }

            let outcome = process_link(source, fetcher, &reconciler, link, cancel).await;
            let Some(outcome) = outcome else {
                break;
            };
            report.visited += 1;
            match outcome {
                LinkOutcome::Created => {
                    report.succeeded += 1;
                    report.created += 1;
                }
                LinkOutcome::Updated => {
                    report.succeeded += 1;
                    report.updated += 1;
                }
                LinkOutcome::Skipped => report.skipped += 1,
                LinkOutcome::Failed => report.failed += 1,
            }
        }

        if let Some(run_id) = self.run_id {
            self.sweep(source, run_id, &mut report);
        }

        info!(
            "{}: {} links, {} ok, {} failed, {} skipped",
            source.source_id(),
            report.links_found,
            report.succeeded,
            report.failed,
            report.skipped
        );
        report
    }

    /// An empty listing (bot challenge, redesign, blank render) says nothing
    /// about which events vanished, so it neither counts as a listing crawl
    /// nor triggers the sweep.
    fn sweep(&self, source: &dyn SourceDriver, run_id: i64, report: &mut SourceReport) {
        if report.links_found == 0 {
            warn!(
                "{}: listing yielded no links, skipping staleness sweep",
                source.source_id()
            );
            return;
        }
        let name = source.source_name();
        if let Err(err) = self.store.record_source_run(run_id, name, report.links_found) {
            warn!("could not record listing crawl for {}: {err}", source.source_id());
            return;
        }
        match self
            .store
            .mark_stale_inactive(name, STALE_AFTER_RUNS, Utc::now())
        {
            Ok(0) => {}
            Ok(count) => {
                info!("{}: marked {count} events inactive", source.source_id());
                report.marked_inactive = count;
            }
            Err(err) => warn!("staleness sweep for {} failed: {err}", source.source_id()),
        }
    }
}

/// `None` when the run was cancelled before the link finished.
async fn process_link(
    source: &dyn SourceDriver,
    fetcher: &dyn PageFetcher,
    reconciler: &Reconciler,
    link: &str,
    cancel: &CancellationToken,
) -> Option<LinkOutcome> {
    let options = FetchOptions::detail();
    let detail_fetch = fetch_with_retry(fetcher, link, &options);
    let html = match until_cancelled(cancel, detail_fetch).await? {
        Ok(html) => html,
        Err(err) => {
            error!("skipping {link}: {err}");
            return Some(LinkOutcome::Failed);
        }
    };

    let Some(event) = source.extract_event(&html, link) else {
        info!("no title found on {link}, skipping");
        return Some(LinkOutcome::Skipped);
    };

    let outcome = match reconciler.reconcile(&event) {
        Ok(reconciled) if reconciled.created => LinkOutcome::Created,
        Ok(_) => LinkOutcome::Updated,
        Err(err) => {
            error!("failed to store {link}: {err}");
            LinkOutcome::Failed
        }
    };
    Some(outcome)
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = work => Some(output),
    }
}

/// One locked, logged run: takes the run lock, opens a session via `launch`,
/// crawls `sources`, closes the session and records the outcome.
pub async fn run_locked<S, L, Fut>(
    store: Arc<Store>,
    sources: Vec<Box<dyn SourceDriver>>,
    cancel: &CancellationToken,
    launch: L,
) -> Result<CrawlReport, CrawlError>
where
    S: FetchSession,
    L: FnOnce() -> Fut,
    Fut: Future<Output = Result<S, FetchError>>,
{
    let run_id = store
        .begin_run(Utc::now(), chrono::Duration::hours(RUN_LOCK_EXPIRY_HOURS))?
        .ok_or(CrawlError::RunInProgress)?;
    info!("crawl run {run_id} started");

    let session = match launch().await {
        Ok(session) => session,
        Err(err) => {
            error!("crawl run {run_id} aborted: {err}");
            let message = err.to_string();
            if let Err(store_err) = store.finish_run(run_id, None, Some(&message), Utc::now()) {
                warn!("could not close run {run_id}: {store_err}");
            }
            return Err(CrawlError::Launch(err));
        }
    };

    let crawler = Crawler::new(store.clone(), sources).with_run(run_id);
    let report = crawler.run(&session, cancel).await;
    session.close().await;

    store.finish_run(run_id, Some(&report), None, Utc::now())?;
    Ok(report)
}
