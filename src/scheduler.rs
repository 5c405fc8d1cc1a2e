use std::sync::Arc;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::crawl::CrawlError;
use crate::models::CrawlReport;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(9 * 60);

type CrawlJob =
    Arc<dyn Fn(CancellationToken) -> LocalBoxFuture<'static, Result<CrawlReport, CrawlError>>>;

/// Runs a full crawl every `period`; a trigger that arrives while a crawl is
/// still going is dropped, not queued.
pub struct Scheduler {
    period: Duration,
    job: CrawlJob,
    running: Mutex<()>,
}

impl Scheduler {
    pub fn new(config: AppConfig, period: Duration) -> Self {
        let config = Arc::new(config);
        Self::with_job(period, move |cancel| {
            let config = config.clone();
            async move { crate::run_crawl(&config, &cancel).await }.boxed_local()
        })
    }

    pub fn with_job<F>(period: Duration, job: F) -> Self
    where
        F: Fn(CancellationToken) -> LocalBoxFuture<'static, Result<CrawlReport, CrawlError>>
            + 'static,
    {
        Self {
            period,
            job: Arc::new(job),
            running: Mutex::new(()),
        }
    }

    /// Ticks immediately, then every period, until `shutdown` fires. A
    /// shutdown also cancels the crawl in flight.
    pub async fn run_until(&self, shutdown: CancellationToken) {
        info!("scheduler started, period {:?}", self.period);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.trigger(&shutdown).await;
        }
        info!("scheduler stopped");
    }

    /// Runs one crawl now unless one is already in progress here.
    pub async fn trigger(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<Result<CrawlReport, CrawlError>> {
        let Ok(_running) = self.running.try_lock() else {
            info!("crawl still in progress, skipping trigger");
            return None;
        };

        let result = (self.job)(shutdown.child_token()).await;
        match &result {
            Ok(report) => info!(
                "scheduled crawl done: {} ok, {} failed, {} skipped",
                report.succeeded, report.failed, report.skipped
            ),
            Err(CrawlError::RunInProgress) => {
                info!("another process is crawling, waiting for next tick")
            }
            Err(err) => error!("scheduled crawl failed: {err}"),
        }
        Some(result)
    }
}
