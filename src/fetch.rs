//! Page fetching through a single long-lived headless browser session.
//!
//! The crawl works on rendered HTML only; everything that talks to the
//! browser lives here behind [`PageFetcher`] so the rest of the pipeline can
//! be driven by a scripted fetcher in tests.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::AppConfig;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const SETTLE_POLL: Duration = Duration::from_millis(500);

const READY_STATE_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
        }
    })
"#;

/// Scrolls a couple of screens so lazily loaded cards get rendered.
const AUTO_SCROLL_SCRIPT: &str = r#"
    new Promise((resolve) => {
        let total = 0;
        const timer = setInterval(() => {
            window.scrollBy(0, 300);
            total += 300;
            if (total >= 2000) {
                clearInterval(timer);
                resolve(total);
            }
        }, 100);
    })
"#;

const ANCHOR_COUNT_SCRIPT: &str = "document.querySelectorAll('a').length";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("navigation to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("browser session could not start: {0}")]
    Launch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Wait until asynchronously loaded content stops changing.
    NetworkIdle,
    /// Navigate without the scroll and settle pass. The navigate command
    /// itself still waits for the `load` event, so this only saves the
    /// settle time, not the subresource loading.
    DomContentLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub wait: WaitStrategy,
    pub timeout: Duration,
    pub attempts: u32,
}

impl FetchOptions {
    pub const fn listing() -> Self {
        Self {
            wait: WaitStrategy::NetworkIdle,
            timeout: Duration::from_secs(60),
            attempts: 3,
        }
    }

    /// Detail pages are not retried within a run; the next run is the retry.
    pub const fn detail() -> Self {
        Self {
            wait: WaitStrategy::DomContentLoaded,
            timeout: Duration::from_secs(30),
            attempts: 1,
        }
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> Result<String, FetchError>;
}

/// A fetcher holding resources that must be released when the run ends.
/// Dropping without `close` only aborts the background handler.
#[async_trait]
pub trait FetchSession: PageFetcher + Sized {
    async fn close(self);
}

pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    options: &FetchOptions,
) -> Result<String, FetchError> {
    let attempts = options.attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(url, options.wait, options.timeout).await {
            Ok(html) => return Ok(html),
            Err(err) if attempt < attempts => {
                warn!("attempt {attempt}/{attempts} for {url} failed: {err}");
                sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One browser process (or remote attachment) and the single page every
/// navigation of a run goes through.
pub struct BrowserSession {
    browser: Mutex<Browser>,
    page: Mutex<Page>,
    handler: JoinHandle<()>,
    launched: bool,
}

impl BrowserSession {
    pub async fn launch(config: &AppConfig) -> Result<Self, FetchError> {
        let (browser, handler, launched) = match config.browser_url.as_deref() {
            Some(remote) => {
                let (browser, handler) = connect_remote(remote).await?;
                (browser, handler, false)
            }
            None => {
                let (browser, handler) = launch_local(config).await?;
                (browser, handler, true)
            }
        };

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                return Err(FetchError::Launch(format!("failed to open page: {err}")));
            }
        };
        if let Err(err) = page
            .execute(SetUserAgentOverrideParams::new(BROWSER_USER_AGENT.to_string()))
            .await
        {
            warn!("could not override user agent: {err}");
        }

        Ok(Self {
            browser: Mutex::new(browser),
            page: Mutex::new(page),
            handler,
            launched,
        })
    }

    async fn navigate(&self, page: &Page, url: &str, wait: WaitStrategy) -> Result<(), FetchError> {
        let nav_error = |reason: String| FetchError::Navigation {
            url: url.to_string(),
            reason,
        };
        match wait {
            WaitStrategy::DomContentLoaded => {
                let params = NavigateParams::builder()
                    .url(url)
                    .build()
                    .map_err(nav_error)?;
                let response = page
                    .execute(params)
                    .await
                    .map_err(|err| nav_error(err.to_string()))?;
                check_navigation(url, response.result.error_text.as_deref())?;
                page.evaluate(READY_STATE_SCRIPT.to_string())
                    .await
                    .map_err(|err| nav_error(err.to_string()))?;
            }
            WaitStrategy::NetworkIdle => {
                page.goto(url)
                    .await
                    .map_err(|err| nav_error(err.to_string()))?;
                if let Err(err) = page.evaluate(AUTO_SCROLL_SCRIPT.to_string()).await {
                    debug!("auto-scroll skipped for {url}: {err}");
                }
                settle(page).await;
            }
        }
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl FetchSession for BrowserSession {
    async fn close(self) {
        let mut browser = self.browser.lock().await;
        if self.launched {
            if let Err(err) = browser.close().await {
                warn!("browser close failed: {err}");
            }
            if let Err(err) = browser.wait().await {
                debug!("browser wait failed: {err}");
            }
        }
        info!("browser session closed");
    }
}

#[async_trait]
impl PageFetcher for BrowserSession {
    async fn fetch(
        &self,
        url: &str,
        wait: WaitStrategy,
        limit: Duration,
    ) -> Result<String, FetchError> {
        let page = self.page.lock().await;
        debug!("navigating to {url} ({wait:?})");
        let html = timeout(limit, async {
            self.navigate(&page, url, wait).await?;
            page.content().await.map_err(|err| FetchError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })
        })
        .await
        .map_err(|_| FetchError::Timeout {
            url: url.to_string(),
            timeout_secs: limit.as_secs(),
        })??;
        Ok(html)
    }
}

/// Chrome reports network failures in the navigate response and still
/// renders its own error page, which must not be mistaken for content.
fn check_navigation(url: &str, error_text: Option<&str>) -> Result<(), FetchError> {
    match error_text.map(str::trim).filter(|text| !text.is_empty()) {
        Some(reason) => Err(FetchError::Navigation {
            url: url.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Polls the anchor count until two consecutive reads agree. The caller's
/// timeout bounds the whole wait.
async fn settle(page: &Page) {
    let started = Instant::now();
    let mut previous: Option<u64> = None;
    loop {
        sleep(SETTLE_POLL).await;
        let count = match page.evaluate(ANCHOR_COUNT_SCRIPT.to_string()).await {
            Ok(result) => result.into_value::<u64>().ok(),
            Err(err) => {
                debug!("settle script failed: {err}");
                None
            }
        };
        if count.is_some() && count == previous {
            debug!(
                "page settled with {} anchors after {:?}",
                count.unwrap_or_default(),
                started.elapsed()
            );
            return;
        }
        previous = count;
    }
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    })
}

async fn launch_local(
    config: &AppConfig,
) -> Result<(Browser, JoinHandle<()>), FetchError> {
    info!("launching browser (headless={})", config.headless);
    let mut builder = BrowserConfig::builder();
    if let Some(path) = config.chrome_path.as_ref() {
        builder = builder.chrome_executable(path);
    }
    if !config.headless {
        builder = builder.with_head();
    }
    builder = builder
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-gpu")
        .arg("--no-first-run")
        .arg("--no-default-browser-check");

    let browser_config = builder
        .build()
        .map_err(|err| FetchError::Launch(format!("invalid browser config: {err}")))?;
    let (browser, handler) = Browser::launch(browser_config)
        .await
        .map_err(|err| FetchError::Launch(err.to_string()))?;
    Ok((browser, spawn_handler(handler)))
}

async fn connect_remote(url: &str) -> Result<(Browser, JoinHandle<()>), FetchError> {
    info!("connecting to remote browser at {url}");
    let ws_url = if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        let version_url = format!("{}/json/version", url.trim_end_matches('/'));
        let info: serde_json::Value = reqwest::get(&version_url)
            .await
            .map_err(|err| FetchError::Launch(format!("remote browser unreachable: {err}")))?
            .json()
            .await
            .map_err(|err| FetchError::Launch(format!("bad browser version info: {err}")))?;
        info.get("webSocketDebuggerUrl")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| FetchError::Launch("no webSocketDebuggerUrl in response".into()))?
    };

    let (browser, handler) = Browser::connect(ws_url)
        .await
        .map_err(|err| FetchError::Launch(err.to_string()))?;
    Ok((browser, spawn_handler(handler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PageFetcher for Flaky {
        async fn fetch(
            &self,
            url: &str,
            _wait: WaitStrategy,
            timeout: Duration,
        ) -> Result<String, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(FetchError::Timeout {
                    url: url.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            } else {
                Ok("<html></html>".to_string())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn listing_fetch_retries_until_success() {
        let fetcher = Flaky {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        let html = fetch_with_retry(&fetcher, "https://a.test/", &FetchOptions::listing())
            .await
            .expect("third attempt succeeds");
        assert_eq!(html, "<html></html>");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn detail_fetch_is_not_retried() {
        let fetcher = Flaky {
            failures_before_success: 1,
            calls: AtomicU32::new(0),
        };
        let err = fetch_with_retry(&fetcher, "https://a.test/e/1", &FetchOptions::detail())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { timeout_secs: 30, .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chrome_error_text_is_a_navigation_failure() {
        let err = check_navigation("https://gone.test/e/1", Some("net::ERR_NAME_NOT_RESOLVED"))
            .unwrap_err();
        match err {
            FetchError::Navigation { url, reason } => {
                assert_eq!(url, "https://gone.test/e/1");
                assert_eq!(reason, "net::ERR_NAME_NOT_RESOLVED");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(check_navigation("https://a.test/e/1", None).is_ok());
        assert!(check_navigation("https://a.test/e/1", Some("")).is_ok());
    }

    #[test]
    fn options_pick_the_right_wait_strategy() {
        assert_eq!(FetchOptions::listing().wait, WaitStrategy::NetworkIdle);
        assert_eq!(FetchOptions::detail().wait, WaitStrategy::DomContentLoaded);
    }
}
