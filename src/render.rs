//! Headless rendering of a single URL
//!
//! Every render borrows one browser from the pool, opens a throwaway
//! browsing context on it, and hands both back in a cleanup phase that runs
//! whether the render succeeded, failed, or was cancelled.

use crate::{BrowserLease, BrowserPool, BrowsingContext, Config, ContextSettings, FetchError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);
const OVERLAY_TIMEOUT: Duration = Duration::from_secs(2);

/// Fully rendered page. `rendered` is false when the document is the
/// plain-fetched one kept as a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub html: String,
    pub rendered: bool,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(
        &self,
        url: &str,
        wait_for: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RenderedDocument, FetchError>;

    /// Whether a browser pool backs this renderer.
    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub acquire_timeout: Duration,
    pub navigation_timeout: Duration,
    pub network_idle: Duration,
    pub selector_timeout: Duration,
    pub context_close_timeout: Duration,
    pub context: ContextSettings,
}

impl RenderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            acquire_timeout: config.timeouts.acquire,
            navigation_timeout: config.timeouts.navigation,
            network_idle: config.timeouts.network_idle,
            selector_timeout: config.timeouts.selector,
            context_close_timeout: config.timeouts.graceful_close,
            context: ContextSettings {
                viewport: config.launch.viewport.clone(),
                user_agent: config.launch.user_agent.clone(),
            },
        }
    }
}

pub struct RenderedFetcher {
    pool: Option<Arc<BrowserPool>>,
    settings: RenderSettings,
}

impl RenderedFetcher {
    pub fn new(pool: Option<Arc<BrowserPool>>, settings: RenderSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> Option<&Arc<BrowserPool>> {
        self.pool.as_ref()
    }

    async fn render_on(
        &self,
        guard: &LeaseGuard,
        url: &str,
        wait_for: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let lease = guard.lease()?;
        let process = lease.process()?;
        guard.context_open.store(true, Ordering::SeqCst);
        let context = match timeout(
            self.settings.navigation_timeout,
            process.open_context(&self.settings.context),
        )
        .await
        {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                lease.mark_unhealthy();
                return Err(e);
            }
            Err(_) => {
                lease.mark_unhealthy();
                return Err(FetchError::RenderingTimeout(self.settings.navigation_timeout));
            }
        };

        let result = self.drive(context.as_ref(), url, wait_for, cancel).await;

        let closed = timeout(self.settings.context_close_timeout, context.close()).await;
        guard.context_open.store(false, Ordering::SeqCst);
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Failed to close browsing context for {}: {}", url, e);
                lease.mark_unhealthy();
            }
            Err(_) => {
                warn!("Closing browsing context for {} timed out", url);
                lease.mark_unhealthy();
            }
        }

        result
    }

    async fn drive(
        &self,
        context: &dyn BrowsingContext,
        url: &str,
        wait_for: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let navigation = self.settings.navigation_timeout;

        let response = bounded(
            cancel,
            navigation,
            FetchError::RenderingTimeout(navigation),
            context.navigate(url),
        )
        .await?;
        if let Some(status) = response.status {
            if status >= 400 {
                return Err(FetchError::RenderingFailed(format!(
                    "navigation to {url} returned HTTP {status}"
                )));
            }
        }

        let idle = bounded(
            cancel,
            navigation,
            FetchError::RenderingTimeout(navigation),
            context.wait_for_network_idle(self.settings.network_idle, navigation),
        )
        .await?;
        if !idle {
            debug!("Network never went idle for {}, continuing", url);
        }

        if let Some(selector) = wait_for {
            self.wait_for_selector(context, selector, cancel).await?;
        }

        match bounded(
            cancel,
            OVERLAY_TIMEOUT,
            FetchError::RenderingTimeout(OVERLAY_TIMEOUT),
            context.dismiss_overlays(),
        )
        .await
        {
            Ok(()) => {}
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(e) => debug!("Overlay dismissal skipped for {}: {}", url, e),
        }

        bounded(
            cancel,
            navigation,
            FetchError::RenderingTimeout(navigation),
            context.content(),
        )
        .await
    }

    async fn wait_for_selector(
        &self,
        context: &dyn BrowsingContext,
        selector: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let limit = self.settings.selector_timeout;
        let poll = async {
            loop {
                if context.selector_visible(selector).await? {
                    return Ok(());
                }
                tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
            }
        };
        bounded(
            cancel,
            limit,
            FetchError::SelectorTimeout {
                selector: selector.to_string(),
                timeout: limit,
            },
            poll,
        )
        .await
    }
}

#[async_trait]
impl PageRenderer for RenderedFetcher {
    async fn render(
        &self,
        url: &str,
        wait_for: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RenderedDocument, FetchError> {
        let pool = self.pool.as_ref().ok_or(FetchError::RenderingUnavailable)?;
        let started = Instant::now();

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            lease = pool.acquire(self.settings.acquire_timeout) => lease?,
        };
        debug!("Rendering {} on browser instance {:?}", url, lease.instance_id());

        let guard = LeaseGuard::new(lease);
        let result = self.render_on(&guard, url, wait_for, cancel).await;
        guard.release().await;

        crate::metrics::record_render_duration(started.elapsed(), result.is_ok());
        match result {
            Ok(html) => {
                info!("Rendered {} in {:?}", url, started.elapsed());
                Ok(RenderedDocument { html, rendered: true })
            }
            Err(e) => {
                warn!("Rendering {} failed: {}", url, e);
                Err(e)
            }
        }
    }

    fn is_available(&self) -> bool {
        self.pool.as_ref().map_or(false, |p| !p.is_closed())
    }
}

/// Holds the lease while a browsing context may be open on it. If the render
/// is dropped before the context is closed, the browser is flagged so it gets
/// replaced instead of handed out with the context still attached.
struct LeaseGuard {
    lease: Option<BrowserLease>,
    context_open: AtomicBool,
}

impl LeaseGuard {
    fn new(lease: BrowserLease) -> Self {
        Self {
            lease: Some(lease),
            context_open: AtomicBool::new(false),
        }
    }

    fn lease(&self) -> Result<&BrowserLease, FetchError> {
        self.lease
            .as_ref()
            .ok_or_else(|| FetchError::Internal("browser lease already released".to_string()))
    }

    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if self.context_open.load(Ordering::SeqCst) {
                warn!("Render abandoned with an open browsing context; replacing browser");
                lease.mark_unhealthy();
            }
        }
    }
}

/// Await `fut` unless `cancel` fires or `limit` passes first.
async fn bounded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    on_timeout: FetchError,
    fut: F,
) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        result = timeout(limit, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(on_timeout),
        },
    }
}
