//! Browser process abstraction
//!
//! A pooled browser is reached only through the traits in this module, so the
//! pool and the renderer stay independent of the CDP client. `ProcessHandle`
//! owns one live process and knows how to end it: graceful close first,
//! forced kill once the graceful window has passed.

use crate::{FetchError, Viewport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Settings for one isolated browsing context.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub viewport: Viewport,
    pub user_agent: String,
}

/// Result of a top-level navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationResponse {
    /// Status of the main document response. `None` when the browser reported
    /// a response without a usable status.
    pub status: Option<u16>,
}

/// One OS-level headless browser process.
#[async_trait]
pub trait BrowserProcess: Send + Sync {
    /// OS process id, when the engine exposes it.
    fn pid(&self) -> Option<u32>;

    /// Lightweight connectivity probe.
    async fn is_responsive(&self) -> bool;

    /// Open a fresh context with its own cookies and storage.
    async fn open_context(
        &self,
        settings: &ContextSettings,
    ) -> Result<Box<dyn BrowsingContext>, FetchError>;

    /// Ask the browser to exit.
    async fn close(&self) -> Result<(), FetchError>;

    /// Terminate the process with a kill signal.
    async fn kill(&self) -> Result<(), FetchError>;
}

/// An isolated session inside a browser process.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<NavigationResponse, FetchError>;

    /// Resolve once no new network activity was seen for `idle`. Returns
    /// false if `limit` elapsed first.
    async fn wait_for_network_idle(&self, idle: Duration, limit: Duration) -> Result<bool, FetchError>;

    async fn selector_visible(&self, selector: &str) -> Result<bool, FetchError>;

    /// Best-effort dismissal of cookie and newsletter overlays.
    async fn dismiss_overlays(&self) -> Result<(), FetchError>;

    async fn content(&self) -> Result<String, FetchError>;

    async fn close(&self) -> Result<(), FetchError>;
}

/// Starts browser processes with a fixed launch configuration.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, instance_id: usize) -> Result<Box<dyn BrowserProcess>, FetchError>;

    /// Release engine-wide resources once the pool is closed.
    async fn shutdown(&self) {}
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Killed,
    /// Neither close nor kill confirmed the exit.
    Abandoned,
}

pub struct ProcessHandle {
    id: usize,
    pid: Option<u32>,
    process: Box<dyn BrowserProcess>,
    healthy: AtomicBool,
    created_at: Instant,
}

impl ProcessHandle {
    pub fn new(id: usize, process: Box<dyn BrowserProcess>) -> Self {
        let pid = process.pid();
        Self {
            id,
            pid,
            process,
            healthy: AtomicBool::new(true),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn process(&self) -> &dyn BrowserProcess {
        self.process.as_ref()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn is_marked_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// A handle is healthy while it was never flagged and the probe answers
    /// within `probe_timeout`. A failed probe flags it permanently.
    pub async fn check_health(&self, probe_timeout: Duration) -> bool {
        if !self.is_marked_healthy() {
            return false;
        }
        let responsive = timeout(probe_timeout, self.process.is_responsive())
            .await
            .unwrap_or(false);
        if !responsive {
            self.mark_unhealthy();
        }
        responsive
    }

    /// Close the process, escalating to a kill when the graceful close does
    /// not finish within `graceful_timeout`.
    pub async fn terminate(self, graceful_timeout: Duration) -> Termination {
        let id = self.id;
        match timeout(graceful_timeout, self.process.close()).await {
            Ok(Ok(())) => {
                debug!("Browser instance {} closed gracefully", id);
                return Termination::Graceful;
            }
            Ok(Err(e)) => warn!("Browser instance {} close failed: {}", id, e),
            Err(_) => warn!(
                "Browser instance {} (pid {:?}) did not close within {:?}, killing",
                id, self.pid, graceful_timeout
            ),
        }

        crate::metrics::record_forced_kill();
        match timeout(graceful_timeout, self.process.kill()).await {
            Ok(Ok(())) => Termination::Killed,
            Ok(Err(e)) => {
                error!("Failed to kill browser instance {} (pid {:?}): {}", id, self.pid, e);
                Termination::Abandoned
            }
            Err(_) => {
                error!("Kill of browser instance {} (pid {:?}) timed out", id, self.pid);
                Termination::Abandoned
            }
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("healthy", &self.is_marked_healthy())
            .finish()
    }
}
