//! Configuration management with serde serialization/deserialization
//!
//! This module provides every configuration structure for the fetch service:
//! browser pool sizing and launch flags, timeouts, concurrency limits,
//! classifier thresholds, HTTP client settings, URL guard policy and job
//! persistence.

use crate::FetchError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the fetch service
///
/// Every section falls back to its defaults when omitted from a config file,
/// so a file only needs to name what it changes.
///
/// # Examples
///
/// ```rust
/// use pagefetch::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     browser_pool_size: 5,
///     rendering_enabled: false,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of headless browser processes kept in the pool (default: 3)
    ///
    /// Each instance is a separate OS process; memory grows linearly with
    /// this value.
    pub browser_pool_size: usize,

    /// Launch the browser pool at start-up (default: true)
    ///
    /// When false, rendering requests fail with `RenderingUnavailable` and
    /// automatic rendering keeps the plain-fetched document.
    pub rendering_enabled: bool,

    /// Browser process launch settings
    pub launch: LaunchConfig,

    /// Bounds for every suspension point that talks to an external process
    pub timeouts: TimeoutSettings,

    /// Process-wide and per-batch concurrency limits
    pub concurrency: ConcurrencySettings,

    /// Rendering-need classifier thresholds
    pub classifier: ClassifierSettings,

    /// Plain HTTP client settings
    pub http: HttpSettings,

    /// URL validation policy
    pub url_guard: UrlGuardSettings,

    /// Job persistence settings
    pub jobs: JobSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser_pool_size: 3,
            rendering_enabled: true,
            launch: LaunchConfig::default(),
            timeouts: TimeoutSettings::default(),
            concurrency: ConcurrencySettings::default(),
            classifier: ClassifierSettings::default(),
            http: HttpSettings::default(),
            url_guard: UrlGuardSettings::default(),
            jobs: JobSettings::default(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file, then validate it.
    pub fn from_file(path: &Path) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FetchError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            FetchError::Configuration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FetchError> {
        let invalid = |msg: &str| Err(FetchError::Configuration(msg.to_string()));

        if self.rendering_enabled && self.browser_pool_size == 0 {
            return invalid("Browser pool size must be greater than 0 when rendering is enabled");
        }
        if self.concurrency.max_concurrent_fetches == 0 {
            return invalid("Max concurrent fetches must be greater than 0");
        }
        if self.concurrency.max_concurrent_renders == 0 {
            return invalid("Max concurrent renders must be greater than 0");
        }
        if self.concurrency.max_batch_concurrency == 0 || self.concurrency.max_batch_urls == 0 {
            return invalid("Batch limits must be greater than 0");
        }
        if self.timeouts.per_url.is_zero()
            || self.timeouts.navigation.is_zero()
            || self.timeouts.acquire.is_zero()
            || self.timeouts.fetch.is_zero()
        {
            return invalid("Timeouts must be greater than 0");
        }
        if self.launch.viewport.width == 0 || self.launch.viewport.height == 0 {
            return invalid("Viewport dimensions must be greater than 0");
        }
        if self.classifier.cache_capacity == 0 {
            return invalid("Classifier cache capacity must be greater than 0");
        }
        if self.jobs.update_attempts == 0 {
            return invalid("Job update attempts must be greater than 0");
        }
        Ok(())
    }
}

/// Browser viewport used by every browsing context
///
/// # Examples
///
/// ```rust
/// use pagefetch::Viewport;
///
/// let desktop = Viewport::default();
/// assert_eq!(desktop.width, 1920);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
        }
    }
}

/// Launch settings applied identically to every pooled browser process,
/// including replacements.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Run without a visible window (default: true)
    pub headless: bool,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// V8 heap ceiling per instance in megabytes (default: 512)
    pub memory_limit_mb: Option<usize>,

    /// Pass `--no-sandbox` (default: false)
    ///
    /// Only needed inside containers that lack the privileges Chrome's
    /// sandbox requires.
    pub no_sandbox: bool,

    /// Desktop viewport for rendered pages
    pub viewport: Viewport,

    /// User-Agent presented by rendered pages
    pub user_agent: String,

    /// Extra command-line flags appended verbatim
    pub extra_args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            memory_limit_mb: Some(512),
            no_sandbox: false,
            viewport: Viewport::default(),
            user_agent: DEFAULT_DESKTOP_USER_AGENT.to_string(),
            extra_args: Vec::new(),
        }
    }
}

pub const DEFAULT_DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Wait for a free browser instance (default: 10s)
    pub acquire: Duration,
    /// Page navigation (default: 10s)
    pub navigation: Duration,
    /// Quiet window that counts as network quiescence (default: 500ms)
    pub network_idle: Duration,
    /// Wait for a caller-specified selector (default: 10s)
    pub selector: Duration,
    /// Graceful browser close before a forced kill (default: 5s)
    pub graceful_close: Duration,
    /// Aggregate bound for closing the whole pool (default: 15s)
    pub pool_close: Duration,
    /// Connectivity probe on release (default: 2s)
    pub health_probe: Duration,
    /// First delay before relaunching a browser whose replacement failed;
    /// doubles per failed attempt (default: 1s)
    pub restore_backoff: Duration,
    /// Plain HTTP fetch (default: 15s)
    pub fetch: Duration,
    /// Whole per-URL pipeline (default: 30s)
    pub per_url: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            acquire: Duration::from_secs(10),
            navigation: Duration::from_secs(10),
            network_idle: Duration::from_millis(500),
            selector: Duration::from_secs(10),
            graceful_close: Duration::from_secs(5),
            pool_close: Duration::from_secs(15),
            health_probe: Duration::from_secs(2),
            restore_backoff: Duration::from_secs(1),
            fetch: Duration::from_secs(15),
            per_url: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Browser renders running at once across all batches
    pub max_concurrent_renders: usize,
    /// Plain HTTP fetches running at once across all batches
    pub max_concurrent_fetches: usize,
    /// Per-batch limit used when a request does not name one (default: 5)
    pub default_batch_concurrency: usize,
    /// Upper clamp for a caller-supplied batch limit (default: 20)
    pub max_batch_concurrency: usize,
    /// Largest accepted batch (default: 100)
    pub max_batch_urls: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_renders: 3,
            max_concurrent_fetches: (num_cpus::get() * 8).max(16),
            default_batch_concurrency: 5,
            max_batch_concurrency: 20,
            max_batch_urls: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Entries per decision cache (default: 1000)
    pub cache_capacity: usize,
    /// Body text below this many characters marks a framework shell (default: 200)
    pub min_framework_content_chars: usize,
    /// Documents smaller than this without metadata need rendering (default: 50000)
    pub small_document_bytes: usize,
    /// Body text above this many characters counts as real content (default: 500)
    pub rich_text_chars: usize,
    /// Hosts known to ship their content through JavaScript
    pub js_heavy_domains: Vec<String>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            min_framework_content_chars: 200,
            small_document_bytes: 50_000,
            rich_text_chars: 500,
            js_heavy_domains: DEFAULT_JS_HEAVY_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

pub const DEFAULT_JS_HEAVY_DOMAINS: &[&str] = &[
    "medium.com",
    "substack.com",
    "notion.site",
    "notion.so",
    "ghost.io",
    "wixsite.com",
    "webflow.io",
    "squarespace.com",
    "hashnode.dev",
    "bloomberg.com",
    "wsj.com",
    "ft.com",
    "twitter.com",
    "x.com",
    "linkedin.com",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    pub max_redirects: usize,
    /// Response bodies beyond this size are rejected (default: 10 MiB)
    pub max_content_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_DESKTOP_USER_AGENT.to_string(),
            max_redirects: 10,
            max_content_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UrlGuardSettings {
    /// Permit loopback/private/link-local targets (default: false)
    pub allow_private_networks: bool,
    /// Hosts rejected outright, subdomains included
    pub blocked_hosts: Vec<String>,
    pub max_url_length: usize,
}

impl Default for UrlGuardSettings {
    fn default() -> Self {
        Self {
            allow_private_networks: false,
            blocked_hosts: Vec::new(),
            max_url_length: 2048,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobSettings {
    /// How long job records and results live in the store (default: 1h)
    pub ttl: Duration,
    /// Optimistic update attempts before a conflict surfaces (default: 3)
    pub update_attempts: usize,
    /// First retry delay; doubles on each attempt (default: 10ms)
    pub base_backoff: Duration,
    /// Bound on waiting for a cancelled job to finish its cleanup (default: 30s)
    pub cancel_grace: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            update_attempts: 3,
            base_backoff: Duration::from_millis(10),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

/// Generate Chrome command-line arguments for one pool instance
///
/// Renders keep web security and certificate checks on; only resource-heavy
/// or attack-surface features (extensions, plugins, remote fonts) are
/// switched off.
///
/// # Examples
///
/// ```rust
/// use pagefetch::{LaunchConfig, get_chrome_args};
///
/// let args = get_chrome_args(&LaunchConfig::default());
/// assert!(args.contains(&"--disable-extensions".to_string()));
/// ```
pub fn get_chrome_args(launch: &LaunchConfig) -> Vec<String> {
    let mut args = vec![
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-plugins".to_string(),
        "--disable-remote-fonts".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        format!(
            "--window-size={},{}",
            launch.viewport.width, launch.viewport.height
        ),
        format!("--user-agent={}", launch.user_agent),
    ];

    if launch.no_sandbox {
        args.push("--no-sandbox".to_string());
    }

    if let Some(limit) = launch.memory_limit_mb {
        args.push(format!("--js-flags=--max-old-space-size={limit}"));
    }

    args.extend(launch.extra_args.iter().cloned());
    args
}

/// Build the chromiumoxide launch configuration for one pool slot. Each slot
/// gets its own profile directory so instances never share a singleton lock.
pub fn create_browser_config(
    launch: &LaunchConfig,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, FetchError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(launch.viewport.width, launch.viewport.height)
        .user_data_dir(user_data_dir)
        .args(get_chrome_args(launch));

    if !launch.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = &launch.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(FetchError::BrowserLaunchFailed)
}
