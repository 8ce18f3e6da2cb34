//! Fakes shared by unit and cross-module tests.

use crate::{
    BrowserLauncher, BrowserPool, BrowserProcess, BrowsingContext, ContextSettings, FetchError,
    FetchMetadata, FetchedPage, HttpFetcher, JobStore, MemoryJobStore, NavigationResponse,
    PageRenderer, PoolSettings, RenderSettings, RenderedDocument, Versioned,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tracks how many calls are running at once and the highest value seen.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

pub struct InFlightGuard<'a>(&'a AtomicUsize);

impl InFlight {
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(&self.current)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Knobs and counters shared by every fake browser a launcher creates.
pub struct FakeBehavior {
    launches: AtomicUsize,
    closes: AtomicUsize,
    kills: AtomicUsize,
    contexts_opened: AtomicUsize,
    contexts_closed: AtomicUsize,
    fail_launches_from: Mutex<Option<usize>>,
    fail_next_launches: AtomicUsize,
    responsive: AtomicBool,
    unresponsive: Mutex<HashSet<usize>>,
    hang_on_close: AtomicBool,
    open_context_fails: AtomicBool,
    html: Mutex<String>,
    navigation_error: Mutex<Option<FetchError>>,
    navigation_status: Mutex<Option<u16>>,
    navigation_delay: Mutex<Duration>,
    selector_present: AtomicBool,
    pub renders: InFlight,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            contexts_opened: AtomicUsize::new(0),
            contexts_closed: AtomicUsize::new(0),
            fail_launches_from: Mutex::new(None),
            fail_next_launches: AtomicUsize::new(0),
            responsive: AtomicBool::new(true),
            unresponsive: Mutex::new(HashSet::new()),
            hang_on_close: AtomicBool::new(false),
            open_context_fails: AtomicBool::new(false),
            html: Mutex::new("<html><body><p>rendered</p></body></html>".to_string()),
            navigation_error: Mutex::new(None),
            navigation_status: Mutex::new(Some(200)),
            navigation_delay: Mutex::new(Duration::ZERO),
            selector_present: AtomicBool::new(true),
            renders: InFlight::default(),
        }
    }
}

impl FakeBehavior {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn contexts_opened(&self) -> usize {
        self.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.contexts_closed.load(Ordering::SeqCst)
    }

    /// Every launch for an instance id of `first` or above fails.
    pub fn fail_launches_from(&self, first: usize) {
        *lock(&self.fail_launches_from) = Some(first);
    }

    pub fn fail_next_launches(&self, count: usize) {
        self.fail_next_launches.store(count, Ordering::SeqCst);
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn set_instance_responsive(&self, id: usize, responsive: bool) {
        let mut unresponsive = lock(&self.unresponsive);
        if responsive {
            unresponsive.remove(&id);
        } else {
            unresponsive.insert(id);
        }
    }

    pub fn set_hang_on_close(&self, hang: bool) {
        self.hang_on_close.store(hang, Ordering::SeqCst);
    }

    pub fn set_open_context_fails(&self, fails: bool) {
        self.open_context_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_html(&self, html: &str) {
        *lock(&self.html) = html.to_string();
    }

    pub fn set_navigation_error(&self, error: Option<FetchError>) {
        *lock(&self.navigation_error) = error;
    }

    pub fn set_navigation_status(&self, status: Option<u16>) {
        *lock(&self.navigation_status) = status;
    }

    pub fn set_navigation_delay(&self, delay: Duration) {
        *lock(&self.navigation_delay) = delay;
    }

    pub fn set_selector_present(&self, present: bool) {
        self.selector_present.store(present, Ordering::SeqCst);
    }

    fn should_fail_launch(&self, id: usize) -> bool {
        if lock(&self.fail_launches_from).map_or(false, |first| id >= first) {
            return true;
        }
        self.fail_next_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct FakeProcess {
    id: usize,
    behavior: Arc<FakeBehavior>,
}

impl FakeProcess {
    pub fn new(id: usize, behavior: Arc<FakeBehavior>) -> Self {
        Self { id, behavior }
    }
}

#[async_trait]
impl BrowserProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(40_000 + self.id as u32)
    }

    async fn is_responsive(&self) -> bool {
        self.behavior.responsive.load(Ordering::SeqCst)
            && !lock(&self.behavior.unresponsive).contains(&self.id)
    }

    async fn open_context(
        &self,
        _settings: &ContextSettings,
    ) -> Result<Box<dyn BrowsingContext>, FetchError> {
        if self.behavior.open_context_fails.load(Ordering::SeqCst) {
            return Err(FetchError::RenderingFailed("target crashed".to_string()));
        }
        self.behavior.contexts_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            behavior: self.behavior.clone(),
        }))
    }

    async fn close(&self) -> Result<(), FetchError> {
        if self.behavior.hang_on_close.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.behavior.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> Result<(), FetchError> {
        self.behavior.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeContext {
    behavior: Arc<FakeBehavior>,
}

#[async_trait]
impl BrowsingContext for FakeContext {
    async fn navigate(&self, _url: &str) -> Result<NavigationResponse, FetchError> {
        let _rendering = self.behavior.renders.enter();
        let delay = *lock(&self.behavior.navigation_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.behavior.navigation_error).clone() {
            return Err(error);
        }
        Ok(NavigationResponse {
            status: *lock(&self.behavior.navigation_status),
        })
    }

    async fn wait_for_network_idle(&self, _idle: Duration, _limit: Duration) -> Result<bool, FetchError> {
        Ok(true)
    }

    async fn selector_visible(&self, _selector: &str) -> Result<bool, FetchError> {
        Ok(self.behavior.selector_present.load(Ordering::SeqCst))
    }

    async fn dismiss_overlays(&self) -> Result<(), FetchError> {
        Ok(())
    }

    async fn content(&self) -> Result<String, FetchError> {
        Ok(lock(&self.behavior.html).clone())
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.behavior.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    behavior: Arc<FakeBehavior>,
    shutdowns: AtomicUsize,
}

impl FakeLauncher {
    pub fn behavior(&self) -> &Arc<FakeBehavior> {
        &self.behavior
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, instance_id: usize) -> Result<Box<dyn BrowserProcess>, FetchError> {
        if self.behavior.should_fail_launch(instance_id) {
            return Err(FetchError::BrowserLaunchFailed(format!(
                "instance {instance_id} refused to start"
            )));
        }
        self.behavior.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess::new(instance_id, self.behavior.clone())))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn pool_settings(capacity: usize) -> PoolSettings {
    PoolSettings {
        capacity,
        graceful_close: Duration::from_millis(50),
        close_timeout: Duration::from_millis(200),
        health_probe: Duration::from_millis(50),
        restore_backoff: Duration::from_millis(20),
    }
}

pub async fn fake_pool(capacity: usize) -> (Arc<BrowserPool>, Arc<FakeLauncher>) {
    let launcher = Arc::new(FakeLauncher::default());
    let pool = BrowserPool::start(pool_settings(capacity), launcher.clone())
        .await
        .expect("fake pool starts");
    (pool, launcher)
}

pub fn render_settings() -> RenderSettings {
    RenderSettings {
        acquire_timeout: Duration::from_millis(200),
        navigation_timeout: Duration::from_millis(200),
        network_idle: Duration::from_millis(10),
        selector_timeout: Duration::from_millis(150),
        context_close_timeout: Duration::from_millis(100),
        context: ContextSettings {
            viewport: Default::default(),
            user_agent: "pagefetch-test".to_string(),
        },
    }
}

/// Canned plain-fetch response.
#[derive(Debug, Clone)]
pub struct FakePage {
    pub body: String,
    pub content_type: String,
}

impl FakePage {
    pub fn into_fetched(self, url: &str) -> FetchedPage {
        let size = self.body.len();
        FetchedPage {
            body: Bytes::from(self.body),
            meta: FetchMetadata {
                status: 200,
                headers: HashMap::new(),
                content_type: Some(self.content_type),
                final_url: url.to_string(),
                size,
            },
        }
    }
}

impl From<&str> for FakePage {
    fn from(body: &str) -> Self {
        Self {
            body: body.to_string(),
            content_type: "text/html; charset=utf-8".to_string(),
        }
    }
}

/// Small server-rendered page with metadata, which the classifier leaves
/// unrendered.
pub fn html_page(text: &str) -> FakePage {
    FakePage::from(
        format!(
            r#"<html><head><title>Test</title>
            <meta property="og:title" content="Test page">
            <meta name="description" content="A page used in tests"></head>
            <body><article><h1>Heading</h1><p>{text}</p></article></body></html>"#
        )
        .as_str(),
    )
}

type Route = (Result<FakePage, FetchError>, Duration);

/// `HttpFetcher` serving canned responses per URL. Unknown URLs are 404s.
#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: AtomicUsize,
    in_flight: InFlight,
}

impl FakeFetcher {
    pub fn respond(&self, url: &str, page: impl Into<FakePage>, delay: Duration) {
        lock(&self.routes).insert(url.to_string(), (Ok(page.into()), delay));
    }

    pub fn fail(&self, url: &str, error: FetchError) {
        lock(&self.routes).insert(url.to_string(), (Err(error), Duration::ZERO));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max()
    }
}

#[async_trait]
impl HttpFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<FetchedPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.in_flight.enter();
        let route = lock(&self.routes).get(url).cloned();
        let Some((result, delay)) = route else {
            return Err(FetchError::UpstreamHttp { status: 404 });
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result.map(|page| page.into_fetched(url))
    }
}

/// `PageRenderer` that returns fixed HTML without a browser.
pub struct FakeRenderer {
    html: Mutex<String>,
    error: Mutex<Option<FetchError>>,
    delay: Mutex<Duration>,
    available: AtomicBool,
    calls: AtomicUsize,
    in_flight: InFlight,
}

impl Default for FakeRenderer {
    fn default() -> Self {
        Self {
            html: Mutex::new("<html><body><p>rendered content</p></body></html>".to_string()),
            error: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            in_flight: InFlight::default(),
        }
    }
}

impl FakeRenderer {
    pub fn set_html(&self, html: &str) {
        *lock(&self.html) = html.to_string();
    }

    pub fn fail_with(&self, error: FetchError) {
        *lock(&self.error) = Some(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max()
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render(
        &self,
        _url: &str,
        _wait_for: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RenderedDocument, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.in_flight.enter();
        let delay = *lock(&self.delay);
        tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        if let Some(error) = lock(&self.error).clone() {
            return Err(error);
        }
        Ok(RenderedDocument {
            html: lock(&self.html).clone(),
            rendered: true,
        })
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Job store that pauses after every read so concurrent writers interleave,
/// and counts rejected compare-and-set calls.
pub struct ContendedJobStore {
    inner: MemoryJobStore,
    read_delay: Duration,
    always_conflict: AtomicBool,
    fail_writes: AtomicBool,
    conflicts: AtomicUsize,
}

impl ContendedJobStore {
    pub fn new(read_delay: Duration) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            read_delay,
            always_conflict: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            conflicts: AtomicUsize::new(0),
        }
    }

    pub fn set_always_conflict(&self, conflict: bool) {
        self.always_conflict.store(conflict, Ordering::SeqCst);
    }

    /// Simulate an unreachable store for plain writes.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for ContendedJobStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, FetchError> {
        let value = self.inner.get(key).await?;
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FetchError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FetchError::JobStore("store unreachable".to_string()));
        }
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, FetchError> {
        let written = !self.always_conflict.load(Ordering::SeqCst)
            && self.inner.compare_and_set(key, expected, value, ttl).await?;
        if !written {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<(), FetchError> {
        self.inner.delete(key).await
    }
}
