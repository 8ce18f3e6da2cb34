//! Bounded concurrent processing of URL batches
//!
//! Each URL runs the pipeline validate → fetch → classify → render (maybe)
//! → convert. Three limits apply at once: a semaphore local to the batch,
//! held for the URL's whole pipeline, and two process-wide semaphores, one
//! for plain fetches and one for renders. A URL takes the batch permit
//! first and then at most one global permit at a time, so batches competing
//! for the global limits cannot deadlock.

use crate::utils::percentage;
use crate::{
    convert, Config, Converted, ErrorKind, FetchError, HttpFetcher, OutcomeContent, OutputFormat,
    PageRenderer, RenderingClassifier, UrlGuard,
};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Render when the classifier or a wait-for selector asks for it
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for RenderMode {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RenderMode::Auto),
            "always" | "render" => Ok(RenderMode::Always),
            "never" | "static" => Ok(RenderMode::Never),
            other => Err(FetchError::Validation(format!("unknown render mode '{other}'"))),
        }
    }
}

/// One URL of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub url: String,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub wait_for_selector: Option<String>,
    #[serde(default)]
    pub render_mode: RenderMode,
}

impl BatchEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
            headers: HashMap::new(),
            wait_for_selector: None,
            render_mode: RenderMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStage {
    Pending,
    Fetching,
    Classifying,
    Rendering,
    Converting,
    Succeeded,
    Failed,
}

/// Failure details recorded in an outcome. `message` is already sanitised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: u16,
}

impl From<&FetchError> for OutcomeError {
    fn from(err: &FetchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.public_message(),
            status_code: err.status_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUrlOutcome {
    pub index: usize,
    pub url: String,
    pub success: bool,
    pub requested_format: OutputFormat,
    /// Format actually produced
    pub format: Option<OutputFormat>,
    pub content: Option<OutcomeContent>,
    pub size: usize,
    pub duration_ms: u64,
    pub rendered: bool,
    pub error: Option<OutcomeError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Percentage, two decimals
    pub success_rate: f64,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[BatchUrlOutcome], duration: Duration) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Self {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            success_rate: percentage(succeeded, outcomes.len()),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<BatchUrlOutcome>,
    pub summary: BatchSummary,
}

/// Result of one successful pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub final_url: String,
    pub converted: Converted,
    pub rendered: bool,
}

/// Process-wide limits shared by every batch and single fetch.
#[derive(Debug, Clone)]
pub struct GlobalLimits {
    pub render: Arc<Semaphore>,
    pub fetch: Arc<Semaphore>,
}

impl GlobalLimits {
    pub fn new(max_renders: usize, max_fetches: usize) -> Self {
        Self {
            render: Arc::new(Semaphore::new(max_renders.max(1))),
            fetch: Arc::new(Semaphore::new(max_fetches.max(1))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    pub max_batch_urls: usize,
    pub per_url_timeout: Duration,
    /// How long a timed-out or cancelled URL may spend on cleanup
    pub cleanup_grace: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_concurrency: config.concurrency.default_batch_concurrency,
            max_concurrency: config.concurrency.max_batch_concurrency,
            max_batch_urls: config.concurrency.max_batch_urls,
            per_url_timeout: config.timeouts.per_url,
            cleanup_grace: config.timeouts.graceful_close * 3,
        }
    }

    pub fn clamp_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_concurrency)
            .clamp(1, self.max_concurrency.max(1))
    }
}

pub struct ConcurrencyOrchestrator {
    guard: Arc<UrlGuard>,
    fetcher: Arc<dyn HttpFetcher>,
    classifier: Arc<RenderingClassifier>,
    renderer: Arc<dyn PageRenderer>,
    limits: GlobalLimits,
    settings: OrchestratorSettings,
}

impl ConcurrencyOrchestrator {
    pub fn new(
        guard: Arc<UrlGuard>,
        fetcher: Arc<dyn HttpFetcher>,
        classifier: Arc<RenderingClassifier>,
        renderer: Arc<dyn PageRenderer>,
        limits: GlobalLimits,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            guard,
            fetcher,
            classifier,
            renderer,
            limits,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run every entry and return one outcome per entry, in input order.
    /// Only an oversized batch fails as a whole.
    pub async fn run_batch(
        &self,
        entries: Vec<BatchEntry>,
        default_format: OutputFormat,
        concurrency: Option<usize>,
        per_url_timeout: Option<Duration>,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<BatchUrlOutcome>>,
    ) -> Result<BatchReport, FetchError> {
        if entries.len() > self.settings.max_batch_urls {
            return Err(FetchError::Validation(format!(
                "batch of {} URLs exceeds the limit of {}",
                entries.len(),
                self.settings.max_batch_urls
            )));
        }

        let started = Instant::now();
        let limit = self.settings.clamp_concurrency(concurrency);
        let per_url_timeout = per_url_timeout.unwrap_or(self.settings.per_url_timeout);
        let batch_limiter = Semaphore::new(limit);
        info!(
            "Starting batch of {} URLs (concurrency {}, per-URL timeout {:?})",
            entries.len(),
            limit,
            per_url_timeout
        );

        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                self.batch_entry(
                    index,
                    entry,
                    default_format,
                    &batch_limiter,
                    per_url_timeout,
                    cancel,
                )
            })
            .collect();

        let mut outcomes = Vec::with_capacity(entries.len());
        while let Some(outcome) = pending.next().await {
            if let Some(tx) = &progress {
                let _ = tx.send(outcome.clone());
            }
            outcomes.push(outcome);
        }
        drop(pending);
        outcomes.sort_by_key(|o| o.index);

        let summary = BatchSummary::from_outcomes(&outcomes, started.elapsed());
        info!(
            "Batch finished: {}/{} succeeded ({}%) in {}ms",
            summary.succeeded, summary.total, summary.success_rate, summary.duration_ms
        );
        Ok(BatchReport { outcomes, summary })
    }

    async fn batch_entry(
        &self,
        index: usize,
        entry: &BatchEntry,
        default_format: OutputFormat,
        batch_limiter: &Semaphore,
        per_url_timeout: Duration,
        cancel: &CancellationToken,
    ) -> BatchUrlOutcome {
        let requested = entry.format.unwrap_or(default_format);
        stage(index, &entry.url, UrlStage::Pending);

        let result = match acquire_permit(batch_limiter, cancel).await {
            Ok(_permit) => {
                let started = Instant::now();
                let result = self
                    .run_entry(index, entry, requested, per_url_timeout, cancel)
                    .await;
                (result, started.elapsed())
            }
            Err(e) => (Err(e), Duration::ZERO),
        };
        build_outcome(index, entry, requested, result)
    }

    /// Run the pipeline for a single URL outside any batch.
    pub async fn fetch_entry(
        &self,
        entry: &BatchEntry,
        default_format: OutputFormat,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, FetchError> {
        let requested = entry.format.unwrap_or(default_format);
        let started = Instant::now();
        let result = self
            .run_entry(0, entry, requested, self.settings.per_url_timeout, cancel)
            .await;
        crate::metrics::record_url_outcome(
            started.elapsed(),
            result.as_ref().map_or(false, |o| o.rendered),
            result.as_ref().err().map(|e| e.kind()),
        );
        result
    }

    /// Bound the pipeline by `per_url_timeout`. On timeout or cancellation
    /// the pipeline's token is cancelled and the pipeline is still awaited,
    /// within the cleanup grace, so browser contexts and leases are returned.
    async fn run_entry(
        &self,
        index: usize,
        entry: &BatchEntry,
        requested: OutputFormat,
        per_url_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, FetchError> {
        let token = cancel.child_token();
        let pipeline = self.pipeline(index, entry, requested, &token);
        tokio::pin!(pipeline);

        let interrupted = tokio::select! {
            biased;
            result = &mut pipeline => return result,
            _ = tokio::time::sleep(per_url_timeout) => FetchError::Timeout(per_url_timeout),
            _ = cancel.cancelled() => FetchError::Cancelled,
        };

        token.cancel();
        if tokio::time::timeout(self.settings.cleanup_grace, &mut pipeline)
            .await
            .is_err()
        {
            // Dropping the pipeline here drops any lease it holds; a lease
            // with a browsing context still open is flagged for replacement.
            warn!(
                "URL {} did not finish cleanup within {:?}; abandoning it",
                entry.url, self.settings.cleanup_grace
            );
        }
        Err(interrupted)
    }

    async fn pipeline(
        &self,
        index: usize,
        entry: &BatchEntry,
        requested: OutputFormat,
        token: &CancellationToken,
    ) -> Result<PipelineOutput, FetchError> {
        let url = self.guard.validate(&entry.url)?;
        let url = url.as_str();

        let plain = if entry.render_mode == RenderMode::Always {
            None
        } else {
            stage(index, url, UrlStage::Fetching);
            let _permit = acquire_permit(&self.limits.fetch, token).await?;
            Some(cancellable(token, self.fetcher.fetch(url, &entry.headers)).await?)
        };

        stage(index, url, UrlStage::Classifying);
        let wants_render = match (entry.render_mode, &plain) {
            (RenderMode::Never, _) => false,
            (RenderMode::Always, _) | (_, None) => true,
            (RenderMode::Auto, Some(page)) => {
                if entry.wait_for_selector.is_some() {
                    true
                } else {
                    let classifier = self.classifier.clone();
                    let (page_url, body, content_type) =
                        (url.to_string(), page.body.clone(), page.meta.content_type.clone());
                    let needed = offload(token, move || {
                        classifier.needs_rendering(&page_url, &body, content_type.as_deref())
                    })
                    .await?;
                    if needed && !self.renderer.is_available() {
                        debug!("{} needs rendering but no browser pool is configured", url);
                        false
                    } else {
                        needed
                    }
                }
            }
        };

        let (body, content_type, final_url, rendered) = if wants_render {
            stage(index, url, UrlStage::Rendering);
            let render_result = {
                let _permit = acquire_permit(&self.limits.render, token).await?;
                self.renderer
                    .render(url, entry.wait_for_selector.as_deref(), token)
                    .await
            };
            match (render_result, plain) {
                (Ok(doc), _) => (
                    doc.html.into_bytes().into(),
                    Some("text/html; charset=utf-8".to_string()),
                    url.to_string(),
                    doc.rendered,
                ),
                (Err(e), Some(page))
                    if entry.render_mode == RenderMode::Auto && e.allows_static_fallback() =>
                {
                    warn!("Rendering {} failed ({}), keeping plain document", url, e);
                    crate::metrics::record_static_fallback();
                    (page.body, page.meta.content_type, page.meta.final_url, false)
                }
                (Err(e), _) => return Err(e),
            }
        } else {
            match plain {
                Some(page) => (page.body, page.meta.content_type, page.meta.final_url, false),
                None => {
                    return Err(FetchError::Internal(
                        "no document to convert".to_string(),
                    ))
                }
            }
        };

        stage(index, url, UrlStage::Converting);
        let converted =
            offload(token, move || convert(&body, content_type.as_deref(), requested)).await??;
        Ok(PipelineOutput {
            final_url,
            converted,
            rendered,
        })
    }
}

fn stage(index: usize, url: &str, stage: UrlStage) {
    debug!("[{}] {} -> {:?}", index, url, stage);
}

fn build_outcome(
    index: usize,
    entry: &BatchEntry,
    requested: OutputFormat,
    (result, elapsed): (Result<PipelineOutput, FetchError>, Duration),
) -> BatchUrlOutcome {
    let duration_ms = elapsed.as_millis() as u64;
    match result {
        Ok(output) => {
            stage(index, &entry.url, UrlStage::Succeeded);
            crate::metrics::record_url_outcome(elapsed, output.rendered, None);
            BatchUrlOutcome {
                index,
                url: entry.url.clone(),
                success: true,
                requested_format: requested,
                format: Some(output.converted.format),
                size: output.converted.content.len(),
                content: Some(output.converted.content),
                duration_ms,
                rendered: output.rendered,
                error: None,
            }
        }
        Err(e) => {
            stage(index, &entry.url, UrlStage::Failed);
            warn!("[{}] {} failed: {}", index, entry.url, e);
            crate::metrics::record_url_outcome(elapsed, false, Some(e.kind()));
            BatchUrlOutcome {
                index,
                url: entry.url.clone(),
                success: false,
                requested_format: requested,
                format: None,
                content: None,
                size: 0,
                duration_ms,
                rendered: false,
                error: Some(OutcomeError::from(&e)),
            }
        }
    }
}

async fn acquire_permit<'a>(
    semaphore: &'a Semaphore,
    token: &CancellationToken,
) -> Result<SemaphorePermit<'a>, FetchError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FetchError::Cancelled),
        permit = semaphore.acquire() => Ok(permit?),
    }
}

async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FetchError::Cancelled),
        result = fut => result,
    }
}

/// Run parsing work on the blocking pool. Cancellation stops the wait, not
/// the work itself.
async fn offload<T, F>(token: &CancellationToken, work: F) -> Result<T, FetchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    cancellable(token, async {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| FetchError::Internal(format!("document task failed: {e}")))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::MockHttpFetcher;
    use crate::test_support::{html_page, FakeFetcher, FakePage, FakeRenderer};
    use crate::{ClassifierSettings, UrlGuardSettings};

    const SHELL: &str = r#"<html><body><div id="root"></div></body></html>"#;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            default_concurrency: 5,
            max_concurrency: 20,
            max_batch_urls: 100,
            per_url_timeout: Duration::from_secs(5),
            cleanup_grace: Duration::from_secs(1),
        }
    }

    fn orchestrator(
        fetcher: Arc<dyn HttpFetcher>,
        renderer: Arc<dyn PageRenderer>,
        limits: GlobalLimits,
    ) -> ConcurrencyOrchestrator {
        ConcurrencyOrchestrator::new(
            Arc::new(UrlGuard::new(UrlGuardSettings::default())),
            fetcher,
            Arc::new(RenderingClassifier::new(ClassifierSettings::default())),
            renderer,
            limits,
            settings(),
        )
    }

    fn simple(fetcher: Arc<FakeFetcher>, renderer: Arc<FakeRenderer>) -> ConcurrencyOrchestrator {
        orchestrator(fetcher, renderer, GlobalLimits::new(3, 16))
    }

    fn urls(n: usize) -> Vec<BatchEntry> {
        (0..n)
            .map(|i| BatchEntry::new(format!("https://site{i}.example.com/")))
            .collect()
    }

    async fn run(
        orch: &ConcurrencyOrchestrator,
        entries: Vec<BatchEntry>,
        concurrency: Option<usize>,
    ) -> BatchReport {
        orch.run_batch(
            entries,
            OutputFormat::Markdown,
            concurrency,
            None,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn outcomes_keep_input_order() {
        let fetcher = Arc::new(FakeFetcher::default());
        for (i, delay) in [80u64, 10, 50, 0].iter().enumerate() {
            fetcher.respond(
                &format!("https://site{i}.example.com/"),
                html_page(&format!("page {i}")),
                Duration::from_millis(*delay),
            );
        }
        let orch = simple(fetcher, Arc::new(FakeRenderer::default()));

        let report = run(&orch, urls(4), Some(4)).await;
        let indices: Vec<usize> = report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        for (i, outcome) in report.outcomes.iter().enumerate() {
            assert!(outcome.success);
            assert_eq!(outcome.url, format!("https://site{i}.example.com/"));
            let text = outcome.content.as_ref().and_then(|c| c.as_text()).unwrap();
            assert!(text.contains(&format!("page {i}")));
        }
    }

    #[tokio::test]
    async fn deeply_nested_page_is_classified_and_converted() {
        let depth = 5_000;
        let deep = format!(
            r#"<html><head><meta property="og:title" content="Deep">
            <meta name="description" content="Nested"></head>
            <body>{}<p>deep text</p>{}</body></html>"#,
            "<div>".repeat(depth),
            "</div>".repeat(depth)
        );
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond(
            "https://site0.example.com/",
            FakePage::from(deep.as_str()),
            Duration::ZERO,
        );
        fetcher.respond("https://site1.example.com/", html_page("shallow"), Duration::ZERO);
        let renderer = Arc::new(FakeRenderer::default());
        let orch = simple(fetcher, renderer.clone());

        let report = run(&orch, urls(2), Some(2)).await;
        assert_eq!(report.summary.succeeded, 2);
        let deep = &report.outcomes[0];
        assert!(!deep.rendered);
        let text = deep.content.as_ref().and_then(|c| c.as_text()).unwrap();
        assert!(text.contains("deep text"));
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond("https://site0.example.com/", html_page("a"), Duration::ZERO);
        fetcher.fail("https://site1.example.com/", FetchError::UpstreamHttp { status: 500 });
        fetcher.respond("https://site2.example.com/", html_page("c"), Duration::ZERO);
        let orch = simple(fetcher, Arc::new(FakeRenderer::default()));

        let report = run(&orch, urls(3), None).await;
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.success_rate, 66.67);

        let failed = &report.outcomes[1];
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::UpstreamHttp);
        assert_eq!(error.status_code, 502);
    }

    #[tokio::test]
    async fn batch_concurrency_is_bounded() {
        let fetcher = Arc::new(FakeFetcher::default());
        for i in 0..5 {
            fetcher.respond(
                &format!("https://site{i}.example.com/"),
                html_page("slow"),
                Duration::from_millis(50),
            );
        }
        let orch = simple(fetcher.clone(), Arc::new(FakeRenderer::default()));

        let report = run(&orch, urls(5), Some(2)).await;
        assert_eq!(report.summary.succeeded, 5);
        assert_eq!(fetcher.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn global_render_limit_spans_batches() {
        let fetcher = Arc::new(FakeFetcher::default());
        let renderer = Arc::new(FakeRenderer::default());
        renderer.set_delay(Duration::from_millis(40));
        for i in 0..4 {
            fetcher.respond(&format!("https://site{i}.example.com/"), SHELL, Duration::ZERO);
        }
        let orch = orchestrator(fetcher, renderer.clone(), GlobalLimits::new(1, 16));

        let (a, b) = tokio::join!(run(&orch, urls(2), Some(2)), async {
            let entries: Vec<BatchEntry> = urls(4).into_iter().skip(2).collect();
            run(&orch, entries, Some(2)).await
        });
        assert_eq!(a.summary.succeeded + b.summary.succeeded, 4);
        assert_eq!(renderer.max_in_flight(), 1);
        assert!(a.outcomes.iter().all(|o| o.rendered));
    }

    #[tokio::test]
    async fn invalid_url_is_a_validation_outcome() {
        let orch = simple(Arc::new(FakeFetcher::default()), Arc::new(FakeRenderer::default()));
        let report = run(&orch, vec![BatchEntry::new("http://127.0.0.1/admin")], None).await;
        let error = report.outcomes[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.status_code, 400);
    }

    #[tokio::test]
    async fn slow_url_times_out_alone() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond("https://site0.example.com/", html_page("slow"), Duration::from_secs(10));
        fetcher.respond("https://site1.example.com/", html_page("fast"), Duration::ZERO);
        let orch = simple(fetcher, Arc::new(FakeRenderer::default()));

        let report = orch
            .run_batch(
                urls(2),
                OutputFormat::Text,
                None,
                Some(Duration::from_millis(50)),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        let error = report.outcomes[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.status_code, 408);
        assert!(report.outcomes[1].success);
        assert_eq!(report.outcomes[1].format, Some(OutputFormat::Text));
    }

    #[tokio::test]
    async fn render_failure_falls_back_in_auto_mode() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond("https://site0.example.com/", SHELL, Duration::ZERO);
        let renderer = Arc::new(FakeRenderer::default());
        renderer.fail_with(FetchError::RenderingFailed("crashed".into()));
        let orch = simple(fetcher, renderer.clone());

        let report = run(&orch, urls(1), None).await;
        let outcome = &report.outcomes[0];
        assert!(outcome.success);
        assert!(!outcome.rendered);
        assert_eq!(renderer.calls(), 1);

        let mut entry = BatchEntry::new("https://site0.example.com/");
        entry.render_mode = RenderMode::Always;
        let report = run(&orch, vec![entry], None).await;
        assert_eq!(report.outcomes[0].error.as_ref().unwrap().kind, ErrorKind::Rendering);
    }

    #[tokio::test]
    async fn selector_timeout_is_never_downgraded() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond("https://site0.example.com/", html_page("static"), Duration::ZERO);
        let renderer = Arc::new(FakeRenderer::default());
        renderer.fail_with(FetchError::SelectorTimeout {
            selector: "#late".into(),
            timeout: Duration::from_secs(10),
        });
        let orch = simple(fetcher, renderer);

        let mut entry = BatchEntry::new("https://site0.example.com/");
        entry.wait_for_selector = Some("#late".to_string());
        let report = run(&orch, vec![entry], None).await;
        let error = report.outcomes[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert!(error.message.contains("#late"));
    }

    #[tokio::test]
    async fn never_mode_skips_rendering() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond("https://site0.example.com/", SHELL, Duration::ZERO);
        let renderer = Arc::new(FakeRenderer::default());
        let orch = simple(fetcher, renderer.clone());

        let mut entry = BatchEntry::new("https://site0.example.com/");
        entry.render_mode = RenderMode::Never;
        let report = run(&orch, vec![entry], None).await;
        assert!(report.outcomes[0].success);
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_renderer_keeps_plain_document() {
        let fetcher = Arc::new(FakeFetcher::default());
        fetcher.respond("https://site0.example.com/", SHELL, Duration::ZERO);
        let renderer = Arc::new(FakeRenderer::default());
        renderer.set_available(false);
        let orch = simple(fetcher, renderer.clone());

        let report = run(&orch, urls(1), None).await;
        assert!(report.outcomes[0].success);
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancelled_outcomes() {
        let fetcher = Arc::new(FakeFetcher::default());
        for i in 0..3 {
            fetcher.respond(
                &format!("https://site{i}.example.com/"),
                html_page("x"),
                Duration::from_secs(10),
            );
        }
        let orch = simple(fetcher, Arc::new(FakeRenderer::default()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = orch
            .run_batch(urls(3), OutputFormat::Markdown, Some(1), None, &cancel, None)
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 3);
        for outcome in &report.outcomes {
            let error = outcome.error.as_ref().unwrap();
            assert_eq!(error.kind, ErrorKind::Cancelled);
            assert_eq!(error.status_code, 499);
        }
    }

    #[tokio::test]
    async fn progress_stream_sees_every_outcome() {
        let fetcher = Arc::new(FakeFetcher::default());
        for i in 0..3 {
            fetcher.respond(&format!("https://site{i}.example.com/"), html_page("p"), Duration::ZERO);
        }
        let orch = simple(fetcher, Arc::new(FakeRenderer::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        orch.run_batch(
            urls(3),
            OutputFormat::Html,
            None,
            None,
            &CancellationToken::new(),
            Some(tx),
        )
        .await
        .unwrap();

        let mut seen = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            seen.push(outcome.index);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn batch_limits_are_enforced() {
        let orch = simple(Arc::new(FakeFetcher::default()), Arc::new(FakeRenderer::default()));
        let result = orch
            .run_batch(
                urls(101),
                OutputFormat::Markdown,
                None,
                None,
                &CancellationToken::new(),
                None,
            )
            .await;
        assert!(matches!(result, Err(FetchError::Validation(_))));

        assert_eq!(orch.settings().clamp_concurrency(Some(0)), 1);
        assert_eq!(orch.settings().clamp_concurrency(Some(500)), 20);
        assert_eq!(orch.settings().clamp_concurrency(None), 5);

        let report = run(&orch, Vec::new(), None).await;
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.success_rate, 0.0);
    }

    #[tokio::test]
    async fn mocked_fetcher_receives_caller_headers() {
        let mut mock = MockHttpFetcher::new();
        mock.expect_fetch()
            .withf(|url, headers| {
                url == "https://docs.example.com/" && headers.get("x-api-key") == Some(&"k".to_string())
            })
            .times(1)
            .returning(|_, _| Ok(html_page("from mock").into_fetched("https://docs.example.com/")));
        let orch = orchestrator(
            Arc::new(mock),
            Arc::new(FakeRenderer::default()),
            GlobalLimits::new(1, 1),
        );

        let mut entry = BatchEntry::new("https://docs.example.com/");
        entry.headers.insert("x-api-key".to_string(), "k".to_string());
        let output = orch
            .fetch_entry(&entry, OutputFormat::Text, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.converted.content.as_text().unwrap().contains("from mock"));
        assert!(!output.rendered);
    }
}
