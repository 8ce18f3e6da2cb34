//! The fetch service
//!
//! `FetchService` is built once at start-up and owns every long-lived
//! component: the optional browser pool, the classifier and its caches, the
//! HTTP client, the global limiters and the job manager. Nothing here is a
//! global; tests build a service from fakes with [`FetchService::with_parts`].

use crate::{
    BatchEntry, BatchJobRequest, BatchReport, BrowserPool, ChromeLauncher,
    ConcurrencyOrchestrator, Config, FetchError, GlobalLimits, HttpFetcher, JobId, JobManager,
    JobProgressTracker, JobRecord, JobStore, MemoryJobStore, OrchestratorSettings,
    OutcomeContent, OutputFormat, PageRenderer, PoolSettings, PoolStats, RenderMode,
    RenderSettings, RenderedFetcher, RenderingClassifier, ReqwestFetcher, ServiceHealth,
    UrlGuard,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A synchronous single-URL request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleFetchRequest {
    pub url: String,
    /// Explicit format; wins over `accept`
    #[serde(default)]
    pub format: Option<OutputFormat>,
    /// Accept-style hint used when no format is given
    #[serde(default)]
    pub accept: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub wait_for_selector: Option<String>,
    #[serde(default)]
    pub render_mode: RenderMode,
}

impl SingleFetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn resolved_format(&self) -> OutputFormat {
        self.format
            .unwrap_or_else(|| OutputFormat::from_accept(self.accept.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub format: OutputFormat,
    pub content: OutcomeContent,
    pub size: usize,
    pub rendered: bool,
    pub duration_ms: u64,
}

/// Components a service can be assembled from.
pub struct ServiceParts {
    pub pool: Option<Arc<BrowserPool>>,
    pub fetcher: Arc<dyn HttpFetcher>,
    /// Defaults to a pool-backed renderer
    pub renderer: Option<Arc<dyn PageRenderer>>,
    pub store: Arc<dyn JobStore>,
}

pub struct FetchService {
    config: Config,
    pool: Option<Arc<BrowserPool>>,
    classifier: Arc<RenderingClassifier>,
    orchestrator: Arc<ConcurrencyOrchestrator>,
    jobs: JobManager,
    shutdown: CancellationToken,
}

impl FetchService {
    /// Validate `config`, launch the browser pool when rendering is enabled,
    /// and wire the service. A pool launch failure is fatal.
    pub async fn new(config: Config) -> Result<Self, FetchError> {
        config.validate()?;

        let pool = if config.rendering_enabled {
            let launcher = Arc::new(ChromeLauncher::new(config.launch.clone()));
            Some(BrowserPool::start(PoolSettings::from_config(&config), launcher).await?)
        } else {
            info!("Rendering disabled; pages are served as fetched");
            None
        };

        let fetcher = Arc::new(ReqwestFetcher::new(
            &config.http,
            config.timeouts.fetch,
            UrlGuard::new(config.url_guard.clone()),
        )?);
        Ok(Self::with_parts(
            config,
            ServiceParts {
                pool,
                fetcher,
                renderer: None,
                store: Arc::new(MemoryJobStore::new()),
            },
        ))
    }

    pub fn with_parts(config: Config, parts: ServiceParts) -> Self {
        let renderer = parts.renderer.unwrap_or_else(|| {
            Arc::new(RenderedFetcher::new(
                parts.pool.clone(),
                RenderSettings::from_config(&config),
            ))
        });
        let classifier = Arc::new(RenderingClassifier::new(config.classifier.clone()));
        let orchestrator = Arc::new(ConcurrencyOrchestrator::new(
            Arc::new(UrlGuard::new(config.url_guard.clone())),
            parts.fetcher,
            classifier.clone(),
            renderer,
            GlobalLimits::new(
                config.concurrency.max_concurrent_renders,
                config.concurrency.max_concurrent_fetches,
            ),
            OrchestratorSettings::from_config(&config),
        ));
        let tracker = Arc::new(JobProgressTracker::new(parts.store, config.jobs.clone()));
        let jobs = JobManager::new(tracker, orchestrator.clone(), &config.jobs);

        Self {
            config,
            pool: parts.pool,
            classifier,
            orchestrator,
            jobs,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn classifier(&self) -> &RenderingClassifier {
        &self.classifier
    }

    pub fn pool(&self) -> Option<&Arc<BrowserPool>> {
        self.pool.as_ref()
    }

    /// Fetch one URL through the full pipeline.
    pub async fn fetch_one(&self, request: SingleFetchRequest) -> Result<FetchResponse, FetchError> {
        let format = request.resolved_format();
        let entry = BatchEntry {
            url: request.url,
            format: Some(format),
            headers: request.headers,
            wait_for_selector: request.wait_for_selector,
            render_mode: request.render_mode,
        };

        let started = Instant::now();
        let cancel = self.shutdown.child_token();
        let output = self.orchestrator.fetch_entry(&entry, format, &cancel).await?;
        Ok(FetchResponse {
            url: entry.url,
            final_url: output.final_url,
            format: output.converted.format,
            size: output.converted.content.len(),
            content: output.converted.content,
            rendered: output.rendered,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run a batch inline and return its report. Used by callers that do not
    /// need a job id.
    pub async fn fetch_batch(&self, request: BatchJobRequest) -> Result<BatchReport, FetchError> {
        let cancel = self.shutdown.child_token();
        self.orchestrator
            .run_batch(
                request.entries,
                request.format,
                request.concurrency,
                request.per_url_timeout_ms.map(std::time::Duration::from_millis),
                &cancel,
                None,
            )
            .await
    }

    pub async fn submit_batch(&self, request: BatchJobRequest) -> Result<JobId, FetchError> {
        self.jobs.submit(request).await
    }

    pub async fn job_status(&self, id: &str) -> Result<JobRecord, FetchError> {
        self.jobs.status(id).await
    }

    pub async fn job_results(&self, id: &str) -> Result<Option<BatchReport>, FetchError> {
        self.jobs.results(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<bool, FetchError> {
        self.jobs.cancel(id).await
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        let stats = self.pool.as_ref().map(|pool| pool.stats());
        if let Some(stats) = &stats {
            crate::metrics::record_pool_stats(stats);
        }
        stats
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth::new(
            self.config.rendering_enabled,
            self.pool_stats(),
            self.jobs.active_jobs(),
            self.classifier.cache_sizes(),
        )
    }

    /// Cancel running jobs and single fetches, then close the browser pool.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down fetch service");
        self.shutdown.cancel();
        self.jobs.shutdown().await;
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        if let Some(stats) = self.pool_stats() {
            if stats.busy > 0 {
                warn!("{} browser instances still checked out at shutdown", stats.busy);
            }
        }
    }
}
