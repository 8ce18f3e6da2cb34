//! Metrics recording for fetches, renders and the browser pool
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library users pay nothing unless they call
//! [`install_prometheus_exporter`].

use crate::{ErrorKind, PoolStats};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

pub fn record_url_outcome(duration: Duration, rendered: bool, error: Option<ErrorKind>) {
    let mode = if rendered { "rendered" } else { "static" };
    match error {
        None => ::metrics::increment_counter!("pagefetch_urls_succeeded_total", "mode" => mode),
        Some(kind) => {
            ::metrics::increment_counter!("pagefetch_urls_failed_total", "kind" => kind.as_str())
        }
    }
    ::metrics::histogram!("pagefetch_url_duration_seconds", duration.as_secs_f64(), "mode" => mode);
}

pub fn record_decision(reason: &'static str, render: Option<bool>) {
    let outcome = match render {
        Some(true) => "render",
        Some(false) => "static",
        None => "ambiguous",
    };
    ::metrics::increment_counter!(
        "pagefetch_classifier_decisions_total",
        "outcome" => outcome,
        "reason" => reason
    );
}

pub fn record_static_fallback() {
    ::metrics::increment_counter!("pagefetch_static_fallbacks_total");
}

pub fn record_render_duration(duration: Duration, success: bool) {
    let result = if success { "ok" } else { "error" };
    ::metrics::histogram!(
        "pagefetch_render_duration_seconds",
        duration.as_secs_f64(),
        "result" => result
    );
}

pub fn record_browser_replacement(success: bool) {
    let result = if success { "ok" } else { "error" };
    ::metrics::increment_counter!("pagefetch_browser_replacements_total", "result" => result);
}

pub fn record_forced_kill() {
    ::metrics::increment_counter!("pagefetch_browser_forced_kills_total");
}

pub fn record_pool_stats(stats: &PoolStats) {
    ::metrics::gauge!("pagefetch_pool_available", stats.available as f64);
    ::metrics::gauge!("pagefetch_pool_busy", stats.busy as f64);
    ::metrics::gauge!("pagefetch_pool_missing", stats.missing as f64);
    let utilization = if stats.capacity > 0 {
        (stats.busy as f64 / stats.capacity as f64) * 100.0
    } else {
        0.0
    };
    ::metrics::gauge!("pagefetch_pool_utilization_percent", utilization);
}

pub fn record_job_conflict() {
    ::metrics::increment_counter!("pagefetch_job_update_conflicts_total");
}

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn install_prometheus_exporter(port: u16) -> Result<(), anyhow::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!("Prometheus metrics available on {}", addr);
    Ok(())
}

/// Rolling window of per-URL durations and failure counts, used for the
/// summary printed by the CLI.
pub struct PerformanceTracker {
    durations: Arc<RwLock<Vec<Duration>>>,
    failures: Arc<RwLock<HashMap<ErrorKind, usize>>>,
    max_samples: usize,
}

impl PerformanceTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            durations: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            max_samples: max_samples.max(1),
        }
    }

    pub async fn record(&self, duration: Duration, error: Option<ErrorKind>) {
        {
            let mut durations = self.durations.write().await;
            durations.push(duration);
            if durations.len() > self.max_samples {
                durations.remove(0);
            }
        }
        if let Some(kind) = error {
            *self.failures.write().await.entry(kind).or_insert(0) += 1;
        }
    }

    pub async fn stats(&self) -> PerformanceStats {
        let durations = self.durations.read().await;
        let failures = self.failures.read().await;

        let samples = durations.len();
        let average = if samples > 0 {
            durations.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples as f64
        } else {
            0.0
        };

        let p95 = if samples > 0 {
            let mut sorted = durations.clone();
            sorted.sort();
            let index = ((samples as f64 * 0.95) as usize).min(samples - 1);
            sorted[index].as_secs_f64()
        } else {
            0.0
        };

        PerformanceStats {
            samples,
            average_seconds: average,
            p95_seconds: p95,
            failures: failures.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceStats {
    pub samples: usize,
    pub average_seconds: f64,
    pub p95_seconds: f64,
    pub failures: HashMap<ErrorKind, usize>,
}
