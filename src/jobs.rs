//! Asynchronous batch jobs
//!
//! `JobProgressTracker` keeps one JSON record per job in a [`JobStore`] and
//! applies progress deltas with optimistic compare-and-set retries.
//! `JobManager` runs batches in the background and feeds the tracker from the
//! orchestrator's outcome stream.

use crate::utils::percentage;
use crate::{
    BatchEntry, BatchReport, BatchSummary, BatchUrlOutcome, ConcurrencyOrchestrator, FetchError,
    JobSettings, JobStore, OutputFormat,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Forward-only transitions; terminal states never change.
    pub fn can_become(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// What a job is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub total: usize,
    pub format: OutputFormat,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub format: OutputFormat,
    pub concurrency: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl JobRecord {
    fn new(id: JobId, spec: &JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            total: spec.total,
            succeeded: 0,
            failed: 0,
            format: spec.format,
            concurrency: spec.concurrency,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn progress_percent(&self) -> f64 {
        percentage(self.completed(), self.total)
    }

    fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.status {
            if self.status.can_become(status) {
                self.status = status;
            } else if status != self.status {
                debug!(
                    "Job {} ignores transition {} -> {}",
                    self.id,
                    self.status.as_str(),
                    status.as_str()
                );
            }
        }
        if let Some((succeeded, failed)) = update.totals {
            self.succeeded = succeeded.min(self.total);
            self.failed = failed.min(self.total - self.succeeded);
        } else {
            let room = self.total.saturating_sub(self.completed());
            let succeeded = update.succeeded.min(room);
            self.succeeded += succeeded;
            self.failed += update.failed.min(room - succeeded);
        }
        if self.error.is_none() {
            self.error = update.error.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// A delta applied to a job record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub succeeded: usize,
    pub failed: usize,
    pub error: Option<String>,
    /// Final (succeeded, failed) counts. Overrides the deltas, so per-URL
    /// updates that were lost to contention cannot skew the finished record.
    pub totals: Option<(usize, usize)>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn finished(status: JobStatus, summary: &BatchSummary) -> Self {
        Self {
            status: Some(status),
            totals: Some((summary.succeeded, summary.failed)),
            ..Default::default()
        }
    }

    pub fn failed_with(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn outcome(outcome: &BatchUrlOutcome) -> Self {
        if outcome.success {
            Self {
                succeeded: 1,
                ..Default::default()
            }
        } else {
            Self {
                failed: 1,
                ..Default::default()
            }
        }
    }
}

fn record_key(id: &str) -> String {
    format!("job:{id}")
}

fn result_key(id: &str) -> String {
    format!("job:{id}:result")
}

pub struct JobProgressTracker {
    store: Arc<dyn JobStore>,
    settings: JobSettings,
}

impl JobProgressTracker {
    pub fn new(store: Arc<dyn JobStore>, settings: JobSettings) -> Self {
        Self { store, settings }
    }

    pub async fn create(&self, spec: JobSpec) -> Result<JobId, FetchError> {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord::new(id.clone(), &spec);
        self.store
            .set_with_ttl(&record_key(&id), serde_json::to_vec(&record)?, self.settings.ttl)
            .await?;
        info!("Created job {} for {} URLs", id, spec.total);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, FetchError> {
        match self.store.get(&record_key(id)).await? {
            Some(versioned) => Ok(Some(serde_json::from_slice(&versioned.value)?)),
            None => Ok(None),
        }
    }

    /// Read, apply `update`, and write back only if nobody wrote in between.
    /// Interference is retried with doubling backoff until the configured
    /// attempts run out, which surfaces as `JobConflict`.
    pub async fn update_progress(&self, id: &str, update: JobUpdate) -> Result<JobRecord, FetchError> {
        let key = record_key(id);
        let mut backoff = self.settings.base_backoff;

        for attempt in 1..=self.settings.update_attempts {
            let current = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| FetchError::JobNotFound(id.to_string()))?;
            let mut record: JobRecord = serde_json::from_slice(&current.value)?;
            let before = record.status;
            record.apply(&update);

            let written = self
                .store
                .compare_and_set(&key, current.version, serde_json::to_vec(&record)?, self.settings.ttl)
                .await?;
            if written {
                if record.status != before {
                    info!("Job {} is now {}", id, record.status.as_str());
                }
                return Ok(record);
            }

            crate::metrics::record_job_conflict();
            if attempt < self.settings.update_attempts {
                debug!(
                    "Job {} changed concurrently (attempt {}/{}), retrying in {:?}",
                    id, attempt, self.settings.update_attempts, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        warn!(
            "Giving up on job {} update after {} attempts",
            id, self.settings.update_attempts
        );
        Err(FetchError::JobConflict(id.to_string()))
    }

    pub async fn store_result(&self, id: &str, report: &BatchReport) -> Result<(), FetchError> {
        self.store
            .set_with_ttl(&result_key(id), serde_json::to_vec(report)?, self.settings.ttl)
            .await
    }

    pub async fn results(&self, id: &str) -> Result<Option<BatchReport>, FetchError> {
        match self.store.get(&result_key(id)).await? {
            Some(versioned) => Ok(Some(serde_json::from_slice(&versioned.value)?)),
            None => Ok(None),
        }
    }

    /// Mark a job cancelled. False when the job is unknown or already finished.
    pub async fn cancel(&self, id: &str) -> Result<bool, FetchError> {
        match self.get(id).await? {
            Some(record) if !record.status.is_terminal() => {}
            _ => return Ok(false),
        }
        let record = self
            .update_progress(id, JobUpdate::status(JobStatus::Cancelled))
            .await?;
        Ok(record.status == JobStatus::Cancelled)
    }
}

/// A batch submitted for background processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchJobRequest {
    pub entries: Vec<BatchEntry>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub per_url_timeout_ms: Option<u64>,
}

struct ActiveJob {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct JobManager {
    tracker: Arc<JobProgressTracker>,
    orchestrator: Arc<ConcurrencyOrchestrator>,
    active: DashMap<JobId, ActiveJob>,
    shutdown: CancellationToken,
    cancel_grace: Duration,
}

impl JobManager {
    pub fn new(
        tracker: Arc<JobProgressTracker>,
        orchestrator: Arc<ConcurrencyOrchestrator>,
        settings: &JobSettings,
    ) -> Self {
        Self {
            tracker,
            orchestrator,
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
            cancel_grace: settings.cancel_grace,
        }
    }

    pub fn tracker(&self) -> &Arc<JobProgressTracker> {
        &self.tracker
    }

    /// Jobs whose background task is still running.
    pub fn active_jobs(&self) -> usize {
        self.active.iter().filter(|job| !job.task.is_finished()).count()
    }

    /// Create the job record and start the batch in the background. Fails
    /// only when the batch is malformed or the record cannot be stored.
    pub async fn submit(&self, request: BatchJobRequest) -> Result<JobId, FetchError> {
        if self.shutdown.is_cancelled() {
            return Err(FetchError::Internal("job manager is shut down".to_string()));
        }
        let settings = self.orchestrator.settings();
        if request.entries.len() > settings.max_batch_urls {
            return Err(FetchError::Validation(format!(
                "batch of {} URLs exceeds the limit of {}",
                request.entries.len(),
                settings.max_batch_urls
            )));
        }

        let spec = JobSpec {
            total: request.entries.len(),
            format: request.format,
            concurrency: settings.clamp_concurrency(request.concurrency),
        };
        let id = self.tracker.create(spec).await?;

        self.active.retain(|_, job| !job.task.is_finished());
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_job(
            self.tracker.clone(),
            self.orchestrator.clone(),
            id.clone(),
            request,
            cancel.clone(),
        ));
        self.active.insert(id.clone(), ActiveJob { cancel, task });
        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<JobRecord, FetchError> {
        self.tracker
            .get(id)
            .await?
            .ok_or_else(|| FetchError::JobNotFound(id.to_string()))
    }

    /// Final report, or `None` while the job is still running.
    pub async fn results(&self, id: &str) -> Result<Option<BatchReport>, FetchError> {
        self.status(id).await?;
        self.tracker.results(id).await
    }

    /// Cancel a job and wait, bounded, for its in-flight URLs to clean up.
    pub async fn cancel(&self, id: &str) -> Result<bool, FetchError> {
        let active = self.active.remove(id).map(|(_, job)| job);
        if let Some(job) = &active {
            job.cancel.cancel();
        }
        let cancelled = self.tracker.cancel(id).await?;

        if let Some(job) = active {
            match tokio::time::timeout(self.cancel_grace, job.task).await {
                Ok(Ok(())) => debug!("Job {} stopped after cancellation", id),
                Ok(Err(e)) => error!("Job {} task failed: {}", id, e),
                Err(_) => warn!(
                    "Job {} did not stop within {:?} of cancellation",
                    id, self.cancel_grace
                ),
            }
        }
        Ok(cancelled)
    }

    /// Cancel every running job and wait for them within the cancel grace.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<JobId> = self.active.iter().map(|job| job.key().clone()).collect();
        let tasks: Vec<JoinHandle<()>> = ids
            .iter()
            .filter_map(|id| self.active.remove(id).map(|(_, job)| job.task))
            .collect();
        if tasks.is_empty() {
            return;
        }

        info!("Waiting for {} running jobs to stop", tasks.len());
        if tokio::time::timeout(self.cancel_grace, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Some jobs did not stop within {:?}", self.cancel_grace);
        }
    }
}

async fn run_job(
    tracker: Arc<JobProgressTracker>,
    orchestrator: Arc<ConcurrencyOrchestrator>,
    id: JobId,
    request: BatchJobRequest,
    cancel: CancellationToken,
) {
    if let Err(e) = tracker
        .update_progress(&id, JobUpdate::status(JobStatus::Running))
        .await
    {
        warn!("Could not mark job {} running: {}", id, e);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<BatchUrlOutcome>();
    let forward = async {
        while let Some(outcome) = rx.recv().await {
            if let Err(e) = tracker.update_progress(&id, JobUpdate::outcome(&outcome)).await {
                warn!("Progress update for job {} lost: {}", id, e);
            }
        }
    };
    let run = orchestrator.run_batch(
        request.entries,
        request.format,
        request.concurrency,
        request.per_url_timeout_ms.map(Duration::from_millis),
        &cancel,
        Some(tx),
    );
    let (report, ()) = tokio::join!(run, forward);

    let update = match report {
        Ok(report) => match tracker.store_result(&id, &report).await {
            Ok(()) => {
                info!(
                    "Job {} finished: {}/{} succeeded",
                    id, report.summary.succeeded, report.summary.total
                );
                let status = if cancel.is_cancelled() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Completed
                };
                JobUpdate::finished(status, &report.summary)
            }
            Err(e) => {
                error!("Storing results of job {} failed: {}", id, e);
                JobUpdate::failed_with(e.public_message())
            }
        },
        Err(e) => {
            error!("Job {} could not run: {}", id, e);
            JobUpdate::failed_with(e.public_message())
        }
    };

    if let Err(e) = tracker.update_progress(&id, update).await {
        error!("Final status of job {} not recorded: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ContendedJobStore;
    use crate::MemoryJobStore;

    fn settings() -> JobSettings {
        JobSettings {
            ttl: Duration::from_secs(60),
            update_attempts: 3,
            base_backoff: Duration::from_millis(10),
            cancel_grace: Duration::from_secs(1),
        }
    }

    fn spec(total: usize) -> JobSpec {
        JobSpec {
            total,
            format: OutputFormat::Markdown,
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn records_start_pending() {
        let tracker = JobProgressTracker::new(Arc::new(MemoryJobStore::new()), settings());
        let id = tracker.create(spec(4)).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        let record = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.total, 4);
        assert_eq!(record.progress_percent(), 0.0);
        assert!(tracker.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_accumulates() {
        let tracker = JobProgressTracker::new(Arc::new(MemoryJobStore::new()), settings());
        let id = tracker.create(spec(3)).await.unwrap();

        tracker
            .update_progress(&id, JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();
        tracker
            .update_progress(&id, JobUpdate { succeeded: 2, ..Default::default() })
            .await
            .unwrap();
        let record = tracker
            .update_progress(&id, JobUpdate { failed: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.completed(), 3);
        assert_eq!(record.progress_percent(), 100.0);

        // Counters never exceed the job size.
        let record = tracker
            .update_progress(&id, JobUpdate { failed: 5, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(record.failed, 1);
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let tracker = JobProgressTracker::new(Arc::new(MemoryJobStore::new()), settings());
        let id = tracker.create(spec(1)).await.unwrap();

        assert!(tracker.cancel(&id).await.unwrap());
        let record = tracker
            .update_progress(&id, JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(!tracker.cancel(&id).await.unwrap());
        assert!(!tracker.cancel("missing").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_updates_both_land() {
        let store = Arc::new(ContendedJobStore::new(Duration::from_millis(5)));
        let tracker = JobProgressTracker::new(store.clone(), settings());
        let id = tracker.create(spec(10)).await.unwrap();

        let (a, b) = tokio::join!(
            tracker.update_progress(&id, JobUpdate { succeeded: 1, ..Default::default() }),
            tracker.update_progress(&id, JobUpdate { failed: 1, ..Default::default() }),
        );
        a.unwrap();
        b.unwrap();

        let record = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(record.succeeded, 1);
        assert_eq!(record.failed, 1);
        assert!(store.conflicts() >= 1);
    }

    #[tokio::test]
    async fn final_update_restores_lost_progress() {
        let store = Arc::new(ContendedJobStore::new(Duration::ZERO));
        let tracker = JobProgressTracker::new(store.clone(), settings());
        let id = tracker.create(spec(3)).await.unwrap();
        tracker
            .update_progress(&id, JobUpdate { succeeded: 1, ..Default::default() })
            .await
            .unwrap();

        // The other two per-URL updates never land.
        store.set_always_conflict(true);
        let lost = tracker
            .update_progress(&id, JobUpdate { failed: 1, ..Default::default() })
            .await;
        assert!(matches!(lost, Err(FetchError::JobConflict(_))));
        store.set_always_conflict(false);

        let summary = BatchSummary {
            total: 3,
            succeeded: 2,
            failed: 1,
            success_rate: 66.67,
            duration_ms: 12,
        };
        let record = tracker
            .update_progress(&id, JobUpdate::finished(JobStatus::Completed, &summary))
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.succeeded, 2);
        assert_eq!(record.failed, 1);
        assert_eq!(record.progress_percent(), 100.0);
    }

    #[tokio::test]
    async fn persistent_interference_surfaces_conflict() {
        let store = Arc::new(ContendedJobStore::new(Duration::ZERO));
        let tracker = JobProgressTracker::new(store.clone(), settings());
        let id = tracker.create(spec(1)).await.unwrap();
        store.set_always_conflict(true);

        let started = std::time::Instant::now();
        let result = tracker
            .update_progress(&id, JobUpdate { succeeded: 1, ..Default::default() })
            .await;
        assert!(matches!(result, Err(FetchError::JobConflict(_))));
        assert_eq!(store.conflicts(), 3);
        // Backoff of 10ms then 20ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn results_round_trip_through_store() {
        let tracker = JobProgressTracker::new(Arc::new(MemoryJobStore::new()), settings());
        let id = tracker.create(spec(0)).await.unwrap();
        assert!(tracker.results(&id).await.unwrap().is_none());

        let report = BatchReport {
            outcomes: Vec::new(),
            summary: crate::BatchSummary::from_outcomes(&[], Duration::from_millis(3)),
        };
        tracker.store_result(&id, &report).await.unwrap();
        assert_eq!(tracker.results(&id).await.unwrap(), Some(report));
    }

    #[tokio::test]
    async fn unknown_job_update_is_not_found() {
        let tracker = JobProgressTracker::new(Arc::new(MemoryJobStore::new()), settings());
        let result = tracker
            .update_progress("nope", JobUpdate::status(JobStatus::Running))
            .await;
        assert!(matches!(result, Err(FetchError::JobNotFound(_))));
    }
}
