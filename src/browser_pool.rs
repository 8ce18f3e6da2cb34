//! Browser pool management for concurrent headless browser instances
//!
//! The pool owns a fixed number of browser processes and hands them out
//! through a FIFO queue guarded by a semaphore whose permit count always
//! equals the number of queued instances. Health is checked when an instance
//! comes back; unhealthy instances are terminated and replaced instead of
//! being queued again.

use crate::{BrowserLauncher, BrowserProcess, Config, FetchError, ProcessHandle};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Sizing and timeouts for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub capacity: usize,
    /// Graceful close window per instance before a kill
    pub graceful_close: Duration,
    /// Aggregate bound for [`BrowserPool::close`]
    pub close_timeout: Duration,
    /// Connectivity probe bound on release
    pub health_probe: Duration,
    /// First wait before relaunching a missing slot
    pub restore_backoff: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.browser_pool_size,
            graceful_close: config.timeouts.graceful_close,
            close_timeout: config.timeouts.pool_close,
            health_probe: config.timeouts.health_probe,
            restore_backoff: config.timeouts.restore_backoff,
        }
    }
}

#[derive(Debug, Clone)]
struct InstanceUsage {
    pid: Option<u32>,
    usage_count: u64,
    created_at: Instant,
    last_used: Option<Instant>,
    checked_out: bool,
}

impl InstanceUsage {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            usage_count: 0,
            created_at: Instant::now(),
            last_used: None,
            checked_out: false,
        }
    }
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured number of instances
    pub capacity: usize,
    /// Live instances, whether queued or checked out
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    /// Slots whose replacement launch failed and is awaiting retry
    pub missing: usize,
    pub acquisitions: u64,
    pub replacements: u64,
    pub exhausted: u64,
    pub closed: bool,
}

/// Usage of a single live instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: usize,
    pub pid: Option<u32>,
    pub usage_count: u64,
    pub checked_out: bool,
    pub age: Duration,
    pub idle_time: Option<Duration>,
}

pub struct BrowserPool {
    settings: PoolSettings,
    launcher: Arc<dyn BrowserLauncher>,
    available: Mutex<VecDeque<ProcessHandle>>,
    permits: Semaphore,
    usage: Mutex<HashMap<usize, InstanceUsage>>,
    next_instance_id: AtomicUsize,
    missing: AtomicUsize,
    restoring: AtomicBool,
    closed: AtomicBool,
    acquisitions: AtomicU64,
    replacements: AtomicU64,
    exhausted: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrowserPool {
    /// Launch every instance up front. Any single launch failure tears down
    /// the instances already started and fails the whole pool.
    pub async fn start(
        settings: PoolSettings,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Arc<Self>, FetchError> {
        if settings.capacity == 0 {
            return Err(FetchError::Configuration(
                "Browser pool capacity must be greater than 0".to_string(),
            ));
        }

        let mut launched = Vec::with_capacity(settings.capacity);
        for id in 0..settings.capacity {
            match launcher.launch(id).await {
                Ok(process) => {
                    info!("Browser instance {} created successfully", id);
                    launched.push(ProcessHandle::new(id, process));
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", id, e);
                    let graceful = settings.graceful_close;
                    join_all(launched.into_iter().map(|h| h.terminate(graceful))).await;
                    launcher.shutdown().await;
                    return Err(e);
                }
            }
        }

        let pool = Arc::new(Self {
            next_instance_id: AtomicUsize::new(settings.capacity),
            settings,
            launcher,
            available: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
            usage: Mutex::new(HashMap::new()),
            missing: AtomicUsize::new(0),
            restoring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        });

        for handle in launched {
            if let Err(handle) = pool.admit(handle, None) {
                handle.terminate(pool.settings.graceful_close).await;
            }
        }

        info!("Browser pool initialized with {} instances", pool.settings.capacity);
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait up to `wait` for an instance and take exclusive ownership of it.
    pub async fn acquire(self: &Arc<Self>, wait: Duration) -> Result<BrowserLease, FetchError> {
        if self.is_closed() {
            return Err(FetchError::PoolClosed);
        }
        self.schedule_restore(Duration::ZERO);

        let permit = match timeout(wait, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FetchError::PoolClosed),
            Err(_) => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!("No browser instance available within {:?}", wait);
                return Err(FetchError::PoolExhausted(wait));
            }
        };
        // The permit now stands for the queued instance we are about to take.
        permit.forget();

        let handle = {
            let mut queue = lock(&self.available);
            let handle = queue.pop_front();
            if let Some(handle) = &handle {
                let mut usage = lock(&self.usage);
                if let Some(entry) = usage.get_mut(&handle.id()) {
                    entry.usage_count += 1;
                    entry.last_used = Some(Instant::now());
                    entry.checked_out = true;
                }
            }
            handle
        };

        match handle {
            Some(handle) => {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                debug!("Checked out browser instance {}", handle.id());
                Ok(BrowserLease {
                    handle: Some(handle),
                    pool: self.clone(),
                })
            }
            None if self.is_closed() => Err(FetchError::PoolClosed),
            None => Err(FetchError::Internal(
                "browser pool permit granted with an empty queue".to_string(),
            )),
        }
    }

    /// Return a lease. Leases from another pool are left untouched and go
    /// back to their own pool when dropped.
    pub async fn release(self: &Arc<Self>, lease: BrowserLease) {
        if !Arc::ptr_eq(&lease.pool, self) {
            warn!("Ignoring release of a lease owned by another pool");
            return;
        }
        lease.release().await;
    }

    async fn return_handle(self: &Arc<Self>, handle: ProcessHandle) {
        if self.is_closed() {
            self.retire(handle).await;
            return;
        }

        if !handle.check_health(self.settings.health_probe).await {
            self.replace(handle).await;
            return;
        }

        let id = handle.id();
        match self.admit(handle, Some(id)) {
            Ok(()) => debug!("Browser instance {} returned to pool", id),
            Err(handle) => self.retire(handle).await,
        }

        self.schedule_restore(Duration::ZERO);
    }

    /// Queue `handle` as available, replacing the accounting entry of
    /// `previous` in the same critical section. Hands the handle back if the
    /// pool is closed.
    fn admit(&self, handle: ProcessHandle, previous: Option<usize>) -> Result<(), ProcessHandle> {
        {
            let mut queue = lock(&self.available);
            let mut usage = lock(&self.usage);
            if self.is_closed() {
                if let Some(previous) = previous {
                    usage.remove(&previous);
                }
                return Err(handle);
            }

            let id = handle.id();
            match previous {
                Some(previous) if previous == id => {
                    if let Some(entry) = usage.get_mut(&id) {
                        entry.checked_out = false;
                    }
                }
                Some(previous) => {
                    usage.remove(&previous);
                    usage.insert(id, InstanceUsage::new(handle.pid()));
                }
                None => {
                    usage.insert(id, InstanceUsage::new(handle.pid()));
                }
            }
            queue.push_back(handle);
        }
        self.permits.add_permits(1);
        Ok(())
    }

    /// Terminate an instance that will not come back and drop its accounting.
    async fn retire(&self, handle: ProcessHandle) {
        let id = handle.id();
        lock(&self.usage).remove(&id);
        handle.terminate(self.settings.graceful_close).await;
        debug!("Browser instance {} retired", id);
    }

    /// Terminate an unhealthy instance and launch a fresh one in its slot.
    /// The old instance stays counted as busy until the new one is queued.
    async fn replace(self: &Arc<Self>, handle: ProcessHandle) {
        let old_id = handle.id();
        warn!(
            "Browser instance {} (pid {:?}) unhealthy after {:?}, replacing",
            old_id,
            handle.pid(),
            handle.age()
        );
        handle.terminate(self.settings.graceful_close).await;

        if self.is_closed() {
            lock(&self.usage).remove(&old_id);
            return;
        }

        let new_id = self.next_instance_id.fetch_add(1, Ordering::SeqCst);
        match self.launcher.launch(new_id).await {
            Ok(process) => {
                let fresh = ProcessHandle::new(new_id, process);
                match self.admit(fresh, Some(old_id)) {
                    Ok(()) => {
                        self.replacements.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_browser_replacement(true);
                        info!("Browser instance {} replaced by {}", old_id, new_id);
                    }
                    Err(fresh) => {
                        fresh.terminate(self.settings.graceful_close).await;
                    }
                }
            }
            Err(e) => {
                lock(&self.usage).remove(&old_id);
                self.missing.fetch_add(1, Ordering::SeqCst);
                crate::metrics::record_browser_replacement(false);
                error!(
                    "Failed to replace browser instance {}: {}; retrying in {:?}",
                    old_id, e, self.settings.restore_backoff
                );
                self.schedule_restore(self.settings.restore_backoff);
            }
        }
    }

    /// Start the background task that relaunches missing slots, unless one
    /// is already running. The task keeps retrying with a doubling delay
    /// until every slot is back or the pool closes, so recovery does not
    /// depend on another lease coming back.
    fn schedule_restore(self: &Arc<Self>, first_delay: Duration) {
        if self.is_closed() || self.missing.load(Ordering::SeqCst) == 0 {
            return;
        }
        if self.restoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.restoring.store(false, Ordering::SeqCst);
                return;
            }
        };

        let pool = self.clone();
        runtime.spawn(async move {
            let ceiling = pool.settings.restore_backoff.max(Duration::from_millis(1)) * 32;
            let mut delay = first_delay;
            loop {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if pool.restore_missing().await {
                    break;
                }
                delay = (delay * 2).max(pool.settings.restore_backoff).min(ceiling);
                debug!("Next browser restore attempt in {:?}", delay);
            }
            pool.restoring.store(false, Ordering::SeqCst);
            // A slot may have gone missing between the last check and the
            // flag being cleared.
            pool.schedule_restore(pool.settings.restore_backoff);
        });
    }

    /// Relaunch slots whose replacement failed earlier. Returns false when a
    /// launch fails and the caller should try again later.
    async fn restore_missing(&self) -> bool {
        loop {
            let claimed = self
                .missing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !claimed || self.is_closed() {
                if claimed {
                    self.missing.fetch_add(1, Ordering::SeqCst);
                }
                return true;
            }

            let id = self.next_instance_id.fetch_add(1, Ordering::SeqCst);
            match self.launcher.launch(id).await {
                Ok(process) => {
                    let handle = ProcessHandle::new(id, process);
                    match self.admit(handle, None) {
                        Ok(()) => {
                            self.replacements.fetch_add(1, Ordering::Relaxed);
                            crate::metrics::record_browser_replacement(true);
                            info!("Restored missing browser slot with instance {}", id);
                        }
                        Err(handle) => {
                            handle.terminate(self.settings.graceful_close).await;
                            return true;
                        }
                    }
                }
                Err(e) => {
                    self.missing.fetch_add(1, Ordering::SeqCst);
                    crate::metrics::record_browser_replacement(false);
                    error!("Failed to restore missing browser slot: {}", e);
                    return false;
                }
            }
        }
    }

    /// Lease dropped outside a runtime: the process cannot be awaited, so
    /// its slot is counted as missing.
    fn abandon(&self, handle: ProcessHandle) {
        error!(
            "Browser instance {} (pid {:?}) dropped outside a runtime",
            handle.id(),
            handle.pid()
        );
        lock(&self.usage).remove(&handle.id());
        if !self.is_closed() {
            self.missing.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Stop handing out instances and terminate every queued one. Instances
    /// still checked out are terminated when their lease comes back.
    pub async fn close(&self) {
        let drained: Vec<ProcessHandle> = {
            let mut queue = lock(&self.available);
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.permits.close();
            let drained: Vec<ProcessHandle> = queue.drain(..).collect();
            let mut usage = lock(&self.usage);
            for handle in &drained {
                usage.remove(&handle.id());
            }
            drained
        };

        info!("Shutting down browser pool ({} idle instances)", drained.len());

        // Leave room inside the aggregate bound for the kill that follows a
        // graceful close that runs out of time.
        let graceful = self.settings.graceful_close.min(self.settings.close_timeout / 2);
        let terminations = join_all(drained.into_iter().map(|h| h.terminate(graceful)));
        match timeout(self.settings.close_timeout, terminations).await {
            Ok(results) => debug!("Terminated {} browser instances", results.len()),
            Err(_) => error!(
                "Browser pool close exceeded {:?}; some processes may remain",
                self.settings.close_timeout
            ),
        }

        self.launcher.shutdown().await;
        info!("Browser pool shutdown complete");
    }

    pub fn stats(&self) -> PoolStats {
        let (total, busy) = {
            let usage = lock(&self.usage);
            (usage.len(), usage.values().filter(|u| u.checked_out).count())
        };
        PoolStats {
            capacity: self.settings.capacity,
            total,
            available: total - busy,
            busy,
            missing: self.missing.load(Ordering::SeqCst),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        let usage = lock(&self.usage);
        let mut snapshots: Vec<InstanceSnapshot> = usage
            .iter()
            .map(|(id, u)| InstanceSnapshot {
                id: *id,
                pid: u.pid,
                usage_count: u.usage_count,
                checked_out: u.checked_out,
                age: u.created_at.elapsed(),
                idle_time: u.last_used.map(|t| t.elapsed()),
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }
}

/// Exclusive ownership of one pooled browser.
///
/// Call [`BrowserLease::release`] when done. A lease that is dropped instead
/// schedules its own release on the current runtime.
pub struct BrowserLease {
    handle: Option<ProcessHandle>,
    pool: Arc<BrowserPool>,
}

impl BrowserLease {
    fn handle(&self) -> Result<&ProcessHandle, FetchError> {
        self.handle
            .as_ref()
            .ok_or_else(|| FetchError::Internal("browser lease already released".to_string()))
    }

    pub fn instance_id(&self) -> Option<usize> {
        self.handle.as_ref().map(|h| h.id())
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    pub fn process(&self) -> Result<&dyn BrowserProcess, FetchError> {
        Ok(self.handle()?.process())
    }

    /// Flag the browser as broken; it is replaced instead of queued on release.
    pub fn mark_unhealthy(&self) {
        if let Some(handle) = &self.handle {
            handle.mark_unhealthy();
        }
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.return_handle(handle).await;
        }
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Browser lease {} dropped, releasing in background", handle.id());
                runtime.spawn(async move {
                    pool.return_handle(handle).await;
                });
            }
            Err(_) => pool.abandon(handle),
        }
    }
}

impl std::fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserLease")
            .field("instance_id", &self.instance_id())
            .finish()
    }
}
