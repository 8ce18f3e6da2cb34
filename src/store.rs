//! Key-value persistence for job records
//!
//! Writers that must not lose concurrent updates use
//! [`JobStore::compare_and_set`], which only succeeds when the record still
//! carries the version the writer read.

use crate::FetchError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often writes sweep expired entries out of a [`MemoryJobStore`].
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, FetchError>;

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FetchError>;

    /// Write `value` only if the current version equals `expected`. A missing
    /// key has version 0. Returns false when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, FetchError>;

    async fn delete(&self, key: &str) -> Result<(), FetchError>;
}

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Instant,
}

/// In-process store. Expired entries are dropped when read, and writes sweep
/// the whole map once per sweep interval so keys nobody reads again do not
/// accumulate.
pub struct MemoryJobStore {
    entries: DashMap<String, Entry>,
    clock: AtomicU64,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Purge if the sweep interval has passed. Must not be called while a
    /// map guard is held.
    fn sweep_if_due(&self) {
        let due = {
            let Ok(mut last) = self.last_sweep.try_lock() else {
                return;
            };
            if last.elapsed() < self.sweep_interval {
                false
            } else {
                *last = Instant::now();
                true
            }
        };
        if due {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!("Swept {} expired job store entries", purged);
            }
        }
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, FetchError> {
        let now = Instant::now();
        let found = self.entries.get(key).map(|entry| {
            (
                entry.expires_at > now,
                Versioned {
                    value: entry.value.clone(),
                    version: entry.version,
                },
            )
        });
        match found {
            Some((true, versioned)) => Ok(Some(versioned)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FetchError> {
        self.sweep_if_due();
        let entry = Entry {
            value,
            version: self.next_version(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, FetchError> {
        self.sweep_if_due();
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Slot::Occupied(mut slot) => {
                let live = slot.get().expires_at > now;
                let current = if live { slot.get().version } else { 0 };
                if current != expected {
                    if !live {
                        slot.remove();
                    }
                    return Ok(false);
                }
                slot.insert(Entry {
                    value,
                    version: self.next_version(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
            Slot::Vacant(slot) => {
                if expected != 0 {
                    return Ok(false);
                }
                slot.insert(Entry {
                    value,
                    version: self.next_version(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), FetchError> {
        self.entries.remove(key);
        Ok(())
    }
}
