//! Bounded least-recently-used set of keys

use std::collections::{BTreeMap, HashMap};

/// A set that forgets its least recently touched key once full.
///
/// Lookups through [`LruSet::touch`] and re-insertions both count as use.
#[derive(Debug)]
pub struct LruSet {
    capacity: usize,
    ticks: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl LruSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ticks: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ticks.contains_key(key)
    }

    /// Returns whether `key` is present, marking it most recently used.
    pub fn touch(&mut self, key: &str) -> bool {
        let tick = self.next_tick();
        match self.ticks.get_mut(key) {
            Some(old) => {
                self.order.remove(old);
                *old = tick;
                self.order.insert(tick, key.to_string());
                true
            }
            None => false,
        }
    }

    /// Insert `key` as most recently used. Returns the evicted key, if any.
    pub fn insert(&mut self, key: &str) -> Option<String> {
        if self.touch(key) {
            return None;
        }

        let evicted = if self.ticks.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let tick = self.next_tick();
        self.ticks.insert(key.to_string(), tick);
        self.order.insert(tick, key.to_string());
        evicted
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.ticks.remove(key) {
            Some(tick) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
        self.order.clear();
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (&tick, _) = self.order.iter().next()?;
        let key = self.order.remove(&tick)?;
        self.ticks.remove(&key);
        Some(key)
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
