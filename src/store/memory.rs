//! In-process counter store with TTL expiry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::CounterStore;
use crate::error::{Result, SliceguardError};
use crate::ratelimit::{SliceKey, TimeSource};

/// Time between sweeps of expired entries.
const CLEANUP_INTERVAL_MILLIS: u64 = 5_000;
/// Writes after which a sweep runs even if the interval has not elapsed.
const MAX_WRITES_BEFORE_CLEANUP: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Entries {
    data: HashMap<String, Entry>,
    next_cleanup: u64,
    writes_since_cleanup: usize,
}

impl Entries {
    fn purge(&mut self, now: u64) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| entry.expires_at > now);
        self.next_cleanup = now.saturating_add(CLEANUP_INTERVAL_MILLIS);
        self.writes_since_cleanup = 0;
        before - self.data.len()
    }

    fn should_cleanup(&self, now: u64) -> bool {
        now >= self.next_cleanup || self.writes_since_cleanup >= MAX_WRITES_BEFORE_CLEANUP
    }
}

/// A [`CounterStore`] held in process memory.
///
/// Entries expire according to the injected time source, so with a
/// [`ManualClock`](crate::ratelimit::ManualClock) it behaves like a shared
/// cache whose TTLs can be fast-forwarded. Expired entries are swept during
/// writes, at most every few seconds or after a burst of writes, and on
/// demand by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    time: Arc<dyn TimeSource>,
    entries: Mutex<Entries>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.lock().data.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            entries: Mutex::new(Entries::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SliceguardError::Backend("memory store is closed".into()));
        }
        Ok(())
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.time.now_millis();
        let purged = self.entries.lock().purge(now);
        if purged > 0 {
            debug!(purged, "Purged expired counters");
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().data.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unexpired slice counters belonging to `key`, with their values.
    pub fn live_slices(&self, key: &str) -> Vec<(SliceKey, u64)> {
        let now = self.time.now_millis();
        let entries = self.entries.lock();
        let mut slices: Vec<(SliceKey, u64)> = entries
            .data
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .filter_map(|(name, entry)| {
                SliceKey::from_store_name(name)
                    .filter(|slice_key| slice_key.key == key)
                    .map(|slice_key| (slice_key, entry.value))
            })
            .collect();
        slices.sort_by(|a, b| b.0.slice.cmp(&a.0.slice));
        slices
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_or_initialize(
        &self,
        name: &str,
        delta: u64,
        initial: u64,
        expiry: Duration,
    ) -> Result<u64> {
        self.ensure_open()?;
        let now = self.time.now_millis();
        let mut entries = self.entries.lock();

        if entries.should_cleanup(now) {
            let purged = entries.purge(now);
            if purged > 0 {
                debug!(purged, remaining = entries.data.len(), "Swept expired counters");
            }
        }
        entries.writes_since_cleanup += 1;

        let live = entries
            .data
            .get_mut(name)
            .filter(|entry| entry.expires_at > now);

        let value = match live {
            Some(entry) => {
                entry.value = entry.value.saturating_add(delta);
                entry.value
            }
            None => {
                let expires_at = now.saturating_add(expiry.as_millis() as u64);
                entries.data.insert(
                    name.to_string(),
                    Entry {
                        value: initial,
                        expires_at,
                    },
                );
                initial
            }
        };

        trace!(name = %name, value, "Incremented memory counter");
        Ok(value)
    }

    async fn bulk_get(&self, names: &[String]) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let now = self.time.now_millis();
        let entries = self.entries.lock();

        Ok(names
            .iter()
            .filter_map(|name| {
                entries
                    .data
                    .get(name)
                    .filter(|entry| entry.expires_at > now)
                    .map(|entry| (name.clone(), entry.value.to_string()))
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.lock().data.clear();
        Ok(())
    }
}
