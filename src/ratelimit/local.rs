//! In-process sliding window counters.

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::slice::SliceClock;

/// Bucketed counts for the most recent slices of one key.
///
/// Slots form a ring indexed by `absolute_slice % slice_count`. The counter
/// remembers the last slice it wrote to; slots belonging to slices that
/// have aged out of the window are zeroed lazily on the next write and
/// ignored by reads.
#[derive(Debug, Clone)]
pub struct LocalWindowCounter {
    slots: Vec<u64>,
    /// Absolute slice number of the last write, `None` until the first one.
    current: Option<u64>,
}

impl LocalWindowCounter {
    /// Create an empty counter with `slice_count` slots.
    pub fn new(slice_count: u32) -> Self {
        Self {
            slots: vec![0; slice_count.max(1) as usize],
            current: None,
        }
    }

    fn slot(&self, absolute: u64) -> usize {
        (absolute % self.slots.len() as u64) as usize
    }

    /// Move the ring forward to `absolute`, zeroing every slot skipped over.
    ///
    /// Returns the slice that writes should land in. A clock that stepped
    /// backwards keeps writing into the latest slice.
    fn advance(&mut self, absolute: u64) -> u64 {
        let len = self.slots.len() as u64;

        match self.current {
            None => {
                self.current = Some(absolute);
                absolute
            }
            Some(current) if absolute <= current => current,
            Some(current) => {
                let skipped = absolute - current;
                if skipped >= len {
                    self.slots.iter_mut().for_each(|slot| *slot = 0);
                } else {
                    for stale in current + 1..=absolute {
                        let index = self.slot(stale);
                        self.slots[index] = 0;
                    }
                }
                trace!(from = current, to = absolute, skipped, "Advanced slice ring");
                self.current = Some(absolute);
                absolute
            }
        }
    }

    /// Add `amount` to the slice containing `now_millis`.
    pub fn increment_at(&mut self, clock: &SliceClock, now_millis: u64, amount: u64) {
        let target = self.advance(clock.absolute_slice_at(now_millis));
        let index = self.slot(target);
        self.slots[index] = self.slots[index].saturating_add(amount);
    }

    /// Add `amount` to the current slice.
    pub fn increment(&mut self, clock: &SliceClock, amount: u64) {
        self.increment_at(clock, clock.now_millis(), amount);
    }

    /// Total of the slices inside the window ending at `now_millis`.
    ///
    /// Does not modify the counter.
    pub fn sum_at(&self, clock: &SliceClock, now_millis: u64) -> u64 {
        let Some(current) = self.current else {
            return 0;
        };
        let len = self.slots.len() as u64;
        let now = clock.absolute_slice_at(now_millis).max(current);
        let oldest_live = now.saturating_sub(len - 1);

        (0..len)
            .filter_map(|back| current.checked_sub(back))
            .filter(|absolute| *absolute >= oldest_live)
            .fold(0u64, |total, absolute| {
                total.saturating_add(self.slots[self.slot(absolute)])
            })
    }

    /// Total of the slices inside the window ending now.
    pub fn sum(&self, clock: &SliceClock) -> u64 {
        self.sum_at(clock, clock.now_millis())
    }

    /// Whether the windowed total is strictly greater than `limit`.
    pub fn is_over_limit(&self, clock: &SliceClock, limit: u64) -> bool {
        self.sum(clock) > limit
    }
}

/// Local counters for every key seen by one limiter.
///
/// The map is sharded, so keys in different shards never contend, and each
/// key's counter has its own lock. Entries are never evicted.
#[derive(Debug)]
pub struct LocalCounters {
    clock: SliceClock,
    counters: DashMap<String, Mutex<LocalWindowCounter>>,
}

impl LocalCounters {
    /// Create an empty counter set using `clock` for slicing.
    pub fn new(clock: SliceClock) -> Self {
        Self {
            clock,
            counters: DashMap::new(),
        }
    }

    /// The slice clock shared by all counters.
    pub fn clock(&self) -> &SliceClock {
        &self.clock
    }

    /// Run `f` against the counter for `key`, creating it if absent.
    fn with_counter<T>(&self, key: &str, f: impl FnOnce(&mut LocalWindowCounter) -> T) -> T {
        if let Some(counter) = self.counters.get(key) {
            return f(&mut counter.lock());
        }

        let counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(
                    key = %key,
                    slices = self.clock.slice_count(),
                    "Creating new local window counter"
                );
                Mutex::new(LocalWindowCounter::new(self.clock.slice_count()))
            })
            .downgrade();
        // Bound to a local so the guard drops before the map reference.
        let result = f(&mut counter.lock());
        result
    }

    /// Add `amount` to the current slice of `key`.
    pub fn increment(&self, key: &str, amount: u64) {
        let now = self.clock.now_millis();
        self.with_counter(key, |counter| counter.increment_at(&self.clock, now, amount));
    }

    /// Windowed total for `key`; zero for keys never incremented.
    pub fn sum(&self, key: &str) -> u64 {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .map(|counter| counter.lock().sum_at(&self.clock, now))
            .unwrap_or(0)
    }

    /// Get the number of keys with counters.
    pub fn key_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop every counter.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.counters.clear();
    }
}
