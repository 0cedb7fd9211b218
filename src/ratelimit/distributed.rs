//! Sliding window counters held in a shared key/value store.
//!
//! Each slice of a key's window is a separate store entry named
//! `<key>~_~<epoch>_<index>`, created by an atomic increment and left to
//! expire on its own. Reading the window fetches every slice name in one
//! batch and sums whatever is still there.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::slice::{SliceClock, SliceKey};
use crate::error::{Result, SliceguardError};
use crate::store::CounterStore;

/// Default extra lifetime given to each slice entry beyond the window.
pub const DEFAULT_EXPIRY_PADDING: Duration = Duration::from_secs(600);
/// Default bound on a single backend round trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Tuning for a [`DistributedWindowCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedOptions {
    /// Added to the window length when setting slice expiry, so clock or
    /// store skew never drops a slice that can still be summed.
    pub expiry_padding: Duration,
    /// Upper bound on each increment and bulk read.
    pub operation_timeout: Duration,
}

impl Default for DistributedOptions {
    fn default() -> Self {
        Self {
            expiry_padding: DEFAULT_EXPIRY_PADDING,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// A sliding window counter backed by a [`CounterStore`].
pub struct DistributedWindowCounter {
    clock: SliceClock,
    store: Arc<dyn CounterStore>,
    options: DistributedOptions,
}

impl std::fmt::Debug for DistributedWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedWindowCounter")
            .field("clock", &self.clock)
            .field("options", &self.options)
            .finish()
    }
}

impl DistributedWindowCounter {
    /// Create a distributed counter with default options.
    pub fn new(clock: SliceClock, store: Arc<dyn CounterStore>) -> Self {
        Self::with_options(clock, store, DistributedOptions::default())
    }

    /// Create a distributed counter with explicit options.
    pub fn with_options(
        clock: SliceClock,
        store: Arc<dyn CounterStore>,
        options: DistributedOptions,
    ) -> Self {
        Self {
            clock,
            store,
            options,
        }
    }

    /// The slice clock used to name entries.
    pub fn clock(&self) -> &SliceClock {
        &self.clock
    }

    /// Get the options.
    pub fn options(&self) -> DistributedOptions {
        self.options
    }

    /// Lifetime given to a newly created slice entry.
    pub fn slice_expiry(&self) -> Duration {
        Duration::from_secs(self.clock.window().window_secs) + self.options.expiry_padding
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.options.operation_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SliceguardError::Timeout { operation, timeout }),
        }
    }

    /// Add `amount` to the current slice of `key`, returning that slice's
    /// new count.
    pub async fn increment(&self, key: &str, amount: u64) -> Result<u64> {
        let name = SliceKey::new(key, self.clock.current_slice()).to_store_name();
        let expiry = self.slice_expiry();

        let value = self
            .bounded(
                "increment",
                self.store.increment_or_initialize(&name, amount, amount, expiry),
            )
            .await?;

        trace!(name = %name, amount, value, "Incremented slice counter");
        Ok(value)
    }

    /// Windowed total for `key`.
    ///
    /// Missing slices count as zero. A slice holding something other than a
    /// non-negative integer is logged and skipped.
    pub async fn sum(&self, key: &str) -> Result<u64> {
        let names: Vec<String> = self
            .clock
            .all_slices()
            .into_iter()
            .map(|slice| SliceKey::new(key, slice).to_store_name())
            .collect();

        let found = self.bounded("bulk_get", self.store.bulk_get(&names)).await?;

        let mut total: u64 = 0;
        for name in &names {
            let Some(raw) = found.get(name) else {
                continue;
            };
            match raw.trim().parse::<u64>() {
                Ok(count) => total = total.saturating_add(count),
                Err(e) => {
                    warn!(name = %name, value = %raw, error = %e, "Skipping malformed slice counter");
                }
            }
        }

        debug!(key = %key, slices = found.len(), total, "Summed distributed window");
        Ok(total)
    }

    /// Whether the windowed total for `key` is strictly greater than `limit`.
    pub async fn is_over_limit(&self, key: &str, limit: u64) -> Result<bool> {
        Ok(self.sum(key).await? > limit)
    }

    /// Release the backing store.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}
