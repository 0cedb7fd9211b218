//! Counter strategy trait for abstracting local and distributed windows.

use async_trait::async_trait;

use super::distributed::DistributedWindowCounter;
use super::local::LocalCounters;
use super::slice::SliceClock;
use crate::error::Result;

/// Trait for sliding window counter implementations.
///
/// This trait abstracts over the in-process [`LocalCounters`] and the
/// store-backed [`DistributedWindowCounter`] so the rate limiter works
/// with either and callers can swap them without behavior change.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Add `amount` to the current slice of `key`.
    async fn increment(&self, key: &str, amount: u64) -> Result<()>;

    /// Total count for `key` over the window ending now.
    async fn sum(&self, key: &str) -> Result<u64>;

    /// Release any resources held by the counter.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the windowed total for `key` is strictly greater than `limit`.
    async fn is_over_limit(&self, key: &str, limit: u64) -> Result<bool> {
        Ok(self.sum(key).await? > limit)
    }
}

#[async_trait]
impl WindowCounter for LocalCounters {
    async fn increment(&self, key: &str, amount: u64) -> Result<()> {
        LocalCounters::increment(self, key, amount);
        Ok(())
    }

    async fn sum(&self, key: &str) -> Result<u64> {
        Ok(LocalCounters::sum(self, key))
    }
}

#[async_trait]
impl WindowCounter for DistributedWindowCounter {
    async fn increment(&self, key: &str, amount: u64) -> Result<()> {
        DistributedWindowCounter::increment(self, key, amount).await?;
        Ok(())
    }

    async fn sum(&self, key: &str) -> Result<u64> {
        DistributedWindowCounter::sum(self, key).await
    }

    async fn close(&self) -> Result<()> {
        DistributedWindowCounter::close(self).await
    }
}

/// The counter strategy a rate limiter delegates to.
#[derive(Debug)]
pub enum CounterStrategy {
    /// Per-process ring buffers.
    Local(LocalCounters),
    /// Slice entries in a shared store.
    Distributed(DistributedWindowCounter),
}

impl CounterStrategy {
    /// The slice clock the strategy counts with.
    pub fn clock(&self) -> &SliceClock {
        match self {
            CounterStrategy::Local(counters) => counters.clock(),
            CounterStrategy::Distributed(counter) => counter.clock(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            CounterStrategy::Local(_) => "local",
            CounterStrategy::Distributed(_) => "distributed",
        }
    }
}

#[async_trait]
impl WindowCounter for CounterStrategy {
    async fn increment(&self, key: &str, amount: u64) -> Result<()> {
        match self {
            CounterStrategy::Local(counters) => WindowCounter::increment(counters, key, amount).await,
            CounterStrategy::Distributed(counter) => WindowCounter::increment(counter, key, amount).await,
        }
    }

    async fn sum(&self, key: &str) -> Result<u64> {
        match self {
            CounterStrategy::Local(counters) => WindowCounter::sum(counters, key).await,
            CounterStrategy::Distributed(counter) => WindowCounter::sum(counter, key).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            CounterStrategy::Local(counters) => WindowCounter::close(counters).await,
            CounterStrategy::Distributed(counter) => WindowCounter::close(counter).await,
        }
    }
}

impl From<LocalCounters> for CounterStrategy {
    fn from(counters: LocalCounters) -> Self {
        CounterStrategy::Local(counters)
    }
}

impl From<DistributedWindowCounter> for CounterStrategy {
    fn from(counter: DistributedWindowCounter) -> Self {
        CounterStrategy::Distributed(counter)
    }
}
