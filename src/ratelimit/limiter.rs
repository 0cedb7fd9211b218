//! Core rate limiter implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::{SystemClock, TimeSource};
use super::counter::{CounterStrategy, WindowCounter};
use super::distributed::{DistributedOptions, DistributedWindowCounter};
use super::local::LocalCounters;
use super::slice::SliceClock;
use super::window::WindowConfig;
use crate::error::{Result, SliceguardError};
use crate::store::CounterStore;

/// How [`RateLimiter::is_limited`] answers when the counter backend fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Return the backend error to the caller.
    #[default]
    Propagate,
    /// Treat the key as limited.
    FailClosed,
    /// Treat the key as not limited.
    FailOpen,
}

/// The rolling-window rate limiter.
///
/// Binds a window configuration to a counter strategy. Keys are counted
/// independently; an optional namespace keeps several limiters apart when
/// they share a backend.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter {
    window: WindowConfig,
    counter: CounterStrategy,
    namespace: Option<String>,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create a rate limiter counting in process memory.
    pub fn local(window: WindowConfig) -> Result<Self> {
        Self::local_with_time(window, Arc::new(SystemClock))
    }

    /// Create a local rate limiter reading time from `time`.
    pub fn local_with_time(window: WindowConfig, time: Arc<dyn TimeSource>) -> Result<Self> {
        let clock = SliceClock::new(window, time)?;
        Ok(Self::with_counter(window, LocalCounters::new(clock).into()))
    }

    /// Create a rate limiter counting in a shared store.
    pub fn distributed(
        window: WindowConfig,
        store: Arc<dyn CounterStore>,
        options: DistributedOptions,
    ) -> Result<Self> {
        Self::distributed_with_time(window, store, options, Arc::new(SystemClock))
    }

    /// Create a distributed rate limiter reading time from `time`.
    pub fn distributed_with_time(
        window: WindowConfig,
        store: Arc<dyn CounterStore>,
        options: DistributedOptions,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let clock = SliceClock::new(window, time)?;
        let counter = DistributedWindowCounter::with_options(clock, store, options);
        Ok(Self::with_counter(window, counter.into()))
    }

    fn with_counter(window: WindowConfig, counter: CounterStrategy) -> Self {
        debug!(
            strategy = counter.name(),
            limit = window.limit,
            window_secs = window.window_secs,
            slice_count = window.slice_count,
            "Created rate limiter"
        );
        Self {
            window,
            counter,
            namespace: None,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Prefix every key with `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set how backend failures are reported by [`RateLimiter::is_limited`].
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Get the window configuration.
    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    /// Get the counter strategy.
    pub fn counter(&self) -> &CounterStrategy {
        &self.counter
    }

    /// Get the failure policy.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    fn storage_key(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(SliceguardError::InvalidKey("key must not be empty".into()));
        }
        Ok(match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, key),
            None => key.to_string(),
        })
    }

    /// Add `amount` to the count for `key`. An amount of zero does nothing.
    pub async fn increment_count(&self, key: &str, amount: u64) -> Result<()> {
        let key = self.storage_key(key)?;
        if amount == 0 {
            return Ok(());
        }

        trace!(key = %key, amount, "Incrementing count");
        self.counter.increment(&key, amount).await
    }

    /// Windowed count for `key`.
    pub async fn count(&self, key: &str) -> Result<u64> {
        let key = self.storage_key(key)?;
        self.counter.sum(&key).await
    }

    /// Check whether `key` is over its limit.
    ///
    /// With `update_count` set, `amount` is added first, so the event that
    /// pushes the count past the limit is the first one reported as limited.
    /// A key at exactly the limit is not limited. Without `update_count`
    /// this is a pure read.
    pub async fn is_limited(&self, key: &str, update_count: bool, amount: u64) -> Result<bool> {
        let key = self.storage_key(key)?;

        match self.check(&key, update_count, amount).await {
            Ok(limited) => Ok(limited),
            Err(e) if e.is_backend_failure() => self.apply_failure_policy(&key, e),
            Err(e) => Err(e),
        }
    }

    async fn check(&self, key: &str, update_count: bool, amount: u64) -> Result<bool> {
        if update_count && amount > 0 {
            self.counter.increment(key, amount).await?;
        }

        let limited = self.counter.is_over_limit(key, self.window.limit).await?;
        if limited {
            debug!(key = %key, limit = self.window.limit, "Rate limit exceeded");
        }
        Ok(limited)
    }

    fn apply_failure_policy(&self, key: &str, error: SliceguardError) -> Result<bool> {
        match self.failure_policy {
            FailurePolicy::Propagate => Err(error),
            FailurePolicy::FailClosed => {
                warn!(key = %key, error = %error, "Counter backend failed, reporting limited");
                Ok(true)
            }
            FailurePolicy::FailOpen => {
                warn!(key = %key, error = %error, "Counter backend failed, reporting not limited");
                Ok(false)
            }
        }
    }

    /// Release backend resources.
    pub async fn close(&self) -> Result<()> {
        self.counter.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    // Start of a 300 second window.
    const T0: u64 = 1_699_999_800_000;

    fn local_limiter(window: WindowConfig) -> (RateLimiter, ManualClock) {
        let time = ManualClock::new(T0 + 5_000);
        let limiter = RateLimiter::local_with_time(window, Arc::new(time.clone())).unwrap();
        (limiter, time)
    }

    fn distributed_limiter(window: WindowConfig, time: &ManualClock) -> RateLimiter {
        let shared: Arc<dyn TimeSource> = Arc::new(time.clone());
        let store = Arc::new(MemoryStore::new(shared.clone()));
        RateLimiter::distributed_with_time(window, store, DistributedOptions::default(), shared)
            .unwrap()
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment_or_initialize(
            &self,
            _name: &str,
            _delta: u64,
            _initial: u64,
            _expiry: Duration,
        ) -> Result<u64> {
            Err(SliceguardError::Backend("unreachable".into()))
        }

        async fn bulk_get(&self, _names: &[String]) -> Result<HashMap<String, String>> {
            Err(SliceguardError::Backend("unreachable".into()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn down_limiter() -> RateLimiter {
        RateLimiter::distributed(
            WindowConfig::new(6, 300, 5),
            Arc::new(DownStore),
            DistributedOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_construction_validates_window() {
        assert!(RateLimiter::local(WindowConfig::new(0, 300, 5)).is_err());
        assert!(RateLimiter::local(WindowConfig::new(6, 0, 5)).is_err());
        assert!(RateLimiter::local(WindowConfig::new(6, 300, 0)).is_err());
        assert!(RateLimiter::local(WindowConfig::new(6, 4, 5)).is_err());
        assert!(RateLimiter::local(WindowConfig::new(6, 301, 5)).is_err());
        assert!(RateLimiter::local(WindowConfig::new(6, 300, 5)).is_ok());
    }

    #[tokio::test]
    async fn test_increment_then_count() {
        let (limiter, _) = local_limiter(WindowConfig::new(6, 300, 5));

        limiter.increment_count("k", 3).await.unwrap();
        assert_eq!(limiter.count("k").await.unwrap(), 3);
        assert_eq!(limiter.count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_limit_boundary_is_strict() {
        let (limiter, _) = local_limiter(WindowConfig::new(6, 300, 5));

        for i in 1..=6 {
            assert!(!limiter.is_limited("k", true, 1).await.unwrap(), "event {}", i);
        }
        assert!(limiter.is_limited("k", true, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only_check_is_idempotent() {
        let (limiter, _) = local_limiter(WindowConfig::new(6, 300, 5));
        limiter.increment_count("k", 4).await.unwrap();

        for _ in 0..10 {
            assert!(!limiter.is_limited("k", false, 0).await.unwrap());
            assert!(!limiter.is_limited("k", true, 0).await.unwrap());
        }
        assert_eq!(limiter.count("k").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_end_to_end_window_ages_out() {
        let (limiter, time) = local_limiter(WindowConfig::new(6, 300, 5));

        for _ in 0..6 {
            limiter.increment_count("k", 1).await.unwrap();
            time.advance(Duration::from_millis(1_500));
        }
        assert!(!limiter.is_limited("k", false, 0).await.unwrap());

        assert!(limiter.is_limited("k", true, 1).await.unwrap());

        time.advance(Duration::from_secs(301));
        assert!(!limiter.is_limited("k", false, 0).await.unwrap());
        assert_eq!(limiter.count("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _) = local_limiter(WindowConfig::new(2, 60, 6));

        assert!(limiter.is_limited("a", true, 3).await.unwrap());
        assert!(!limiter.is_limited("b", true, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespace_prefixes_keys() {
        let time = ManualClock::new(T0);
        let shared: Arc<dyn TimeSource> = Arc::new(time.clone());
        let store = Arc::new(MemoryStore::new(shared.clone()));
        let window = WindowConfig::new(6, 300, 5);

        let logins = RateLimiter::distributed_with_time(
            window,
            store.clone(),
            DistributedOptions::default(),
            shared.clone(),
        )
        .unwrap()
        .with_namespace("logins");
        let signups = RateLimiter::distributed_with_time(
            window,
            store.clone(),
            DistributedOptions::default(),
            shared,
        )
        .unwrap()
        .with_namespace("signups");

        logins.increment_count("user", 5).await.unwrap();
        signups.increment_count("user", 1).await.unwrap();

        assert_eq!(logins.count("user").await.unwrap(), 5);
        assert_eq!(signups.count("user").await.unwrap(), 1);
        assert_eq!(store.live_slices("logins:user").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (limiter, _) = local_limiter(WindowConfig::new(6, 300, 5));

        let err = limiter.is_limited("", true, 1).await.unwrap_err();
        assert!(matches!(err, SliceguardError::InvalidKey(_)));
        assert!(limiter.increment_count("", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_backend_failure_propagates_by_default() {
        let limiter = down_limiter();

        let err = limiter.is_limited("k", true, 1).await.unwrap_err();
        assert!(err.is_backend_failure());
        assert!(limiter.increment_count("k", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_closed_reports_limited() {
        let limiter = down_limiter().with_failure_policy(FailurePolicy::FailClosed);
        assert!(limiter.is_limited("k", true, 1).await.unwrap());
        assert!(limiter.is_limited("k", false, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_open_reports_not_limited() {
        let limiter = down_limiter().with_failure_policy(FailurePolicy::FailOpen);
        assert!(!limiter.is_limited("k", true, 1).await.unwrap());

        // Invalid input is still an error under any policy.
        assert!(limiter.is_limited("", true, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_distributed_end_to_end() {
        let time = ManualClock::new(T0 + 5_000);
        let limiter = distributed_limiter(WindowConfig::new(6, 300, 5), &time);

        for _ in 0..6 {
            limiter.increment_count("k", 1).await.unwrap();
            time.advance(Duration::from_millis(1_500));
        }
        assert!(!limiter.is_limited("k", false, 0).await.unwrap());
        assert!(limiter.is_limited("k", true, 1).await.unwrap());

        time.advance(Duration::from_secs(301));
        assert!(!limiter.is_limited("k", false, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_and_distributed_parity() {
        let window = WindowConfig::new(10, 120, 6);
        let (local, time) = local_limiter(window);
        let distributed = distributed_limiter(window, &time);

        // Deterministic irregular schedule, including gaps longer than the window.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for step in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let key = if seed % 3 == 0 { "a" } else { "b" };
            let update = seed % 5 != 0;
            let amount = seed % 4;
            let gap = match seed % 50 {
                0 => 200_000,
                1..=9 => 25_000,
                _ => seed % 4_000,
            };

            let local_limited = local.is_limited(key, update, amount).await.unwrap();
            let distributed_limited = distributed.is_limited(key, update, amount).await.unwrap();
            assert_eq!(local_limited, distributed_limited, "step {}", step);
            assert_eq!(
                local.count(key).await.unwrap(),
                distributed.count(key).await.unwrap(),
                "step {}",
                step
            );

            time.advance(Duration::from_millis(gap));
        }
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let (limiter, _) = local_limiter(WindowConfig::new(1_000, 300, 5));
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        limiter.increment_count("shared", 1).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.count("shared").await.unwrap(), 200);
    }
}
