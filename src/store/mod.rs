//! Key/value backends for the distributed window counter.
//!
//! A backend only needs three operations: an atomic increment that creates
//! missing entries with an expiry, a batched read, and a way to release its
//! resources.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Trait for counter backends shared between limiter instances.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to the counter `name` and return the new value.
    ///
    /// When `name` does not exist it is created holding `initial` and set to
    /// expire after `expiry`. Existing entries keep their expiry.
    async fn increment_or_initialize(
        &self,
        name: &str,
        delta: u64,
        initial: u64,
        expiry: Duration,
    ) -> Result<u64>;

    /// Fetch whichever of `names` currently exist, as their raw stored text.
    async fn bulk_get(&self, names: &[String]) -> Result<HashMap<String, String>>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}
