//! Redis-backed counter store.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::CounterStore;
use crate::error::{Result, SliceguardError};

/// Increment-or-initialize in one server-side step, so concurrent callers
/// in different processes never race between the existence check and the
/// write.
const INCREMENT_OR_INITIALIZE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('INCRBY', KEYS[1], ARGV[1])
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return tonumber(ARGV[2])
";

/// A [`CounterStore`] backed by a Redis server.
///
/// Slice counters are plain integer strings with a TTL, read back with a
/// single `MGET` per window.
pub struct RedisStore {
    connection: Mutex<Option<MultiplexedConnection>>,
    script: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| SliceguardError::Backend(format!("Failed to create Redis client: {}", e)))?;
        let connection = client.get_multiplexed_tokio_connection().await?;

        info!(url = %redis_url, "Connected to Redis counter store");

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            script: Script::new(INCREMENT_OR_INITIALIZE),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| SliceguardError::Backend("No Redis connection available".into()))
    }
}

/// Pair `MGET` replies with their names, dropping misses.
///
/// Values are decoded lossily so a slice holding non-UTF-8 bytes reaches the
/// caller as an unparsable string instead of failing the whole read.
fn collect_found(names: &[String], values: Vec<Option<Vec<u8>>>) -> HashMap<String, String> {
    names
        .iter()
        .zip(values)
        .filter_map(|(name, value)| {
            value.map(|bytes| {
                let text = match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(name = %name, "Slice counter is not valid UTF-8");
                        String::from_utf8_lossy(e.as_bytes()).into_owned()
                    }
                };
                (name.clone(), text)
            })
        })
        .collect()
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_or_initialize(
        &self,
        name: &str,
        delta: u64,
        initial: u64,
        expiry: Duration,
    ) -> Result<u64> {
        let mut conn = self.connection()?;
        // Redis rejects a zero TTL.
        let expiry_secs = expiry.as_secs().max(1);

        let value: i64 = self
            .script
            .key(name)
            .arg(delta)
            .arg(initial)
            .arg(expiry_secs)
            .invoke_async(&mut conn)
            .await?;

        u64::try_from(value)
            .map_err(|_| SliceguardError::Backend(format!("Counter {} went negative: {}", name, value)))
    }

    async fn bulk_get(&self, names: &[String]) -> Result<HashMap<String, String>> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.connection()?;

        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("MGET")
            .arg(names)
            .query_async(&mut conn)
            .await?;

        Ok(collect_found(names, values))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.lock().take().is_some() {
            debug!("Closed Redis counter store connection");
        }
        Ok(())
    }
}
