//! Configuration management for Sliceguard.
//!
//! Configuration can come from a YAML file, from `SLICEGUARD__`-prefixed
//! environment variables, or both (environment wins). Nested fields use a
//! double underscore, e.g. `SLICEGUARD__WINDOW__LIMIT=20`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SliceguardError};
use crate::ratelimit::{
    DistributedOptions, FailurePolicy, RateLimiter, SystemClock, TimeSource, WindowConfig,
};
use crate::store::{CounterStore, MemoryStore, RedisStore};

/// Environment variable prefix.
const ENV_PREFIX: &str = "SLICEGUARD";

/// Main configuration for a Sliceguard rate limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceguardConfig {
    /// Rolling window shape
    #[serde(default)]
    pub window: WindowConfig,

    /// Counter backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Prefix applied to every limiter key
    #[serde(default)]
    pub namespace: Option<String>,

    /// What to report when the backend fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Where counts are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Ring buffers in process memory
    #[default]
    Local,
    /// Expiring slice entries in an in-process store
    Memory,
    /// Expiring slice entries in Redis
    Redis,
}

/// Counter backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Extra slice lifetime beyond the window, in seconds
    #[serde(default = "default_expiry_padding")]
    pub expiry_padding_secs: u64,

    /// Bound on each backend call, in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            expiry_padding_secs: default_expiry_padding(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_expiry_padding() -> u64 {
    600
}

fn default_timeout() -> u64 {
    500
}

impl BackendConfig {
    /// Options for distributed counters built from this configuration.
    pub fn distributed_options(&self) -> DistributedOptions {
        DistributedOptions {
            expiry_padding: Duration::from_secs(self.expiry_padding_secs),
            operation_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl SliceguardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SliceguardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file layered under environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading rate limiter configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| SliceguardError::Config(e.to_string()))
    }

    /// Check the configuration without building anything.
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if self.backend.kind != BackendKind::Local && self.backend.timeout_ms == 0 {
            return Err(SliceguardError::Config(
                "backend timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Create a rate limiter for the configured backend, reading the system clock.
pub async fn build_rate_limiter(config: &SliceguardConfig) -> Result<RateLimiter> {
    build_rate_limiter_with_time(config, Arc::new(SystemClock)).await
}

/// Create a rate limiter for the configured backend using `time`.
///
/// Connects to Redis when the Redis backend is selected.
pub async fn build_rate_limiter_with_time(
    config: &SliceguardConfig,
    time: Arc<dyn TimeSource>,
) -> Result<RateLimiter> {
    config.validate()?;

    let limiter = match config.backend.kind {
        BackendKind::Local => RateLimiter::local_with_time(config.window, time)?,
        BackendKind::Memory => {
            let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(time.clone()));
            RateLimiter::distributed_with_time(
                config.window,
                store,
                config.backend.distributed_options(),
                time,
            )?
        }
        BackendKind::Redis => {
            let store: Arc<dyn CounterStore> =
                Arc::new(RedisStore::connect(&config.backend.redis_url).await?);
            RateLimiter::distributed_with_time(
                config.window,
                store,
                config.backend.distributed_options(),
                time,
            )?
        }
    };

    info!(
        backend = ?config.backend.kind,
        limit = config.window.limit,
        window_secs = config.window.window_secs,
        slice_count = config.window.slice_count,
        "Rate limiter initialized"
    );

    let limiter = limiter.with_failure_policy(config.failure_policy);
    Ok(match &config.namespace {
        Some(namespace) => limiter.with_namespace(namespace.clone()),
        None => limiter,
    })
}
