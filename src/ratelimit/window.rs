//! Rolling window configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceguardError};

/// Default number of events allowed per window.
const DEFAULT_LIMIT: u64 = 1000;
/// Default window length in seconds.
const DEFAULT_WINDOW_SECS: u64 = 300;
/// Default number of slices per window.
const DEFAULT_SLICE_COUNT: u32 = 5;

/// Shape of a rolling window: how many events are allowed within
/// `window_secs`, and how finely the window is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum events permitted within the window
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Length of the rolling window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Number of slices the window is divided into
    #[serde(default = "default_slice_count")]
    pub slice_count: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_secs: DEFAULT_WINDOW_SECS,
            slice_count: DEFAULT_SLICE_COUNT,
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_slice_count() -> u32 {
    DEFAULT_SLICE_COUNT
}

impl WindowConfig {
    /// Create a window configuration. Call [`WindowConfig::validate`]
    /// before counting with it.
    pub fn new(limit: u64, window_secs: u64, slice_count: u32) -> Self {
        Self {
            limit,
            window_secs,
            slice_count,
        }
    }

    /// Check that the configuration describes a usable window.
    ///
    /// Slices must all have the same whole-second width, so the window
    /// length has to be a multiple of the slice count.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(SliceguardError::Config("limit must be greater than 0".into()));
        }
        if self.window_secs == 0 {
            return Err(SliceguardError::Config(
                "window_secs must be greater than 0".into(),
            ));
        }
        if self.slice_count == 0 {
            return Err(SliceguardError::Config(
                "slice_count must be at least 1".into(),
            ));
        }
        if self.window_secs < u64::from(self.slice_count) {
            return Err(SliceguardError::Config(format!(
                "window_secs ({}) must be at least slice_count ({})",
                self.window_secs, self.slice_count
            )));
        }
        if self.window_secs % u64::from(self.slice_count) != 0 {
            return Err(SliceguardError::Config(format!(
                "window_secs ({}) must be evenly divisible by slice_count ({})",
                self.window_secs, self.slice_count
            )));
        }
        if self.window_millis().is_none() {
            return Err(SliceguardError::Config(format!(
                "window_secs ({}) is too large",
                self.window_secs
            )));
        }
        Ok(())
    }

    /// Width of a single slice in seconds.
    pub fn slice_secs(&self) -> u64 {
        self.window_secs / u64::from(self.slice_count.max(1))
    }

    /// Width of a single slice in milliseconds.
    pub fn slice_millis(&self) -> u64 {
        self.slice_secs().saturating_mul(1000)
    }

    fn window_millis(&self) -> Option<u64> {
        self.window_secs.checked_mul(1000)
    }
}
