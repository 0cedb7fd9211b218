//! Slice identity derived from the wall clock.
//!
//! A window of `window_secs` is divided into `slice_count` slices. The slice
//! containing a given instant is named by the pair `(epoch, index)`, where
//! `epoch` counts whole windows since the Unix epoch and `index` is the
//! position of the slice inside its window. The pair is unique across time;
//! the index alone repeats every window.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::clock::TimeSource;
use super::window::WindowConfig;
use crate::error::Result;

/// Separator between a limiter key and its slice suffix in store names.
pub const SLICE_SEPARATOR: &str = "~_~";

/// One slice of the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slice {
    /// Whole windows elapsed since the Unix epoch.
    pub epoch: u64,
    /// Position of the slice within its window, `0..slice_count`.
    pub index: u32,
}

impl Slice {
    /// Build a slice from its absolute number (slices since the Unix epoch).
    pub fn from_absolute(absolute: u64, slice_count: u32) -> Self {
        let count = u64::from(slice_count);
        Self {
            epoch: absolute / count,
            index: (absolute % count) as u32,
        }
    }

    /// Absolute number of this slice since the Unix epoch.
    pub fn absolute(&self, slice_count: u32) -> u64 {
        self.epoch * u64::from(slice_count) + u64::from(self.index)
    }

    /// The slice immediately before this one, or `None` before the Unix epoch.
    pub fn previous(&self, slice_count: u32) -> Option<Self> {
        if self.index == 0 {
            self.epoch.checked_sub(1).map(|epoch| Self {
                epoch,
                index: slice_count - 1,
            })
        } else {
            Some(Self {
                epoch: self.epoch,
                index: self.index - 1,
            })
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.epoch, self.index)
    }
}

/// Name of one slice counter for one limiter key in a shared store.
///
/// Format: `<key>~_~<epoch>_<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceKey {
    /// The limiter key.
    pub key: String,
    /// The slice this counter belongs to.
    pub slice: Slice,
}

impl SliceKey {
    /// Create a new slice key.
    pub fn new(key: &str, slice: Slice) -> Self {
        Self {
            key: key.to_string(),
            slice,
        }
    }

    /// Convert to the name used in the counter store.
    pub fn to_store_name(&self) -> String {
        format!("{}{}{}", self.key, SLICE_SEPARATOR, self.slice)
    }

    /// Parse a store name.
    ///
    /// Splits on the last separator, since the slice suffix never contains
    /// it, so keys that contain the separator still parse.
    pub fn from_store_name(name: &str) -> Option<Self> {
        let (key, suffix) = name.rsplit_once(SLICE_SEPARATOR)?;
        let (epoch, index) = suffix.split_once('_')?;

        Some(Self {
            key: key.to_string(),
            slice: Slice {
                epoch: epoch.parse().ok()?,
                index: index.parse().ok()?,
            },
        })
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_name())
    }
}

/// Maps wall-clock time to slices for one window configuration.
#[derive(Clone)]
pub struct SliceClock {
    window: WindowConfig,
    time: Arc<dyn TimeSource>,
}

impl fmt::Debug for SliceClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceClock")
            .field("window", &self.window)
            .finish()
    }
}

impl SliceClock {
    /// Create a slice clock. Fails if the window configuration is invalid.
    pub fn new(window: WindowConfig, time: Arc<dyn TimeSource>) -> Result<Self> {
        window.validate()?;
        Ok(Self { window, time })
    }

    /// The window this clock slices.
    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    /// Number of slices per window.
    pub fn slice_count(&self) -> u32 {
        self.window.slice_count
    }

    /// Width of one slice in milliseconds.
    pub fn slice_millis(&self) -> u64 {
        self.window.slice_millis()
    }

    /// Current wall-clock time in milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.time.now_millis()
    }

    /// Absolute slice number containing `now_millis`.
    pub fn absolute_slice_at(&self, now_millis: u64) -> u64 {
        now_millis / self.slice_millis()
    }

    /// The slice containing `now_millis`.
    pub fn slice_at(&self, now_millis: u64) -> Slice {
        Slice::from_absolute(self.absolute_slice_at(now_millis), self.slice_count())
    }

    /// The slice containing the current time.
    pub fn current_slice(&self) -> Slice {
        self.slice_at(self.now_millis())
    }

    /// All slices of the window ending at `now_millis`, most recent first.
    pub fn all_slices_at(&self, now_millis: u64) -> Vec<Slice> {
        let count = self.slice_count();
        let mut slices = Vec::with_capacity(count as usize);
        let mut slice = Some(self.slice_at(now_millis));

        while let Some(current) = slice {
            slices.push(current);
            if slices.len() == count as usize {
                break;
            }
            slice = current.previous(count);
        }

        trace!(
            now = now_millis,
            first = %slices[0],
            slices = slices.len(),
            "Computed window slices"
        );

        slices
    }

    /// All slices of the window ending now, most recent first.
    pub fn all_slices(&self) -> Vec<Slice> {
        self.all_slices_at(self.now_millis())
    }
}
