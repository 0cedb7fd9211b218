//! Rolling-window rate limiting: slice math, counter strategies and the
//! limiter facade.

mod clock;
mod counter;
mod distributed;
mod limiter;
mod local;
mod slice;
mod window;

pub use clock::{ManualClock, SystemClock, TimeSource};
pub use counter::{CounterStrategy, WindowCounter};
pub use distributed::{
    DistributedOptions, DistributedWindowCounter, DEFAULT_EXPIRY_PADDING,
    DEFAULT_OPERATION_TIMEOUT,
};
pub use limiter::{FailurePolicy, RateLimiter};
pub use local::{LocalCounters, LocalWindowCounter};
pub use slice::{Slice, SliceClock, SliceKey, SLICE_SEPARATOR};
pub use window::WindowConfig;
