//! Throttling logic and shared state management.

mod options;
mod report;
mod spin;
mod throttler;

pub use options::{configure_options, ThrottlerOptions};
pub use report::{ThrottlerStats, ThroughputReport};
pub use spin::{RawSpinLock, SpinLock, SpinLockGuard};
pub use throttler::{make_throttler, SharedThrottler, Throttler, TransferHandle};
