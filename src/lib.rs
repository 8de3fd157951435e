//! Throttler - shared rate limiting for concurrent data transfers
//!
//! This crate implements a throttler shared by the workers of a transfer.
//! It keeps aggregate throughput at a configured average rate while a token
//! bucket bounds how fast a lagging transfer may burst to catch up.

pub mod config;
pub mod error;
pub mod throttle;

pub use throttle::{configure_options, make_throttler, SharedThrottler, Throttler};
