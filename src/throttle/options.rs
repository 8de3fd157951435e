//! Normalization of the three throttler rates.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Fraction of a second of peak-rate traffic used to size an automatic bucket.
const BUCKET_TIME_SECS: f64 = 0.25;
/// Multiplier applied on top of `BUCKET_TIME_SECS` for automatic buckets.
const BUCKET_MULTIPLIER: f64 = 2.0;

/// The three rate parameters of a throttler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerOptions {
    /// Target long-run average rate; zero disables average control
    pub avg_rate_bytes_per_sec: f64,
    /// Peak rate and bucket refill rate; zero disables token bucket control
    pub peak_rate_bytes_per_sec: f64,
    /// Maximum burst capacity of the bucket
    pub bucket_limit_bytes: f64,
}

impl ThrottlerOptions {
    /// Create options as given, without normalization.
    pub fn new(avg_rate_bytes_per_sec: f64, peak_rate_bytes_per_sec: f64, bucket_limit_bytes: f64) -> Self {
        Self {
            avg_rate_bytes_per_sec,
            peak_rate_bytes_per_sec,
            bucket_limit_bytes,
        }
    }

    /// Return a copy run through [`configure_options`].
    pub fn normalized(mut self) -> Self {
        configure_options(
            &mut self.avg_rate_bytes_per_sec,
            &mut self.peak_rate_bytes_per_sec,
            &mut self.bucket_limit_bytes,
        );
        self
    }

    /// Whether average rate control is active.
    pub fn average_enabled(&self) -> bool {
        self.avg_rate_bytes_per_sec > 0.0
    }

    /// Whether token bucket control is active.
    pub fn bucket_enabled(&self) -> bool {
        self.peak_rate_bytes_per_sec > 0.0
    }

    /// Whether any throttling would happen at all.
    pub fn is_enabled(&self) -> bool {
        self.average_enabled() || self.bucket_enabled()
    }
}

/// Collapse non-positive and non-finite rates to the disabled value.
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Normalize caller supplied rates into a consistent configuration.
///
/// Non-positive values disable the corresponding control. A peak rate below
/// the average rate is raised to the average rate, and a missing bucket limit
/// is derived from the peak rate. Never fails.
pub fn configure_options(
    avg_rate_bytes_per_sec: &mut f64,
    peak_rate_bytes_per_sec: &mut f64,
    bucket_limit_bytes: &mut f64,
) {
    *avg_rate_bytes_per_sec = sanitize(*avg_rate_bytes_per_sec);
    *peak_rate_bytes_per_sec = sanitize(*peak_rate_bytes_per_sec);
    *bucket_limit_bytes = sanitize(*bucket_limit_bytes);

    if *peak_rate_bytes_per_sec > 0.0 && *peak_rate_bytes_per_sec < *avg_rate_bytes_per_sec {
        warn!(
            peak_rate = *peak_rate_bytes_per_sec,
            avg_rate = *avg_rate_bytes_per_sec,
            "Peak rate is below the average rate, raising it to the average rate"
        );
        *peak_rate_bytes_per_sec = *avg_rate_bytes_per_sec;
    }

    if *peak_rate_bytes_per_sec <= 0.0 {
        *bucket_limit_bytes = 0.0;
    } else if *bucket_limit_bytes <= 0.0 {
        *bucket_limit_bytes = BUCKET_TIME_SECS * BUCKET_MULTIPLIER * *peak_rate_bytes_per_sec;
        info!(
            bucket_limit = *bucket_limit_bytes,
            peak_rate = *peak_rate_bytes_per_sec,
            "Bucket limit not specified, derived from the peak rate"
        );
    }

    debug!(
        avg_rate = *avg_rate_bytes_per_sec,
        peak_rate = *peak_rate_bytes_per_sec,
        bucket_limit = *bucket_limit_bytes,
        "Configured throttler options"
    );
}
