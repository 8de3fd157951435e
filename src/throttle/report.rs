//! Throughput observations emitted by the throttler.

use serde::Serialize;
use tracing::info;

use crate::config::BYTES_PER_MBYTE;

/// One periodic throughput observation.
///
/// Built inside the critical section, emitted after the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputReport {
    /// Rate over the interval since the previous report
    pub instant_rate_bytes_per_sec: f64,
    /// Rate since the start of the measurement epoch
    pub average_rate_bytes_per_sec: f64,
    /// Tokens left in the bucket
    pub bucket_tokens: f64,
    /// Bucket capacity
    pub bucket_limit: f64,
    /// Progress reported by the call that triggered this report
    pub delta_progress: f64,
}

impl ThroughputReport {
    /// Emit the report as a structured `info` event.
    pub fn log(&self) {
        info!(
            instant_rate_bytes_per_sec = self.instant_rate_bytes_per_sec,
            average_rate_bytes_per_sec = self.average_rate_bytes_per_sec,
            instant_mbytes_per_sec = self.instant_rate_bytes_per_sec / BYTES_PER_MBYTE,
            average_mbytes_per_sec = self.average_rate_bytes_per_sec / BYTES_PER_MBYTE,
            bucket_tokens = self.bucket_tokens,
            bucket_limit = self.bucket_limit,
            delta_progress = self.delta_progress,
            "Throttler throughput"
        );
    }
}

/// Point-in-time snapshot of a throttler, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThrottlerStats {
    /// Configured average rate
    pub avg_rate_bytes_per_sec: f64,
    /// Configured peak rate
    pub peak_rate_bytes_per_sec: f64,
    /// Configured bucket capacity
    pub bucket_limit_bytes: f64,
    /// Tokens currently in the bucket
    pub bucket_tokens: f64,
    /// Progress accounted since the epoch started
    pub bytes_progress: f64,
    /// Registered transfers
    pub ref_count: i64,
    /// Seconds since the epoch started
    pub elapsed_secs: f64,
    /// Reporting cadence
    pub log_interval_millis: i64,
}

impl ThrottlerStats {
    /// Average throughput since the epoch started, zero before any time passed.
    pub fn average_rate_bytes_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.bytes_progress / self.elapsed_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_average_rate() {
        let stats = ThrottlerStats {
            avg_rate_bytes_per_sec: 100.0,
            peak_rate_bytes_per_sec: 200.0,
            bucket_limit_bytes: 100.0,
            bucket_tokens: 50.0,
            bytes_progress: 500.0,
            ref_count: 1,
            elapsed_secs: 2.0,
            log_interval_millis: 0,
        };
        assert_eq!(stats.average_rate_bytes_per_sec(), 250.0);

        let idle = ThrottlerStats {
            elapsed_secs: 0.0,
            ..stats
        };
        assert_eq!(idle.average_rate_bytes_per_sec(), 0.0);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = ThrottlerStats {
            avg_rate_bytes_per_sec: 1.0,
            peak_rate_bytes_per_sec: 2.0,
            bucket_limit_bytes: 1.0,
            bucket_tokens: 1.0,
            bytes_progress: 0.0,
            ref_count: 0,
            elapsed_secs: 0.0,
            log_interval_millis: 10,
        };
        let json = serde_json::to_value(stats).unwrap();

        assert_eq!(json["ref_count"], 0);
        assert_eq!(json["log_interval_millis"], 10);
        assert_eq!(json["peak_rate_bytes_per_sec"], 2.0);
    }
}
