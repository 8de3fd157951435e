//! Configuration management for the throttler.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, ThrottlerError};
use crate::throttle::{make_throttler, ThrottlerOptions, SharedThrottler};

/// Number of bytes in one megabyte for the `*_mbytes` helpers.
pub const BYTES_PER_MBYTE: f64 = 1024.0 * 1024.0;

/// Prefix for environment variable overrides (e.g. `THROTTLER_AVG_RATE_BYTES_PER_SEC`).
const ENV_PREFIX: &str = "THROTTLER";

/// Throttler configuration as supplied by the enclosing transfer application.
///
/// Zero (or any non-positive value) means "disabled" for a rate and "auto"
/// for the bucket limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Target long-run average throughput
    #[serde(default)]
    pub avg_rate_bytes_per_sec: f64,

    /// Peak rate, which is also the token bucket refill rate
    #[serde(default)]
    pub peak_rate_bytes_per_sec: f64,

    /// Maximum burst size in bytes
    #[serde(default)]
    pub bucket_limit_bytes: f64,

    /// Interval between periodic throughput reports
    #[serde(default)]
    pub log_interval_millis: i64,
}

impl ThrottlerConfig {
    /// Build a configuration from megabyte-per-second values.
    pub fn from_mbytes(
        avg_mbytes_per_sec: f64,
        peak_mbytes_per_sec: f64,
        bucket_limit_mbytes: f64,
        log_interval_millis: i64,
    ) -> Self {
        Self {
            avg_rate_bytes_per_sec: avg_mbytes_per_sec * BYTES_PER_MBYTE,
            peak_rate_bytes_per_sec: peak_mbytes_per_sec * BYTES_PER_MBYTE,
            bucket_limit_bytes: bucket_limit_mbytes * BYTES_PER_MBYTE,
            log_interval_millis,
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottlerError::Config(format!("Failed to parse throttler config: {}", e)))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `THROTTLER_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading throttler configuration");
            if !path.exists() {
                return Err(ThrottlerError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file not found: {}", path.display()),
                )));
            }
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: ThrottlerConfig = settings.try_deserialize()?;
        debug!(?config, "Throttler configuration loaded");
        Ok(config)
    }

    /// The three rates, normalized the way the throttler will apply them.
    pub fn options(&self) -> ThrottlerOptions {
        ThrottlerOptions::new(
            self.avg_rate_bytes_per_sec,
            self.peak_rate_bytes_per_sec,
            self.bucket_limit_bytes,
        )
        .normalized()
    }

    /// Create a shared throttler, or `None` when neither average nor peak
    /// control would be active.
    pub fn build_throttler(&self) -> Option<SharedThrottler> {
        if !self.options().is_enabled() {
            info!("Throttling disabled, no average or peak rate configured");
            return None;
        }

        Some(make_throttler(
            self.avg_rate_bytes_per_sec,
            self.peak_rate_bytes_per_sec,
            self.bucket_limit_bytes,
            self.log_interval_millis,
        ))
    }
}
