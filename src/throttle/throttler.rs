//! Shared throttler combining average rate and token bucket control.
//!
//! Average control keeps cumulative progress at or below
//! `avg_rate * elapsed` since the epoch started. When a transfer falls behind
//! it may catch up, but no faster than the token bucket allows: the bucket
//! refills at the peak rate up to the bucket limit, and progress beyond the
//! available tokens must be slept off. Callers sleep for whichever of the two
//! requirements is larger.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::options::configure_options;
use super::report::{ThrottlerStats, ThroughputReport};
use super::spin::SpinLock;

/// A throttler shared between all transfers that use it.
pub type SharedThrottler = Arc<Throttler>;

/// Normalize the rates with [`configure_options`] and build a shared throttler.
pub fn make_throttler(
    avg_rate_bytes_per_sec: f64,
    peak_rate_bytes_per_sec: f64,
    bucket_limit_bytes: f64,
    throttler_log_time_millis: i64,
) -> SharedThrottler {
    Arc::new(Throttler::new(
        avg_rate_bytes_per_sec,
        peak_rate_bytes_per_sec,
        bucket_limit_bytes,
        throttler_log_time_millis,
    ))
}

/// Bytes of progress to account for a reported amount; non-finite and
/// negative amounts count as no progress.
fn sanitize_progress(progress: f64) -> f64 {
    if progress.is_finite() {
        progress.max(0.0)
    } else {
        0.0
    }
}

/// Duration to block for `sleep_secs`, saturating at `Duration::MAX` when
/// the value is too large to represent.
fn sleep_duration(sleep_secs: f64) -> Option<Duration> {
    if !(sleep_secs > 0.0) {
        return None;
    }
    Some(Duration::try_from_secs_f64(sleep_secs).unwrap_or(Duration::MAX))
}

/// `instant` moved forward by `secs`, unchanged if that cannot be represented.
fn advance(instant: Instant, secs: f64) -> Instant {
    Duration::try_from_secs_f64(secs)
        .ok()
        .and_then(|d| instant.checked_add(d))
        .unwrap_or(instant)
}

/// Mutable state, only touched with the spin lock held.
#[derive(Debug)]
struct ThrottlerState {
    /// Target average rate; non-positive disables average control
    avg_rate_bytes_per_sec: f64,
    /// Bucket refill rate, i.e. the peak rate
    bucket_rate_bytes_per_sec: f64,
    /// Maximum number of tokens
    bytes_token_bucket_limit: f64,
    /// Tokens currently available
    bytes_token_bucket: f64,
    /// Progress accounted since the epoch started
    bytes_progress: f64,
    /// Progress since the last periodic report
    instant_progress: f64,
    /// Start of the current measurement epoch
    start_time: Instant,
    /// Last time the bucket was refilled
    last_fill_time: Instant,
    /// Last time a periodic report was produced
    last_log_time: Instant,
    /// Number of registered transfers
    ref_count: i64,
    /// Periodic report interval; non-positive disables reporting
    throttler_log_time_millis: i64,
}

impl ThrottlerState {
    fn bucket_enabled(&self) -> bool {
        self.bucket_rate_bytes_per_sec > 0.0
    }

    fn full_bucket(&self) -> f64 {
        self.bytes_token_bucket_limit.max(0.0)
    }

    /// Start a fresh epoch for a new group of transfers.
    fn reset_epoch(&mut self, now: Instant) {
        self.start_time = now;
        self.last_fill_time = now;
        self.last_log_time = now;
        self.bytes_progress = 0.0;
        self.instant_progress = 0.0;
        self.bytes_token_bucket = self.full_bucket();
    }

    /// Account `delta` bytes of progress and return the seconds to sleep.
    ///
    /// Returns `None` when no transfer is registered.
    fn account(&mut self, delta: f64, now: Instant) -> Option<f64> {
        if self.ref_count <= 0 {
            return None;
        }

        self.bytes_progress += delta;
        self.instant_progress += delta;

        let bucket_sleep = self.token_bucket_sleep(delta, now);
        let average_sleep = self.average_sleep(now);
        Some(bucket_sleep.max(average_sleep).max(0.0))
    }

    /// Seconds needed for the cumulative progress to fall back to the average.
    fn average_sleep(&self, now: Instant) -> f64 {
        if self.avg_rate_bytes_per_sec <= 0.0 {
            return 0.0;
        }

        let elapsed = now.saturating_duration_since(self.start_time).as_secs_f64();
        let expected = self.avg_rate_bytes_per_sec * elapsed;
        if self.bytes_progress > expected {
            (self.bytes_progress - expected) / self.avg_rate_bytes_per_sec
        } else {
            0.0
        }
    }

    /// Refill the bucket, charge `delta` and return the seconds needed to
    /// earn back any deficit at the refill rate.
    ///
    /// A deficit moves `last_fill_time` past `now` by the time it takes to
    /// earn it back, so the refill during that sleep is never credited twice.
    /// Callers arriving before then queue behind the outstanding debt.
    fn token_bucket_sleep(&mut self, delta: f64, now: Instant) -> f64 {
        if !self.bucket_enabled() {
            return 0.0;
        }

        let elapsed = now.saturating_duration_since(self.last_fill_time).as_secs_f64();
        self.last_fill_time = self.last_fill_time.max(now);
        self.bytes_token_bucket = (self.bytes_token_bucket
            + elapsed * self.bucket_rate_bytes_per_sec)
            .min(self.bytes_token_bucket_limit);

        self.bytes_token_bucket -= delta;
        if self.bytes_token_bucket < 0.0 {
            let debt_secs = -self.bytes_token_bucket / self.bucket_rate_bytes_per_sec;
            self.bytes_token_bucket = 0.0;
            self.last_fill_time = advance(self.last_fill_time, debt_secs);
            self.last_fill_time
                .saturating_duration_since(now)
                .as_secs_f64()
                .max(debt_secs)
        } else {
            0.0
        }
    }

    /// Produce a report if the reporting interval has elapsed.
    fn periodic_report(&mut self, now: Instant, delta: f64) -> Option<ThroughputReport> {
        if self.ref_count <= 0 || self.throttler_log_time_millis <= 0 {
            return None;
        }

        let since_log = now.saturating_duration_since(self.last_log_time);
        if since_log < Duration::from_millis(self.throttler_log_time_millis as u64) {
            return None;
        }

        let since_start = now.saturating_duration_since(self.start_time).as_secs_f64();
        let average_rate = if since_start > 0.0 {
            self.bytes_progress / since_start
        } else {
            0.0
        };

        let report = ThroughputReport {
            instant_rate_bytes_per_sec: self.instant_progress / since_log.as_secs_f64(),
            average_rate_bytes_per_sec: average_rate,
            bucket_tokens: self.bytes_token_bucket,
            bucket_limit: self.bytes_token_bucket_limit,
            delta_progress: delta,
        };

        self.instant_progress = 0.0;
        self.last_log_time = now;
        Some(report)
    }

    fn stats(&self, now: Instant) -> ThrottlerStats {
        ThrottlerStats {
            avg_rate_bytes_per_sec: self.avg_rate_bytes_per_sec,
            peak_rate_bytes_per_sec: self.bucket_rate_bytes_per_sec,
            bucket_limit_bytes: self.bytes_token_bucket_limit,
            bucket_tokens: self.bytes_token_bucket,
            bytes_progress: self.bytes_progress,
            ref_count: self.ref_count,
            elapsed_secs: now.saturating_duration_since(self.start_time).as_secs_f64(),
            log_interval_millis: self.throttler_log_time_millis,
        }
    }
}

/// Rate limiter shared by concurrent transfers.
///
/// Every transfer brackets its use with [`register_transfer`](Self::register_transfer)
/// and [`de_register_transfer`](Self::de_register_transfer) (or holds a
/// [`TransferHandle`]) and calls [`limit`](Self::limit) after each chunk.
/// Bookkeeping happens under a spin lock; the sleep itself happens after the
/// lock is released.
#[derive(Debug)]
pub struct Throttler {
    state: SpinLock<ThrottlerState>,
}

impl Throttler {
    /// Create a throttler. The rates go through [`configure_options`], so a
    /// zero bucket limit with a positive peak rate is derived automatically.
    pub fn new(
        avg_rate_bytes_per_sec: f64,
        peak_rate_bytes_per_sec: f64,
        bucket_limit_bytes: f64,
        throttler_log_time_millis: i64,
    ) -> Self {
        let mut avg_rate = avg_rate_bytes_per_sec;
        let mut peak_rate = peak_rate_bytes_per_sec;
        let mut bucket_limit = bucket_limit_bytes;
        configure_options(&mut avg_rate, &mut peak_rate, &mut bucket_limit);

        let now = Instant::now();
        debug!(
            avg_rate,
            peak_rate,
            bucket_limit,
            log_time_millis = throttler_log_time_millis,
            "Creating throttler"
        );

        Self {
            state: SpinLock::new(ThrottlerState {
                avg_rate_bytes_per_sec: avg_rate,
                bucket_rate_bytes_per_sec: peak_rate,
                bytes_token_bucket_limit: bucket_limit,
                bytes_token_bucket: bucket_limit,
                bytes_progress: 0.0,
                instant_progress: 0.0,
                start_time: now,
                last_fill_time: now,
                last_log_time: now,
                ref_count: 0,
                throttler_log_time_millis,
            }),
        }
    }

    /// Account `delta_progress` bytes and block for the required time.
    pub fn limit(&self, delta_progress: f64) {
        let sleep_secs = self.calculate_sleep_for_delta(delta_progress, Instant::now());

        if let Some(duration) = sleep_duration(sleep_secs) {
            if sleep_secs > 1.0 {
                debug!(sleep_secs, "Throttler sleeping");
            }
            std::thread::sleep(duration);
        }

        self.print_periodic_logs(Instant::now(), delta_progress);
    }

    /// Seconds the caller must sleep given the cumulative progress
    /// `bytes_total_progress` observed at `now`. Does not sleep.
    ///
    /// A total below the progress already accounted, or a non-finite total,
    /// counts as no progress.
    pub fn calculate_sleep(&self, bytes_total_progress: f64, now: Instant) -> f64 {
        let outcome = {
            let mut state = self.state.lock();
            let delta = sanitize_progress(bytes_total_progress - state.bytes_progress);
            state.account(delta, now)
        };
        Self::resolve_sleep(outcome)
    }

    fn calculate_sleep_for_delta(&self, delta_progress: f64, now: Instant) -> f64 {
        let delta = sanitize_progress(delta_progress);
        let outcome = self.state.lock().account(delta, now);
        Self::resolve_sleep(outcome)
    }

    fn resolve_sleep(outcome: Option<f64>) -> f64 {
        match outcome {
            Some(sleep_secs) => {
                trace!(sleep_secs, "Calculated throttler sleep");
                sleep_secs
            }
            None => {
                warn!("Throttler used without a registered transfer, not throttling");
                0.0
            }
        }
    }

    fn print_periodic_logs(&self, now: Instant, delta_progress: f64) {
        let report = self.state.lock().periodic_report(now, delta_progress);
        if let Some(report) = report {
            report.log();
        }
    }

    /// Register a transfer. The first registration of a group starts a new epoch.
    pub fn register_transfer(&self) {
        self.register_transfer_at(Instant::now());
    }

    fn register_transfer_at(&self, now: Instant) {
        let ref_count = {
            let mut state = self.state.lock();
            if state.ref_count <= 0 {
                state.ref_count = 0;
                state.reset_epoch(now);
            }
            state.ref_count += 1;
            state.ref_count
        };
        debug!(ref_count, "Registered transfer");
    }

    /// De-register a transfer. The count never drops below zero.
    pub fn de_register_transfer(&self) {
        let ref_count = {
            let mut state = self.state.lock();
            if state.ref_count <= 0 {
                None
            } else {
                state.ref_count -= 1;
                Some(state.ref_count)
            }
        };

        match ref_count {
            Some(ref_count) => debug!(ref_count, "De-registered transfer"),
            None => warn!("De-registering a transfer that was never registered"),
        }
    }

    /// Register a transfer that is de-registered when the handle drops.
    pub fn register(self: &Arc<Self>) -> TransferHandle {
        self.register_transfer();
        TransferHandle {
            throttler: Arc::clone(self),
        }
    }

    /// Get the average rate in bytes per second.
    pub fn get_avg_rate_bytes_per_sec(&self) -> f64 {
        self.state.lock().avg_rate_bytes_per_sec
    }

    /// Get the peak (bucket refill) rate in bytes per second.
    pub fn get_peak_rate_bytes_per_sec(&self) -> f64 {
        self.state.lock().bucket_rate_bytes_per_sec
    }

    /// Get the bucket limit in bytes.
    pub fn get_bucket_limit_bytes(&self) -> f64 {
        self.state.lock().bytes_token_bucket_limit
    }

    /// Get the periodic report interval in milliseconds.
    pub fn get_throttler_log_time_millis(&self) -> i64 {
        self.state.lock().throttler_log_time_millis
    }

    /// Set the periodic report interval; non-positive disables reporting.
    pub fn set_throttler_log_time_millis(&self, throttler_log_time_millis: i64) {
        self.state.lock().throttler_log_time_millis = throttler_log_time_millis;
    }

    /// Replace the rates. The new values are normalized and the bucket is
    /// clamped to the new limit.
    pub fn set_throttler_rates(
        &self,
        avg_rate_bytes_per_sec: f64,
        peak_rate_bytes_per_sec: f64,
        bucket_limit_bytes: f64,
    ) {
        let mut avg_rate = avg_rate_bytes_per_sec;
        let mut peak_rate = peak_rate_bytes_per_sec;
        let mut bucket_limit = bucket_limit_bytes;
        configure_options(&mut avg_rate, &mut peak_rate, &mut bucket_limit);

        {
            let mut state = self.state.lock();
            state.avg_rate_bytes_per_sec = avg_rate;
            state.bucket_rate_bytes_per_sec = peak_rate;
            state.bytes_token_bucket_limit = bucket_limit;
            state.bytes_token_bucket = state.bytes_token_bucket.min(bucket_limit).max(0.0);
        }

        debug!(avg_rate, peak_rate, bucket_limit, "Updated throttler rates");
    }

    /// Snapshot of the current state.
    pub fn stats(&self) -> ThrottlerStats {
        let now = Instant::now();
        self.state.lock().stats(now)
    }
}

impl fmt::Display for Throttler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "avg rate: {} bytes/sec, peak rate: {} bytes/sec, bucket limit: {} bytes, \
             bucket tokens: {} bytes, progress: {} bytes, registered transfers: {}, \
             log time: {} ms",
            stats.avg_rate_bytes_per_sec,
            stats.peak_rate_bytes_per_sec,
            stats.bucket_limit_bytes,
            stats.bucket_tokens,
            stats.bytes_progress,
            stats.ref_count,
            stats.log_interval_millis,
        )
    }
}

/// Registration of one transfer with a shared throttler.
///
/// Dropping the handle de-registers the transfer.
#[derive(Debug)]
pub struct TransferHandle {
    throttler: SharedThrottler,
}

impl TransferHandle {
    /// The throttler this transfer is registered with.
    pub fn throttler(&self) -> &SharedThrottler {
        &self.throttler
    }

    /// Shorthand for [`Throttler::limit`].
    pub fn limit(&self, delta_progress: f64) {
        self.throttler.limit(delta_progress);
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.throttler.de_register_transfer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn registered(avg: f64, peak: f64, bucket: f64, log_ms: i64) -> (SharedThrottler, Instant) {
        let throttler = make_throttler(avg, peak, bucket, log_ms);
        let t0 = Instant::now();
        throttler.register_transfer_at(t0);
        (throttler, t0)
    }

    #[test]
    fn test_make_throttler_normalizes() {
        let throttler = make_throttler(100.0, 50.0, 0.0, 0);

        assert_eq!(throttler.get_avg_rate_bytes_per_sec(), 100.0);
        assert_eq!(throttler.get_peak_rate_bytes_per_sec(), 100.0);
        assert_eq!(throttler.get_bucket_limit_bytes(), 50.0);
    }

    #[test]
    fn test_disabled_throttler_never_sleeps() {
        let (throttler, t0) = registered(0.0, 0.0, 0.0, 0);

        assert_eq!(throttler.calculate_sleep(1e12, t0), 0.0);
        assert_eq!(throttler.calculate_sleep(2e12, t0 + secs(0.001)), 0.0);
    }

    #[test]
    fn test_average_sleep() {
        let (throttler, t0) = registered(1000.0, 0.0, 0.0, 0);

        // 2000 bytes after one second is 1000 bytes ahead of the average.
        assert_eq!(throttler.calculate_sleep(2000.0, t0 + secs(1.0)), 1.0);
        // Behind the average, no sleep.
        assert_eq!(throttler.calculate_sleep(2500.0, t0 + secs(3.0)), 0.0);
    }

    #[test]
    fn test_average_converges() {
        let (throttler, t0) = registered(1000.0, 0.0, 0.0, 0);
        let mut now = t0;
        let mut total = 0.0;

        for _ in 0..100 {
            total += 500.0;
            let sleep = throttler.calculate_sleep(total, now);
            now += secs(sleep);
        }

        let rate = total / (now - t0).as_secs_f64();
        assert!((rate - 1000.0).abs() < 1.0, "rate {} should converge to 1000", rate);
    }

    #[test]
    fn test_token_bucket_sleep() {
        let (throttler, t0) = registered(0.0, 1000.0, 0.0, 0);
        assert_eq!(throttler.get_bucket_limit_bytes(), 500.0);

        // Exactly drains the full bucket.
        assert_eq!(throttler.calculate_sleep(500.0, t0), 0.0);
        // 1000 bytes over an empty bucket at 1000 bytes/sec.
        assert_eq!(throttler.calculate_sleep(1500.0, t0), 1.0);
        assert_eq!(throttler.stats().bucket_tokens, 0.0);

        // The refill during the sleep pays the debt, nothing is credited.
        assert_eq!(throttler.calculate_sleep(1500.0, t0 + secs(1.0)), 0.0);
        assert_eq!(throttler.stats().bucket_tokens, 0.0);

        // Refill after the debt is capped at the limit.
        assert_eq!(throttler.calculate_sleep(1500.0, t0 + secs(3.0)), 0.0);
        assert_eq!(throttler.stats().bucket_tokens, 500.0);
    }

    #[test]
    fn test_peak_rate_bound_over_many_steps() {
        let (throttler, t0) = registered(0.0, 1000.0, 500.0, 0);
        let mut now = t0;
        let mut total = 0.0;

        for _ in 0..50 {
            total += 150.0;
            let sleep = throttler.calculate_sleep(total, now);
            now += secs(sleep);

            let elapsed = (now - t0).as_secs_f64();
            assert!(
                total - 500.0 <= 1000.0 * elapsed + 1e-3,
                "{} bytes in {}s exceeds the peak rate",
                total,
                elapsed
            );
        }

        // Beyond the initial burst, progress runs at the peak rate, not above or far below it.
        let elapsed = (now - t0).as_secs_f64();
        assert!((elapsed - (total - 500.0) / 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_callers_queue_behind_outstanding_debt() {
        let (throttler, t0) = registered(0.0, 1000.0, 500.0, 0);

        assert_eq!(throttler.calculate_sleep(1500.0, t0), 1.0);
        // Another caller at the same instant waits for the first debt too.
        let sleep = throttler.calculate_sleep(1600.0, t0);
        assert!((sleep - 1.1).abs() < 1e-9);
        assert_eq!(throttler.stats().bucket_tokens, 0.0);
    }

    #[test]
    fn test_new_derives_bucket_limit() {
        let throttler = Throttler::new(0.0, 1000.0, 0.0, 0);
        assert_eq!(throttler.get_bucket_limit_bytes(), 500.0);

        let t0 = Instant::now();
        throttler.register_transfer_at(t0);

        let sleep = throttler.calculate_sleep(1_000_000.0, t0);
        assert!((sleep - 999.5).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_total_counts_as_no_progress() {
        let (throttler, t0) = registered(1000.0, 0.0, 0.0, 0);

        assert_eq!(throttler.calculate_sleep(f64::INFINITY, t0), 0.0);
        assert_eq!(throttler.stats().bytes_progress, 0.0);

        assert_eq!(throttler.calculate_sleep(10.0, t0 + secs(1000.0)), 0.0);
        assert_eq!(throttler.stats().bytes_progress, 10.0);
    }

    #[test]
    fn test_sleep_duration() {
        assert_eq!(sleep_duration(0.0), None);
        assert_eq!(sleep_duration(-1.0), None);
        assert_eq!(sleep_duration(f64::NAN), None);
        assert_eq!(sleep_duration(1.5), Some(Duration::from_millis(1500)));
        // Too large to represent still blocks rather than skipping the sleep.
        assert_eq!(sleep_duration(1e30), Some(Duration::MAX));
        assert_eq!(sleep_duration(f64::INFINITY), Some(Duration::MAX));
    }

    #[test]
    fn test_bucket_stays_within_bounds() {
        let (throttler, t0) = registered(0.0, 1000.0, 500.0, 0);
        let steps = [
            (100.0, 0.0),
            (900.0, 0.01),
            (0.0, 5.0),
            (50.0, 0.0),
            (2000.0, 0.1),
            (10.0, 0.3),
            (0.0, 0.0),
            (499.0, 0.2),
        ];
        let mut now = t0;
        let mut total = 0.0;

        for (delta, elapsed) in steps {
            now += secs(elapsed);
            total += delta;
            let sleep = throttler.calculate_sleep(total, now);
            assert!(sleep >= 0.0);

            let tokens = throttler.stats().bucket_tokens;
            assert!((0.0..=500.0).contains(&tokens), "tokens {} out of bounds", tokens);
        }
    }

    #[test]
    fn test_stricter_constraint_wins() {
        let (throttler, t0) = registered(100.0, 1000.0, 500.0, 0);

        // Bucket wants 0.6s, average wants (1100 - 100) / 100 = 10s.
        let sleep = throttler.calculate_sleep(1100.0, t0 + secs(1.0));
        assert!((sleep - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sleep_never_negative() {
        let (throttler, t0) = registered(100.0, 200.0, 0.0, 0);

        throttler.calculate_sleep(1000.0, t0);
        assert_eq!(throttler.calculate_sleep(10.0, t0 + secs(100.0)), 0.0);
        assert_eq!(throttler.calculate_sleep(f64::NAN, t0 + secs(100.0)), 0.0);
        assert_eq!(throttler.stats().bytes_progress, 1000.0);
    }

    #[test]
    fn test_unregistered_throttler_does_not_sleep() {
        let throttler = make_throttler(100.0, 0.0, 0.0, 0);

        assert_eq!(throttler.calculate_sleep(1e9, Instant::now()), 0.0);
        assert_eq!(throttler.stats().bytes_progress, 0.0);
    }

    #[test]
    fn test_registration_accounting() {
        let throttler = make_throttler(100.0, 0.0, 0.0, 0);
        let t0 = Instant::now();

        throttler.register_transfer_at(t0);
        throttler.register_transfer_at(t0 + secs(1.0));
        throttler.register_transfer_at(t0 + secs(2.0));
        throttler.de_register_transfer();

        let state = throttler.state.lock();
        assert_eq!(state.ref_count, 2);
        assert_eq!(state.start_time, t0);
    }

    #[test]
    fn test_mid_flight_join_keeps_epoch() {
        let (throttler, t0) = registered(0.0, 0.0, 0.0, 0);
        throttler.calculate_sleep(100.0, t0 + secs(0.5));

        throttler.register_transfer_at(t0 + secs(1.0));

        let state = throttler.state.lock();
        assert_eq!(state.start_time, t0);
        assert_eq!(state.bytes_progress, 100.0);
    }

    #[test]
    fn test_new_epoch_after_group_empties() {
        let (throttler, t0) = registered(0.0, 1000.0, 0.0, 0);
        throttler.calculate_sleep(400.0, t0);
        throttler.de_register_transfer();

        let t1 = t0 + secs(1.0);
        throttler.register_transfer_at(t1);

        let state = throttler.state.lock();
        assert_eq!(state.ref_count, 1);
        assert_eq!(state.start_time, t1);
        assert_eq!(state.bytes_progress, 0.0);
        assert_eq!(state.bytes_token_bucket, 500.0);
    }

    #[test]
    fn test_de_register_never_below_zero() {
        let throttler = make_throttler(100.0, 0.0, 0.0, 0);

        throttler.de_register_transfer();
        throttler.de_register_transfer();

        assert_eq!(throttler.stats().ref_count, 0);
    }

    #[test]
    fn test_transfer_handle_de_registers_on_drop() {
        let throttler = make_throttler(0.0, 0.0, 0.0, 0);

        {
            let first = throttler.register();
            let _second = throttler.register();
            assert_eq!(throttler.stats().ref_count, 2);

            first.limit(10.0);
            assert_eq!(first.throttler().stats().bytes_progress, 10.0);
        }

        assert_eq!(throttler.stats().ref_count, 0);
    }

    #[test]
    fn test_periodic_report() {
        let (throttler, t0) = registered(0.0, 0.0, 0.0, 100);
        throttler.calculate_sleep(100.0, t0);

        // Interval not reached yet.
        assert!(throttler.state.lock().periodic_report(t0 + secs(0.05), 100.0).is_none());

        let report = throttler
            .state
            .lock()
            .periodic_report(t0 + secs(0.2), 100.0)
            .unwrap();
        assert!((report.instant_rate_bytes_per_sec - 500.0).abs() < 1e-6);
        assert!((report.average_rate_bytes_per_sec - 500.0).abs() < 1e-6);
        assert_eq!(report.delta_progress, 100.0);

        let state = throttler.state.lock();
        assert_eq!(state.instant_progress, 0.0);
        assert_eq!(state.last_log_time, t0 + secs(0.2));
    }

    #[test]
    fn test_periodic_report_requires_registration() {
        let throttler = make_throttler(0.0, 0.0, 0.0, 10);
        let t0 = Instant::now();

        assert!(throttler.state.lock().periodic_report(t0 + secs(1.0), 0.0).is_none());

        throttler.register_transfer_at(t0);
        throttler.de_register_transfer();
        assert!(throttler.state.lock().periodic_report(t0 + secs(2.0), 0.0).is_none());
    }

    #[test]
    fn test_periodic_report_disabled() {
        let (throttler, t0) = registered(0.0, 0.0, 0.0, 0);
        throttler.calculate_sleep(100.0, t0);

        assert!(throttler.state.lock().periodic_report(t0 + secs(10.0), 0.0).is_none());

        throttler.set_throttler_log_time_millis(1000);
        assert_eq!(throttler.get_throttler_log_time_millis(), 1000);
        assert!(throttler.state.lock().periodic_report(t0 + secs(10.0), 0.0).is_some());
    }

    #[test]
    fn test_set_throttler_rates() {
        let (throttler, _) = registered(0.0, 1000.0, 0.0, 0);
        assert_eq!(throttler.stats().bucket_tokens, 500.0);

        throttler.set_throttler_rates(300.0, 200.0, 0.0);

        assert_eq!(throttler.get_avg_rate_bytes_per_sec(), 300.0);
        assert_eq!(throttler.get_peak_rate_bytes_per_sec(), 300.0);
        assert_eq!(throttler.get_bucket_limit_bytes(), 150.0);
        assert_eq!(throttler.stats().bucket_tokens, 150.0);
    }

    #[test]
    fn test_display() {
        let throttler = make_throttler(100.0, 200.0, 50.0, 10);
        let dump = throttler.to_string();

        assert!(dump.contains("avg rate: 100 bytes/sec"));
        assert!(dump.contains("peak rate: 200 bytes/sec"));
        assert!(dump.contains("bucket limit: 50 bytes"));
        assert!(dump.contains("log time: 10 ms"));
    }
}
