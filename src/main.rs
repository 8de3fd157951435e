use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use throttler::config::{ThrottlerConfig, BYTES_PER_MBYTE};
use throttler::throttle::{SharedThrottler, ThrottlerStats};

/// Drive a shared throttler with a synthetic multi-threaded transfer.
#[derive(Debug, Parser)]
#[command(name = "throttler", version, about)]
struct Args {
    /// YAML configuration file; `THROTTLER_*` environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Average rate in megabytes per second (0 disables)
    #[arg(long)]
    avg_mbytes_per_sec: Option<f64>,

    /// Peak rate in megabytes per second (0 disables)
    #[arg(long)]
    max_mbytes_per_sec: Option<f64>,

    /// Token bucket limit in megabytes (0 derives it from the peak rate)
    #[arg(long)]
    bucket_limit_mbytes: Option<f64>,

    /// Interval between throughput reports in milliseconds (0 disables)
    #[arg(long)]
    log_time_millis: Option<i64>,

    /// Number of concurrent workers
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Total megabytes to move across all workers
    #[arg(long, default_value_t = 64.0)]
    total_mbytes: f64,

    /// Maximum chunk size in kilobytes; chunks vary between half and full size
    #[arg(long, default_value_t = 256)]
    chunk_kbytes: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    threads: usize,
    bytes: u64,
    elapsed_secs: f64,
    mbytes_per_sec: f64,
    throttler: Option<ThrottlerStats>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    info!(?config, "Configuration loaded");

    let throttler = config.build_throttler();
    if let Some(ref throttler) = throttler {
        info!(throttler = %throttler, "Throttler initialized");
    }

    let threads = args.threads.max(1);
    let bytes_per_worker = (args.total_mbytes.max(0.0) * BYTES_PER_MBYTE) as u64 / threads as u64;
    let max_chunk = (args.chunk_kbytes.max(1) * 1024).max(2);

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|worker| {
            let throttler = throttler.clone();
            thread::spawn(move || run_worker(worker, throttler, bytes_per_worker, max_chunk))
        })
        .collect();

    let mut bytes = 0;
    for handle in handles {
        bytes += handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
    }
    let elapsed_secs = start.elapsed().as_secs_f64();

    let summary = Summary {
        threads,
        bytes,
        elapsed_secs,
        mbytes_per_sec: if elapsed_secs > 0.0 {
            bytes as f64 / BYTES_PER_MBYTE / elapsed_secs
        } else {
            0.0
        },
        throttler: throttler.as_ref().map(|t| t.stats()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            threads = summary.threads,
            bytes = summary.bytes,
            elapsed_secs = summary.elapsed_secs,
            mbytes_per_sec = summary.mbytes_per_sec,
            "Transfer complete"
        );
    }

    Ok(())
}

/// Load file/environment configuration, then apply command line overrides.
fn resolve_config(args: &Args) -> anyhow::Result<ThrottlerConfig> {
    let mut config = ThrottlerConfig::load(args.config.as_deref())?;

    if let Some(avg) = args.avg_mbytes_per_sec {
        config.avg_rate_bytes_per_sec = avg * BYTES_PER_MBYTE;
    }
    if let Some(peak) = args.max_mbytes_per_sec {
        config.peak_rate_bytes_per_sec = peak * BYTES_PER_MBYTE;
    }
    if let Some(bucket) = args.bucket_limit_mbytes {
        config.bucket_limit_bytes = bucket * BYTES_PER_MBYTE;
    }
    if let Some(log_time_millis) = args.log_time_millis {
        config.log_interval_millis = log_time_millis;
    }

    Ok(config)
}

/// Move `total` bytes in random sized chunks, reporting each chunk to the throttler.
fn run_worker(worker: usize, throttler: Option<SharedThrottler>, total: u64, max_chunk: u64) -> u64 {
    let registration = throttler.as_ref().map(|t| t.register());
    let mut rng = rand::thread_rng();
    let mut moved = 0;

    while moved < total {
        let chunk = rng.gen_range(max_chunk / 2..=max_chunk).min(total - moved);
        moved += chunk;
        if let Some(ref registration) = registration {
            registration.limit(chunk as f64);
        }
    }

    debug!(worker, bytes = moved, "Worker finished");
    moved
}
