use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bucketgate::config::BucketGateConfig;
use bucketgate::ratelimit::{BucketSettings, SystemClock, TimeUnit};

/// Admit or deny caller ids read from stdin, one per line.
#[derive(Debug, Parser)]
#[command(name = "bucketgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Default bucket capacity (overrides the configuration file)
    #[arg(long)]
    capacity: Option<u64>,

    /// Default refill period, in `unit`s (overrides the configuration file)
    #[arg(long)]
    period: Option<u64>,

    /// Default period unit: millisecond, second, minute, hour or day
    #[arg(long, value_parser = parse_unit)]
    unit: Option<TimeUnit>,
}

fn parse_unit(value: &str) -> Result<TimeUnit, String> {
    serde_yaml::from_str(value).map_err(|_| format!("unknown time unit: {}", value))
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so decisions on stdout stay machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BucketGateConfig::from_file(path)?,
        None => BucketGateConfig::default(),
    };
    let BucketSettings {
        capacity,
        period,
        unit,
    } = config.limiter;
    config.limiter = BucketSettings::new(
        args.capacity.unwrap_or(capacity),
        args.period.unwrap_or(period),
        args.unit.unwrap_or(unit),
    );

    let limiter = config.build_limiter(SystemClock::shared())?;
    info!(
        capacity = config.limiter.capacity,
        period = config.limiter.period,
        unit = ?config.limiter.unit,
        overrides = config.clients.len(),
        "Limiter ready"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in io::stdin().lock().lines() {
        let line = line?;
        let caller_id = line.trim();
        if caller_id.is_empty() {
            continue;
        }

        let decision = if limiter.allow_request(caller_id) {
            "ALLOW"
        } else {
            "DENY"
        };
        writeln!(out, "{} {}", decision, caller_id)?;
    }

    info!(clients = limiter.client_count(), "Input exhausted");
    Ok(())
}
