use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sliding_limiter::config::{LimiterConfig, LogFormat, LoggingConfig};
use sliding_limiter::ratelimit::{Decision, Rate, RuleRegistry};

/// Sliding window rate limiter.
#[derive(Debug, Parser)]
#[command(name = "sliding-limiter", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse a rate literal such as "10 requests in 1 minute"
    ParseRate {
        /// The rate literal
        literal: String,
    },
    /// Run decisions for one key under a configured rule
    Check {
        /// Rule name
        #[arg(short, long)]
        rule: String,
        /// Logical key
        #[arg(short, long)]
        key: String,
        /// Number of consecutive requests
        #[arg(short = 'n', long, default_value_t = 1)]
        repeat: usize,
    },
    /// Replay "<unix-seconds> <key>" lines from stdin through a rule
    Replay {
        /// Rule name
        #[arg(short, long)]
        rule: String,
    },
}

#[derive(Debug, Serialize)]
struct ReplayLine<'a> {
    now: f64,
    key: &'a str,
    #[serde(flatten)]
    decision: Decision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = LimiterConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sliding-limiter");

    match cli.command {
        Command::ParseRate { literal } => {
            let rate: Rate = literal.parse()?;
            println!("requests:          {}", rate.requests);
            println!("period:            {}", rate.period);
            println!("unit:              {:?}", rate.unit);
            println!("period in seconds: {}", rate.period_in_seconds());
            if let Err(e) = rate.validate() {
                warn!(error = %e, "Rate cannot be used for a sliding window");
            }
        }
        Command::Check { rule, key, repeat } => {
            let registry = RuleRegistry::from_config(&config)?;
            for attempt in 1..=repeat {
                match registry.check(&rule, &key)? {
                    Decision::Allowed => println!("{attempt}: allowed"),
                    Decision::RateLimited { until } => {
                        println!("{attempt}: rate-limited until {until:.3}")
                    }
                }
            }
        }
        Command::Replay { rule } => {
            let registry = RuleRegistry::from_config(&config)?;
            for line in std::io::stdin().lock().lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((now, key)) = line.split_once(char::is_whitespace) else {
                    bail!("expected '<unix-seconds> <key>', got '{line}'");
                };
                let now: f64 = now
                    .parse()
                    .with_context(|| format!("bad timestamp in '{line}'"))?;
                let key = key.trim();

                let decision = registry.check_at(&rule, key, now)?;
                println!(
                    "{}",
                    serde_json::to_string(&ReplayLine { now, key, decision })?
                );
            }
        }
    }

    Ok(())
}

/// Initialize tracing from the logging configuration; `RUST_LOG` wins.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
