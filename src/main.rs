use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windmill::config::WindmillConfig;
use windmill::{wait_for, Context, LimiterStore, WindmillError};

/// Admit keys read from stdin through a sliding window rate limiter.
///
/// Each input line is a key. One decision is written to stdout per key.
#[derive(Parser, Debug)]
#[command(name = "windmill", version, about)]
struct Cli {
    /// Configuration file (YAML, JSON or TOML); WINDMILL__* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Wait for capacity instead of rejecting
    #[arg(long)]
    wait: bool,

    /// Print decisions as JSON lines
    #[arg(long)]
    json: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// The outcome for one key.
#[derive(Debug, Serialize)]
struct Decision<'a> {
    key: &'a str,
    allowed: bool,
    limit: u64,
    remaining: u64,
    retry_after_ms: u64,
    waited_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)?,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Windmill");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = WindmillConfig::load(cli.config.as_deref())?;
    info!(
        max_events = config.limiter.max_events,
        interval_ms = config.limiter.interval_ms,
        segments = config.limiter.segments,
        cleanup_interval_ms = config.store.cleanup_interval_ms,
        "Configuration loaded"
    );

    let ctx = Context::background();
    let store = LimiterStore::new(&ctx, config.sliding_window()?, config.cleanup_interval())?;

    tokio::spawn(shutdown_signal(ctx.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = ctx.done() => break,
        };
        let Some(line) = line else {
            break;
        };
        let key = line.trim();
        if key.is_empty() {
            continue;
        }

        let decision = match admit(&ctx, &store, key, cli.wait).await {
            Ok(decision) => decision,
            Err(WindmillError::Context(reason)) => {
                info!(reason = %reason, "Context done, stopping");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        if cli.json {
            println!("{}", serde_json::to_string(&decision)?);
        } else if decision.allowed {
            println!(
                "ALLOW {} remaining={}/{} waited={}ms",
                decision.key, decision.remaining, decision.limit, decision.waited_ms
            );
        } else {
            println!(
                "DENY {} retry_after={}ms",
                decision.key, decision.retry_after_ms
            );
        }
    }

    ctx.cancel();
    info!(keys = store.len(), "Windmill stopped");
    Ok(())
}

/// Consume one unit for `key`, waiting for capacity when `wait_for_capacity`
/// is set.
async fn admit<'a>(
    ctx: &Context,
    store: &LimiterStore,
    key: &'a str,
    wait_for_capacity: bool,
) -> windmill::Result<Decision<'a>> {
    let limiter = store.limit(ctx, key)?;
    let started = Instant::now();

    loop {
        let token = limiter.take();
        match token.consume() {
            Ok(()) => {
                return Ok(Decision {
                    key,
                    allowed: true,
                    limit: limiter.limit(),
                    remaining: limiter.tokens(ctx)?,
                    retry_after_ms: 0,
                    waited_ms: millis(started.elapsed()),
                });
            }
            Err(WindmillError::RateLimitExceeded) if wait_for_capacity => {
                wait_for(ctx, token.retry_after()).await?;
            }
            Err(WindmillError::RateLimitExceeded) => {
                return Ok(Decision {
                    key,
                    allowed: false,
                    limit: limiter.limit(),
                    remaining: 0,
                    retry_after_ms: millis(token.retry_after()),
                    waited_ms: 0,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Cancel `ctx` on Ctrl+C or SIGTERM.
async fn shutdown_signal(ctx: Context) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }

    ctx.cancel();
}
