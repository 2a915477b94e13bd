use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{AdmissionMode, DemoConfig, RatekeeperConfig};
use ratekeeper::ratelimit::{
    MultiLimiter, Rate, RateLimiter, TokenBucketConfig, TokenBucketLimiter, WaitContext,
};

/// Drive a configured limiter with concurrent workers and log every admission.
#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Requests issued by each worker
    #[arg(short, long)]
    requests: Option<usize>,

    /// How workers ask for admission
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Per-request wait timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Drive the configured limiter, or a connection whose operations share limits
    #[arg(short, long, value_enum, default_value_t = Scenario::Single)]
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Every worker goes through the configured limiter
    Single,
    /// Half the workers read files and half resolve addresses
    Combined,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Wait,
    Try,
}

impl From<Mode> for AdmissionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Wait => AdmissionMode::Wait,
            Mode::Try => AdmissionMode::Try,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Ratekeeper demo");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RatekeeperConfig::from_file(path)?,
        None => RatekeeperConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.demo.workers = workers;
    }
    if let Some(requests) = args.requests {
        config.demo.requests_per_worker = requests;
    }
    if let Some(mode) = args.mode {
        config.demo.mode = mode.into();
    }
    if args.timeout_ms.is_some() {
        config.demo.timeout_ms = args.timeout_ms;
    }
    info!(demo = ?config.demo, "Configuration loaded");

    // Throttle tickers and every worker wait hang off this context.
    let (ctx, cancel) = WaitContext::with_cancel();
    let operations: Vec<(&'static str, Arc<dyn RateLimiter>)> = match args.scenario {
        Scenario::Single => vec![("request", config.limiter.build(&ctx)?)],
        Scenario::Combined => {
            let connection = ApiConnection::open()?;
            vec![
                ("read_file", connection.read_file),
                ("resolve_address", connection.resolve_address),
            ]
        }
    };
    for (operation, limiter) in &operations {
        info!(
            operation = *operation,
            limit = %limiter.limit(),
            burst = limiter.burst(),
            "Limiter initialized"
        );
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    let started = Instant::now();
    let workers = (0..config.demo.workers).map(|worker| {
        let (operation, limiter) = &operations[worker % operations.len()];
        tokio::spawn(run_worker(
            worker,
            *operation,
            limiter.clone(),
            ctx.clone(),
            config.demo.clone(),
            started,
        ))
    });

    let mut admitted = 0;
    let mut refused = 0;
    for result in futures::future::join_all(workers).await {
        let (ok, failed) = result?;
        admitted += ok;
        refused += failed;
    }

    info!(
        admitted = admitted,
        refused = refused,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Done"
    );
    Ok(())
}

/// A remote API whose operations are limited by the API quota plus the
/// quota of the resource each one touches.
///
/// The API limiter is shared, so reads and resolves draw from the same
/// per-second and per-minute budget.
struct ApiConnection {
    read_file: Arc<dyn RateLimiter>,
    resolve_address: Arc<dyn RateLimiter>,
}

impl ApiConnection {
    fn open() -> ratekeeper::error::Result<Self> {
        let api: Arc<dyn RateLimiter> = Arc::new(MultiLimiter::new(vec![
            token_bucket(2, Rate::per(2, Duration::from_secs(1)))?,
            token_bucket(10, Rate::per(10, Duration::from_secs(60)))?,
        ])?);
        let disk: Arc<dyn RateLimiter> = Arc::new(MultiLimiter::new(vec![token_bucket(
            1,
            Rate::per_second(1.0),
        )?])?);
        let network: Arc<dyn RateLimiter> = Arc::new(MultiLimiter::new(vec![token_bucket(
            3,
            Rate::per(3, Duration::from_secs(1)),
        )?])?);

        Ok(Self {
            read_file: Arc::new(MultiLimiter::new(vec![api.clone(), disk])?),
            resolve_address: Arc::new(MultiLimiter::new(vec![api, network])?),
        })
    }
}

fn token_bucket(burst: u64, rate: Rate) -> ratekeeper::error::Result<Arc<dyn RateLimiter>> {
    Ok(Arc::new(TokenBucketLimiter::new(TokenBucketConfig { burst, rate })?))
}

/// Issue the configured requests; returns (admitted, refused).
async fn run_worker(
    worker: usize,
    operation: &'static str,
    limiter: Arc<dyn RateLimiter>,
    ctx: WaitContext,
    demo: DemoConfig,
    started: Instant,
) -> (usize, usize) {
    let mut admitted = 0;
    let mut refused = 0;

    for request in 0..demo.requests_per_worker {
        let outcome = match demo.mode {
            AdmissionMode::Wait => {
                let ctx = match demo.timeout_ms {
                    Some(ms) => ctx.with_timeout(Duration::from_millis(ms)),
                    None => ctx.clone(),
                };
                limiter.wait(&ctx).await.map_err(|e| e.to_string())
            }
            AdmissionMode::Try => {
                if limiter.try_acquire() {
                    Ok(())
                } else {
                    Err("refused".to_string())
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                admitted += 1;
                info!(
                    worker = worker,
                    operation = operation,
                    request = request,
                    elapsed_ms = elapsed_ms,
                    "Admitted"
                );
            }
            Err(reason) => {
                refused += 1;
                warn!(
                    worker = worker,
                    operation = operation,
                    request = request,
                    elapsed_ms = elapsed_ms,
                    reason = %reason,
                    "Not admitted"
                );
            }
        }
    }

    (admitted, refused)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling outstanding waits");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling outstanding waits");
        }
    }
}
