//! wearquotad - write-endurance quota daemon.
//!
//! Polls the per-actor write-stats export once per interval, feeds each
//! snapshot through the `wearquota-core` control loop, and carries leash
//! decisions to the configured enforcement backend. Runs until SIGINT,
//! SIGTERM, or the configured run duration elapses, then flushes the
//! actor store and the telemetry series exactly once.
//!
//! The control loop itself is synchronous and single-tick-at-a-time; the
//! async runtime only multiplexes the interval timer against the Unix
//! signals, so a signal never interrupts a tick mid-mutation.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wearquota_core::config::MonitorConfig;
use wearquota_core::monitor::Monitor;
use wearquota_core::sample::SampleSource;
use wearquota_core::store::ActorStore;
use wearquota_daemon::enforcers::EnforcerBackend;
use wearquota_daemon::probe::ProbeBackend;
use wearquota_daemon::series::JsonlSeriesSink;
use wearquota_daemon::sources::SourceBackend;

/// wearquotad - write-endurance quota daemon
#[derive(Parser, Debug)]
#[command(name = "wearquotad")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the monitor policy file
    #[arg(short, long, default_value = "wearquota.toml")]
    config: PathBuf,

    /// Path to the actor stats store (overrides the policy file)
    #[arg(long)]
    stats_store: Option<PathBuf>,

    /// Prefix for the telemetry series file
    #[arg(long, default_value = "")]
    series_prefix: String,

    /// Stop after this many seconds (overrides the policy file; 0 = run
    /// until signalled)
    #[arg(long)]
    run_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    let config =
        MonitorConfig::from_file(&args.config).context("failed to load monitor policy")?;
    info!(
        w_max_gib = config.device.w_max_kib as f64 / 1024.0 / 1024.0,
        lifetime_days = config.device.life_secs as f64 / 86_400.0,
        slack_gib = config.device.initial_slack() / 1024.0 / 1024.0,
        baseline_kib_s = config.device.baseline_rate(),
        "monitor started"
    );

    let store_path = args
        .stats_store
        .clone()
        .unwrap_or_else(|| config.store.path.clone());
    let store = ActorStore::load(&store_path).context("failed to load actor store")?;

    let start_secs = unix_now_secs() as u64;
    let sink = JsonlSeriesSink::create(&args.series_prefix, start_secs)
        .context("failed to open telemetry series sink")?;
    let mut source = SourceBackend::from_config(&config);
    let probe = ProbeBackend::from_config(&config);
    let enforcer = EnforcerBackend::from_config(&config);

    let mut monitor = Monitor::new(&config, &store, probe, enforcer, sink);

    let interval_secs = config.sampling.interval_secs;
    let run_secs = args.run_secs.unwrap_or(config.sampling.run_secs);

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if run_secs > 0 && monitor.ticks() * interval_secs >= run_secs {
                    info!(run_secs, "configured run duration elapsed");
                    break;
                }
                // The whole tick runs inside this arm, so shutdown can
                // only ever observe tick boundaries.
                match source.sample() {
                    Ok(batch) => {
                        monitor.tick(unix_now_secs(), &batch);
                    },
                    Err(err) => {
                        // A missed sample fails only its own tick; the
                        // ledgers are untouched and the loop keeps going.
                        warn!("sample failed, skipping tick: {err}");
                    },
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
        }
    }

    // Exactly-once finalizer: flush the series sink and persist merged
    // actor totals.
    let ticks = monitor.ticks();
    let snapshot = monitor.finish().context("failed to flush telemetry")?;
    if config.store.persist {
        snapshot
            .save(&store_path)
            .context("failed to flush actor store")?;
    }
    info!(ticks, "monitor stopped");
    Ok(())
}
