//! waterhackd: the WaterHack daemon.
//!
//! Single binary that assembles all WaterHack subsystems:
//! - State store (redb)
//! - Telemetry hub + sampling loop
//! - Allocation scheduler + scheduling loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! waterhackd run --config /etc/waterhack/waterhack.toml --port 8480
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use waterhack_core::{Clock, ControlMode, SystemClock, WaterhackConfig};
use waterhack_telemetry::{IngestorConfig, SimulatedSource, SimulationProfile, TelemetryHub};

#[derive(Parser)]
#[command(name = "waterhackd", about = "WaterHack canal allocation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, telemetry sampler and API in one process.
    Run {
        /// Path to waterhack.toml. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Start in manual control mode.
        #[arg(long)]
        manual: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,waterhackd=debug,waterhack=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            manual,
        } => {
            let mut cfg = match config {
                Some(path) => WaterhackConfig::from_file(&path)?,
                None => WaterhackConfig::default(),
            };
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Some(dir) = data_dir {
                cfg.server.data_dir = dir;
            }
            if manual {
                cfg.scheduler.control_mode = ControlMode::Manual;
            }
            run(cfg).await
        }
    }
}

async fn run(cfg: WaterhackConfig) -> anyhow::Result<()> {
    info!("WaterHack daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&cfg.server.data_dir)?;
    let db_path = cfg.server.data_dir.join("waterhack.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // State store.
    let store = waterhack_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Telemetry.
    let telemetry = TelemetryHub::new(IngestorConfig::from(&cfg.telemetry), clock.clone())?;
    let source = match cfg.telemetry.seed {
        Some(seed) => SimulatedSource::seeded(seed, SimulationProfile::default()),
        None => SimulatedSource::from_entropy(SimulationProfile::default()),
    };
    info!(
        alpha = cfg.telemetry.alpha,
        seed = ?cfg.telemetry.seed,
        "telemetry hub initialized"
    );

    // Scheduler. Refuses to start on an inconsistent store.
    let scheduler = waterhack_scheduler::Scheduler::recover(
        store.clone(),
        telemetry.clone(),
        clock,
        &cfg.scheduler,
    )?;
    info!(mode = ?cfg.scheduler.control_mode, "scheduler recovered");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sampler_shutdown = shutdown_rx.clone();
    let scheduler_shutdown = shutdown_rx;

    // ── Start background tasks ─────────────────────────────────

    let sampler_handle = tokio::spawn(waterhack_telemetry::run_sampler(
        telemetry.clone(),
        source,
        cfg.telemetry.sample_interval(),
        sampler_shutdown,
    ));

    let loop_scheduler = scheduler.clone();
    let scheduler_handle = tokio::spawn(async move {
        loop_scheduler.run(scheduler_shutdown).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = waterhack_api::build_router(waterhack_api::ApiState {
        store,
        scheduler,
        telemetry,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = sampler_handle.await;
    let _ = scheduler_handle.await;

    info!("WaterHack daemon stopped");
    Ok(())
}
