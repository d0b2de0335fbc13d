//! pax-daemon - priority auction and incentive allocation daemon.
//!
//! Loads configuration, builds the market engine, starts the lease sweep and
//! digest flush timers, and serves the HTTP API until ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pax_core::MarketEngine;
use pax_core::config::PaxConfig;
use pax_daemon::api;
use pax_daemon::notify::{DigestNotificationQueue, LogDigestSink};
use pax_daemon::scheduler::{spawn_digest_flush, spawn_lease_sweep};
use pax_daemon::state::{DaemonStateHandle, SharedState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// pax daemon - priority auctions, bounty pools and vertical leases
#[derive(Parser, Debug)]
#[command(name = "pax-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file; defaults apply when absent
    #[arg(short, long, env = "PAX_CONFIG")]
    config: Option<PathBuf>,

    /// Address the HTTP API binds to (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
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

fn load_config(args: &Args) -> Result<PaxConfig> {
    let mut config = match &args.config {
        Some(path) => PaxConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PaxConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.daemon.listen_addr = listen.to_string();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    let config = load_config(&args)?;
    let addr: SocketAddr = config
        .daemon
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.daemon.listen_addr))?;

    let notifications = Arc::new(DigestNotificationQueue::new(
        config.daemon.notification_daily_cap,
        Arc::new(LogDigestSink),
    ));
    let sweep_interval = config.daemon.sweep_interval();
    let flush_interval = config.daemon.digest_flush_interval();
    let engine = MarketEngine::builder(config)
        .notifier(notifications.clone())
        .build();
    let state: SharedState = Arc::new(DaemonStateHandle::new(engine, notifications));

    let sweep_task = spawn_lease_sweep(state.clone(), sweep_interval);
    let flush_task = spawn_digest_flush(state.clone(), flush_interval);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP API")?;
    info!(addr = %addr, "HTTP API listening");

    let shutdown_state = state.clone();
    axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("Received ctrl-c, shutting down");
            shutdown_state.request_shutdown();
        })
        .await
        .context("HTTP API error")?;

    state.request_shutdown();
    sweep_task.abort();
    flush_task.abort();
    let report = state.notifications().flush().await;
    info!(
        delivered = report.delivered,
        failed = report.failed,
        uptime_secs = state.uptime_secs(),
        "pax-daemon stopped"
    );
    Ok(())
}
