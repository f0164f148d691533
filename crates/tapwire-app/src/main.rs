//! Tapwire - capture traffic to selected sites and extract articles.
//!
//! This is the main binary:
//! - Intercepting proxy (always)
//! - Instrumentation bridge (with `--agent`)
//! - Query API server (with `--api-port`)

mod cli;

use std::panic;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tapwire_bridge::InstrumentationBridge;
use tapwire_proxy::{CaManager, ProxyServer};
use tapwire_server::{AppState, Server, ServerConfig};
use tapwire_storage::{Database, StatsAggregator};
use tokio_util::sync::CancellationToken;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Command, GlobalArgs, RunArgs};

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "tapwire", "tapwire").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &GlobalArgs) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tapwire={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("tapwire")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if args.debug {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn open_database(args: &GlobalArgs) -> anyhow::Result<Database> {
    let path = match &args.db {
        Some(path) => path.clone(),
        None => Database::default_db_path()?,
    };

    let db = Database::with_path(&path).with_context(|| format!("opening {:?}", path))?;
    tracing::info!("Database opened at {:?}", path);
    Ok(db)
}

/// Runs the proxy, and the bridge and API server when asked, until Ctrl-C.
async fn run(db: Database, args: RunArgs) -> anyhow::Result<()> {
    let stats = StatsAggregator::new(db.clone());
    let shutdown = CancellationToken::new();

    let proxy = ProxyServer::new(args.proxy_config(), db.clone())?;
    let proxy_handle = proxy.start().await?;
    let targets = proxy.target_domains();
    tracing::info!(
        targets = ?targets.iter().collect::<Vec<_>>(),
        tls_intercept = proxy.intercepts_tls(),
        "Proxy listening on {}",
        proxy_handle.addr()
    );
    if let Some(path) = proxy.ca_cert_path().filter(|_| proxy.intercepts_tls()) {
        tracing::info!("Install {:?} on the device to capture HTTPS", path);
    }

    let bridge = args
        .bridge_config()
        .map(|config| InstrumentationBridge::new(config, db.clone()).start());

    let api = match args.api_port {
        Some(port) => {
            let state = AppState::new(db.clone()).with_proxy_metrics(proxy.metrics());
            let server = Server::with_state(ServerConfig::default().with_port(port), state)?;
            let stop = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run_until(stop.cancelled_owned()).await {
                    tracing::error!("API server error: {}", e);
                }
            }))
        }
        None => None,
    };

    let mut ticker = args.stats_interval().map(tokio::time::interval);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for Ctrl-C")?;
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Err(e) = stats.log_summary() {
                    tracing::warn!("Summary unavailable: {}", e);
                }
                tracing::debug!(metrics = ?proxy.metrics().snapshot(), "Proxy counters");
            }
        }
    }

    shutdown.cancel();
    proxy_handle.stop().await;
    if let Some(bridge) = bridge {
        bridge.stop().await;
    }
    if let Some(api) = api {
        let _ = api.await;
    }

    let summary = stats.log_summary()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Prints the summary of an existing database.
fn print_stats(db: &Database, recent: i64) -> anyhow::Result<()> {
    let summary = StatsAggregator::new(db.clone())
        .with_recent_limit(recent)
        .summary()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Creates the root CA if needed and prints where its certificate lives.
fn ensure_ca(ca_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let manager = match ca_dir {
        Some(dir) => CaManager::new(dir),
        None => CaManager::with_default_dir()?,
    };

    manager.ensure_ca()?;
    println!("{}", manager.cert_path().display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging (keep guard alive for the duration of the program)
    let _log_guard = init_logging(&cli.global);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    tracing::info!("Starting Tapwire...");
    tracing::debug!("Args: {:?}", cli);

    let global = cli.global.clone();
    match cli.into_command() {
        Command::Run(args) => run(open_database(&global)?, args).await?,
        Command::Stats { recent } => print_stats(&open_database(&global)?, recent)?,
        Command::Ca { ca_dir } => ensure_ca(ca_dir)?,
    }

    tracing::info!("Tapwire shutting down");
    Ok(())
}
