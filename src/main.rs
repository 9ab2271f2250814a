//! Disco - IdP discovery login statistics
//!
//! Records which identity provider each network logs in with and serves
//! ranked IdP suggestions from that history:
//! - In-memory login counters with batched write-back to SQLite
//! - Per-network and global ranking cache
//! - Stale-while-revalidate accepted-IdP filter lists
//! - Prometheus metrics

mod cache;
mod config;
mod discovery;
mod error;
mod logins;
mod metrics;
mod routes;
mod services;
mod store;
mod utils;

use crate::config::Config;
use crate::discovery::DiscoveryService;
use crate::metrics::create_metrics;
use crate::routes::{router, AppState};
use crate::services::discofeed::DiscoFeedApi;
use crate::services::metadata::MetadataStore;
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Disco - IdP discovery login statistics
#[derive(Parser, Debug)]
#[command(name = "disco")]
#[command(author, version, about = "IdP discovery login statistics server", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Server port (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,

    /// Login statistics database (overrides DATABASE_PATH env var)
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Disco v{}", env!("CARGO_PKG_VERSION"));

    // CLI overrides env
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = database;
    }

    let metrics = create_metrics();
    let api = DiscoFeedApi::new(config.metadata.request_timeout);
    let metadata = Arc::new(MetadataStore::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = metadata.spawn_refresher(
        api.clone(),
        config.metadata.clone(),
        metrics.clone(),
        shutdown_rx,
    );
    if refresher.is_none() {
        warn!("DISCOFEED_URL not set, no IdP is known and every login will be ignored");
    }

    if config.filter.allowed_prefixes.is_empty() {
        info!("FILTER_URL_PREFIXES not set, filter lists are ignored");
    }

    // nothing downstream works without the store
    let (discovery, lifecycle) =
        DiscoveryService::start(&config, metadata.clone(), api, metrics.clone())
            .with_context(|| format!("failed to open {}", config.database.path.display()))?;

    let app = router(AppState {
        discovery,
        metadata,
        metrics,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(
        "Listening on http://{} (Login: /login, Suggestions: /suggestions, Metrics: /metrics, Health: /health)",
        addr
    );

    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl-c");
        info!("Shutdown signal received, initiating graceful shutdown...");
        let _ = shutdown_tx.send(true);
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    // counts known at this point are persisted or logged as failed, unless
    // the store hangs past the timeout
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, lifecycle.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Login statistics did not shut down cleanly"),
        Err(_) => error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Timed out flushing login statistics, queued counts are lost"
        ),
    }
    if let Some(refresher) = refresher {
        refresher.abort();
    }

    info!("Disco shutdown complete");
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("disco={},tower_http=info,hyper=warn", level)));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}
