//! Gemini CloudCode gateway
//!
//! Single-binary Rust service that:
//! 1. Serves an OpenAI-compatible chat API backed by Gemini CloudCode
//! 2. Rotates a pool of OAuth credentials, refreshing access tokens lazily
//! 3. Exposes a loopback admin API for credential CRUD and quota views
//! 4. Reports pool health and Prometheus metrics

mod admin;
mod config;
mod metrics;
mod openai;
mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gemini_auth::credentials::CredentialFile;
use gemini_pool::{QuotaCache, Rotator, RotatorOptions, SWEEP_INTERVAL, spawn_quota_sweep};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::routes::AppState;

/// How long in-flight requests get to finish after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    if config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
    } else {
        warn!(path = %config_path.display(), "config file not found, using defaults");
    }

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        accounts_path = %config.storage.accounts_path.display(),
        api_key_required = config.api_key.is_some(),
        "configuration loaded"
    );

    // A store that exists but cannot be parsed is fatal; an absent one
    // starts an empty pool the admin API can fill.
    let store = CredentialFile::open(&config.storage.accounts_path).with_context(|| {
        format!(
            "failed to open credential store at {}",
            config.storage.accounts_path.display()
        )
    })?;

    let http = reqwest::Client::new();
    let client = cloudcode::CloudCodeClient::new(http.clone(), config.api.to_api_config());

    let rotator = Arc::new(Rotator::new(
        Arc::new(store),
        http,
        client.clone(),
        RotatorOptions {
            skip_eligibility_check: config.rotation.skip_eligibility_check,
            ..RotatorOptions::default()
        },
    ));
    let accounts = rotator
        .reload()
        .await
        .context("failed to load the credential pool")?;
    info!(accounts, "credential pool loaded");

    let quotas = Arc::new(QuotaCache::open(&config.storage.quotas_path));
    let sweep = spawn_quota_sweep(quotas.clone(), SWEEP_INTERVAL);

    let app_state = AppState {
        rotator: rotator.clone(),
        client: client.clone(),
        api_key: config.api_key.map(Arc::new),
        defaults: config.defaults.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = routes::build_router(
        app_state,
        config.server.max_connections,
        config.server.max_body_bytes,
    );

    let admin_app = admin::build_admin_router(AdminState {
        rotator,
        quotas,
        client,
    });

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.admin_addr))?;

    info!(addr = %config.server.listen_addr, "accepting requests");
    info!(addr = %config.server.admin_addr, "admin API listening");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. both listeners stop accepting and drain in-flight requests
    // 3. DRAIN_TIMEOUT keeps a slow client from blocking process exit
    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    let mut main_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = main_rx.changed().await;
            })
            .await
    });

    let mut admin_rx = shutdown_tx.subscribe();
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = admin_rx.changed().await;
            })
            .await
    });

    // Wait for the OS signal, then begin draining both listeners
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    sweep.abort();

    for (name, handle) in [("main", server_handle), ("admin", admin_handle)] {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => info!(listener = name, "all in-flight requests drained"),
            Ok(Ok(Err(e))) => error!(listener = name, error = %e, "server error during shutdown"),
            Ok(Err(e)) => error!(listener = name, error = %e, "server task panicked"),
            Err(_) => warn!(
                listener = name,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            ),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
