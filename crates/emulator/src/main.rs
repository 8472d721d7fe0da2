//! Function Emulator Server
//!
//! Runs the worker pool behind an HTTP server: ingress requests are brokered
//! to worker processes that long-poll the runtime API.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_pool::{BuildWatcher, ProcessLauncher, WorkerPool};

use fn_emulator::{build_router, config::AppConfig, state::AppState, ResultExt};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,fn_emulator=debug,worker_pool=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting function emulator"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let runtime_api = app_config.runtime_api_url();
    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        min_workers = app_config.min_workers,
        max_workers = app_config.max_workers,
        worker_command = %app_config.worker_command,
        runtime_api = %runtime_api,
        "Configuration loaded"
    );

    let launcher = ProcessLauncher::new(app_config.worker_command.clone(), runtime_api)
        .with_args(app_config.worker_args());
    let pool = WorkerPool::new(app_config.pool_config(), Arc::new(launcher))
        .log("creating worker pool")?;

    // Bind before starting workers so their first poll can connect
    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Server listening");

    pool.start().await.log("starting worker pool")?;

    let watcher = app_config.build_dir.as_ref().map(|dir| {
        BuildWatcher::new(dir, app_config.watch_debounce()).spawn(pool.clone())
    });

    let state = AppState::new(pool.clone(), app_config);
    let app = build_router(state);

    // Run the server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pool.clone()))
        .await?;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    pool.shutdown().await;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then close the pool so parked polls and
/// waiting callers return before the server drains connections.
async fn shutdown_signal(pool: WorkerPool) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }

    pool.shutdown().await;
}
