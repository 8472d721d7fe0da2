//! Function emulator worker binary.
//!
//! Exits 0 once the emulator retires it.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worker_runtime::{Runtime, RuntimeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = RuntimeConfig::from_env()?;
    tracing::info!(
        worker_id = %config.worker_id,
        code_version = %config.code_version,
        runtime_api = %config.runtime_api,
        handler = %config.handler_command,
        "Worker configuration loaded"
    );

    let runtime = Runtime::from_config(&config);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        result = runtime.run() => {
            let handled = result?;
            tracing::info!(handled, "Worker stopped");
        }
        _ = shutdown => {
            tracing::info!("Shutting down worker");
        }
    }

    Ok(())
}
