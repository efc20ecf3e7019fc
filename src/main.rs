use anyhow::{Context, Result};
use tracing::info;
use vidcache_proxy::config::Config;
use vidcache_proxy::server;

fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter.clone())
        .init();

    info!("Starting vidcache-proxy");

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async move { server::run(config, shutdown_signal()).await })
}

/// Resolves on SIGINT, or on SIGTERM where supported, for graceful shutdown.
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
