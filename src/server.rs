//! Binds the listening socket, wires the cache manager and origin fetcher
//! into a [`ProxyHandler`], and serves until asked to shut down.

use crate::cache_manager::CacheManager;
use crate::config::Config;
use crate::origin::OriginFetcher;
use crate::proxy::ProxyHandler;
use crate::stats::{self, Stats};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Runs the proxy until `shutdown` resolves, then lets in-flight requests
/// drain before returning.
pub async fn run(config: Config, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
    let cache_manager = Arc::new(
        CacheManager::new(
            config.cache_root.clone(),
            config.max_total_bytes,
            config.chunk_size,
        )
        .await
        .context("failed to initialize cache manager")?,
    );
    let origin = OriginFetcher::new(Duration::from_secs(config.origin_timeout_secs));
    let stats = Stats::new();
    stats::spawn_reporter(stats.clone(), Duration::from_secs(config.stats_interval_secs));

    let handler = ProxyHandler::new(
        cache_manager,
        origin,
        stats,
        Duration::from_secs(config.client_idle_timeout_secs),
    );
    let app = handler.router();

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr().context("failed to read local address")?;
    info!("vidcache-proxy listening on {local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("proxy server error")?;

    info!("vidcache-proxy shut down cleanly");
    Ok(())
}
