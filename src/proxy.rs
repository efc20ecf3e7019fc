//! Per-request orchestration: validate the request, consult the cache
//! manager, plan a read over cached+missing segments, and splice cached and
//! origin bytes to the client while teeing missing segments into the store.

use crate::cache_manager::{CacheManager, StoreHandle};
use crate::error::ProxyError;
use crate::origin::OriginFetcher;
use crate::range::{self, ByteRange, ParsedRange};
use crate::stats::Stats;
use async_stream::stream;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Bounded in-flight item count for the client/store tee. Approximates the
/// ~4 chunk (≈20 MiB) backpressure budget from the design without requiring
/// byte-exact accounting of arbitrarily-sized network reads.
const TEE_BUFFER_ITEMS: usize = 64;

pub struct ProxyHandler {
    cache_manager: Arc<CacheManager>,
    origin: OriginFetcher,
    stats: Arc<Stats>,
    client_idle_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(
        cache_manager: Arc<CacheManager>,
        origin: OriginFetcher,
        stats: Arc<Stats>,
        client_idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache_manager,
            origin,
            stats,
            client_idle_timeout,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/", get(handle)).with_state(self)
    }

    async fn serve(&self, params: HashMap<String, String>, range_header: Option<String>) -> Result<Response, ProxyError> {
        let url = params
            .get("url")
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ProxyError::BadRequest)?
            .to_string();

        let handle = self.cache_manager.acquire(&url).await?;

        let existing_total_size = handle.store.read().await.total_size();
        let total_size = if existing_total_size == 0 {
            self.probe(&handle, &url).await?
        } else {
            existing_total_size
        };

        let (status, byte_range, is_range_request) = match range_header.as_deref() {
            None => (StatusCode::OK, ByteRange { start: 0, end: total_size }, false),
            Some(raw) => match range::parse(raw, total_size) {
                ParsedRange::NotSatisfiable => {
                    return Err(ProxyError::RangeNotSatisfiable { total_size });
                }
                ParsedRange::Satisfiable(r) => (StatusCode::PARTIAL_CONTENT, r, true),
            },
        };

        self.stats.record_request(is_range_request);

        let cached_prefix = handle
            .store
            .read()
            .await
            .cached_range_size(byte_range.start, byte_range.end);
        let total_len = byte_range.len();

        if cached_prefix == total_len {
            self.stats.record_cache_hit(total_len);
        } else {
            self.stats.record_cache_miss(cached_prefix, total_len - cached_prefix);
        }

        let content_type = handle.store.read().await.content_type().to_string();

        let body_stream = build_body_stream(
            self.cache_manager.clone(),
            self.origin.clone(),
            self.stats.clone(),
            handle,
            url,
            byte_range,
            cached_prefix,
            self.client_idle_timeout,
        );
        let body = Body::from_stream(body_stream);

        let mut response = Response::builder().status(status).body(body).map_err(|err| {
            ProxyError::Internal(anyhow::anyhow!("failed to build response: {err}"))
        })?;

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total_len));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if status == StatusCode::PARTIAL_CONTENT {
            if let Ok(value) = HeaderValue::from_str(&range::format_content_range(byte_range, total_size)) {
                headers.insert(CONTENT_RANGE, value);
            }
        }

        Ok(response)
    }

    /// Discovers `totalSize`/`contentType` via a `bytes=0-` probe, persisting
    /// them to the store. Holds the store's writer lock for the duration so
    /// concurrent first-requests for the same URL serialize behind it.
    async fn probe(&self, handle: &Arc<StoreHandle>, url: &str) -> Result<u64, ProxyError> {
        let mut store = handle.store.write().await;
        if store.total_size() > 0 {
            return Ok(store.total_size()); // a racing request already probed
        }

        let response = self
            .origin
            .fetch(url, Some("bytes=0-"))
            .await
            .map_err(|err| ProxyError::BadGateway(err.to_string()))?;
        let total_size = response
            .total_size()
            .ok_or_else(|| ProxyError::BadGateway("origin did not report a resource size".into()))?;
        let content_type = response.content_type.clone();
        // The probe only needs headers; the body stream is dropped unread.
        drop(response);

        store
            .set_origin_metadata(total_size, content_type)
            .await
            .map_err(ProxyError::Internal)?;
        debug!(%url, total_size, "probed origin for resource size");
        Ok(total_size)
    }
}

/// Wraps a receiver stream so that a gap of more than `idle_timeout` between
/// items aborts the stream with an error instead of stalling forever — the
/// store-side counterpart of `OriginFetcher`'s own inactivity timeout, since
/// the background fill has no other way to notice a wedged upstream.
fn inactivity_bounded(
    rx: tokio::sync::mpsc::Receiver<anyhow::Result<Bytes>>,
    idle_timeout: Duration,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = anyhow::Result<Bytes>> + Send>> {
    Box::pin(stream! {
        let mut rx = ReceiverStream::new(rx);
        loop {
            match tokio::time::timeout(idle_timeout, rx.next()).await {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(_) => {
                    yield Err(anyhow::anyhow!(
                        "cache fill stalled for {:?} of inactivity",
                        idle_timeout
                    ));
                    break;
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn build_body_stream(
    cache_manager: Arc<CacheManager>,
    origin: OriginFetcher,
    stats: Arc<Stats>,
    handle: Arc<StoreHandle>,
    url: String,
    range: ByteRange,
    cached_prefix: u64,
    client_idle_timeout: Duration,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> {
    stream! {
        if cached_prefix > 0 {
            let cache_start = range.start;
            let cache_end = range.start + cached_prefix;
            let store = handle.store.read().await;
            let mut cached = store.read(cache_start, cache_end);
            loop {
                let next = cached.next().await;
                match next {
                    Some(Ok(bytes)) => yield Ok(bytes),
                    Some(Err(err)) => {
                        warn!("cache read failed mid-response for {url}: {err:#}");
                        return;
                    }
                    None => break,
                }
            }
        }

        let remaining_start = range.start + cached_prefix;
        if remaining_start >= range.end {
            cache_manager.touch(&url).await;
            let evict_stats = stats.clone();
            cache_manager
                .evict_if_needed_with(|| evict_stats.record_eviction())
                .await;
            return;
        }

        let range_header = format!("bytes={}-{}", remaining_start, range.end - 1);
        let origin_response = match origin.fetch(&url, Some(&range_header)).await {
            Ok(response) => response,
            Err(err) => {
                warn!("origin fetch failed mid-response for {url}: {err:#}");
                stats.record_origin_fetch_failure();
                return;
            }
        };

        let (client_tx, mut client_rx) =
            tokio::sync::mpsc::channel::<anyhow::Result<Bytes>>(TEE_BUFFER_ITEMS);
        let (store_tx, store_rx) =
            tokio::sync::mpsc::channel::<anyhow::Result<Bytes>>(TEE_BUFFER_ITEMS);

        let mut upstream = origin_response.stream;
        tokio::spawn(async move {
            // The client and store sinks are independent: a dead store_tx
            // (the cache-fill task gave up, e.g. disk full) must not stop
            // upstream reads from reaching the client, and vice versa. Once
            // one side is gone we just stop feeding it and keep forwarding
            // to whichever side remains, per spec §7's "response to the
            // client is unaffected if origin bytes are still flowing".
            let mut store_alive = true;
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(bytes) => {
                        let _ = client_tx.send(Ok(bytes.clone())).await;
                        if store_alive && store_tx.send(Ok(bytes)).await.is_err() {
                            store_alive = false;
                        }
                    }
                    Err(err) => {
                        let _ = client_tx.send(Err(anyhow::anyhow!("{err:#}"))).await;
                        if store_alive {
                            let _ = store_tx.send(Err(anyhow::anyhow!("{err:#}"))).await;
                        }
                        break;
                    }
                }
            }
            // tx handles drop here, closing both channels for their consumers.
        });

        {
            let fill_handle = handle.clone();
            let fill_url = url.clone();
            let fill_cache_manager = cache_manager.clone();
            tokio::spawn(async move {
                // Bounds how long the background fill waits for the next tee'd
                // chunk once the client side has gone away; the store-write
                // path otherwise has no independent liveness signal of its own.
                let store_stream = inactivity_bounded(store_rx, client_idle_timeout);
                let mut store = fill_handle.store.write().await;
                if let Err(err) = store.write_stream(store_stream, remaining_start).await {
                    warn!("cache fill abandoned for {fill_url}: {err:#}");
                }
                drop(store);
                fill_cache_manager.touch(&fill_url).await;
                let evict_stats = stats.clone();
                fill_cache_manager
                    .evict_if_needed_with(|| evict_stats.record_eviction())
                    .await;
            });
        }

        while let Some(item) = client_rx.recv().await {
            match item {
                Ok(bytes) => yield Ok(bytes),
                Err(err) => {
                    warn!("origin stream error mid-response for {url}: {err:#}");
                    return;
                }
            }
        }
    }
}

pub async fn handle(
    State(handler): State<Arc<ProxyHandler>>,
    Query(params): Query<HashMap<String, String>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let range_header = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    match handler.serve(params, range_header).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
