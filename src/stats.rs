//! Lightweight in-process counters and a periodic human-readable report.
//! Purely observational: resets on restart and has no effect on request
//! handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Default)]
pub struct Stats {
    requests_served: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    bytes_served_from_cache: AtomicU64,
    bytes_served_from_origin: AtomicU64,
    range_requests: AtomicU64,
    full_requests: AtomicU64,
    origin_fetch_failures: AtomicU64,
    evictions_performed: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, is_range: bool) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        if is_range {
            self.range_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.full_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self, bytes: u64) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, cache_bytes: u64, origin_bytes: u64) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_served_from_cache.fetch_add(cache_bytes, Ordering::Relaxed);
        self.bytes_served_from_origin.fetch_add(origin_bytes, Ordering::Relaxed);
    }

    pub fn record_origin_fetch_failure(&self) {
        self.origin_fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions_performed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let served = self.requests_served.load(Ordering::Relaxed);
        if served == 0 {
            return 0.0;
        }
        self.cache_hits.load(Ordering::Relaxed) as f64 / served as f64
    }

    pub fn format_report(&self, uptime: Duration) -> String {
        let served = self.requests_served.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let cache_bytes = self.bytes_served_from_cache.load(Ordering::Relaxed);
        let origin_bytes = self.bytes_served_from_origin.load(Ordering::Relaxed);
        let failures = self.origin_fetch_failures.load(Ordering::Relaxed);
        let evictions = self.evictions_performed.load(Ordering::Relaxed);

        let hit_rate_pct = if served > 0 {
            100.0 * hits as f64 / served as f64
        } else {
            0.0
        };
        let uptime_secs = uptime.as_secs();

        format!(
            "requests={served} hits={hits} misses={misses} hit_rate={hit_rate_pct:.1}% \
             cache_bytes={cache_bytes} origin_bytes={origin_bytes} \
             origin_failures={failures} evictions={evictions} uptime={uptime_secs}s"
        )
    }
}

/// Spawns a background task that logs `stats.format_report()` every `interval`.
pub fn spawn_reporter(stats: Arc<Stats>, interval: Duration) -> tokio::task::JoinHandle<()> {
    let start = Instant::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            info!("{}", stats.format_report(start.elapsed()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_reflects_recorded_requests() {
        let stats = Stats::new();
        stats.record_request(false);
        stats.record_cache_hit(100);
        stats.record_request(true);
        stats.record_cache_miss(10, 90);

        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn report_contains_expected_fields() {
        let stats = Stats::new();
        stats.record_request(false);
        stats.record_cache_hit(1024);
        let report = stats.format_report(Duration::from_secs(5));
        assert!(report.contains("requests=1"));
        assert!(report.contains("hits=1"));
        assert!(report.contains("hit_rate=100.0%"));
        assert!(report.contains("uptime=5s"));
    }

    #[test]
    fn zero_requests_has_zero_hit_rate() {
        let stats = Stats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
