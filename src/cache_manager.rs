//! Registry owning one `ChunkStore` per URL fingerprint: lazy creation,
//! startup rehydration, per-store readers/writer locking, and LRU eviction
//! against a total-size budget.

use crate::chunk_store::ChunkStore;
use crate::fingerprint::Fingerprint;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// A registry entry: the store itself behind a readers/writer lock, plus an
/// LRU timestamp tracked independently of lock acquisition.
pub struct StoreHandle {
    pub store: RwLock<ChunkStore>,
    last_access_millis: AtomicU64,
}

impl StoreHandle {
    fn new(store: ChunkStore) -> Self {
        Self {
            store: RwLock::new(store),
            last_access_millis: AtomicU64::new(now_millis()),
        }
    }

    fn touch(&self) {
        self.last_access_millis.store(now_millis(), Ordering::Relaxed);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct CacheManager {
    cache_root: PathBuf,
    max_total_bytes: u64,
    chunk_size: u64,
    registry: Mutex<HashMap<Fingerprint, Arc<StoreHandle>>>,
}

impl CacheManager {
    pub async fn new(cache_root: PathBuf, max_total_bytes: u64, chunk_size: u64) -> Result<Self> {
        let manager = Self {
            cache_root,
            max_total_bytes,
            chunk_size,
            registry: Mutex::new(HashMap::new()),
        };
        manager.scan_existing_stores().await?;
        Ok(manager)
    }

    /// Returns the store handle for `url`'s fingerprint, creating it if this
    /// is the first reference.
    pub async fn acquire(&self, url: &str) -> Result<Arc<StoreHandle>> {
        let fingerprint = Fingerprint::of_url(url);
        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry.get(&fingerprint) {
            return Ok(handle.clone());
        }

        let root_dir = self.cache_root.join(fingerprint.as_str());
        let store = ChunkStore::open(root_dir, url.to_string(), self.chunk_size).await?;
        let handle = Arc::new(StoreHandle::new(store));
        registry.insert(fingerprint, handle.clone());
        Ok(handle)
    }

    /// Bumps the in-memory last-access timestamp for `url`'s store, if registered.
    pub async fn touch(&self, url: &str) {
        let fingerprint = Fingerprint::of_url(url);
        let registry = self.registry.lock().await;
        if let Some(handle) = registry.get(&fingerprint) {
            handle.touch();
        }
    }

    /// While the registry's total size exceeds `maxTotalBytes`, evicts the
    /// least-recently-accessed store that is not currently locked by any
    /// reader or writer. Best-effort: returns without error if nothing is
    /// evictable.
    pub async fn evict_if_needed(&self) {
        self.evict_if_needed_with(|| {}).await
    }

    /// Same as [`Self::evict_if_needed`], but invokes `on_evicted` once per
    /// store actually cleared, so callers can feed a stats counter.
    pub async fn evict_if_needed_with(&self, mut on_evicted: impl FnMut()) {
        loop {
            let entries: Vec<(Fingerprint, Arc<StoreHandle>)> = {
                let registry = self.registry.lock().await;
                registry.iter().map(|(f, h)| (f.clone(), h.clone())).collect()
            };

            let mut total = 0u64;
            for (_, handle) in &entries {
                total += handle.store.read().await.size();
            }
            if total <= self.max_total_bytes {
                return;
            }

            let mut candidates: Vec<_> = entries.iter().collect();
            candidates.sort_by_key(|(_, h)| h.last_access_millis.load(Ordering::Relaxed));

            let mut evicted_any = false;
            for (fingerprint, handle) in candidates {
                let Ok(mut guard) = handle.store.try_write() else {
                    continue; // in use; skip to the next-oldest candidate
                };
                if let Err(err) = guard.clear().await {
                    warn!("failed to clear store {fingerprint} during eviction: {err:#}");
                    continue;
                }
                drop(guard);
                self.registry.lock().await.remove(fingerprint);
                info!("evicted cache store {fingerprint} to stay within max_total_bytes");
                on_evicted();
                evicted_any = true;
                break;
            }

            if !evicted_any {
                return; // ceiling is best-effort; every store is in use
            }
        }
    }

    async fn scan_existing_stores(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .with_context(|| format!("failed to create cache root {:?}", self.cache_root))?;

        let mut entries = tokio::fs::read_dir(&self.cache_root)
            .await
            .context("failed to scan cache root")?;
        let mut registry = self.registry.lock().await;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read cache root entry")?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !Fingerprint::is_valid(&name) {
                continue;
            }
            let metadata_path = entry.path().join("metadata.json");
            if !metadata_path.exists() {
                continue;
            }

            let Ok(contents) = tokio::fs::read_to_string(&metadata_path).await else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&contents) else {
                continue;
            };
            let Some(url) = parsed.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            if url.is_empty() {
                continue;
            }

            match ChunkStore::open(entry.path(), url.to_string(), self.chunk_size).await {
                Ok(store) => {
                    let fingerprint = Fingerprint::from_str(&name)
                        .expect("already validated by Fingerprint::is_valid");
                    debug!("rehydrated cache store {fingerprint} for {url}");
                    registry.insert(fingerprint, Arc::new(StoreHandle::new(store)));
                }
                Err(err) => warn!("failed to rehydrate cache store {name}: {err:#}"),
            }
        }
        Ok(())
    }
}
