//! Per-resource on-disk cache store: fixed-size chunk files plus a JSON
//! metadata sidecar, written with write-temp-then-rename atomicity.

use anyhow::{Context, Result};
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMeta {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreMetadataFile {
    total_size: u64,
    content_type: String,
    chunk_size: u64,
    url: String,
    chunks: Vec<ChunkMeta>,
}

pub struct ChunkStore {
    root_dir: PathBuf,
    chunk_size: u64,
    url: String,
    total_size: u64,
    content_type: String,
    chunks: HashMap<u64, ChunkMeta>,
}

fn is_disk_full_error(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(28) {
            return true;
        }
    }
    #[cfg(windows)]
    {
        if err.raw_os_error() == Some(112) {
            return true;
        }
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("disk full")
}

impl ChunkStore {
    /// Creates `root_dir` if absent, loads and revalidates `metadata.json` if
    /// present, and scrubs any leftover `.temp` files.
    pub async fn open(root_dir: PathBuf, url: String, chunk_size: u64) -> Result<Self> {
        tokio::fs::create_dir_all(root_dir.join("data"))
            .await
            .with_context(|| format!("failed to create cache directory {:?}", root_dir))?;

        let metadata_path = root_dir.join("metadata.json");
        let (total_size, content_type, chunks) = if metadata_path.exists() {
            match Self::load_metadata(&metadata_path).await {
                Ok(meta) => {
                    let map = meta.chunks.into_iter().map(|c| (c.index, c)).collect();
                    (meta.total_size, meta.content_type, map)
                }
                Err(err) => {
                    warn!("failed to parse metadata.json at {:?}, starting fresh: {err:#}", metadata_path);
                    (0, "application/octet-stream".to_string(), HashMap::new())
                }
            }
        } else {
            (0, "application/octet-stream".to_string(), HashMap::new())
        };

        let mut store = Self {
            root_dir,
            chunk_size,
            url,
            total_size,
            content_type,
            chunks,
        };

        store.cleanup_temp_files().await?;
        store.revalidate().await?;
        Ok(store)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Persists origin-discovered metadata (called once after the initial probe).
    pub async fn set_origin_metadata(&mut self, total_size: u64, content_type: String) -> Result<()> {
        self.total_size = total_size;
        self.content_type = content_type;
        self.save_metadata().await
    }

    /// The contiguous prefix of `[start, end)`, counted from `start`, that is
    /// locally present.
    pub fn cached_range_size(&self, start: u64, end: u64) -> u64 {
        if self.total_size == 0 || start >= end || end > self.total_size {
            return 0;
        }
        let first_index = start / self.chunk_size;
        let last_index = (end - 1) / self.chunk_size;
        let mut covered_to = start;
        for index in first_index..=last_index {
            let Some(chunk) = self.chunks.get(&index) else {
                break;
            };
            if !chunk.complete || chunk.start > covered_to {
                break;
            }
            covered_to = covered_to.max(chunk.end);
            if covered_to >= end {
                return end - start;
            }
        }
        covered_to.saturating_sub(start).min(end - start)
    }

    /// Whether the entirety of `[start, end)` is present as a gap-free run of
    /// complete chunks.
    pub fn range_cached(&self, start: u64, end: u64) -> bool {
        if self.total_size == 0 || start >= end || end > self.total_size {
            return false;
        }
        self.cached_range_size(start, end) == end - start
    }

    /// Sum of `size` over complete chunks.
    pub fn size(&self) -> u64 {
        self.chunks.values().filter(|c| c.complete).map(|c| c.size).sum()
    }

    /// Reads `[start, end)` as a byte stream, walking chunk files in order.
    /// Fails if any touched chunk is missing — callers are expected to have
    /// pre-checked with `range_cached`.
    pub fn read(&self, start: u64, end: u64) -> impl Stream<Item = Result<Bytes>> + '_ {
        let chunk_size = self.chunk_size;
        let root_dir = self.root_dir.clone();
        try_stream! {
            if end <= start {
                return;
            }
            let first_index = start / chunk_size;
            let last_index = (end - 1) / chunk_size;
            for index in first_index..=last_index {
                let chunk_start = index * chunk_size;
                let file_path = root_dir.join("data").join(format!("chunk_{index}"));
                let sub_start = start.max(chunk_start) - chunk_start;
                let sub_end = end.min(chunk_start + chunk_size) - chunk_start;

                let data = tokio::fs::read(&file_path)
                    .await
                    .with_context(|| format!("missing cached chunk {index} at {:?}", file_path))?;
                let sub_end = sub_end.min(data.len() as u64);
                if sub_start >= sub_end {
                    continue;
                }
                yield Bytes::copy_from_slice(&data[sub_start as usize..sub_end as usize]);
            }
        }
    }

    /// Consumes a byte stream, writing it to chunk files starting at
    /// `start_offset`. Flushes each full `chunk_size` window as it fills,
    /// persisting metadata after every flush; any final partial window is
    /// stored at its true length without zero-padding.
    pub async fn write_stream<S>(&mut self, mut src: S, start_offset: u64) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let first_index = start_offset / self.chunk_size;
        let chunk_boundary = first_index * self.chunk_size;

        let mut buffer: Vec<u8> = Vec::new();
        let mut forced_incomplete = false;
        if start_offset > chunk_boundary {
            let prefix_len = (start_offset - chunk_boundary) as usize;
            let (prefix, existed) = self.read_existing_chunk_prefix(first_index, prefix_len).await?;
            buffer.extend_from_slice(&prefix);
            forced_incomplete = !existed;
        }
        let mut cursor = chunk_boundary;

        while let Some(item) = src.next().await {
            let bytes = item?;
            buffer.extend_from_slice(&bytes);
            while buffer.len() as u64 >= self.chunk_size {
                let chunk_index = cursor / self.chunk_size;
                let this_chunk: Vec<u8> = buffer.drain(..self.chunk_size as usize).collect();
                self.flush_chunk(chunk_index, &this_chunk, forced_incomplete).await?;
                forced_incomplete = false;
                cursor += self.chunk_size;
            }
        }

        if !buffer.is_empty() {
            let chunk_index = cursor / self.chunk_size;
            let len = buffer.len() as u64;
            self.flush_chunk(chunk_index, &buffer, forced_incomplete).await?;
            cursor += len;
        }

        if cursor > self.total_size {
            self.total_size = cursor;
            self.save_metadata().await?;
        }
        Ok(())
    }

    /// Deletes `root_dir` recursively and resets in-memory state.
    pub async fn clear(&mut self) -> Result<()> {
        if self.root_dir.exists() {
            tokio::fs::remove_dir_all(&self.root_dir)
                .await
                .with_context(|| format!("failed to remove cache directory {:?}", self.root_dir))?;
        }
        self.chunks.clear();
        self.total_size = 0;
        self.content_type = "application/octet-stream".to_string();
        Ok(())
    }

    fn expected_chunk_size(&self, chunk_index: u64) -> u64 {
        if self.total_size == 0 {
            return self.chunk_size;
        }
        let last_index = self.last_chunk_index();
        if chunk_index == last_index {
            let rem = self.total_size % self.chunk_size;
            if rem == 0 { self.chunk_size } else { rem }
        } else {
            self.chunk_size
        }
    }

    fn last_chunk_index(&self) -> u64 {
        if self.total_size == 0 {
            0
        } else {
            (self.total_size + self.chunk_size - 1) / self.chunk_size - 1
        }
    }

    async fn read_existing_chunk_prefix(&self, chunk_index: u64, prefix_len: usize) -> Result<(Vec<u8>, bool)> {
        let path = self.root_dir.join("data").join(format!("chunk_{chunk_index}"));
        match tokio::fs::read(&path).await {
            Ok(mut data) => {
                data.truncate(prefix_len);
                data.resize(prefix_len, 0);
                Ok((data, true))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok((vec![0u8; prefix_len], false))
            }
            Err(err) => Err(err).context("failed to read existing chunk prefix"),
        }
    }

    async fn flush_chunk(&mut self, chunk_index: u64, data: &[u8], forced_incomplete: bool) -> Result<()> {
        let data_dir = self.root_dir.join("data");
        let temp_path = data_dir.join(format!("chunk_{chunk_index}.temp"));
        let final_path = data_dir.join(format!("chunk_{chunk_index}"));

        tokio::fs::write(&temp_path, data).await.map_err(|err| {
            if is_disk_full_error(&err) {
                anyhow::anyhow!("DISK_FULL: failed to write chunk {chunk_index}: {err}")
            } else if err.kind() == std::io::ErrorKind::PermissionDenied {
                anyhow::anyhow!("PERMISSION_DENIED: failed to write chunk {chunk_index}: {err}")
            } else {
                anyhow::anyhow!("failed to write chunk {chunk_index}: {err}")
            }
        })?;

        if let Err(err) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err).context(format!("failed to finalize chunk {chunk_index}"));
        }

        let start = chunk_index * self.chunk_size;
        let size = data.len() as u64;
        let expected = self.expected_chunk_size(chunk_index);
        let complete = !forced_incomplete && size == expected;

        self.chunks.insert(
            chunk_index,
            ChunkMeta {
                index: chunk_index,
                start,
                end: start + size,
                size,
                complete,
            },
        );
        debug!(chunk_index, size, complete, "flushed chunk");
        self.save_metadata().await
    }

    async fn cleanup_temp_files(&self) -> Result<()> {
        // A crash mid-`save_metadata` can leave `metadata.json.temp` sitting
        // directly in `root_dir`, alongside the per-chunk `.temp` stragglers
        // under `data/`.
        let metadata_temp = self.root_dir.join("metadata.json.temp");
        let _ = tokio::fs::remove_file(&metadata_temp).await;

        let data_dir = self.root_dir.join("data");
        let mut entries = match tokio::fs::read_dir(&data_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context("failed to scan cache data directory"),
        };
        while let Some(entry) = entries.next_entry().await.context("failed to read directory entry")? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".temp") {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    async fn revalidate(&mut self) -> Result<()> {
        let mut stale = Vec::new();
        for (index, meta) in self.chunks.iter() {
            let path = self.root_dir.join("data").join(format!("chunk_{index}"));
            match tokio::fs::metadata(&path).await {
                Ok(fs_meta) if fs_meta.len() == meta.size => {}
                _ => stale.push(*index),
            }
        }
        if stale.is_empty() {
            return Ok(());
        }
        for index in stale {
            self.chunks.remove(&index);
        }
        self.save_metadata().await
    }

    async fn load_metadata(path: &Path) -> Result<StoreMetadataFile> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("failed to read metadata.json")?;
        serde_json::from_str(&contents).context("failed to parse metadata.json")
    }

    /// Rewrites `metadata.json` atomically (write-temp, then rename).
    async fn save_metadata(&self) -> Result<()> {
        let mut chunks: Vec<ChunkMeta> = self.chunks.values().copied().collect();
        chunks.sort_by_key(|c| c.index);
        let file = StoreMetadataFile {
            total_size: self.total_size,
            content_type: self.content_type.clone(),
            chunk_size: self.chunk_size,
            url: self.url.clone(),
            chunks,
        };
        let contents = serde_json::to_string_pretty(&file).context("failed to serialize metadata")?;

        let temp_path = self.root_dir.join("metadata.json.temp");
        let final_path = self.root_dir.join("metadata.json");
        tokio::fs::write(&temp_path, contents)
            .await
            .context("failed to write metadata temp file")?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .context("failed to finalize metadata.json")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn bytes_stream(data: Vec<u8>, piece: usize) -> impl Stream<Item = Result<Bytes>> + Unpin {
        let pieces: Vec<Result<Bytes>> = data
            .chunks(piece)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(pieces)
    }

    async fn collect(store: &ChunkStore, start: u64, end: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut s = Box::pin(store.read(start, end));
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn write_and_read_full_single_chunk() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        store.set_origin_metadata(16, "video/mp4".into()).await.unwrap();

        let data: Vec<u8> = (0..16).collect();
        store.write_stream(bytes_stream(data.clone(), 4), 0).await.unwrap();

        assert!(store.range_cached(0, 16));
        assert_eq!(store.size(), 16);
        assert_eq!(collect(&store, 0, 16).await, data);
    }

    #[tokio::test]
    async fn short_final_chunk_is_not_zero_padded() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        store.set_origin_metadata(20, "video/mp4".into()).await.unwrap();

        let data: Vec<u8> = (0..20).collect();
        store.write_stream(bytes_stream(data.clone(), 5), 0).await.unwrap();

        assert!(store.range_cached(0, 20));
        let chunk1_path = dir.path().join("data").join("chunk_1");
        let on_disk = std::fs::read(chunk1_path).unwrap();
        assert_eq!(on_disk.len(), 4); // 20 - 16, not padded to 16
        assert_eq!(collect(&store, 16, 20).await, data[16..20]);
    }

    #[tokio::test]
    async fn mid_chunk_write_prepends_existing_prefix() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        store.set_origin_metadata(32, "video/mp4".into()).await.unwrap();

        // write chunk 0 fully first.
        let first: Vec<u8> = (0..16).collect();
        store.write_stream(bytes_stream(first.clone(), 16), 0).await.unwrap();

        // now write starting mid-chunk 1 (offset 20), chunk 1 does not exist yet,
        // so its prefix [16,20) is zero-filled and chunk 1 stays incomplete.
        let second: Vec<u8> = (20..32).collect();
        store.write_stream(bytes_stream(second, 16), 20).await.unwrap();

        assert!(store.range_cached(0, 16));
        assert!(!store.range_cached(16, 32));
    }

    #[tokio::test]
    async fn cached_range_size_stops_at_gap() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        store.set_origin_metadata(48, "video/mp4".into()).await.unwrap();

        let chunk0: Vec<u8> = vec![1; 16];
        store.write_stream(bytes_stream(chunk0, 16), 0).await.unwrap();
        let chunk2: Vec<u8> = vec![3; 16];
        store.write_stream(bytes_stream(chunk2, 16), 32).await.unwrap();

        assert_eq!(store.cached_range_size(0, 48), 16);
        assert!(!store.range_cached(0, 48));
        assert!(store.range_cached(0, 16));
    }

    #[tokio::test]
    async fn reopen_revalidates_against_disk() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
                .await
                .unwrap();
            store.set_origin_metadata(16, "video/mp4".into()).await.unwrap();
            store
                .write_stream(bytes_stream((0..16).collect(), 16), 0)
                .await
                .unwrap();
        }

        // corrupt the chunk file on disk behind the store's back.
        std::fs::write(dir.path().join("data").join("chunk_0"), b"short").unwrap();

        let store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        assert!(!store.range_cached(0, 16));
    }

    #[tokio::test]
    async fn clear_removes_directory_and_resets_state() {
        let dir = TempDir::new().unwrap();
        let mut store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        store.set_origin_metadata(16, "video/mp4".into()).await.unwrap();
        store.write_stream(bytes_stream((0..16).collect(), 16), 0).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.size(), 0);
        assert!(!dir.path().join("metadata.json").exists());
    }

    #[tokio::test]
    async fn leftover_temp_files_are_scrubbed_on_open() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("data")).await.unwrap();
        tokio::fs::write(dir.path().join("data").join("chunk_0.temp"), b"stale")
            .await
            .unwrap();

        let _store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        assert!(!dir.path().join("data").join("chunk_0.temp").exists());
    }

    #[tokio::test]
    async fn leftover_metadata_temp_file_is_scrubbed_on_open() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("data")).await.unwrap();
        tokio::fs::write(dir.path().join("metadata.json.temp"), b"{\"stale\":true}")
            .await
            .unwrap();

        let _store = ChunkStore::open(dir.path().to_path_buf(), "http://x/y".into(), 16)
            .await
            .unwrap();
        assert!(!dir.path().join("metadata.json.temp").exists());
    }
}
