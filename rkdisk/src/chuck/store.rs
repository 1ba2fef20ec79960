//! Backing stores: byte-level fetch/store capability behind a virtual disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::cadapter::client::{ObjectBackend, ObjectClient};
use crate::config::ObjectStoreConfig;

/// Byte transfer capability consumed by [`crate::disk::VirtualDisk`].
///
/// No retries happen at this level; wrap the backend if they are needed.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn size(&self) -> Result<u64>;

    async fn fetch(&self, offset: u64, len: usize) -> Result<Bytes>;

    async fn store(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Drop cached or overlaid bytes so the range reads from the source again.
    async fn invalidate(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

fn check_bounds(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => anyhow::bail!("range @{offset}+{len} beyond store size {size}"),
    }
}

/// Counters of backend traffic, for diagnostics and tests.
#[derive(Debug, Default)]
pub struct IoStats {
    fetches: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
}

impl IoStats {
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

/// Simple in-memory implementation for local development/testing.
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<Vec<u8>>,
    stats: IoStats,
}

impl InMemoryStore {
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0u8; size])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            stats: IoStats::default(),
        }
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn size(&self) -> Result<u64> {
        Ok(self.data.read().await.len() as u64)
    }

    async fn fetch(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let guard = self.data.read().await;
        check_bounds(offset, len as u64, guard.len() as u64)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&guard[start..start + len]))
    }

    async fn store(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.data.write().await;
        check_bounds(offset, data.len() as u64, guard.len() as u64)?;
        let start = offset as usize;
        guard[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn invalidate(&self, _offset: u64, _len: u64) -> Result<()> {
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Disk image held as a single object, read lazily in page units.
///
/// Fetched pages land in a byte-weighted moka cache; writes go to an
/// in-memory page overlay since the object itself is never modified.
pub struct ObjectImageStore<B: ObjectBackend> {
    client: ObjectClient<B>,
    key: String,
    size: u64,
    page_size: u64,
    cache: moka::future::Cache<u64, Bytes>,
    overlay: RwLock<HashMap<u64, Vec<u8>>>,
    remote_reads: AtomicU64,
}

impl<B: ObjectBackend> ObjectImageStore<B> {
    pub async fn open(
        client: ObjectClient<B>,
        key: impl Into<String>,
        config: ObjectStoreConfig,
    ) -> Result<Self> {
        let key = key.into();
        anyhow::ensure!(config.page_size > 0, "page size must be non-zero");
        let size = client
            .head_object(&key)
            .await?
            .with_context(|| format!("image object {key} not found"))?;
        let cache = moka::future::Cache::builder()
            .max_capacity(config.cache_capacity)
            .weigher(|_: &u64, v: &Bytes| u32::try_from(v.len()).unwrap_or(u32::MAX))
            .build();
        debug!(key = %key, size, page_size = config.page_size, "opened image object");
        Ok(Self {
            client,
            key,
            size,
            page_size: config.page_size,
            cache,
            overlay: RwLock::new(HashMap::new()),
            remote_reads: AtomicU64::new(0),
        })
    }

    /// Number of ranged GETs issued so far.
    pub fn remote_reads(&self) -> u64 {
        self.remote_reads.load(Ordering::Relaxed)
    }

    pub async fn overlay_pages(&self) -> usize {
        self.overlay.read().await.len()
    }

    fn page_start(&self, idx: u64) -> u64 {
        idx * self.page_size
    }

    fn page_len(&self, idx: u64) -> u64 {
        self.page_size.min(self.size - self.page_start(idx))
    }

    /// Read pages `[first, last]` of the original object with one ranged GET
    /// and cache each of them.
    async fn fetch_run(&self, first: u64, last: u64) -> Result<Vec<Bytes>> {
        let start = self.page_start(first);
        let len: u64 = (first..=last).map(|i| self.page_len(i)).sum();
        trace!(first, last, len, "fetching page run");
        self.remote_reads.fetch_add(1, Ordering::Relaxed);
        let data = self
            .client
            .get_object_range(&self.key, start, len as usize)
            .await?;
        let mut pages = Vec::with_capacity((last - first + 1) as usize);
        let mut cursor = 0usize;
        for idx in first..=last {
            let n = self.page_len(idx) as usize;
            let page = data.slice(cursor..cursor + n);
            self.cache.insert(idx, page.clone()).await;
            pages.push(page);
            cursor += n;
        }
        Ok(pages)
    }

    /// Original (pre-overlay) contents of one page.
    async fn base_page(&self, idx: u64) -> Result<Bytes> {
        if let Some(page) = self.cache.get(&idx).await {
            return Ok(page);
        }
        let mut run = self.fetch_run(idx, idx).await?;
        Ok(run.remove(0))
    }
}

#[async_trait]
impl<B: ObjectBackend> BackingStore for ObjectImageStore<B> {
    async fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    async fn fetch(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_bounds(offset, len as u64, self.size)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let first = offset / self.page_size;
        let last = (offset + len as u64 - 1) / self.page_size;

        let mut pages: Vec<Option<Bytes>> = Vec::with_capacity((last - first + 1) as usize);
        {
            let overlay = self.overlay.read().await;
            for idx in first..=last {
                let page = match overlay.get(&idx) {
                    Some(p) => Some(Bytes::copy_from_slice(p)),
                    None => self.cache.get(&idx).await,
                };
                pages.push(page);
            }
        }

        // Coalesce consecutive misses into single ranged reads.
        let mut i = 0usize;
        while i < pages.len() {
            if pages[i].is_some() {
                i += 1;
                continue;
            }
            let mut j = i;
            while j + 1 < pages.len() && pages[j + 1].is_none() {
                j += 1;
            }
            let run = self
                .fetch_run(first + i as u64, first + j as u64)
                .await?;
            for (slot, page) in pages[i..=j].iter_mut().zip(run) {
                *slot = Some(page);
            }
            i = j + 1;
        }

        let mut out = Vec::with_capacity(len);
        let end = offset + len as u64;
        for (k, page) in pages.into_iter().enumerate() {
            let idx = first + k as u64;
            let page = page.context("page missing after fetch")?;
            let page_start = self.page_start(idx);
            let from = (offset.max(page_start) - page_start) as usize;
            let to = (end.min(page_start + page.len() as u64) - page_start) as usize;
            out.extend_from_slice(&page[from..to]);
        }
        Ok(Bytes::from(out))
    }

    async fn store(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len() as u64, self.size)?;
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        let first = offset / self.page_size;
        let last = (end - 1) / self.page_size;

        let mut overlay = self.overlay.write().await;
        for idx in first..=last {
            let page_start = self.page_start(idx);
            let page_len = self.page_len(idx);
            let from = offset.max(page_start);
            let to = end.min(page_start + page_len);
            let covers_page = from == page_start && to == page_start + page_len;
            if !overlay.contains_key(&idx) {
                let base = if covers_page {
                    vec![0u8; page_len as usize]
                } else {
                    self.base_page(idx).await?.to_vec()
                };
                overlay.insert(idx, base);
            }
            let page = overlay.get_mut(&idx).context("overlay page vanished")?;
            page[(from - page_start) as usize..(to - page_start) as usize]
                .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
            self.cache.invalidate(&idx).await;
        }
        Ok(())
    }

    async fn invalidate(&self, offset: u64, len: u64) -> Result<()> {
        check_bounds(offset, len, self.size)?;
        if len == 0 {
            return Ok(());
        }
        let end = offset + len;
        let first = offset / self.page_size;
        let last = (end - 1) / self.page_size;

        let mut overlay = self.overlay.write().await;
        for idx in first..=last {
            let page_start = self.page_start(idx);
            let page_end = page_start + self.page_len(idx);
            if offset <= page_start && page_end <= end {
                overlay.remove(&idx);
                self.cache.invalidate(&idx).await;
                continue;
            }
            // Partially covered overlay page: restore the original bytes.
            if overlay.contains_key(&idx) {
                let base = self.base_page(idx).await?;
                let from = (offset.max(page_start) - page_start) as usize;
                let to = (end.min(page_end) - page_start) as usize;
                if let Some(page) = overlay.get_mut(&idx) {
                    page[from..to].copy_from_slice(&base[from..to]);
                }
            }
        }
        Ok(())
    }
}

/// Convenience alias: image store backed by the real S3 backend.
pub type S3ImageStore = ObjectImageStore<crate::cadapter::s3::S3Backend>;
/// Convenience alias: image store backed by the LocalFs mock backend.
pub type LocalFsImageStore = ObjectImageStore<crate::cadapter::localfs::LocalFsBackend>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::localfs::LocalFsBackend;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn image_store(data: &[u8], page_size: u64) -> (tempfile::TempDir, LocalFsImageStore) {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());
        backend.put_object("img/disk.img", data).await.unwrap();
        let config = ObjectStoreConfig::default().page_size(page_size);
        let store = ObjectImageStore::open(ObjectClient::new(backend), "img/disk.img", config)
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_in_memory_store_bounds() {
        let store = InMemoryStore::new(16);
        store.store(4, &[1, 2, 3]).await.unwrap();
        assert_eq!(&store.fetch(3, 5).await.unwrap()[..], &[0, 1, 2, 3, 0]);
        assert!(store.fetch(10, 7).await.is_err());
        assert!(store.store(15, &[1, 2]).await.is_err());
        assert_eq!(store.stats().fetches(), 2);
        assert_eq!(store.stats().stores(), 2);
    }

    #[tokio::test]
    async fn test_object_store_fetch_spans_pages_and_caches() {
        let data = pattern(1000);
        let (_tmp, store) = image_store(&data, 64).await;
        assert_eq!(store.size().await.unwrap(), 1000);

        let got = store.fetch(30, 200).await.unwrap();
        assert_eq!(&got[..], &data[30..230]);
        assert_eq!(store.remote_reads(), 1);

        // Fully cached now.
        let got = store.fetch(64, 100).await.unwrap();
        assert_eq!(&got[..], &data[64..164]);
        assert_eq!(store.remote_reads(), 1);

        // Tail page is short.
        let got = store.fetch(990, 10).await.unwrap();
        assert_eq!(&got[..], &data[990..]);
        assert!(store.fetch(995, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_object_store_write_overlay_and_invalidate() {
        let data = pattern(512);
        let (_tmp, store) = image_store(&data, 128).await;

        store.store(100, &[0xAA; 60]).await.unwrap();
        assert_eq!(store.overlay_pages().await, 2);
        let got = store.fetch(90, 80).await.unwrap();
        assert_eq!(&got[..10], &data[90..100]);
        assert!(got[10..70].iter().all(|&b| b == 0xAA));
        assert_eq!(&got[70..], &data[160..170]);

        // Partial invalidation restores original bytes inside page 0.
        store.invalidate(100, 10).await.unwrap();
        let got = store.fetch(100, 20).await.unwrap();
        assert_eq!(&got[..10], &data[100..110]);
        assert!(got[10..].iter().all(|&b| b == 0xAA));

        // Whole-page invalidation drops page 1 from the overlay.
        store.invalidate(128, 128).await.unwrap();
        assert_eq!(store.overlay_pages().await, 1);
        let got = store.fetch(128, 32).await.unwrap();
        assert_eq!(&got[..], &data[128..160]);
    }

    #[tokio::test]
    async fn test_object_store_full_page_write_skips_base_fetch() {
        let data = pattern(256);
        let (_tmp, store) = image_store(&data, 64).await;
        store.store(64, &[7u8; 64]).await.unwrap();
        assert_eq!(store.remote_reads(), 0);
        assert!(store.fetch(64, 64).await.unwrap().iter().all(|&b| b == 7));
        assert_eq!(store.remote_reads(), 0);
    }
}
