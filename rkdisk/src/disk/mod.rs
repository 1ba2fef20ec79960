//! Virtual disk over a lazily fetched backing store.
//!
//! Every read, write and zeroing discard is recorded in a [`ChunkTracker`];
//! the block map is derived from that record on demand.

pub mod stream;

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, info};

use crate::chuck::bmap::BlockMap;
use crate::chuck::store::BackingStore;
use crate::chuck::tracker::{ByteRange, ChunkTracker};
use crate::error::{DiskError, Result};

pub struct VirtualDisk<S: BackingStore> {
    store: S,
    capacity: u64,
    discard_is_zero: bool,
    tracker: Mutex<ChunkTracker>,
}

impl<S: BackingStore> VirtualDisk<S> {
    /// Open a disk over `store`. The capacity is read once and never changes.
    ///
    /// With `discard_is_zero` a discard marks the range known and reads it back
    /// as zeros without any backend I/O; use it when discarded regions of the
    /// medium are guaranteed to read as zero.
    pub async fn open(store: S, discard_is_zero: bool) -> Result<Self> {
        let capacity = store.size().await.map_err(DiskError::Backend)?;
        info!(capacity, discard_is_zero, "opened virtual disk");
        Ok(Self {
            store,
            capacity,
            discard_is_zero,
            tracker: Mutex::new(ChunkTracker::new(capacity)),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // Never held across an await.
    fn tracker(&self) -> MutexGuard<'_, ChunkTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `[offset, offset + length)`; `None` for zero-length requests.
    fn range_for(&self, offset: u64, length: u64) -> Result<Option<ByteRange>> {
        match offset.checked_add(length) {
            Some(end) if end <= self.capacity => Ok(ByteRange::from_offset_len(offset, length)),
            _ => Err(DiskError::out_of_range(offset, length, self.capacity)),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        let Some(range) = self.range_for(offset, length as u64)? else {
            return Ok(Bytes::new());
        };
        let zeroed = self.tracker().zeroed_in(range);
        let data = if zeroed.is_empty() {
            self.fetch(range).await?
        } else if zeroed[0] == range {
            Bytes::from(vec![0u8; length])
        } else {
            let mut out = vec![0u8; length];
            let mut cursor = range.start;
            for z in &zeroed {
                if z.start > cursor {
                    self.fetch_into(&mut out, range.start, ByteRange::new(cursor, z.start - 1))
                        .await?;
                }
                cursor = z.end + 1;
            }
            if cursor <= range.end {
                self.fetch_into(&mut out, range.start, ByteRange::new(cursor, range.end))
                    .await?;
            }
            Bytes::from(out)
        };
        self.tracker().mark_known(range)?;
        Ok(data)
    }

    async fn fetch(&self, range: ByteRange) -> Result<Bytes> {
        let data = self
            .store
            .fetch(range.start, range.len() as usize)
            .await
            .map_err(DiskError::Backend)?;
        if data.len() as u64 != range.len() {
            return Err(DiskError::backend(anyhow::anyhow!(
                "store returned {} bytes for {} at {}",
                data.len(),
                range.len(),
                range.start
            )));
        }
        Ok(data)
    }

    async fn fetch_into(&self, out: &mut [u8], base: u64, range: ByteRange) -> Result<()> {
        let data = self.fetch(range).await?;
        let from = (range.start - base) as usize;
        out[from..from + data.len()].copy_from_slice(&data);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    pub async fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let Some(range) = self.range_for(offset, buf.len() as u64)? else {
            return Ok(());
        };
        self.store
            .store(offset, buf)
            .await
            .map_err(DiskError::Backend)?;
        self.tracker().mark_written(range)
    }

    /// Declare `[offset, offset + length)` free.
    pub async fn discard(&self, offset: u64, length: u64) -> Result<()> {
        let Some(range) = self.range_for(offset, length)? else {
            return Ok(());
        };
        if self.discard_is_zero {
            debug!(offset, length, "discard as zero");
            self.tracker().mark_zeroed(range)
        } else {
            debug!(offset, length, "discard, invalidating backend bytes");
            self.store
                .invalidate(offset, length)
                .await
                .map_err(DiskError::Backend)
        }
    }

    /// Block-aligned superset of the known bytes. Does not mutate anything.
    pub fn block_map(&self, block_size: u64) -> Result<BlockMap> {
        let tracker = self.tracker();
        BlockMap::derive(block_size, self.capacity, tracker.iter())
    }

    pub fn known_bytes(&self) -> u64 {
        self.tracker().total_known_bytes()
    }

    pub fn known_ranges(&self) -> Vec<ByteRange> {
        self.tracker().iter().collect()
    }

    pub fn reset_tracking(&self) {
        self.tracker().reset();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chuck::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) const MIB: usize = 1024 * 1024;

    /// In-memory store whose operations can be switched to fail.
    pub(crate) struct FlakyStore {
        pub inner: InMemoryStore,
        pub failing: AtomicBool,
    }

    impl FlakyStore {
        pub fn new(size: usize) -> Self {
            Self {
                inner: InMemoryStore::new(size),
                failing: AtomicBool::new(false),
            }
        }

        fn check(&self) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("injected transport failure");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BackingStore for FlakyStore {
        async fn size(&self) -> anyhow::Result<u64> {
            self.inner.size().await
        }

        async fn fetch(&self, offset: u64, len: usize) -> anyhow::Result<Bytes> {
            self.check()?;
            self.inner.fetch(offset, len).await
        }

        async fn store(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
            self.check()?;
            self.inner.store(offset, data).await
        }
    }

    /// Answers every fetch with one byte too many, or one too few when `short`.
    struct MisbehavingStore {
        inner: InMemoryStore,
        short: bool,
    }

    #[async_trait]
    impl BackingStore for MisbehavingStore {
        async fn size(&self) -> anyhow::Result<u64> {
            self.inner.size().await
        }

        async fn fetch(&self, _offset: u64, len: usize) -> anyhow::Result<Bytes> {
            let len = if self.short { len - 1 } else { len + 1 };
            Ok(Bytes::from(vec![7u8; len]))
        }

        async fn store(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
            self.inner.store(offset, data).await
        }
    }

    fn pairs(map: &BlockMap) -> Vec<(u64, u64)> {
        map.ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    #[tokio::test]
    async fn test_write_and_zero_discard_scenario() {
        let disk = VirtualDisk::open(InMemoryStore::new(MIB), true).await.unwrap();
        disk.write(0, &[0xAB; 1024]).await.unwrap();
        disk.discard(2048, 2048).await.unwrap();

        let map = disk.block_map(512).unwrap();
        assert_eq!(pairs(&map), vec![(0, 1), (4, 7)]);
        assert_eq!(disk.known_bytes(), 1024 + 2048);
        assert_eq!(disk.store().stats().stores(), 1);
        assert_eq!(disk.store().stats().fetches(), 0);
    }

    #[tokio::test]
    async fn test_zero_discard_reads_zero_without_backend() {
        let store = InMemoryStore::from_bytes(vec![0x55; 8192]);
        let disk = VirtualDisk::open(store, true).await.unwrap();
        disk.discard(1000, 3000).await.unwrap();

        let inside = disk.read(1500, 1000).await.unwrap();
        assert!(inside.iter().all(|&b| b == 0));
        assert_eq!(disk.store().stats().fetches(), 0);

        // Straddling read: backend bytes around the zeroed hole.
        let across = disk.read(900, 4200).await.unwrap();
        assert!(across[..100].iter().all(|&b| b == 0x55));
        assert!(across[100..3100].iter().all(|&b| b == 0));
        assert!(across[3100..].iter().all(|&b| b == 0x55));
        assert_eq!(disk.store().stats().fetches(), 2);
    }

    #[tokio::test]
    async fn test_write_over_zeroed_reads_back_data() {
        let disk = VirtualDisk::open(InMemoryStore::new(4096), true).await.unwrap();
        disk.discard(0, 4096).await.unwrap();
        disk.write(100, &[9u8; 10]).await.unwrap();

        let got = disk.read(95, 20).await.unwrap();
        assert!(got[..5].iter().all(|&b| b == 0));
        assert!(got[5..15].iter().all(|&b| b == 9));
        assert!(got[15..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_discard_without_zero_guarantee_leaves_tracker() {
        let disk = VirtualDisk::open(InMemoryStore::new(4096), false).await.unwrap();
        disk.discard(0, 2048).await.unwrap();
        assert_eq!(disk.known_bytes(), 0);
        assert_eq!(disk.store().stats().invalidations(), 1);
        assert!(disk.block_map(512).unwrap().ranges.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_has_no_effect() {
        let disk = VirtualDisk::open(InMemoryStore::new(1000), true).await.unwrap();
        assert!(matches!(
            disk.read(900, 101).await,
            Err(DiskError::OutOfRange { capacity: 1000, .. })
        ));
        assert!(matches!(
            disk.write(999, &[1, 2]).await,
            Err(DiskError::OutOfRange { .. })
        ));
        assert!(matches!(
            disk.discard(u64::MAX, 2).await,
            Err(DiskError::OutOfRange { .. })
        ));
        assert_eq!(disk.known_bytes(), 0);
        assert_eq!(disk.store().stats().stores(), 0);

        // Exactly at the end is fine; zero length is a no-op.
        assert_eq!(disk.read(900, 100).await.unwrap().len(), 100);
        assert!(disk.read(1000, 0).await.unwrap().is_empty());
        assert_eq!(disk.known_bytes(), 100);
    }

    #[tokio::test]
    async fn test_backend_failure_leaves_tracker_untouched() {
        let disk = VirtualDisk::open(FlakyStore::new(4096), true).await.unwrap();
        disk.read(0, 100).await.unwrap();
        disk.store().failing.store(true, Ordering::SeqCst);

        assert!(matches!(disk.read(200, 100).await, Err(DiskError::Backend(_))));
        assert!(matches!(
            disk.write(400, &[1u8; 10]).await,
            Err(DiskError::Backend(_))
        ));
        assert_eq!(disk.known_ranges(), vec![ByteRange::new(0, 99)]);
    }

    #[tokio::test]
    async fn test_wrong_length_fetch_is_backend_error() {
        for short in [false, true] {
            let store = MisbehavingStore {
                inner: InMemoryStore::new(4096),
                short,
            };
            let disk = VirtualDisk::open(store, true).await.unwrap();
            assert!(matches!(disk.read(0, 100).await, Err(DiskError::Backend(_))));

            // Around a zeroed hole the pieces are fetched separately.
            disk.discard(1000, 100).await.unwrap();
            assert!(matches!(disk.read(900, 300).await, Err(DiskError::Backend(_))));
            assert_eq!(disk.known_ranges(), vec![ByteRange::new(1000, 1099)]);
        }
    }

    #[tokio::test]
    async fn test_reads_accumulate_known_chunks() {
        let disk = VirtualDisk::open(InMemoryStore::new(4096), false).await.unwrap();
        disk.read(0, 100).await.unwrap();
        disk.read(100, 100).await.unwrap();
        disk.read(1000, 10).await.unwrap();
        assert_eq!(
            disk.known_ranges(),
            vec![ByteRange::new(0, 199), ByteRange::new(1000, 1009)]
        );
        disk.reset_tracking();
        assert_eq!(disk.known_bytes(), 0);
    }
}
