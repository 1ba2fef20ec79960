use std::path::PathBuf;

pub const DEFAULT_BLOCK_SIZE: u64 = 512;
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 16 * 1024 * 1024; // 16MB
pub const DEFAULT_PAGE_SIZE: u64 = 1024 * 1024; // 1MB
pub const DEFAULT_CACHE_CAPACITY: u64 = 256 * 1024 * 1024; // 256MB
pub const DEFAULT_VERIFY_SAMPLE: usize = 1024;
/// MBR type byte of native Linux partitions.
pub const LINUX_PARTITION_TYPE: u8 = 0x83;

#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    /// Unit of ranged reads, caching and write overlay.
    /// Larger pages mean fewer requests but more over-fetch on random reads.
    pub page_size: u64,
    /// Read cache capacity in bytes. Streaming a whole image through a small
    /// cache is fine; pages are only reused by nearby reads and writes.
    pub cache_capacity: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl ObjectStoreConfig {
    pub fn page_size(self, page_size: u64) -> Self {
        Self { page_size, ..self }
    }

    pub fn cache_capacity(self, cache_capacity: u64) -> Self {
        Self {
            cache_capacity,
            ..self
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Partition types eligible for trim-or-discard.
    pub eligible_types: Vec<u8>,
    /// Partitions processed at once. 1 keeps the strictly sequential order.
    pub concurrency: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            eligible_types: vec![LINUX_PARTITION_TYPE],
            concurrency: 1,
        }
    }
}

impl PlannerConfig {
    pub fn eligible_types(self, eligible_types: Vec<u8>) -> Self {
        Self {
            eligible_types,
            ..self
        }
    }

    pub fn concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..self
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Raw image written here.
    pub output: PathBuf,
    /// Block map JSON written here when set.
    pub bmap_output: Option<PathBuf>,
    /// Also write `<bmap_output>.xml`.
    pub bmap_xml: bool,
    pub block_size: u64,
    pub stream_chunk_size: usize,
    /// Bytes compared between the disk and the written output.
    pub verify_sample: usize,
    pub progress: bool,
    pub planner: PlannerConfig,
}

impl PipelineConfig {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            bmap_output: None,
            bmap_xml: false,
            block_size: DEFAULT_BLOCK_SIZE,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            verify_sample: DEFAULT_VERIFY_SAMPLE,
            progress: false,
            planner: PlannerConfig::default(),
        }
    }

    pub fn bmap_output(self, path: impl Into<PathBuf>, xml: bool) -> Self {
        Self {
            bmap_output: Some(path.into()),
            bmap_xml: xml,
            ..self
        }
    }

    pub fn block_size(self, block_size: u64) -> Self {
        Self { block_size, ..self }
    }

    pub fn stream_chunk_size(self, stream_chunk_size: usize) -> Self {
        Self {
            stream_chunk_size,
            ..self
        }
    }

    pub fn verify_sample(self, verify_sample: usize) -> Self {
        Self {
            verify_sample,
            ..self
        }
    }

    pub fn progress(self, progress: bool) -> Self {
        Self { progress, ..self }
    }

    pub fn planner(self, planner: PlannerConfig) -> Self {
        Self { planner, ..self }
    }
}
