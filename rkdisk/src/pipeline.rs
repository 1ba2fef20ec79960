//! End-to-end image preparation.
//!
//! configure → plan partition discards → stream the full image to a file →
//! derive the block map → verify a sample of the written file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::chuck::bmap::BlockMap;
use crate::chuck::store::BackingStore;
use crate::config::PipelineConfig;
use crate::disk::VirtualDisk;
use crate::disk::stream::copy_to_sink;
use crate::partition::Partition;
use crate::partition::mount::Mounter;
use crate::partition::planner::{PartitionDiscardPlanner, PlanReport};

/// Injects configuration into the image before it is planned and streamed.
#[async_trait]
pub trait Configurator<S: BackingStore>: Send + Sync {
    async fn configure(&self, disk: &VirtualDisk<S>) -> Result<()>;
}

/// Leaves the image untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConfig;

#[async_trait]
impl<S: BackingStore> Configurator<S> for NoConfig {
    async fn configure(&self, _disk: &VirtualDisk<S>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub plan: PlanReport,
    pub bytes_written: u64,
    pub known_chunks: usize,
    pub known_bytes: u64,
    pub block_map: BlockMap,
    pub verified_bytes: usize,
}

pub async fn run_pipeline<S, C, M>(
    disk: &VirtualDisk<S>,
    configurator: &C,
    partitions: &[Partition],
    mounter: &M,
    config: &PipelineConfig,
) -> Result<PipelineReport>
where
    S: BackingStore,
    C: Configurator<S>,
    M: Mounter<S>,
{
    configurator
        .configure(disk)
        .await
        .context("Failed to configure image")?;
    info!("image configured");

    let planner = PartitionDiscardPlanner::new(mounter, config.planner.clone());
    let plan = planner
        .run(disk, partitions)
        .await
        .context("Failed to trim partitions")?;
    info!(
        partitions = plan.partitions.len(),
        discarded = plan.discarded_bytes(),
        "partitions processed"
    );

    let bytes_written = stream_to_file(disk, config).await?;

    let known_chunks = disk.known_ranges().len();
    let known_bytes = disk.known_bytes();
    info!(
        "{known_chunks} known chunks, {known_bytes} / {} bytes",
        disk.capacity()
    );

    let block_map = disk
        .block_map(config.block_size)
        .context("Failed to compute block map")?;
    info!(
        mapped_bytes = block_map.mapped_bytes(),
        "block map: {block_map}"
    );
    write_block_map(&block_map, config).await?;

    let verified_bytes = verify_sample(disk, config).await?;

    Ok(PipelineReport {
        plan,
        bytes_written,
        known_chunks,
        known_bytes,
        block_map,
        verified_bytes,
    })
}

async fn stream_to_file<S: BackingStore>(
    disk: &VirtualDisk<S>,
    config: &PipelineConfig,
) -> Result<u64> {
    let progress_bar = if config.progress {
        let bar = ProgressBar::new(disk.capacity());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
                .progress_chars("#>-"),
        );
        bar.set_message("Streaming image");
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut output = tokio::fs::File::create(&config.output)
        .await
        .with_context(|| format!("Failed to create output file {}", config.output.display()))?;
    let pieces = disk.stream(None, None, config.stream_chunk_size)?;
    let written = copy_to_sink(pieces, &mut output, |len| progress_bar.inc(len as u64))
        .await
        .context("Failed to stream image")?;
    progress_bar.finish_and_clear();
    info!(written, output = %config.output.display(), "image streamed");
    Ok(written)
}

async fn write_block_map(block_map: &BlockMap, config: &PipelineConfig) -> Result<()> {
    let Some(path) = &config.bmap_output else {
        return Ok(());
    };
    tokio::fs::write(path, block_map.to_json()?)
        .await
        .with_context(|| format!("Failed to write block map {}", path.display()))?;
    if config.bmap_xml {
        let mut xml_path = path.as_os_str().to_owned();
        xml_path.push(".xml");
        tokio::fs::write(&xml_path, block_map.to_bmap_xml())
            .await
            .with_context(|| format!("Failed to write block map {}", xml_path.display()))?;
    }
    info!(path = %path.display(), "block map written");
    Ok(())
}

/// Re-read the start of the image and compare it with the written file.
async fn verify_sample<S: BackingStore>(
    disk: &VirtualDisk<S>,
    config: &PipelineConfig,
) -> Result<usize> {
    let len = (config.verify_sample as u64).min(disk.capacity()) as usize;
    if len == 0 {
        return Ok(0);
    }
    let expected = disk.read(0, len).await?;
    let mut actual = vec![0u8; len];
    let mut file = tokio::fs::File::open(&config.output)
        .await
        .with_context(|| format!("Failed to reopen {}", config.output.display()))?;
    file.read_exact(&mut actual)
        .await
        .context("Output file is shorter than the image")?;
    if actual != expected.as_ref() {
        anyhow::bail!(
            "Verification failed: first {len} bytes of {} differ from the image",
            config.output.display()
        );
    }
    info!(len, "sample verified");
    Ok(len)
}
