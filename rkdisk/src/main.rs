use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rkdisk::cadapter::client::{ObjectBackend, ObjectClient};
use rkdisk::cadapter::localfs::LocalFsBackend;
use rkdisk::cadapter::s3::{S3Backend, S3Config};
use rkdisk::chuck::store::ObjectImageStore;
use rkdisk::config::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_CAPACITY, DEFAULT_PAGE_SIZE, DEFAULT_STREAM_CHUNK_SIZE,
    DEFAULT_VERIFY_SAMPLE, LINUX_PARTITION_TYPE, ObjectStoreConfig, PipelineConfig, PlannerConfig,
};
use rkdisk::disk::VirtualDisk;
use rkdisk::partition::load_manifest;
use rkdisk::partition::mount::NullMounter;
use rkdisk::pipeline::{NoConfig, run_pipeline};

#[derive(Parser)]
#[command(name = "rkdisk")]
#[command(about = "Fetch a disk image lazily, trim its partitions and emit a block map", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Read the image from an S3-compatible bucket (anonymous access)")]
    S3(S3Source),
    #[command(about = "Read the image from a local directory used as a bucket")]
    Local(LocalSource),
}

#[derive(Args)]
struct S3Source {
    #[arg(long, env = "RKDISK_BUCKET")]
    bucket: String,
    /// Object key of the raw image.
    #[arg(long, env = "RKDISK_KEY")]
    key: String,
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    endpoint: Option<String>,
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct LocalSource {
    /// Directory holding the image object.
    #[arg(long, value_name = "DIR")]
    root: PathBuf,
    #[arg(long)]
    key: String,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Raw image output file.
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
    /// Block map JSON output file.
    #[arg(long, value_name = "FILE")]
    bmap: Option<PathBuf>,
    /// Also write `<bmap>.xml` in bmaptool format.
    #[arg(long, requires = "bmap")]
    bmap_xml: bool,
    /// Pipeline report JSON output file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u64,
    #[arg(long, default_value_t = DEFAULT_STREAM_CHUNK_SIZE)]
    chunk_size: usize,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u64,
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache_capacity: u64,
    #[arg(long, default_value_t = DEFAULT_VERIFY_SAMPLE)]
    verify_sample: usize,
    /// JSON partition manifest; no partitions are processed without it.
    #[arg(long, value_name = "FILE")]
    partitions: Option<PathBuf>,
    /// Partition type eligible for trim-or-discard, decimal or hex (`0x83`).
    /// Repeatable.
    #[arg(
        long = "trim-type",
        value_parser = parse_partition_type,
        default_values_t = [LINUX_PARTITION_TYPE]
    )]
    trim_types: Vec<u8>,
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Discarded regions are not guaranteed to read back as zeros.
    #[arg(long)]
    no_discard_zero: bool,
    #[arg(long)]
    progress: bool,
}

impl CommonArgs {
    fn store_config(&self) -> ObjectStoreConfig {
        ObjectStoreConfig::default()
            .page_size(self.page_size)
            .cache_capacity(self.cache_capacity)
    }

    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(&self.output)
            .block_size(self.block_size)
            .stream_chunk_size(self.chunk_size)
            .verify_sample(self.verify_sample)
            .progress(self.progress)
            .planner(
                PlannerConfig::default()
                    .eligible_types(self.trim_types.clone())
                    .concurrency(self.concurrency),
            );
        if let Some(bmap) = &self.bmap {
            config = config.bmap_output(bmap, self.bmap_xml);
        }
        config
    }
}

fn parse_partition_type(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid partition type {s:?}: {e}"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rkdisk=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run<B: ObjectBackend + 'static>(
    backend: B,
    key: &str,
    common: &CommonArgs,
) -> Result<()> {
    let store = ObjectImageStore::open(ObjectClient::new(backend), key, common.store_config())
        .await
        .with_context(|| format!("Failed to open image {key}"))?;
    let disk = VirtualDisk::open(store, !common.no_discard_zero).await?;

    let partitions = match &common.partitions {
        Some(path) => load_manifest(path).await?,
        None => Vec::new(),
    };
    let config = common.pipeline_config();
    let report = run_pipeline(&disk, &NoConfig, &partitions, &NullMounter, &config).await?;
    info!(
        remote_reads = disk.store().remote_reads(),
        mapped_bytes = report.block_map.mapped_bytes(),
        "done"
    );

    if let Some(path) = &common.report {
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::S3(args) => {
            let config = S3Config {
                endpoint: args.endpoint,
                region: args.region,
                max_retries: args.max_retries,
                ..S3Config::default()
            };
            let backend = S3Backend::new(&args.bucket, config).await?;
            run(backend, &args.key, &args.common).await
        }
        Commands::Local(args) => {
            let backend = LocalFsBackend::new(&args.root);
            run(backend, &args.key, &args.common).await
        }
    }
}
