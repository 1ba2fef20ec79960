//! Trim what can be mounted, discard what cannot.
//!
//! Each eligible partition is mounted; a mounted filesystem with native trim
//! is trimmed, one without trim is left alone. A partition that fails to mount
//! for any reason has its whole extent discarded: without a filesystem view
//! there is no way to tell live data from free space.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::Partition;
use super::mount::Mounter;
use crate::chuck::store::BackingStore;
use crate::config::PlannerConfig;
use crate::disk::VirtualDisk;
use crate::error::{DiskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PartitionOutcome {
    /// Type not eligible.
    Skipped,
    Trimmed,
    /// Mounted, but the filesystem has no trim.
    NoTrim,
    /// Mount failed; whole extent discarded.
    Discarded { bytes: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub partition: Partition,
    #[serde(flatten)]
    pub outcome: PartitionOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
    pub partitions: Vec<PartitionReport>,
}

impl PlanReport {
    pub fn discarded_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .map(|r| match r.outcome {
                PartitionOutcome::Discarded { bytes } => bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn count(&self, pred: impl Fn(&PartitionOutcome) -> bool) -> usize {
        self.partitions.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct PartitionDiscardPlanner<'m, M> {
    mounter: &'m M,
    config: PlannerConfig,
}

impl<'m, M> PartitionDiscardPlanner<'m, M> {
    pub fn new(mounter: &'m M, config: PlannerConfig) -> Self {
        Self { mounter, config }
    }

    pub fn is_eligible(&self, partition: &Partition) -> bool {
        self.config.eligible_types.contains(&partition.kind)
    }

    /// Process every partition; reports come back in input order.
    pub async fn run<S>(&self, disk: &VirtualDisk<S>, partitions: &[Partition]) -> Result<PlanReport>
    where
        S: BackingStore,
        M: Mounter<S>,
    {
        let eligible: Vec<u32> = partitions
            .iter()
            .filter(|p| self.is_eligible(p))
            .map(|p| p.index)
            .collect();
        info!(?eligible, "partitions to trim");

        let reports = if self.config.concurrency <= 1 {
            let mut reports = Vec::with_capacity(partitions.len());
            for p in partitions {
                reports.push(self.process(disk, p).await?);
            }
            reports
        } else {
            stream::iter(partitions)
                .map(|p| self.process(disk, p))
                .buffered(self.config.concurrency)
                .try_collect()
                .await?
        };
        Ok(PlanReport {
            partitions: reports,
        })
    }

    async fn process<S>(&self, disk: &VirtualDisk<S>, partition: &Partition) -> Result<PartitionReport>
    where
        S: BackingStore,
        M: Mounter<S>,
    {
        let report = |outcome| PartitionReport {
            partition: *partition,
            outcome,
        };
        if !self.is_eligible(partition) {
            debug!(index = partition.index, kind = partition.kind, "skipping partition");
            return Ok(report(PartitionOutcome::Skipped));
        }

        let outcome = match self.mounter.mount(disk, partition).await {
            Ok(mut fs) => {
                // `fs` is released when this arm ends, on success and on `?`.
                match fs.trim_support() {
                    Some(trim) => {
                        trim.trim().await.map_err(DiskError::Trim)?;
                        info!(index = partition.index, "filesystem trimmed");
                        PartitionOutcome::Trimmed
                    }
                    None => {
                        info!(index = partition.index, "filesystem has no trim, left as is");
                        PartitionOutcome::NoTrim
                    }
                }
            }
            Err(err) => {
                warn!(
                    index = partition.index,
                    "mount failed ({err}), discarding {} bytes at {}",
                    partition.size,
                    partition.offset
                );
                disk.discard(partition.offset, partition.size).await?;
                PartitionOutcome::Discarded {
                    bytes: partition.size,
                }
            }
        };
        Ok(report(outcome))
    }
}
