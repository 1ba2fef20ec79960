//! Mount capability consumed by the discard planner.
//!
//! Filesystem drivers live outside this crate. A handle is a scoped resource:
//! implementors release (unmount/close) in `Drop`.

use async_trait::async_trait;

use super::Partition;
use crate::chuck::store::BackingStore;
use crate::disk::VirtualDisk;
use crate::error::{DiskError, Result};

/// Native trim of a mounted filesystem: discards its free space on the disk.
#[async_trait]
pub trait Trim: Send {
    async fn trim(&mut self) -> anyhow::Result<()>;
}

pub trait FilesystemHandle: Send {
    /// `None` when the filesystem has no native trim.
    fn trim_support(&mut self) -> Option<&mut dyn Trim>;
}

#[async_trait]
pub trait Mounter<S: BackingStore>: Send + Sync {
    /// Mount the filesystem inside `partition`'s extent of `disk`.
    async fn mount<'a>(
        &'a self,
        disk: &'a VirtualDisk<S>,
        partition: &Partition,
    ) -> Result<Box<dyn FilesystemHandle + 'a>>;
}

/// Mounter without any filesystem driver: every mount fails, so every
/// eligible partition falls back to a whole-extent discard.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMounter;

#[async_trait]
impl<S: BackingStore> Mounter<S> for NullMounter {
    async fn mount<'a>(
        &'a self,
        _disk: &'a VirtualDisk<S>,
        partition: &Partition,
    ) -> Result<Box<dyn FilesystemHandle + 'a>> {
        Err(DiskError::Mount(format!(
            "no filesystem driver for partition {} (type {:#04x})",
            partition.index, partition.kind
        )))
    }
}
