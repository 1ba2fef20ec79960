// Library crate for rkdisk: lazily fetched virtual disks, chunk tracking and
// block map derivation, shared by the binary and integration tests.

pub mod cadapter;
pub mod chuck;
pub mod config;
pub mod disk;
pub mod error;
pub mod partition;
pub mod pipeline;

pub use chuck::bmap::BlockMap;
pub use chuck::tracker::{ByteRange, ChunkTracker};
pub use disk::VirtualDisk;
pub use error::{DiskError, Result};
