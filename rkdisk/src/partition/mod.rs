//! Partition descriptors and the trim-or-discard planner.
//!
//! Parsing partition tables is left to external tools; descriptors arrive as
//! a JSON manifest such as
//! `[{"index": 2, "type": 131, "offset": 67108864, "size": 314572800}]`.
//!
//! Submodules:
//! - `mount`: the mount capability and filesystem handles
//! - `planner`: per-partition trim or whole-extent discard

pub mod mount;
pub mod planner;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One partition table entry; offset and size are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// 1-based position in the table.
    pub index: u32,
    /// MBR partition type byte.
    #[serde(rename = "type")]
    pub kind: u8,
    pub offset: u64,
    pub size: u64,
}

/// Reject entries whose extents overlap; returns them sorted by offset.
pub fn validate_partitions(mut parts: Vec<Partition>) -> Result<Vec<Partition>> {
    parts.sort_by_key(|p| p.offset);
    for pair in parts.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let a_end = a
            .offset
            .checked_add(a.size)
            .with_context(|| format!("partition {} extent overflows", a.index))?;
        if a_end > b.offset {
            anyhow::bail!(
                "partitions {} and {} overlap ({}+{} > {})",
                a.index,
                b.index,
                a.offset,
                a.size,
                b.offset
            );
        }
    }
    Ok(parts)
}

pub async fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<Partition>> {
    let path = path.as_ref();
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read partition manifest {}", path.display()))?;
    let parts: Vec<Partition> = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse partition manifest {}", path.display()))?;
    validate_partitions(parts)
}
