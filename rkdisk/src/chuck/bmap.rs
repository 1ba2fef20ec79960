//! Block map: block-aligned superset of the known byte ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::tracker::ByteRange;
use crate::error::{DiskError, Result};

/// Inclusive range of block indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn blocks(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMap {
    pub block_size: u64,
    pub image_size: u64,
    pub ranges: Vec<BlockRange>,
}

impl BlockMap {
    /// Align every byte range outwards to `block_size` and coalesce the result.
    ///
    /// The start rounds down and the whole block holding `end` is included, so
    /// the map never drops a known byte. `ranges` must be ascending.
    pub fn derive<I>(block_size: u64, image_size: u64, ranges: I) -> Result<Self>
    where
        I: IntoIterator<Item = ByteRange>,
    {
        if block_size == 0 {
            return Err(DiskError::InvalidBlockSize);
        }
        let mut out: Vec<BlockRange> = Vec::new();
        for r in ranges {
            let start = r.start / block_size;
            let end = r.end / block_size;
            match out.last_mut() {
                Some(last) if start <= last.end + 1 => last.end = last.end.max(end),
                _ => out.push(BlockRange { start, end }),
            }
        }
        Ok(Self {
            block_size,
            image_size,
            ranges: out,
        })
    }

    pub fn mapped_blocks(&self) -> u64 {
        self.ranges.iter().map(BlockRange::blocks).sum()
    }

    pub fn total_blocks(&self) -> u64 {
        self.image_size.div_ceil(self.block_size)
    }

    /// Bytes a consumer has to transfer to reproduce the image.
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_blocks() * self.block_size
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// bmaptool-style XML description, without checksums.
    pub fn to_bmap_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" ?>\n");
        xml.push_str("<bmap version=\"1.2\">\n");
        xml.push_str(&format!("    <ImageSize> {} </ImageSize>\n", self.image_size));
        xml.push_str(&format!("    <BlockSize> {} </BlockSize>\n", self.block_size));
        xml.push_str(&format!(
            "    <BlocksCount> {} </BlocksCount>\n",
            self.total_blocks()
        ));
        xml.push_str(&format!(
            "    <MappedBlocksCount> {} </MappedBlocksCount>\n",
            self.mapped_blocks()
        ));
        xml.push_str("    <BlockMap>\n");
        for r in &self.ranges {
            xml.push_str(&format!("        <Range> {} </Range>\n", RangeLabel(r)));
        }
        xml.push_str("    </BlockMap>\n");
        xml.push_str("</bmap>\n");
        xml
    }
}

struct RangeLabel<'a>(&'a BlockRange);

impl fmt::Display for RangeLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.start == self.0.end {
            write!(f, "{}", self.0.start)
        } else {
            write!(f, "{}-{}", self.0.start, self.0.end)
        }
    }
}

impl fmt::Display for BlockMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bmap[{}B]", self.block_size)?;
        for (i, r) in self.ranges.iter().enumerate() {
            let sep = if i == 0 { " " } else { "," };
            write!(f, "{sep}{}", RangeLabel(r))?;
        }
        Ok(())
    }
}
