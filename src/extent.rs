//! Block extent to byte range mapping and per-partition layout validation.

use std::fmt;

use crate::error::{Error, Result};
use crate::manifest::Extent;

/// Half-open byte range `[offset, offset + length)` within an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset. Ranges produced by [`to_byte_ranges`] never
    /// overflow here.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.offset, self.end())
    }
}

/// Convert block extents into byte ranges, preserving order.
pub fn to_byte_ranges(extents: &[Extent], block_size: u32) -> Result<Vec<ByteRange>> {
    extents
        .iter()
        .map(|e| {
            let overflow = || {
                Error::InvalidManifest(format!(
                    "extent {}+{} overflows with block size {block_size}",
                    e.start_block, e.num_blocks,
                ))
            };
            let offset = e
                .start_block
                .checked_mul(block_size.into())
                .ok_or_else(overflow)?;
            let length = e
                .num_blocks
                .checked_mul(block_size.into())
                .ok_or_else(overflow)?;
            offset.checked_add(length).ok_or_else(overflow)?;

            Ok(ByteRange::new(offset, length))
        })
        .collect()
}

/// Total number of bytes covered by `ranges`.
pub fn total_length(ranges: &[ByteRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

/// Check that no two ranges overlap and that every range lies within
/// `partition_size` bytes. Empty ranges are ignored.
pub fn validate_disjoint(ranges: &[ByteRange], partition_size: u64) -> Result<()> {
    let mut sorted = ranges
        .iter()
        .copied()
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>();
    sorted.sort_unstable();

    for range in &sorted {
        if range.end() > partition_size {
            return Err(Error::OutOfBounds {
                range: *range,
                limit: partition_size,
                what: "partition",
            });
        }
    }

    for pair in sorted.windows(2) {
        if pair[1].offset < pair[0].end() {
            return Err(Error::Overlap {
                first: pair[0],
                second: pair[1],
            });
        }
    }

    Ok(())
}

/// Find the first byte range in `[0, partition_size)` not covered by
/// `ranges`. The ranges must already have passed [`validate_disjoint`].
pub fn find_gap(ranges: &[ByteRange], partition_size: u64) -> Option<ByteRange> {
    let mut sorted = ranges
        .iter()
        .copied()
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>();
    sorted.sort_unstable();

    let mut cursor = 0;
    for range in sorted {
        if range.offset > cursor {
            return Some(ByteRange::new(cursor, range.offset - cursor));
        }
        cursor = range.end();
    }

    (cursor < partition_size).then(|| ByteRange::new(cursor, partition_size - cursor))
}
