use std::ops::Range;

use crate::error::{CbdError, Result};
use crate::format::{DATA_BLOCKS_PER_SEGMENT, HEADER_BLOCK, SEGMENT_BLOCKS};

/// Physical placement of one logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddr {
    pub segment: u64,
    /// Physical index of the segment's counter block.
    pub counter_block: u64,
    /// Physical index of the data block itself.
    pub data_block: u64,
    /// Position of the block's counter within the counter block.
    pub offset: usize,
}

/// Address arithmetic for the 1-header + 1025-blocks-per-segment tiling.
///
/// ```text
/// [HEADER] [C0][D0 .. D1023] [C1][D1024 .. D2047] ... [Cn][Dn*1024 .. tail]
///    0      1   2 ..  1025   1026 1027 .. 2050
/// ```
///
/// A trailing remainder of two or more physical blocks becomes a short
/// final segment; a single leftover block is left unused. Both the write
/// path and the change-set enumerator go through this type so their view of
/// which counter owns which block can never diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    physical_blocks: u64,
    segments: u64,
    logical_capacity: u64,
}

impl Layout {
    /// Geometry for a store of `physical_blocks` blocks.
    ///
    /// Needs at least a header, one counter block, and one data block.
    pub fn new(physical_blocks: u64) -> Result<Self> {
        let logical_capacity = Self::logical_capacity_for(physical_blocks);
        if logical_capacity == 0 {
            return Err(CbdError::InvalidGeometry(format!(
                "{physical_blocks} physical blocks cannot hold a header and one segment (need at least 3)"
            )));
        }
        Ok(Self {
            physical_blocks,
            segments: Self::segment_count(physical_blocks),
            logical_capacity,
        })
    }

    /// Number of segments (full and tail) that fit in `physical_blocks`.
    pub fn segment_count(physical_blocks: u64) -> u64 {
        let Some(after_header) = physical_blocks.checked_sub(1) else {
            return 0;
        };
        let full = after_header / SEGMENT_BLOCKS;
        let tail = after_header % SEGMENT_BLOCKS;
        full + u64::from(tail >= 2)
    }

    /// Data blocks visible to the consumer for a store of `physical_blocks`.
    pub fn logical_capacity_for(physical_blocks: u64) -> u64 {
        let Some(after_header) = physical_blocks.checked_sub(1) else {
            return 0;
        };
        let full = after_header / SEGMENT_BLOCKS;
        let tail = after_header % SEGMENT_BLOCKS;
        full * DATA_BLOCKS_PER_SEGMENT + tail.saturating_sub(1)
    }

    /// Smallest physical size whose logical capacity is `logical_blocks`.
    pub fn physical_blocks_for(logical_blocks: u64) -> u64 {
        let full = logical_blocks / DATA_BLOCKS_PER_SEGMENT;
        let tail = logical_blocks % DATA_BLOCKS_PER_SEGMENT;
        1 + full * SEGMENT_BLOCKS + if tail > 0 { tail + 1 } else { 0 }
    }

    #[inline]
    pub fn physical_blocks(&self) -> u64 {
        self.physical_blocks
    }

    #[inline]
    pub fn segments(&self) -> u64 {
        self.segments
    }

    #[inline]
    pub fn logical_capacity(&self) -> u64 {
        self.logical_capacity
    }

    /// Physical index of the counter block of `segment`.
    #[inline]
    pub fn counter_block(segment: u64) -> u64 {
        HEADER_BLOCK + 1 + segment * SEGMENT_BLOCKS
    }

    /// Data blocks in `segment`: 1024 except possibly for the last one.
    pub fn segment_len(&self, segment: u64) -> u64 {
        let range = self.segment_logical_range(segment);
        range.end - range.start
    }

    /// Logical indices covered by `segment` (empty past the last segment).
    pub fn segment_logical_range(&self, segment: u64) -> Range<u64> {
        let start = segment
            .saturating_mul(DATA_BLOCKS_PER_SEGMENT)
            .min(self.logical_capacity);
        let end = start
            .saturating_add(DATA_BLOCKS_PER_SEGMENT)
            .min(self.logical_capacity);
        start..end
    }

    /// Resolve a logical index to its counter block, data block, and counter
    /// offset.
    pub fn to_physical(&self, logical: u64) -> Result<PhysicalAddr> {
        if logical >= self.logical_capacity {
            return Err(CbdError::OutOfRange {
                index: logical,
                capacity: self.logical_capacity,
            });
        }
        let segment = logical / DATA_BLOCKS_PER_SEGMENT;
        let offset = logical % DATA_BLOCKS_PER_SEGMENT;
        let counter_block = Self::counter_block(segment);
        Ok(PhysicalAddr {
            segment,
            counter_block,
            data_block: counter_block + 1 + offset,
            offset: offset as usize,
        })
    }

    /// Inverse of [`to_physical`](Self::to_physical). `None` for the header,
    /// counter blocks, and anything outside the logical capacity.
    pub fn to_logical(&self, physical: u64) -> Option<u64> {
        if physical == HEADER_BLOCK || physical >= self.physical_blocks {
            return None;
        }
        let relative = physical - HEADER_BLOCK - 1;
        let segment = relative / SEGMENT_BLOCKS;
        let position = relative % SEGMENT_BLOCKS;
        if position == 0 {
            return None;
        }
        let logical = segment * DATA_BLOCKS_PER_SEGMENT + position - 1;
        (logical < self.logical_capacity).then_some(logical)
    }
}
