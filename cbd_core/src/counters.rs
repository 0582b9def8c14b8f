use std::fmt;

use crate::error::{CbdError, Result};
use crate::format::{ByteOrder, BLOCK_SIZE, COUNTERS_PER_BLOCK};
use crate::layout::Layout;
use crate::store::BlockStore;

/// In-memory copy of one counter block: 1024 write counters, one per data
/// block of the owning segment.
///
/// Counters wrap at 2^32. A block rewritten exactly 2^32 times between two
/// snapshots therefore looks unchanged; periodic full-verification backup
/// passes are the mitigation.
#[derive(Clone, PartialEq, Eq)]
pub struct CounterBlock {
    counters: Box<[u32; COUNTERS_PER_BLOCK]>,
}

impl CounterBlock {
    pub fn zeroed() -> Self {
        Self {
            counters: Box::new([0u32; COUNTERS_PER_BLOCK]),
        }
    }

    pub fn from_counters(counters: [u32; COUNTERS_PER_BLOCK]) -> Self {
        Self {
            counters: Box::new(counters),
        }
    }

    /// Decode a raw counter block stored in `order`.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(CbdError::InvalidBlockLength {
                len: buf.len(),
                block_size: BLOCK_SIZE,
            });
        }
        let mut block = Self::zeroed();
        for (slot, chunk) in block.counters.iter_mut().zip(buf.chunks_exact(4)) {
            *slot = order.read_u32([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(block)
    }

    /// Encode to exactly one block in `order`.
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        for &counter in self.counters.iter() {
            buf.extend_from_slice(&order.write_u32(counter));
        }
        buf
    }

    /// Read and decode the counter block of `segment` straight from `store`.
    pub fn read_from(store: &dyn BlockStore, order: ByteOrder, segment: u64) -> Result<Self> {
        let block = Layout::counter_block(segment);
        let mut buf = vec![0u8; BLOCK_SIZE];
        store
            .read_block(block, &mut buf)
            .map_err(|source| CbdError::StorageRead { block, source })?;
        Self::decode(&buf, order)
    }

    /// Encode and write this block as the counter block of `segment`.
    pub fn write_to(&self, store: &dyn BlockStore, order: ByteOrder, segment: u64) -> Result<()> {
        let block = Layout::counter_block(segment);
        store
            .write_block(block, &self.encode(order))
            .map_err(|source| CbdError::StorageWrite { block, source })
    }

    #[inline]
    pub fn get(&self, offset: usize) -> u32 {
        self.counters[offset]
    }

    #[inline]
    pub fn set(&mut self, offset: usize, value: u32) {
        self.counters[offset] = value;
    }

    /// Advance the counter at `offset` by one, wrapping to 0 past `u32::MAX`.
    /// Returns the new value.
    #[inline]
    pub fn increment(&mut self, offset: usize) -> u32 {
        let slot = &mut self.counters[offset];
        *slot = slot.wrapping_add(1);
        *slot
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.counters[..]
    }

    /// Number of blocks written at least once (modulo wraparound).
    pub fn touched(&self) -> usize {
        self.counters.iter().filter(|&&c| c != 0).count()
    }

    /// Sum of all counters; a lower bound on writes seen by the segment.
    pub fn total(&self) -> u64 {
        self.counters.iter().map(|&c| u64::from(c)).sum()
    }
}

impl Default for CounterBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for CounterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterBlock")
            .field("touched", &self.touched())
            .field("total", &self.total())
            .finish()
    }
}
