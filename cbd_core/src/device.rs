use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::CounterCache;
use crate::config::DeviceConfig;
use crate::counters::CounterBlock;
use crate::error::{CbdError, Result};
use crate::format::{self, Header, BLOCK_SIZE};
use crate::layout::Layout;
use crate::store::BlockStore;

/// Change-tracking layer over a [`BlockStore`].
///
/// # Write ordering
/// For every logical write the owning counter block is incremented and
/// written to the store *before* the data block is written:
///
/// ```text
/// write_logical_block(d)
///   1. resolve d -> (counter block C, data block D, offset i)
///   2. lock segment, load C on first touch
///   3. C[i] += 1  (wrapping)
///   4. write C          <- a failure here aborts; D is never written
///   5. write D
/// ```
///
/// After a crash a data block may therefore be newer than its counter says
/// (the next incremental pass re-copies it, which is harmless), but a counter
/// is never advanced for a write that was not at least requested. No
/// barriers are issued: with a volatile store write cache the store may
/// still complete the two writes out of order.
///
/// # Failure
/// A storage write failure leaves the outcome of the operation unknown, so
/// the device is *poisoned*: further writes fail with [`CbdError::Poisoned`]
/// until [`revalidate`](Self::revalidate) succeeds. Reads and change-set
/// enumeration keep working.
pub struct CounterBlockDevice {
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) header: Header,
    pub(crate) layout: Layout,
    cache: CounterCache,
    poisoned: AtomicBool,
}

/// Outcome of a [`CounterBlockDevice::revalidate`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevalidateReport {
    pub segments_checked: u64,
    pub data_blocks_checked: u64,
    /// Cached counter blocks discarded, including any unpersisted ones.
    pub cache_discarded: usize,
    /// Non-zero counters found past the end of a short tail segment.
    pub stray_counters: u64,
    /// Data blocks with a non-zero counter.
    pub touched_blocks: u64,
}

impl CounterBlockDevice {
    /// Zero every counter block and write a fresh header.
    ///
    /// Counter blocks go out before the header, so an interrupted format
    /// never leaves a valid header in front of stale counters.
    pub fn format(store: Arc<dyn BlockStore>, config: &DeviceConfig) -> Result<Self> {
        config.validate()?;
        let layout = Self::layout_for(&*store, config)?;
        format::ensure_formattable(&*store, config.force_reformat)?;

        let zero = CounterBlock::zeroed();
        for segment in 0..layout.segments() {
            zero.write_to(&*store, config.byte_order, segment)?;
        }
        let header = format::write_header(&*store, config.byte_order, true)?;

        tracing::info!(
            store = store.name(),
            physical_blocks = layout.physical_blocks(),
            segments = layout.segments(),
            logical_capacity = layout.logical_capacity(),
            byte_order = %header.byte_order,
            "formatted counter block device"
        );
        Ok(Self::assemble(store, header, layout, config))
    }

    /// Open an already formatted store. The counter byte order comes from
    /// the header; `config.byte_order` is ignored.
    pub fn open(store: Arc<dyn BlockStore>, config: &DeviceConfig) -> Result<Self> {
        config.validate()?;
        let header = format::read_header(&*store)?;
        let layout = Self::layout_for(&*store, config)?;

        tracing::info!(
            store = store.name(),
            version = %header.version,
            byte_order = %header.byte_order,
            segments = layout.segments(),
            logical_capacity = layout.logical_capacity(),
            "opened counter block device"
        );
        Ok(Self::assemble(store, header, layout, config))
    }

    fn layout_for(store: &dyn BlockStore, config: &DeviceConfig) -> Result<Layout> {
        let available = store.block_count();
        let physical = config.physical_blocks.unwrap_or(available);
        if physical > available {
            return Err(CbdError::InvalidGeometry(format!(
                "configured {physical} physical blocks but store {} holds {available}",
                store.name()
            )));
        }
        Layout::new(physical)
    }

    fn assemble(
        store: Arc<dyn BlockStore>,
        header: Header,
        layout: Layout,
        config: &DeviceConfig,
    ) -> Self {
        let cache = CounterCache::new(Arc::clone(&store), header.byte_order, config.cache_segments);
        Self {
            store,
            header,
            layout,
            cache,
            poisoned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn header(&self) -> Header {
        self.header
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Data blocks visible to the consumer.
    #[inline]
    pub fn logical_capacity(&self) -> u64 {
        self.layout.logical_capacity()
    }

    #[inline]
    pub fn segments(&self) -> u64 {
        self.layout.segments()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn cache(&self) -> &CounterCache {
        &self.cache
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(CbdError::Poisoned);
        }
        Ok(())
    }

    fn poison_on_write_failure(&self, err: CbdError) -> CbdError {
        if let CbdError::StorageWrite { block, .. } = &err {
            if !self.poisoned.swap(true, Ordering::AcqRel) {
                tracing::warn!(block, "storage write failed; device poisoned until revalidated");
            }
        }
        err
    }

    /// Write one 4096-byte logical block. Returns the block's new counter
    /// value.
    pub fn write_logical_block(&self, logical: u64, data: &[u8]) -> Result<u32> {
        if data.len() != BLOCK_SIZE {
            return Err(CbdError::InvalidBlockLength {
                len: data.len(),
                block_size: BLOCK_SIZE,
            });
        }
        self.check_writable()?;
        let addr = self.layout.to_physical(logical)?;

        let counter = self
            .cache
            .with_segment(addr.segment, |entry| {
                let value = entry.counters_mut().increment(addr.offset);
                entry.mark_dirty();
                entry.flush()?;
                Ok(value)
            })
            .map_err(|e| self.poison_on_write_failure(e))?;

        self.store
            .write_block(addr.data_block, data)
            .map_err(|source| {
                self.poison_on_write_failure(CbdError::StorageWrite {
                    block: addr.data_block,
                    source,
                })
            })?;
        Ok(counter)
    }

    /// Write a contiguous run of logical blocks starting at `start`.
    ///
    /// `data.len()` must be a multiple of the block size. Each touched
    /// segment gets a single counter block write covering all of its blocks
    /// in the run, followed by the run's data blocks in ascending order.
    pub fn write_logical_blocks(&self, start: u64, data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CbdError::InvalidBlockLength {
                len: data.len(),
                block_size: BLOCK_SIZE,
            });
        }
        let count = (data.len() / BLOCK_SIZE) as u64;
        if count == 0 {
            return Ok(());
        }
        self.check_writable()?;
        let end = start.checked_add(count).ok_or(CbdError::OutOfRange {
            index: u64::MAX,
            capacity: self.layout.logical_capacity(),
        })?;
        // validate the whole run before touching any counter
        self.layout.to_physical(end - 1)?;

        let mut chunks = data.chunks_exact(BLOCK_SIZE);
        let mut logical = start;
        while logical < end {
            let first = self.layout.to_physical(logical)?;
            let run_end = self
                .layout
                .segment_logical_range(first.segment)
                .end
                .min(end);
            let run = (run_end - logical) as usize;

            self.cache
                .with_segment(first.segment, |entry| {
                    for i in 0..run {
                        entry.counters_mut().increment(first.offset + i);
                    }
                    entry.mark_dirty();
                    entry.flush()?;
                    Ok(())
                })
                .map_err(|e| self.poison_on_write_failure(e))?;

            for (i, chunk) in (0..run as u64).zip(&mut chunks) {
                let block = first.data_block + i;
                self.store.write_block(block, chunk).map_err(|source| {
                    self.poison_on_write_failure(CbdError::StorageWrite { block, source })
                })?;
            }
            tracing::trace!(segment = first.segment, blocks = run, "wrote segment run");
            logical = run_end;
        }
        Ok(())
    }

    /// Read one logical block into `buf`. Pure pass-through: counters are
    /// neither read nor written.
    pub fn read_logical_block_into(&self, logical: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(CbdError::InvalidBlockLength {
                len: buf.len(),
                block_size: BLOCK_SIZE,
            });
        }
        let addr = self.layout.to_physical(logical)?;
        self.store
            .read_block(addr.data_block, buf)
            .map_err(|source| CbdError::StorageRead {
                block: addr.data_block,
                source,
            })
    }

    pub fn read_logical_block(&self, logical: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_logical_block_into(logical, &mut buf)?;
        Ok(buf)
    }

    /// Current write counter of `logical`, as seen through the cache.
    pub fn counter(&self, logical: u64) -> Result<u32> {
        let addr = self.layout.to_physical(logical)?;
        self.cache
            .with_segment(addr.segment, |entry| Ok(entry.counters().get(addr.offset)))
    }

    /// Flush any dirty counter blocks, then ask the store to sync.
    ///
    /// Refused on a poisoned device: nothing cached is trusted until
    /// [`revalidate`](Self::revalidate) has re-read the counters.
    pub fn sync(&self) -> Result<()> {
        self.check_writable()?;
        let flushed = self
            .cache
            .flush_all()
            .map_err(|e| self.poison_on_write_failure(e))?;
        if flushed > 0 {
            tracing::debug!(flushed, "flushed dirty counter blocks before sync");
        }
        self.store.sync()?;
        Ok(())
    }

    /// Consistency pass after a storage failure.
    ///
    /// Discards the counter cache (including increments that never reached
    /// the store), re-reads and checks the header, re-reads every counter
    /// block and, with `scan_data`, every data block. Clears the poison flag
    /// on success. Must not run concurrently with writers.
    pub fn revalidate(&self, scan_data: bool) -> Result<RevalidateReport> {
        let mut report = RevalidateReport {
            cache_discarded: self.cache.invalidate_all(),
            ..RevalidateReport::default()
        };

        let header = format::read_header(&*self.store)?;
        if header != self.header {
            return Err(CbdError::CorruptHeader(format!(
                "header changed underneath the open device: {:?} -> {:?}",
                self.header, header
            )));
        }

        let mut buf = vec![0u8; BLOCK_SIZE];
        for segment in 0..self.layout.segments() {
            let counters = CounterBlock::read_from(&*self.store, header.byte_order, segment)?;
            let len = self.layout.segment_len(segment) as usize;
            report.touched_blocks += counters.as_slice()[..len]
                .iter()
                .filter(|&&c| c != 0)
                .count() as u64;
            report.stray_counters += counters.as_slice()[len..]
                .iter()
                .filter(|&&c| c != 0)
                .count() as u64;
            report.segments_checked += 1;

            if scan_data {
                for logical in self.layout.segment_logical_range(segment) {
                    self.read_logical_block_into(logical, &mut buf)?;
                    report.data_blocks_checked += 1;
                }
            }
        }
        if report.stray_counters > 0 {
            tracing::warn!(
                stray = report.stray_counters,
                "non-zero counters past the end of the tail segment"
            );
        }

        self.poisoned.store(false, Ordering::Release);
        tracing::info!(
            segments = report.segments_checked,
            data_blocks = report.data_blocks_checked,
            discarded = report.cache_discarded,
            "revalidated counter block device"
        );
        Ok(report)
    }
}
