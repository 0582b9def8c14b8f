use std::collections::BTreeMap;

use crate::counters::CounterBlock;
use crate::device::CounterBlockDevice;
use crate::error::Result;
use crate::snapshot::Snapshot;

impl CounterBlockDevice {
    /// Capture every segment's counter block as a baseline.
    ///
    /// Counters are read from the store, not the cache, so the snapshot
    /// reflects exactly what a crash at this moment would leave behind.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for segment in 0..self.layout.segments() {
            let counters =
                CounterBlock::read_from(&*self.store, self.header.byte_order, segment)?;
            snapshot.insert_full(segment, counters);
        }
        tracing::debug!(segments = snapshot.len(), "captured counter snapshot");
        Ok(snapshot)
    }

    /// Logical blocks whose counters differ from `baseline`.
    ///
    /// See [`ChangedBlocks`] for the consistency guarantees.
    pub fn changed_since<'a>(&'a self, baseline: &'a Snapshot) -> ChangedBlocks<'a> {
        self.changed_since_from(baseline, 0)
    }

    /// Like [`changed_since`](Self::changed_since) but starting at
    /// `start_segment`, for resuming an interrupted scan.
    pub fn changed_since_from<'a>(
        &'a self,
        baseline: &'a Snapshot,
        start_segment: u64,
    ) -> ChangedBlocks<'a> {
        ChangedBlocks {
            device: self,
            baseline,
            next_segment: start_segment,
            pending: Vec::new().into_iter(),
            finished: false,
        }
    }

    /// Per-segment count of changed blocks since `baseline`.
    pub fn summarize_changes(&self, baseline: &Snapshot) -> Result<ChangeSummary> {
        let mut summary = ChangeSummary::default();
        for logical in self.changed_since(baseline) {
            let segment = logical? / crate::format::DATA_BLOCKS_PER_SEGMENT;
            *summary.per_segment.entry(segment).or_default() += 1;
            summary.total += 1;
        }
        summary.segments_without_baseline = (0..self.layout.segments())
            .filter(|&segment| baseline.segment(segment).is_none())
            .count() as u64;
        Ok(summary)
    }
}

/// Lazy scan over the counter blocks yielding changed logical indices in
/// ascending order.
///
/// One counter block is read per segment, only when the previous segment's
/// results are exhausted. A segment with no baseline entry is reported in
/// full without reading its counter block.
///
/// A counter counts as changed whenever it differs from its baseline value,
/// so a wrapped counter is still detected unless the block was written
/// exactly a multiple of 2^32 times. Scanning concurrently with writers may
/// report a block whose data write is still in flight; because counters are
/// written before data, the result is always a superset of the blocks that
/// actually changed, never a subset.
///
/// A storage read failure is yielded once as an `Err` and ends the scan;
/// [`next_segment`](Self::next_segment) tells where to resume.
pub struct ChangedBlocks<'a> {
    device: &'a CounterBlockDevice,
    baseline: &'a Snapshot,
    next_segment: u64,
    pending: std::vec::IntoIter<u64>,
    finished: bool,
}

impl ChangedBlocks<'_> {
    /// Segment the scan will read next. Blocks of earlier segments have all
    /// been yielded once `pending` drains.
    pub fn next_segment(&self) -> u64 {
        self.next_segment
    }

    fn scan_segment(&self, segment: u64) -> Result<Vec<u64>> {
        let range = self.device.layout.segment_logical_range(segment);
        let Some(baseline) = self.baseline.segment(segment) else {
            return Ok(range.collect());
        };
        let live = CounterBlock::read_from(
            &*self.device.store,
            self.device.header.byte_order,
            segment,
        )?;
        let start = range.start;
        Ok(range
            .filter(|&logical| {
                let offset = (logical - start) as usize;
                baseline.get(offset) != Some(live.get(offset))
            })
            .collect())
    }
}

impl Iterator for ChangedBlocks<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(logical) = self.pending.next() {
                return Some(Ok(logical));
            }
            if self.finished || self.next_segment >= self.device.layout.segments() {
                return None;
            }
            let segment = self.next_segment;
            match self.scan_segment(segment) {
                Ok(changed) => {
                    self.next_segment += 1;
                    self.pending = changed.into_iter();
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Changed-block counts grouped by segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub total: u64,
    pub per_segment: BTreeMap<u64, u64>,
    /// Segments reported in full because the baseline has no entry for them.
    pub segments_without_baseline: u64,
}
