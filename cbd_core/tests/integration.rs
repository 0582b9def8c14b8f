//! End-to-end behavior of the counter block device over the bundled stores.
//!
//! The in-memory store journals every physical write, which lets these tests
//! assert the counter-before-data ordering directly.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cbd_core::format::{self, DATA_BLOCKS_PER_SEGMENT};
use cbd_core::{
    BlockStore, ByteOrder, CbdError, CounterBlock, CounterBlockDevice, DeviceConfig, Layout,
    SegmentBaseline, Snapshot, BLOCK_SIZE,
};
use cbd_stores::{FileStore, MemStore};
use parking_lot::Mutex;
use tempfile::TempDir;

// ── helpers ───────────────────────────────────────────────────────────────

fn config() -> DeviceConfig {
    DeviceConfig {
        byte_order: ByteOrder::Little,
        ..DeviceConfig::default()
    }
}

/// Format a fresh in-memory device with `logical` data blocks and clear the
/// journal of the format writes.
fn mem_device(logical: u64) -> (Arc<MemStore>, CounterBlockDevice) {
    let store = Arc::new(MemStore::new(Layout::physical_blocks_for(logical)));
    let device = CounterBlockDevice::format(store.clone(), &config()).unwrap();
    store.take_journal();
    (store, device)
}

fn block_of(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

fn changed(device: &CounterBlockDevice, baseline: &Snapshot) -> Vec<u64> {
    device
        .changed_since(baseline)
        .collect::<cbd_core::Result<Vec<_>>>()
        .unwrap()
}

fn raw_counters(store: &MemStore, segment: u64, order: ByteOrder) -> CounterBlock {
    CounterBlock::decode(&store.raw_block(Layout::counter_block(segment)), order).unwrap()
}

// ── header ────────────────────────────────────────────────────────────────

#[test]
fn header_survives_reopen_and_detects_corruption() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("device.img");
    let store = Arc::new(FileStore::create(&path, Layout::physical_blocks_for(100))?);
    CounterBlockDevice::format(store, &config())?;

    let reopened = Arc::new(FileStore::open(&path)?);
    let header = format::read_header(&*reopened)?;
    assert_eq!(header.version.to_string(), "000.000.001");
    assert_eq!(header.byte_order, ByteOrder::Little);
    let device = CounterBlockDevice::open(reopened.clone(), &config())?;
    assert_eq!(device.logical_capacity(), 100);

    let mut block0 = vec![0u8; BLOCK_SIZE];
    reopened.read_block(0, &mut block0)?;
    block0[0] ^= 0xff;
    reopened.write_block(0, &block0)?;
    assert!(matches!(
        format::read_header(&*reopened),
        Err(CbdError::CorruptHeader(_))
    ));
    assert!(matches!(
        CounterBlockDevice::open(reopened, &config()),
        Err(CbdError::CorruptHeader(_))
    ));
    Ok(())
}

#[test]
fn reformat_requires_force() {
    let (store, device) = mem_device(10);
    device.write_logical_block(3, &block_of(1)).unwrap();

    let again = CounterBlockDevice::format(store.clone(), &config());
    assert!(matches!(again, Err(CbdError::Format(_))));
    assert!(matches!(
        format::write_header(&*store, ByteOrder::Big, false),
        Err(CbdError::Format(_))
    ));

    let forced = DeviceConfig {
        force_reformat: true,
        byte_order: ByteOrder::Big,
        ..config()
    };
    let device = CounterBlockDevice::format(store.clone(), &forced).unwrap();
    assert_eq!(device.header().byte_order, ByteOrder::Big);
    assert_eq!(device.counter(3).unwrap(), 0, "reformat zeroes counters");
}

#[test]
fn format_writes_counters_before_header() {
    let store = Arc::new(MemStore::new(Layout::physical_blocks_for(3000)));
    CounterBlockDevice::format(store.clone(), &config()).unwrap();
    assert_eq!(store.journal(), vec![1, 1026, 2051, 0]);
}

// ── write path ────────────────────────────────────────────────────────────

#[test]
fn write_then_read_returns_data_and_bumps_counter() {
    let (_store, device) = mem_device(2048);
    let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 7 % 256) as u8).collect();

    assert_eq!(device.counter(1500).unwrap(), 0);
    assert_eq!(device.write_logical_block(1500, &data).unwrap(), 1);
    assert_eq!(device.read_logical_block(1500).unwrap(), data);
    assert_eq!(device.counter(1500).unwrap(), 1);

    assert_eq!(device.write_logical_block(1500, &block_of(0)).unwrap(), 2);
    assert_eq!(device.read_logical_block(1500).unwrap(), block_of(0));
}

#[test]
fn two_segment_scenario_orders_counter_before_data() {
    let (store, device) = mem_device(2048);
    assert_eq!(device.segments(), 2);

    device.write_logical_block(0, &block_of(0xA0)).unwrap();
    device.write_logical_block(1025, &block_of(0xA1)).unwrap();

    // counter block 1 then data block 2; counter block 1026 then data block 1028
    assert_eq!(store.journal(), vec![1, 2, 1026, 1028]);

    let seg0 = raw_counters(&store, 0, ByteOrder::Little);
    assert_eq!(seg0.get(0), 1);
    assert_eq!(seg0.total(), 1);
    let seg1 = raw_counters(&store, 1, ByteOrder::Little);
    assert_eq!(seg1.get(1), 1);
    assert_eq!(seg1.total(), 1);

    assert_eq!(changed(&device, &Snapshot::zeroed(2)), vec![0, 1025]);
}

#[test]
fn counter_write_failure_skips_data_and_poisons() {
    let (store, device) = mem_device(2048);
    store.fail_writes_at(Layout::counter_block(0));

    match device.write_logical_block(7, &block_of(9)) {
        Err(CbdError::StorageWrite { block, .. }) => assert_eq!(block, 1),
        other => panic!("expected StorageWrite, got {other:?}"),
    }
    assert!(store.journal().is_empty(), "data block must not be written");
    assert!(device.is_poisoned());
    assert!(matches!(
        device.write_logical_block(1030, &block_of(9)),
        Err(CbdError::Poisoned)
    ));
    // reads and enumeration keep working
    assert_eq!(device.read_logical_block(7).unwrap(), block_of(0));
    assert!(changed(&device, &Snapshot::zeroed(2)).is_empty());

    store.clear_faults();
    let report = device.revalidate(false).unwrap();
    assert!(!device.is_poisoned());
    assert_eq!(report.segments_checked, 2);
    assert!(report.cache_discarded >= 1);

    // the unpersisted increment was discarded
    assert_eq!(device.counter(7).unwrap(), 0);
    assert_eq!(device.write_logical_block(7, &block_of(9)).unwrap(), 1);
}

#[test]
fn poisoned_sync_never_persists_a_failed_increment() {
    let (store, device) = mem_device(2048);
    store.fail_writes_at(Layout::counter_block(0));
    assert!(device.write_logical_block(7, &block_of(9)).is_err());
    store.clear_faults();

    // the cached view matches what the store holds
    assert_eq!(device.counter(7).unwrap(), 0);
    assert!(!device.cache().is_dirty(0));

    assert!(matches!(device.sync(), Err(CbdError::Poisoned)));
    assert_eq!(device.cache().flush_all().unwrap(), 0);
    assert!(store.journal().is_empty());
    assert_eq!(raw_counters(&store, 0, ByteOrder::Little).get(7), 0);
    assert_eq!(device.read_logical_block(7).unwrap(), block_of(0));
}

#[test]
fn failed_flush_is_not_written_back_by_the_next_writer() {
    let (store, device) = mem_device(2048);
    let cache = device.cache();
    store.fail_writes_at(Layout::counter_block(0));

    let first = cache.with_segment(0, |entry| {
        entry.counters_mut().increment(7);
        entry.mark_dirty();
        entry.flush()
    });
    assert!(matches!(first, Err(CbdError::StorageWrite { block: 1, .. })));
    store.clear_faults();

    // a second writer on the same segment flushes successfully
    cache
        .with_segment(0, |entry| {
            entry.counters_mut().increment(8);
            entry.mark_dirty();
            entry.flush()
        })
        .unwrap();

    let persisted = raw_counters(&store, 0, ByteOrder::Little);
    assert_eq!(persisted.get(7), 0);
    assert_eq!(persisted.get(8), 1);
    assert_eq!(store.journal(), vec![Layout::counter_block(0)]);
}

#[test]
fn failed_batch_leaves_counters_untouched() {
    let (store, device) = mem_device(2048);
    store.fail_writes_at(Layout::counter_block(1));

    assert!(device.write_logical_blocks(1020, &block_of(2).repeat(8)).is_err());
    store.clear_faults();
    device.revalidate(false).unwrap();

    // the first segment's run was fully written before the failure
    assert_eq!(changed(&device, &Snapshot::zeroed(2)), vec![1020, 1021, 1022, 1023]);
    for logical in 1024..1028 {
        assert_eq!(device.counter(logical).unwrap(), 0);
        assert_eq!(device.read_logical_block(logical).unwrap(), block_of(0));
    }
}

#[test]
fn data_write_failure_leaves_a_safe_overcount() {
    let (store, device) = mem_device(2048);
    let target = device.layout().to_physical(42).unwrap();
    let baseline = device.snapshot().unwrap();
    store.fail_writes_at(target.data_block);

    assert!(matches!(
        device.write_logical_block(42, &block_of(1)),
        Err(CbdError::StorageWrite { block, .. }) if block == target.data_block
    ));
    assert!(device.is_poisoned());
    assert_eq!(store.journal(), vec![target.counter_block]);

    store.clear_faults();
    device.revalidate(true).unwrap();
    assert_eq!(changed(&device, &baseline), vec![42]);
}

#[test]
fn full_segment_batch_flushes_counters_once() {
    let (store, device) = mem_device(2048);
    let data: Vec<u8> = (0..DATA_BLOCKS_PER_SEGMENT as usize)
        .flat_map(|i| vec![(i % 256) as u8; BLOCK_SIZE])
        .collect();

    device.write_logical_blocks(1024, &data).unwrap();

    let journal = store.journal();
    assert_eq!(journal.len(), 1 + 1024);
    assert_eq!(journal[0], Layout::counter_block(1));
    assert!(journal[1..].windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(device.read_logical_block(1024 + 300).unwrap(), block_of(44));

    let seg1 = raw_counters(&store, 1, ByteOrder::Little);
    assert!(seg1.as_slice().iter().all(|&c| c == 1));
}

#[test]
fn batch_crossing_segments_flushes_each_segment() {
    let (store, device) = mem_device(2048);
    let data = block_of(5).repeat(4);
    device.write_logical_blocks(1022, &data).unwrap();

    assert_eq!(store.journal(), vec![1, 1024, 1025, 1026, 1027, 1028]);
    assert_eq!(changed(&device, &Snapshot::zeroed(2)), vec![1022, 1023, 1024, 1025]);
}

#[test]
fn batch_is_validated_before_any_write() {
    let (store, device) = mem_device(100);
    assert!(matches!(
        device.write_logical_blocks(98, &block_of(1).repeat(3)),
        Err(CbdError::OutOfRange { index: 100, capacity: 100 })
    ));
    assert!(matches!(
        device.write_logical_blocks(0, &[0u8; 100]),
        Err(CbdError::InvalidBlockLength { len: 100, .. })
    ));
    assert!(store.journal().is_empty());
}

#[test]
fn rejects_bad_indices_and_lengths() {
    let (_store, device) = mem_device(100);
    assert!(matches!(
        device.write_logical_block(100, &block_of(1)),
        Err(CbdError::OutOfRange { index: 100, capacity: 100 })
    ));
    assert!(matches!(
        device.read_logical_block(u64::MAX),
        Err(CbdError::OutOfRange { .. })
    ));
    assert!(matches!(
        device.write_logical_block(0, &[1u8; 512]),
        Err(CbdError::InvalidBlockLength { len: 512, .. })
    ));
}

#[test]
fn big_endian_devices_store_big_endian_counters() {
    let store = Arc::new(MemStore::new(Layout::physical_blocks_for(10)));
    let big = DeviceConfig {
        byte_order: ByteOrder::Big,
        ..config()
    };
    let device = CounterBlockDevice::format(store.clone(), &big).unwrap();
    device.write_logical_block(1, &block_of(3)).unwrap();

    let raw = store.raw_block(1);
    assert_eq!(&raw[4..8], &[0, 0, 0, 1]);

    // reopening with a different configured order still follows the header
    let reopened = CounterBlockDevice::open(store, &config()).unwrap();
    assert_eq!(reopened.header().byte_order, ByteOrder::Big);
    assert_eq!(reopened.counter(1).unwrap(), 1);
}

#[test]
fn counter_wraparound_is_tolerated_and_still_detected() {
    let store = Arc::new(MemStore::new(Layout::physical_blocks_for(10)));
    CounterBlockDevice::format(store.clone(), &config()).unwrap();

    let mut counters = CounterBlock::zeroed();
    counters.set(4, u32::MAX);
    counters
        .write_to(&*store, ByteOrder::Little, 0)
        .unwrap();

    let device = CounterBlockDevice::open(store, &config()).unwrap();
    let baseline = device.snapshot().unwrap();
    assert_eq!(device.write_logical_block(4, &block_of(1)).unwrap(), 0);
    assert_eq!(changed(&device, &baseline), vec![4]);
}

// ── cache ─────────────────────────────────────────────────────────────────

#[test]
fn cache_stays_bounded_and_refuses_dirty_eviction() {
    let store = Arc::new(MemStore::new(Layout::physical_blocks_for(5 * 1024)));
    let small = DeviceConfig {
        cache_segments: 2,
        ..config()
    };
    let device = CounterBlockDevice::format(store, &small).unwrap();
    for segment in 0..5 {
        device
            .write_logical_block(segment * 1024, &block_of(1))
            .unwrap();
    }
    assert!(device.cache().resident() <= 2);

    let cache = device.cache();
    cache
        .with_segment(4, |entry| {
            entry.counters_mut().increment(9);
            entry.mark_dirty();
            Ok(())
        })
        .unwrap();
    assert!(cache.is_dirty(4));
    assert!(matches!(cache.evict(4), Err(CbdError::EvictDirty { segment: 4 })));

    assert!(cache.flush(4).unwrap());
    assert!(!cache.is_dirty(4));
    assert!(cache.evict(4).unwrap());
    assert!(!cache.evict(4).unwrap());
    assert_eq!(device.counter(4 * 1024 + 9).unwrap(), 1);
}

#[test]
fn sync_flushes_leftover_dirty_blocks() {
    let (store, device) = mem_device(2048);
    device
        .cache()
        .with_segment(1, |entry| {
            entry.counters_mut().increment(0);
            entry.mark_dirty();
            Ok(())
        })
        .unwrap();
    device.sync().unwrap();
    assert_eq!(store.journal(), vec![Layout::counter_block(1)]);
    assert_eq!(raw_counters(&store, 1, ByteOrder::Little).get(0), 1);
}

#[test]
fn concurrent_writers_never_lose_increments() {
    let (_store, device) = mem_device(2048);
    const THREADS: u64 = 4;
    const WRITES: u64 = 50;

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let device = &device;
            scope.spawn(move || {
                for i in 0..WRITES {
                    // every thread hammers logical 10, plus its own block in
                    // each segment
                    device.write_logical_block(10, &block_of(t as u8)).unwrap();
                    device
                        .write_logical_block(1024 + t * WRITES + i, &block_of(1))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(device.counter(10).unwrap(), (THREADS * WRITES) as u32);
    let expected: Vec<u64> = std::iter::once(10)
        .chain(1024..1024 + THREADS * WRITES)
        .collect();
    assert_eq!(changed(&device, &Snapshot::zeroed(2)), expected);
}

#[test]
fn scans_alongside_writers_report_every_completed_write() {
    let (_store, device) = mem_device(4 * 1024);
    let baseline = device.snapshot().unwrap();
    let completed = Mutex::new(BTreeSet::new());
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let writers: Vec<_> = (0..3u64)
            .map(|t| {
                let (device, completed) = (&device, &completed);
                scope.spawn(move || {
                    for i in 0..200u64 {
                        let logical = (t * 1361 + i * 17) % (4 * 1024);
                        device.write_logical_block(logical, &block_of(t as u8)).unwrap();
                        completed.lock().insert(logical);
                    }
                })
            })
            .collect();

        let scanner = scope.spawn(|| {
            let mut scans = 0;
            while scans == 0 || !done.load(Ordering::Acquire) {
                let finished_before_scan = completed.lock().clone();
                let reported: BTreeSet<u64> = changed(&device, &baseline).into_iter().collect();
                assert!(
                    finished_before_scan.is_subset(&reported),
                    "scan {scans} missed a completed write"
                );
                scans += 1;
            }
        });

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        scanner.join().unwrap();
    });

    let reported: BTreeSet<u64> = changed(&device, &baseline).into_iter().collect();
    assert_eq!(reported, completed.into_inner());
}

// ── change-set enumeration ────────────────────────────────────────────────

#[test]
fn fresh_snapshot_reports_nothing() {
    let (_store, device) = mem_device(3000);
    device.write_logical_block(17, &block_of(1)).unwrap();
    device.write_logical_block(2999, &block_of(1)).unwrap();
    let snapshot = device.snapshot().unwrap();
    assert_eq!(snapshot.len() as u64, device.segments());
    assert!(changed(&device, &snapshot).is_empty());
}

#[test]
fn reports_exactly_the_written_set() {
    let (_store, device) = mem_device(3000);
    let baseline = device.snapshot().unwrap();
    let written: BTreeSet<u64> = [0, 5, 1023, 1024, 2047, 2500, 2999].into_iter().collect();
    for &logical in &written {
        device.write_logical_block(logical, &block_of(2)).unwrap();
    }
    // rewriting a block still reports it once
    device.write_logical_block(5, &block_of(3)).unwrap();

    let reported: BTreeSet<u64> = changed(&device, &baseline).into_iter().collect();
    assert_eq!(reported, written);
}

#[test]
fn segments_missing_from_baseline_are_fully_changed() {
    // two full segments plus a 10-block tail segment
    let (_store, device) = mem_device(2048 + 10);
    assert_eq!(device.segments(), 3);
    let mut baseline = device.snapshot().unwrap();
    baseline.remove(1);
    baseline.remove(2);

    let reported = changed(&device, &baseline);
    let expected: Vec<u64> = (1024..2058).collect();
    assert_eq!(reported, expected);

    let summary = device.summarize_changes(&baseline).unwrap();
    assert_eq!(summary.total, 1024 + 10);
    assert_eq!(summary.segments_without_baseline, 2);
    assert_eq!(summary.per_segment.get(&2), Some(&10));
    assert_eq!(summary.per_segment.get(&0), None);
}

#[test]
fn sparse_baseline_reports_unobserved_offsets() {
    let (_store, device) = mem_device(1024);
    device.write_logical_block(2, &block_of(1)).unwrap();

    let mut baseline = Snapshot::new();
    for offset in 0..1024 {
        if offset != 700 {
            baseline.observe(0, offset, 0).unwrap();
        }
    }
    baseline.observe(0, 2, 1).unwrap();
    assert!(matches!(baseline.segment(0), Some(SegmentBaseline::Sparse(_))));

    assert_eq!(changed(&device, &baseline), vec![700]);
}

#[test]
fn read_failure_ends_scan_and_scan_can_resume() {
    let (store, device) = mem_device(3 * 1024);
    device.write_logical_block(5, &block_of(1)).unwrap();
    device.write_logical_block(2048 + 5, &block_of(1)).unwrap();
    let baseline = Snapshot::zeroed(3);

    store.fail_reads_at(Layout::counter_block(1));
    let mut scan = device.changed_since(&baseline);
    assert_eq!(scan.next().unwrap().unwrap(), 5);
    match scan.next() {
        Some(Err(CbdError::StorageRead { block, .. })) => assert_eq!(block, 1026),
        other => panic!("expected StorageRead, got {other:?}"),
    }
    assert!(scan.next().is_none());
    let resume_at = scan.next_segment();
    assert_eq!(resume_at, 1);

    store.clear_faults();
    let rest: Vec<u64> = device
        .changed_since_from(&baseline, resume_at)
        .collect::<cbd_core::Result<_>>()
        .unwrap();
    assert_eq!(rest, vec![2048 + 5]);
}

#[test]
fn persisted_snapshot_drives_the_next_incremental_pass() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let image = dir.path().join("device.img");
    let snap_path = dir.path().join("base.snap");

    {
        let store = Arc::new(FileStore::create(&image, Layout::physical_blocks_for(4096))?);
        let device = CounterBlockDevice::format(store, &config())?;
        device.write_logical_block(100, &block_of(1))?;
        device.snapshot()?.save(&snap_path)?;
        device.write_logical_block(100, &block_of(2))?;
        device.write_logical_block(3000, &block_of(3))?;
        device.sync()?;
    }

    let store = Arc::new(FileStore::open(&image)?);
    let device = CounterBlockDevice::open(store, &config())?;
    let baseline = Snapshot::load(&snap_path)?;
    let reported: Vec<u64> = device
        .changed_since(&baseline)
        .collect::<cbd_core::Result<_>>()?;
    assert_eq!(reported, vec![100, 3000]);
    assert_eq!(device.read_logical_block(3000)?, block_of(3));
    Ok(())
}

#[test]
fn revalidate_scans_every_block() {
    let (_store, device) = mem_device(1030);
    device.write_logical_block(1029, &block_of(1)).unwrap();
    let report = device.revalidate(true).unwrap();
    assert_eq!(report.segments_checked, 2);
    assert_eq!(report.data_blocks_checked, 1030);
    assert_eq!(report.touched_blocks, 1);
    assert_eq!(report.stray_counters, 0);
}

#[test]
fn configured_size_must_fit_the_store() {
    let store = Arc::new(MemStore::new(100));
    let too_big = DeviceConfig {
        physical_blocks: Some(101),
        ..config()
    };
    assert!(matches!(
        CounterBlockDevice::format(store.clone(), &too_big),
        Err(CbdError::InvalidGeometry(_))
    ));

    let partial = DeviceConfig {
        physical_blocks: Some(50),
        ..config()
    };
    let device = CounterBlockDevice::format(store, &partial).unwrap();
    assert_eq!(device.logical_capacity(), 48);
}
