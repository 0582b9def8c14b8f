//! Counter Block Device Demo
//!
//! Formats a 64 MB image, fills it, takes a baseline snapshot, then runs a
//! random write workload. It then shows what an incremental backup costs with
//! per-block counters compared with a full read of the device, replays the
//! delta onto a copy of the baseline image, and checks the copy matches.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use cbd_core::{ByteOrder, CbdError, CounterBlockDevice, DeviceConfig, Layout, Snapshot, BLOCK_SIZE};
use cbd_stores::{FileStore, MemStore};

// ── constants ──────────────────────────────────────────────────────────────

const SEGMENTS: u64 = 16;
const LOGICAL_BLOCKS: u64 = SEGMENTS * 1024;
/// Random writes issued between the two backups.
const WORKLOAD_WRITES: u64 = 600;
/// Share of workload writes aimed at a small hot set.
const HOT_SET: u64 = 32;

// ── data generator ─────────────────────────────────────────────────────────

/// Deterministic block contents for `(logical, generation)`.
fn block_contents(logical: u64, generation: u64, buf: &mut [u8]) {
    let mut state = logical
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(generation.wrapping_mul(0xBF58_476D_1CE4_E5B9));
    for chunk in buf.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    buf[..8].copy_from_slice(&logical.to_le_bytes());
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

// ── formatting helpers ─────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const U: &[&str] = &["B", "KB", "MB", "GB"];
    let mut v = n as f64;
    let mut u = 0;
    while v >= 1024.0 && u < U.len() - 1 { v /= 1024.0; u += 1; }
    if u == 0 { format!("{n} B") } else { format!("{v:.2} {}", U[u]) }
}

fn fmt_duration(d: Duration) -> String {
    let ms = d.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        format!("{:.1} µs", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("{ms:.1} ms")
    } else {
        format!("{:.2} s", d.as_secs_f64())
    }
}

fn speedup(slow: Duration, fast: Duration) -> f64 {
    slow.as_secs_f64() / fast.as_secs_f64().max(1e-9)
}

fn section(title: &str) {
    println!("━━━ {title} {}", "━".repeat(70usize.saturating_sub(title.len() + 5)));
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 { out.push(','); }
        out.push(c);
    }
    out.chars().rev().collect()
}

fn timed_step<T, F: FnOnce() -> Result<T>>(label: &str, f: F) -> Result<(T, Duration)> {
    eprint!("  {label:<32} ");
    let t0 = Instant::now();
    let r = f()?;
    let elapsed = t0.elapsed();
    eprintln!("done  ({})", fmt_duration(elapsed));
    Ok((r, elapsed))
}

// ── phases ─────────────────────────────────────────────────────────────────

fn fill(device: &CounterBlockDevice) -> Result<()> {
    let mut run = vec![0u8; 1024 * BLOCK_SIZE];
    for segment in 0..device.segments() {
        let range = device.layout().segment_logical_range(segment);
        let start = range.start;
        let len = (range.end - range.start) as usize;
        for (i, block) in run[..len * BLOCK_SIZE].chunks_exact_mut(BLOCK_SIZE).enumerate() {
            block_contents(start + i as u64, 0, block);
        }
        device.write_logical_blocks(start, &run[..len * BLOCK_SIZE])?;
    }
    device.sync()?;
    Ok(())
}

fn workload(device: &CounterBlockDevice, seed: u64) -> Result<BTreeSet<u64>> {
    let mut rng = Lcg(seed);
    let mut written = BTreeSet::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    for generation in 1..=WORKLOAD_WRITES {
        let logical = if generation % 3 == 0 {
            rng.next(HOT_SET)
        } else {
            rng.next(device.logical_capacity())
        };
        block_contents(logical, generation, &mut buf);
        device.write_logical_block(logical, &buf)?;
        written.insert(logical);
    }
    device.sync()?;
    Ok(written)
}

fn full_read(device: &CounterBlockDevice) -> Result<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut checksum = 0u64;
    for logical in 0..device.logical_capacity() {
        device.read_logical_block_into(logical, &mut buf)?;
        checksum = checksum.wrapping_add(u64::from_le_bytes(buf[8..16].try_into()?));
    }
    Ok(checksum)
}

/// Copy every block changed since `baseline` from `source` onto `target`.
fn replay_delta(
    source: &CounterBlockDevice,
    target: &CounterBlockDevice,
    baseline: &Snapshot,
) -> Result<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut copied = 0u64;
    for logical in source.changed_since(baseline) {
        let logical = logical?;
        source.read_logical_block_into(logical, &mut buf)?;
        target.write_logical_block(logical, &buf)?;
        copied += 1;
    }
    target.sync()?;
    Ok(copied)
}

fn images_match(a: &CounterBlockDevice, b: &CounterBlockDevice) -> Result<bool> {
    let mut left = vec![0u8; BLOCK_SIZE];
    let mut right = vec![0u8; BLOCK_SIZE];
    for logical in 0..a.logical_capacity() {
        a.read_logical_block_into(logical, &mut left)?;
        b.read_logical_block_into(logical, &mut right)?;
        if left != right {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Fail a counter block write on an in-memory device and walk through
/// poisoning and recovery.
fn failure_walkthrough() -> Result<()> {
    let store = Arc::new(MemStore::new(Layout::physical_blocks_for(2048)));
    let config = DeviceConfig {
        byte_order: ByteOrder::Little,
        ..DeviceConfig::default()
    };
    let device = CounterBlockDevice::format(store.clone(), &config)?;
    store.take_journal();

    let block = vec![0xC3u8; BLOCK_SIZE];
    device.write_logical_block(1025, &block)?;
    println!("  healthy write to logical 1025   → physical writes {:?}", store.take_journal());

    store.fail_writes_at(Layout::counter_block(0));
    match device.write_logical_block(3, &block) {
        Err(CbdError::StorageWrite { block, .. }) => {
            println!("  counter block {block} write fails    → data write skipped, journal {:?}", store.journal())
        }
        other => anyhow::bail!("expected a storage write failure, got {other:?}"),
    }
    match device.write_logical_block(1030, &block) {
        Err(CbdError::Poisoned) => println!("  next write                      → refused: device poisoned"),
        other => anyhow::bail!("expected the device to be poisoned, got {other:?}"),
    }

    store.clear_faults();
    let report = device.revalidate(false)?;
    println!(
        "  revalidate                      → {} segments checked, {} cached block(s) discarded",
        report.segments_checked, report.cache_discarded
    );
    let counter = device.write_logical_block(3, &block)?;
    println!("  retry write to logical 3        → ok, counter now {counter}");
    Ok(())
}

// ── demo runner ────────────────────────────────────────────────────────────

fn run() -> Result<()> {
    let out_dir = std::env::temp_dir().join("cbd_demo");
    std::fs::create_dir_all(&out_dir)?;
    let image_path = out_dir.join("device.img");
    let backup_path = out_dir.join("backup.img");
    let snapshot_path = out_dir.join("baseline.snap");
    let physical = Layout::physical_blocks_for(LOGICAL_BLOCKS);

    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║        Counter Block Device  ·  Incremental Backup Demo          ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    // ── Phase 0: Format ──────────────────────────────────────────────────────
    section("0 · FORMAT");
    let config = DeviceConfig::default();
    let store = Arc::new(FileStore::create(&image_path, physical)?);
    let device = CounterBlockDevice::format(store, &DeviceConfig { force_reformat: true, ..config.clone() })?;
    let layout = device.layout();
    println!("  image          : {}", image_path.display());
    println!("  byte order     : {}", device.header().byte_order);
    println!("  segments       : {} × (1 counter block + 1024 data blocks)", layout.segments());
    println!("  capacity       : {} blocks ({})",
        format_number(layout.logical_capacity()),
        human_bytes(layout.logical_capacity() * BLOCK_SIZE as u64));
    println!("  counter space  : {} ({:.3}% of the image)",
        human_bytes(layout.segments() * BLOCK_SIZE as u64),
        layout.segments() as f64 / layout.physical_blocks() as f64 * 100.0);
    println!();

    // ── Phase 1: Initial fill and full backup ────────────────────────────────
    section("1 · INITIAL FILL + FULL BACKUP");
    timed_step("filling every logical block", || fill(&device))?;
    let (baseline, snap_time) = timed_step("capturing baseline snapshot", || {
        let snapshot = device.snapshot()?;
        snapshot.save(&snapshot_path)?;
        Ok(snapshot)
    })?;
    timed_step("copying image as full backup", || {
        std::fs::copy(&image_path, &backup_path).context("copying image")
    })?;
    println!();
    println!("  snapshot       : {} segments, {} on disk (in {})",
        baseline.len(),
        human_bytes(std::fs::metadata(&snapshot_path)?.len()),
        fmt_duration(snap_time));
    println!();

    // ── Phase 2: Workload ────────────────────────────────────────────────────
    section("2 · WORKLOAD: random writes with a hot set");
    let (written, _) = timed_step("issuing random writes", || workload(&device, 42))?;
    println!();
    println!("  writes issued  : {}", format_number(WORKLOAD_WRITES));
    println!("  distinct blocks: {} ({:.2}% of the device)",
        format_number(written.len() as u64),
        written.len() as f64 / device.logical_capacity() as f64 * 100.0);
    println!();

    // ── Phase 3: Incremental vs full ─────────────────────────────────────────
    section("3 · THE CORE CLAIM: find changed blocks without reading data");
    let baseline = Snapshot::load(&snapshot_path)?;
    let (changed, scan_time) = timed_step("scanning counters", || {
        device
            .changed_since(&baseline)
            .collect::<cbd_core::Result<BTreeSet<u64>>>()
            .map_err(anyhow::Error::from)
    })?;
    let (_, full_time) = timed_step("reading the whole device", || full_read(&device))?;

    let scan_io = device.segments() * BLOCK_SIZE as u64;
    let full_io = device.logical_capacity() * BLOCK_SIZE as u64;
    println!();
    println!("  {:<32}  {:>12}  {:>12}", "Method", "Latency", "I/O read");
    println!("  {}", "─".repeat(62));
    println!("  {:<32}  {:>12}  {:>12}", "counter scan", fmt_duration(scan_time), human_bytes(scan_io));
    println!("  {:<32}  {:>12}  {:>12}", "full device read", fmt_duration(full_time), human_bytes(full_io));
    println!();
    println!("  changed blocks : {} (written set: {}) {}",
        format_number(changed.len() as u64),
        format_number(written.len() as u64),
        if changed == written { "✓ exact match" } else { "⚠ MISMATCH" });
    println!("  scan speedup   : {:.1}×  |  I/O ratio : {:.0}×",
        speedup(full_time, scan_time),
        full_io as f64 / scan_io as f64);
    println!();

    // ── Phase 4: Replay ──────────────────────────────────────────────────────
    section("4 · APPLY DELTA TO THE FULL BACKUP");
    let backup = CounterBlockDevice::open(Arc::new(FileStore::open(&backup_path)?), &config)?;
    let (copied, _) = timed_step("replaying changed blocks", || replay_delta(&device, &backup, &baseline))?;
    let (matches, _) = timed_step("comparing images", || images_match(&device, &backup))?;
    println!();
    println!("  delta          : {} blocks, {}", format_number(copied), human_bytes(copied * BLOCK_SIZE as u64));
    println!("  backup image   : {}", if matches { "✓ identical to the live device" } else { "⚠ differs from the live device" });
    println!();

    // ── Phase 5: Failure handling ────────────────────────────────────────────
    section("5 · STORAGE FAILURE: counter write fails, device poisons, revalidate recovers");
    failure_walkthrough()?;
    println!();

    for p in [&image_path, &backup_path, &snapshot_path] {
        let _ = std::fs::remove_file(p);
    }
    if !matches || changed != written {
        anyhow::bail!("incremental backup did not reproduce the live device");
    }
    Ok(())
}

fn cleanup_hint(dir: &Path) {
    eprintln!("  (scratch files under {})", dir.display());
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        cleanup_hint(&std::env::temp_dir().join("cbd_demo"));
        std::process::exit(1);
    }
}
