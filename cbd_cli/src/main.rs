use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cbd_core::format::DATA_BLOCKS_PER_SEGMENT;
use cbd_core::{
    BlockStore, ByteOrder, CounterBlockDevice, DeviceConfig, Layout, SegmentBaseline, Snapshot,
    BLOCK_SIZE,
};
use cbd_stores::{store_from_spec, FileStore};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "cbd",
    about = "Counter block device: format images, write through per-block counters, and list blocks changed since a snapshot",
    version
)]
struct Cli {
    /// Device configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Counter blocks kept in memory (overrides the config file)
    #[arg(long, global = true)]
    cache_segments: Option<usize>,
    /// Raise log verbosity (-v info, -vv debug); RUST_LOG applies otherwise
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or resize an image and format it
    Format {
        /// Image file (or mem:<blocks> for a dry run)
        image: PathBuf,
        /// Physical blocks in the image, header and counter blocks included
        #[arg(short, long)]
        blocks: Option<u64>,
        /// Counter byte order: little | big | native
        #[arg(long)]
        byte_order: Option<ByteOrder>,
        /// Overwrite an existing header
        #[arg(long)]
        force: bool,
    },
    /// Print header, geometry, and optionally per-segment write totals
    Inspect {
        image: PathBuf,
        /// Print one line per segment
        #[arg(long)]
        segments: bool,
    },
    /// Write one logical block
    Write {
        image: PathBuf,
        /// Logical block index
        #[arg(short, long)]
        index: u64,
        /// Source file ("-" reads stdin); padded with zeros or truncated to one block
        #[arg(long)]
        input: PathBuf,
    },
    /// Read one logical block
    Read {
        image: PathBuf,
        /// Logical block index
        #[arg(short, long)]
        index: u64,
        /// Write raw bytes to a file instead of printing a hex dump
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Save the current counters as a baseline snapshot
    Snapshot {
        image: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List logical blocks changed since a snapshot
    Changed {
        image: PathBuf,
        /// Baseline snapshot file
        #[arg(long)]
        since: PathBuf,
        /// Emit JSON instead of one index per line
        #[arg(long)]
        json: bool,
    },
    /// Copy blocks changed since a snapshot into a flat delta file
    ///
    /// Each record is the logical index (u64, little-endian) followed by the
    /// 4096-byte block.
    Export {
        image: PathBuf,
        #[arg(long)]
        since: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run the consistency pass: header, every counter block, optionally every data block
    Verify {
        image: PathBuf,
        /// Also read every data block
        #[arg(long)]
        data: bool,
    },
    /// Benchmark random logical block writes
    Bench {
        image: PathBuf,
        /// Number of random blocks to write
        #[arg(short, long, default_value_t = 1000)]
        count: u64,
        /// Fixed random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<DeviceConfig> {
    let mut config = match &cli.config {
        Some(path) => DeviceConfig::load(path)
            .with_context(|| format!("loading configuration {:?}", path))?,
        None => DeviceConfig::default(),
    };
    if let Some(segments) = cli.cache_segments {
        config.cache_segments = segments;
    }
    tracing::debug!(?config, "resolved device configuration");
    Ok(config)
}

fn open_device(image: &Path, config: &DeviceConfig) -> anyhow::Result<CounterBlockDevice> {
    let store = store_from_spec(image).with_context(|| format!("opening image {:?}", image))?;
    CounterBlockDevice::open(store, config)
        .with_context(|| format!("opening counter block device {:?}", image))
}

fn load_snapshot(path: &Path) -> anyhow::Result<Snapshot> {
    Snapshot::load(path).with_context(|| format!("loading snapshot {:?}", path))
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn hex_dump(index: u64, raw: &[u8]) {
    let preview = &raw[..raw.len().min(256)];
    println!("--- block {} ({} bytes, first {} shown) ---", index, raw.len(), preview.len());
    for (i, chunk) in preview.chunks(16).enumerate() {
        print!("  {:04x}  ", i * 16);
        for b in chunk {
            print!("{:02x} ", b);
        }
        for _ in chunk.len()..16 {
            print!("   ");
        }
        print!("  |");
        for b in chunk {
            if b.is_ascii_graphic() || *b == b' ' {
                print!("{}", *b as char);
            } else {
                print!(".");
            }
        }
        println!("|");
    }
    if raw.len() > 256 {
        println!("  ... ({} bytes remaining not shown)", raw.len() - 256);
    }
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_format(
    image: PathBuf,
    blocks: Option<u64>,
    byte_order: Option<ByteOrder>,
    force: bool,
    mut config: DeviceConfig,
) -> anyhow::Result<()> {
    if let Some(order) = byte_order {
        config.byte_order = order;
    }
    config.force_reformat |= force;

    let is_memory = image.to_str().is_some_and(|s| s.starts_with("mem:"));
    let store: Arc<dyn BlockStore> = match blocks.or(config.physical_blocks) {
        Some(blocks) if !is_memory => Arc::new(
            FileStore::create_for_format(&image, blocks, config.force_reformat)
                .with_context(|| format!("sizing image {:?} to {} blocks", image, blocks))?,
        ),
        _ => store_from_spec(&image).with_context(|| format!("opening image {:?}", image))?,
    };
    config.physical_blocks = blocks.or(config.physical_blocks);

    let t0 = Instant::now();
    let device = CounterBlockDevice::format(store, &config)
        .with_context(|| format!("formatting {:?}", image))?;
    let elapsed = t0.elapsed();
    let layout = device.layout();

    eprintln!("  image       : {:?}", image);
    eprintln!("  byte order  : {}", device.header().byte_order);
    eprintln!("  physical    : {} blocks", layout.physical_blocks());
    eprintln!("  segments    : {}", layout.segments());
    eprintln!(
        "  capacity    : {} blocks ({})",
        layout.logical_capacity(),
        human_bytes(layout.logical_capacity() * BLOCK_SIZE as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_inspect(image: PathBuf, show_segments: bool, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let header = device.header();
    let layout = device.layout();

    println!("=== Counter block device: {:?} ===", image);
    println!();
    println!("  store          : {}", device.store_name());
    println!("  format version : {}", header.version);
    println!("  byte order     : {}", header.byte_order);
    println!("  physical       : {} blocks", layout.physical_blocks());
    println!("  segments       : {}", layout.segments());
    println!(
        "  capacity       : {} blocks ({})",
        layout.logical_capacity(),
        human_bytes(layout.logical_capacity() * BLOCK_SIZE as u64)
    );
    let tail = layout.segment_len(layout.segments().saturating_sub(1));
    if tail < DATA_BLOCKS_PER_SEGMENT {
        println!("  tail segment   : {} data blocks", tail);
    }

    if show_segments {
        let snapshot = device.snapshot()?;
        println!();
        println!(
            "  {:>8}  {:>12}  {:>10}  {:>10}  {:>14}",
            "segment", "counter blk", "blocks", "touched", "writes"
        );
        println!("  {}", "-".repeat(62));
        for (segment, baseline) in snapshot.iter() {
            let SegmentBaseline::Full(counters) = baseline else {
                continue;
            };
            let len = layout.segment_len(segment) as usize;
            let live = &counters.as_slice()[..len];
            println!(
                "  {:>8}  {:>12}  {:>10}  {:>10}  {:>14}",
                segment,
                Layout::counter_block(segment),
                len,
                live.iter().filter(|&&c| c != 0).count(),
                live.iter().map(|&c| c as u64).sum::<u64>()
            );
        }
    }
    Ok(())
}

fn run_write(image: PathBuf, index: u64, input: PathBuf, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;

    let mut block = Vec::with_capacity(BLOCK_SIZE);
    if input.to_str() == Some("-") {
        io::stdin().lock().take(BLOCK_SIZE as u64).read_to_end(&mut block)?;
    } else {
        File::open(&input)
            .with_context(|| format!("opening input file {:?}", input))?
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut block)?;
    }
    let supplied = block.len();
    block.resize(BLOCK_SIZE, 0);

    let t0 = Instant::now();
    let counter = device.write_logical_block(index, &block)?;
    device.sync()?;
    let elapsed = t0.elapsed();

    eprintln!("  block       : {}", index);
    eprintln!("  input       : {} (padded to {})", human_bytes(supplied as u64), human_bytes(BLOCK_SIZE as u64));
    eprintln!("  counter     : {}", counter);
    eprintln!("  elapsed     : {:.3}ms", elapsed.as_secs_f64() * 1000.0);
    Ok(())
}

fn run_read(image: PathBuf, index: u64, output: Option<PathBuf>, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let addr = device.layout().to_physical(index)?;
    eprintln!(
        "reading logical block {} (physical {}, segment {})...",
        index, addr.data_block, addr.segment
    );

    let t0 = Instant::now();
    let raw = device.read_logical_block(index)?;
    let elapsed = t0.elapsed();
    eprintln!(
        "  read {} in {:.3}ms, counter {}",
        human_bytes(raw.len() as u64),
        elapsed.as_secs_f64() * 1000.0,
        device.counter(index)?
    );

    match output {
        Some(path) => {
            std::fs::write(&path, &raw)?;
            eprintln!("  written to {:?}", path);
        }
        None => hex_dump(index, &raw),
    }
    Ok(())
}

fn run_snapshot(image: PathBuf, output: PathBuf, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let t0 = Instant::now();
    let snapshot = device.snapshot()?;
    snapshot
        .save(&output)
        .with_context(|| format!("writing snapshot {:?}", output))?;
    let elapsed = t0.elapsed();

    eprintln!("  segments    : {}", snapshot.len());
    eprintln!("  file        : {}", human_bytes(std::fs::metadata(&output)?.len()));
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_changed(image: PathBuf, since: PathBuf, json: bool, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let baseline = load_snapshot(&since)?;

    let t0 = Instant::now();
    let changed = device
        .changed_since(&baseline)
        .collect::<cbd_core::Result<Vec<u64>>>()?;
    let elapsed = t0.elapsed();

    if json {
        let out = serde_json::json!({
            "image": image.display().to_string(),
            "since": since.display().to_string(),
            "logical_capacity": device.logical_capacity(),
            "count": changed.len(),
            "changed": changed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for logical in &changed {
            writeln!(out, "{}", logical)?;
        }
    }

    eprintln!(
        "  {} of {} blocks changed ({}), scanned in {:.3}ms",
        changed.len(),
        device.logical_capacity(),
        human_bytes(changed.len() as u64 * BLOCK_SIZE as u64),
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}

fn run_export(image: PathBuf, since: PathBuf, output: PathBuf, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let baseline = load_snapshot(&since)?;
    let mut dst = BufWriter::new(
        File::create(&output).with_context(|| format!("creating delta file {:?}", output))?,
    );

    let t0 = Instant::now();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut exported = 0u64;
    for logical in device.changed_since(&baseline) {
        let logical = logical?;
        device.read_logical_block_into(logical, &mut buf)?;
        dst.write_all(&logical.to_le_bytes())?;
        dst.write_all(&buf)?;
        exported += 1;
    }
    dst.flush()?;
    let elapsed = t0.elapsed();

    let bytes = exported * BLOCK_SIZE as u64;
    eprintln!("  blocks      : {}", exported);
    eprintln!("  delta size  : {}", human_bytes(std::fs::metadata(&output)?.len()));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((bytes as f64 / elapsed.as_secs_f64().max(1e-9)) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_verify(image: PathBuf, data: bool, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let t0 = Instant::now();
    let report = device
        .revalidate(data)
        .with_context(|| format!("verifying {:?}", image))?;
    let elapsed = t0.elapsed();

    println!("=== Verify: {:?} ===", image);
    println!("  segments checked    : {}", report.segments_checked);
    println!("  data blocks checked : {}", report.data_blocks_checked);
    println!("  blocks ever written : {}", report.touched_blocks);
    println!("  stray counters      : {}", report.stray_counters);
    println!("  elapsed             : {:.3}s", elapsed.as_secs_f64());
    if report.stray_counters > 0 {
        anyhow::bail!(
            "{} non-zero counters past the end of the tail segment",
            report.stray_counters
        );
    }
    Ok(())
}

fn run_bench(image: PathBuf, count: u64, seed: u64, config: &DeviceConfig) -> anyhow::Result<()> {
    let device = open_device(&image, config)?;
    let capacity = device.logical_capacity();
    if count == 0 {
        anyhow::bail!("nothing to benchmark: --count is 0");
    }

    // Simple LCG for reproducible random block indices (no external dep)
    let indices: Vec<u64> = {
        let mut rng = seed;
        (0..count)
            .map(|_| {
                rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (rng >> 33) % capacity
            })
            .collect()
    };

    eprintln!(
        "benchmarking {} random block writes across {} blocks...",
        count, capacity
    );

    let mut block = vec![0u8; BLOCK_SIZE];
    let t0 = Instant::now();
    let mut latencies_us: Vec<u64> = Vec::with_capacity(count as usize);
    for (n, &idx) in indices.iter().enumerate() {
        block[..8].copy_from_slice(&(n as u64).to_le_bytes());
        let t = Instant::now();
        device.write_logical_block(idx, &block)?;
        latencies_us.push(t.elapsed().as_micros() as u64);
    }
    device.sync()?;

    let elapsed = t0.elapsed();
    latencies_us.sort_unstable();

    let pct = |p: f64| latencies_us[((latencies_us.len() as f64 * p) as usize).min(latencies_us.len() - 1)];
    let total = count * BLOCK_SIZE as u64;

    println!();
    println!("=== Random Block Write Benchmark ===");
    println!("  blocks written : {}", count);
    println!("  total data     : {}", human_bytes(total));
    println!("  cached counters: {} of {}", device.cache().resident(), device.segments());
    println!("  elapsed        : {:.3}s", elapsed.as_secs_f64());
    println!(
        "  throughput     : {}/s",
        human_bytes((total as f64 / elapsed.as_secs_f64()) as u64)
    );
    println!("  latency:");
    println!("    min  : {} µs", pct(0.0));
    println!("    p50  : {} µs", pct(0.5));
    println!("    p95  : {} µs", pct(0.95));
    println!("    p99  : {} µs", pct(0.99));
    println!("    max  : {} µs", pct(1.0));
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Format {
            image,
            blocks,
            byte_order,
            force,
        } => run_format(image, blocks, byte_order, force, config),
        Commands::Inspect { image, segments } => run_inspect(image, segments, &config),
        Commands::Write { image, index, input } => run_write(image, index, input, &config),
        Commands::Read {
            image,
            index,
            output,
        } => run_read(image, index, output, &config),
        Commands::Snapshot { image, output } => run_snapshot(image, output, &config),
        Commands::Changed { image, since, json } => run_changed(image, since, json, &config),
        Commands::Export {
            image,
            since,
            output,
        } => run_export(image, since, output, &config),
        Commands::Verify { image, data } => run_verify(image, data, &config),
        Commands::Bench { image, count, seed } => run_bench(image, count, seed, &config),
    }
}
