use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use xxhash_rust::xxh3::xxh3_64;

use crate::counters::CounterBlock;
use crate::error::{CbdError, Result};
use crate::format::COUNTERS_PER_BLOCK;

/// Baseline counters for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentBaseline {
    /// Every counter of the segment.
    Full(CounterBlock),
    /// Only the counters that were observed; missing offsets count as
    /// changed.
    Sparse(BTreeMap<u16, u32>),
}

impl SegmentBaseline {
    /// Baseline counter at `offset`, if one was recorded.
    pub fn get(&self, offset: usize) -> Option<u32> {
        match self {
            SegmentBaseline::Full(counters) => Some(counters.get(offset)),
            SegmentBaseline::Sparse(observed) => {
                u16::try_from(offset).ok().and_then(|o| observed.get(&o).copied())
            }
        }
    }
}

/// Captured counter values used as the baseline for incremental change
/// detection. Segments without an entry are treated as never backed up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    segments: BTreeMap<u64, SegmentBaseline>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline of a freshly formatted device: all counters zero.
    pub fn zeroed(segments: u64) -> Self {
        let mut snapshot = Self::new();
        for segment in 0..segments {
            snapshot.insert_full(segment, CounterBlock::zeroed());
        }
        snapshot
    }

    pub fn insert_full(&mut self, segment: u64, counters: CounterBlock) {
        self.segments
            .insert(segment, SegmentBaseline::Full(counters));
    }

    /// Record a single observed counter. Creates a sparse baseline for the
    /// segment if none exists.
    pub fn observe(&mut self, segment: u64, offset: usize, value: u32) -> Result<()> {
        if offset >= COUNTERS_PER_BLOCK {
            return Err(CbdError::OutOfRange {
                index: offset as u64,
                capacity: COUNTERS_PER_BLOCK as u64,
            });
        }
        match self
            .segments
            .entry(segment)
            .or_insert_with(|| SegmentBaseline::Sparse(BTreeMap::new()))
        {
            SegmentBaseline::Full(counters) => counters.set(offset, value),
            SegmentBaseline::Sparse(observed) => {
                observed.insert(offset as u16, value);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, segment: u64) -> Option<SegmentBaseline> {
        self.segments.remove(&segment)
    }

    pub fn segment(&self, segment: u64) -> Option<&SegmentBaseline> {
        self.segments.get(&segment)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &SegmentBaseline)> {
        self.segments.iter().map(|(&segment, baseline)| (segment, baseline))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    // ── Persistence ────────────────────────────────────────────────────────

    /// Serialize to the snapshot file format:
    ///
    /// ```text
    /// [HEADER: 48 bytes, little-endian]
    ///   magic[8] "CBDSNAP\n" | version:u16 | flags:u16 | reserved:u32
    ///   records:u64 | raw_len:u64 | payload_len:u64 | xxh3(payload):u64
    /// [PAYLOAD: zstd(records)]
    ///   per record: segment:u64, kind:u8
    ///     kind 0 (full):   1024 × counter:u32
    ///     kind 1 (sparse): count:u16, count × (offset:u16, counter:u32)
    /// ```
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(self.segments.len() * (9 + COUNTERS_PER_BLOCK * 4));
        for (&segment, baseline) in &self.segments {
            raw.extend_from_slice(&segment.to_le_bytes());
            match baseline {
                SegmentBaseline::Full(counters) => {
                    raw.push(RECORD_FULL);
                    for &c in counters.as_slice() {
                        raw.extend_from_slice(&c.to_le_bytes());
                    }
                }
                SegmentBaseline::Sparse(observed) => {
                    raw.push(RECORD_SPARSE);
                    raw.extend_from_slice(&(observed.len() as u16).to_le_bytes());
                    for (&offset, &c) in observed {
                        raw.extend_from_slice(&offset.to_le_bytes());
                        raw.extend_from_slice(&c.to_le_bytes());
                    }
                }
            }
        }

        let payload = zstd::bulk::compress(&raw, SNAPSHOT_ZSTD_LEVEL)?;
        let header = SnapshotHeader {
            records: self.segments.len() as u64,
            raw_len: raw.len() as u64,
            payload_len: payload.len() as u64,
            checksum: xxh3_64(&payload),
        };

        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE {
            return Err(corrupt(format!(
                "{} bytes is shorter than the {SNAPSHOT_HEADER_SIZE}-byte header",
                bytes.len()
            )));
        }
        let (head, payload) = bytes.split_at(SNAPSHOT_HEADER_SIZE);
        let header = SnapshotHeader::from_bytes(head)?;

        if payload.len() as u64 != header.payload_len {
            return Err(corrupt(format!(
                "payload is {} bytes but header says {}",
                payload.len(),
                header.payload_len
            )));
        }
        let computed = xxh3_64(payload);
        if computed != header.checksum {
            return Err(corrupt(format!(
                "checksum mismatch: expected {:016x}, got {computed:016x}",
                header.checksum
            )));
        }
        let raw = zstd::bulk::decompress(payload, header.raw_len as usize)
            .map_err(|e| corrupt(format!("payload decompression failed: {e}")))?;
        if raw.len() as u64 != header.raw_len {
            return Err(corrupt(format!(
                "payload decompressed to {} bytes but header says {}",
                raw.len(),
                header.raw_len
            )));
        }

        let mut cursor = raw.as_slice();
        let mut snapshot = Self::new();
        for _ in 0..header.records {
            let segment = u64::from_le_bytes(take(&mut cursor)?);
            let [kind] = take::<1>(&mut cursor)?;
            let baseline = match kind {
                RECORD_FULL => {
                    let mut counters = CounterBlock::zeroed();
                    for offset in 0..COUNTERS_PER_BLOCK {
                        counters.set(offset, u32::from_le_bytes(take(&mut cursor)?));
                    }
                    SegmentBaseline::Full(counters)
                }
                RECORD_SPARSE => {
                    let count = u16::from_le_bytes(take(&mut cursor)?);
                    let mut observed = BTreeMap::new();
                    for _ in 0..count {
                        let offset = u16::from_le_bytes(take(&mut cursor)?);
                        let value = u32::from_le_bytes(take(&mut cursor)?);
                        if usize::from(offset) >= COUNTERS_PER_BLOCK {
                            return Err(corrupt(format!(
                                "segment {segment} has counter offset {offset}"
                            )));
                        }
                        observed.insert(offset, value);
                    }
                    SegmentBaseline::Sparse(observed)
                }
                other => {
                    return Err(corrupt(format!(
                        "segment {segment} has unknown record kind {other}"
                    )))
                }
            };
            if snapshot.segments.insert(segment, baseline).is_some() {
                return Err(corrupt(format!("segment {segment} recorded twice")));
            }
        }
        if !cursor.is_empty() {
            return Err(corrupt(format!(
                "{} trailing payload bytes",
                cursor.len()
            )));
        }
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

// ── Snapshot file header ───────────────────────────────────────────────────

/// Magic bytes of a snapshot file.
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"CBDSNAP\n";

/// Fixed size of the snapshot file header.
///   magic[8] + version:u16 + flags:u16 + reserved:u32
///   + records:u64 + raw_len:u64 + payload_len:u64 + checksum:u64
///   = 8 + 2 + 2 + 4 + 8 + 8 + 8 + 8 = 48
pub const SNAPSHOT_HEADER_SIZE: usize = 48;

const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_ZSTD_LEVEL: i32 = 3;
const RECORD_FULL: u8 = 0;
const RECORD_SPARSE: u8 = 1;

#[derive(Debug, Clone, Copy)]
struct SnapshotHeader {
    records: u64,
    raw_len: u64,
    payload_len: u64,
    checksum: u64,
}

impl SnapshotHeader {
    fn to_bytes(self) -> [u8; SNAPSHOT_HEADER_SIZE] {
        let mut buf = [0u8; SNAPSHOT_HEADER_SIZE];
        buf[0..8].copy_from_slice(SNAPSHOT_MAGIC);
        buf[8..10].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        // flags and reserved stay zero
        buf[16..24].copy_from_slice(&self.records.to_le_bytes());
        buf[24..32].copy_from_slice(&self.raw_len.to_le_bytes());
        buf[32..40].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[40..48].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        let magic: [u8; 8] = take(&mut buf)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(corrupt("invalid snapshot magic bytes".to_owned()));
        }
        let version = u16::from_le_bytes(take(&mut buf)?);
        if version != SNAPSHOT_VERSION {
            return Err(corrupt(format!(
                "unsupported snapshot version {version} (only {SNAPSHOT_VERSION} is supported)"
            )));
        }
        let _flags: [u8; 2] = take(&mut buf)?;
        let _reserved: [u8; 4] = take(&mut buf)?;
        Ok(Self {
            records: u64::from_le_bytes(take(&mut buf)?),
            raw_len: u64::from_le_bytes(take(&mut buf)?),
            payload_len: u64::from_le_bytes(take(&mut buf)?),
            checksum: u64::from_le_bytes(take(&mut buf)?),
        })
    }
}

fn corrupt(detail: String) -> CbdError {
    CbdError::SnapshotCorrupt(detail)
}

/// Split `N` bytes off the front of `cursor`.
fn take<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N]> {
    if cursor.len() < N {
        return Err(corrupt(format!(
            "truncated: needed {N} bytes, {} left",
            cursor.len()
        )));
    }
    let (head, rest) = cursor.split_at(N);
    *cursor = rest;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}
