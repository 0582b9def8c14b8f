use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{CbdError, Result};
use crate::store::BlockStore;

/// Size of every block on the underlying store, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Counters held by one counter block: 4096 bytes / 4 bytes per counter.
pub const COUNTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// Data blocks tracked by one counter block.
pub const DATA_BLOCKS_PER_SEGMENT: u64 = COUNTERS_PER_BLOCK as u64;

/// Physical blocks in a full segment: one counter block + its data blocks.
pub const SEGMENT_BLOCKS: u64 = DATA_BLOCKS_PER_SEGMENT + 1;

/// Physical index of the header block.
pub const HEADER_BLOCK: u64 = 0;

// ── Header layout ──────────────────────────────────────────────────────────
//
//   00-28 : "counter_block_device\nversion="
//   29-31 : major   (3 ASCII digits)
//   32    : '.'
//   33-35 : minor   (3 ASCII digits)
//   36    : '.'
//   37-39 : release (3 ASCII digits)
//   40    : '\n'
//
// Version 000.000.001 continues with:
//   41-51   : "endianness="
//   52-57   : "little" | "big   "
//   58-59   : "\n\0"
//   60-4095 : zeros (reserved)

/// Magic prefix of the header block. 29 bytes.
pub const MAGIC: &[u8; 29] = b"counter_block_device\nversion=";

const VERSION_OFFSET: usize = 29;
const VERSION_END: usize = 41;
const ENDIANNESS_KEY: &[u8; 11] = b"endianness=";
const ENDIANNESS_KEY_OFFSET: usize = 41;
const ENDIANNESS_VALUE_OFFSET: usize = 52;
const ENDIANNESS_VALUE_LEN: usize = 6;
const TERMINATOR: &[u8; 2] = b"\n\0";
const TERMINATOR_OFFSET: usize = 58;
/// First reserved byte of a version 000.000.001 header.
pub const RESERVED_OFFSET: usize = 60;

// ── Byte order ─────────────────────────────────────────────────────────────

/// Byte order of the counters stored in every counter block.
///
/// Declared once in the header so an image moves between machines of
/// differing native byte order without reinterpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// The 6-byte, space-padded tag written at header offset 52.
    pub fn tag(self) -> &'static [u8; 6] {
        match self {
            ByteOrder::Little => b"little",
            ByteOrder::Big => b"big   ",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"little" => Some(ByteOrder::Little),
            b"big   " => Some(ByteOrder::Big),
            _ => None,
        }
    }

    #[inline]
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    #[inline]
    pub fn write_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::native()
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => f.write_str("little"),
            ByteOrder::Big => f.write_str("big"),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = CbdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "little" | "le" => Ok(ByteOrder::Little),
            "big" | "be" => Ok(ByteOrder::Big),
            "native" => Ok(ByteOrder::native()),
            other => Err(CbdError::Config(format!(
                "unknown byte order '{other}'; expected little, big, or native"
            ))),
        }
    }
}

// ── Version ────────────────────────────────────────────────────────────────

/// Semantic version stored as `MMM.mmm.rrr` in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub release: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, release: u16) -> Self {
        Self {
            major,
            minor,
            release,
        }
    }

    /// The only layout this build reads and writes.
    pub const CURRENT: Version = Version::new(0, 0, 1);

    /// `"MMM.mmm.rrr\n"`, 12 bytes.
    fn to_field(self) -> [u8; VERSION_END - VERSION_OFFSET] {
        let text = format!("{:03}.{:03}.{:03}\n", self.major, self.minor, self.release);
        let mut field = [0u8; VERSION_END - VERSION_OFFSET];
        field.copy_from_slice(text.as_bytes());
        field
    }

    fn from_field(field: &[u8]) -> Result<Self> {
        if field.len() != VERSION_END - VERSION_OFFSET
            || field[3] != b'.'
            || field[7] != b'.'
            || field[11] != b'\n'
        {
            return Err(CbdError::CorruptHeader(format!(
                "malformed version field {:?}",
                String::from_utf8_lossy(field)
            )));
        }
        let digits = |range: std::ops::Range<usize>| -> Result<u16> {
            let part = &field[range];
            if !part.iter().all(u8::is_ascii_digit) {
                return Err(CbdError::CorruptHeader(format!(
                    "non-digit version component {:?}",
                    String::from_utf8_lossy(part)
                )));
            }
            Ok(part
                .iter()
                .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
        };
        Ok(Self {
            major: digits(0..3)?,
            minor: digits(4..7)?,
            release: digits(8..11)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}.{:03}.{:03}", self.major, self.minor, self.release)
    }
}

// ── Header ─────────────────────────────────────────────────────────────────

/// Decoded representation of the header block (physical block 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub byte_order: ByteOrder,
}

impl Header {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            version: Version::CURRENT,
            byte_order,
        }
    }

    /// Serialize to exactly one block.
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[..VERSION_OFFSET].copy_from_slice(MAGIC);
        buf[VERSION_OFFSET..VERSION_END].copy_from_slice(&self.version.to_field());
        buf[ENDIANNESS_KEY_OFFSET..ENDIANNESS_VALUE_OFFSET].copy_from_slice(ENDIANNESS_KEY);
        buf[ENDIANNESS_VALUE_OFFSET..TERMINATOR_OFFSET].copy_from_slice(self.byte_order.tag());
        buf[TERMINATOR_OFFSET..RESERVED_OFFSET].copy_from_slice(TERMINATOR);
        // reserved region stays zero
        buf
    }

    /// True when `buf` starts with the header magic, regardless of version.
    pub fn has_magic(buf: &[u8]) -> bool {
        buf.len() >= MAGIC.len() && &buf[..MAGIC.len()] == MAGIC
    }

    /// Deserialize from one block, checking magic, version, and the
    /// version-specific literals.
    pub fn from_bytes(buf: &[u8; BLOCK_SIZE]) -> Result<Self> {
        if !Self::has_magic(buf) {
            return Err(CbdError::CorruptHeader(
                "magic mismatch; not a counter block device".to_owned(),
            ));
        }
        let version = Version::from_field(&buf[VERSION_OFFSET..VERSION_END])?;
        if version != Version::CURRENT {
            return Err(CbdError::UnsupportedVersion(version.to_string()));
        }

        if &buf[ENDIANNESS_KEY_OFFSET..ENDIANNESS_VALUE_OFFSET] != ENDIANNESS_KEY {
            return Err(CbdError::CorruptHeader(
                "missing endianness key".to_owned(),
            ));
        }
        let tag = &buf[ENDIANNESS_VALUE_OFFSET..ENDIANNESS_VALUE_OFFSET + ENDIANNESS_VALUE_LEN];
        let byte_order = ByteOrder::from_tag(tag).ok_or_else(|| {
            CbdError::CorruptHeader(format!(
                "unknown endianness tag {:?}",
                String::from_utf8_lossy(tag)
            ))
        })?;
        if &buf[TERMINATOR_OFFSET..RESERVED_OFFSET] != TERMINATOR {
            return Err(CbdError::CorruptHeader(
                "missing header terminator".to_owned(),
            ));
        }
        if let Some(pos) = buf[RESERVED_OFFSET..].iter().position(|&b| b != 0) {
            tracing::warn!(
                offset = RESERVED_OFFSET + pos,
                "header reserved region is not zero; ignoring"
            );
        }

        Ok(Self {
            version,
            byte_order,
        })
    }
}

// ── Header I/O ─────────────────────────────────────────────────────────────

/// Read and parse the header block of `store`.
pub fn read_header(store: &dyn BlockStore) -> Result<Header> {
    let mut buf = [0u8; BLOCK_SIZE];
    store
        .read_block(HEADER_BLOCK, &mut buf)
        .map_err(|source| CbdError::StorageRead {
            block: HEADER_BLOCK,
            source,
        })?;
    Header::from_bytes(&buf)
}

/// Fail with [`CbdError::Format`] if `store` already carries the header
/// magic and `force` is not set.
pub fn ensure_formattable(store: &dyn BlockStore, force: bool) -> Result<()> {
    let mut buf = [0u8; BLOCK_SIZE];
    store
        .read_block(HEADER_BLOCK, &mut buf)
        .map_err(|source| CbdError::StorageRead {
            block: HEADER_BLOCK,
            source,
        })?;
    if Header::has_magic(&buf) {
        if !force {
            return Err(CbdError::Format(
                "store already carries a counter block device header; force a reformat to overwrite it"
                    .to_owned(),
            ));
        }
        tracing::warn!("overwriting existing counter block device header");
    }
    Ok(())
}

/// Write a fresh version 000.000.001 header declaring `byte_order`.
///
/// Refuses to overwrite an existing header unless `force` is set.
pub fn write_header(store: &dyn BlockStore, byte_order: ByteOrder, force: bool) -> Result<Header> {
    ensure_formattable(store, force)?;
    let header = Header::new(byte_order);
    store
        .write_block(HEADER_BLOCK, &header.to_bytes())
        .map_err(|source| CbdError::StorageWrite {
            block: HEADER_BLOCK,
            source,
        })?;
    Ok(header)
}
