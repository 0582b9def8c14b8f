use thiserror::Error;

/// Errors surfaced by the counter block device.
///
/// Storage failures always carry the *physical* block index that failed so a
/// caller can tell a header, counter block, or data block failure apart.
#[derive(Debug, Error)]
pub enum CbdError {
    /// The store already carries a counter block device header and a
    /// reformat was not forced.
    #[error("device already formatted: {0}")]
    Format(String),

    /// Block 0 is not a counter block device header.
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    /// The header parsed but names a version this build cannot lay out.
    #[error("unsupported on-disk version {0}")]
    UnsupportedVersion(String),

    /// Logical index beyond the device capacity.
    #[error("logical block {index} out of range (capacity {capacity})")]
    OutOfRange { index: u64, capacity: u64 },

    #[error("read of physical block {block} failed: {source}")]
    StorageRead {
        block: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("write of physical block {block} failed: {source}")]
    StorageWrite {
        block: u64,
        #[source]
        source: std::io::Error,
    },

    /// Attempted to drop a counter block that still holds unpersisted
    /// increments.
    #[error("counter block for segment {segment} is dirty and cannot be evicted")]
    EvictDirty { segment: u64 },

    #[error("buffer length {len} is not a multiple of the {block_size}-byte block size")]
    InvalidBlockLength { len: usize, block_size: usize },

    #[error("invalid device geometry: {0}")]
    InvalidGeometry(String),

    /// A previous write failed with an unknown outcome; run
    /// `CounterBlockDevice::revalidate` before writing again.
    #[error("device poisoned by an earlier storage write failure; revalidate before writing")]
    Poisoned,

    #[error("corrupt snapshot: {0}")]
    SnapshotCorrupt(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CbdError>;
