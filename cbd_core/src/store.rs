use std::io;

/// Block-read/block-write capability of the underlying physical store.
///
/// Every implementation:
/// - Addresses whole blocks of [`BLOCK_SIZE`](crate::format::BLOCK_SIZE)
///   bytes by physical index; callers always pass buffers of that length.
/// - Is assumed atomic per block, never across blocks.
/// - Takes `&self`: writers on different segments call in concurrently, so
///   implementations synchronize internally.
///
/// The device issues no barriers between writes. A store with a volatile
/// write cache may complete them out of order.
pub trait BlockStore: Send + Sync {
    /// Human-readable store name for CLI display.
    fn name(&self) -> &'static str;

    /// Total number of physical blocks.
    fn block_count(&self) -> u64;

    /// Read physical block `index` into `buf`.
    fn read_block(&self, index: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` to physical block `index`.
    fn write_block(&self, index: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush the store's own caches to stable media.
    fn sync(&self) -> io::Result<()>;
}
