mod file;
mod mem;

pub use file::FileStore;
pub use mem::MemStore;

use std::path::Path;
use std::sync::Arc;

use cbd_core::BlockStore;

/// Open the store behind a CLI path argument.
///
/// `mem:<blocks>` yields a fresh in-memory store of that many blocks (handy
/// for dry runs); anything else is treated as an image file or device node.
pub fn store_from_spec(spec: &Path) -> std::io::Result<Arc<dyn BlockStore>> {
    if let Some(blocks) = spec.to_str().and_then(|s| s.strip_prefix("mem:")) {
        let blocks: u64 = blocks.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid in-memory store size '{blocks}'"),
            )
        })?;
        return Ok(Arc::new(MemStore::new(blocks)));
    }
    Ok(Arc::new(FileStore::open(spec)?))
}
