use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use cbd_core::format::{self, BLOCK_SIZE};
use cbd_core::BlockStore;

/// File-backed block store using positional (`pread`/`pwrite`) I/O.
///
/// No shared seek position, so concurrent readers and writers need no
/// extra locking. Works on regular image files and raw block device nodes.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    block_count: u64,
    writable: bool,
}

impl FileStore {
    /// Open an existing image, read-write if permitted, read-only otherwise.
    ///
    /// A trailing partial block is ignored.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| OpenOptions::new().read(true).open(path).map(|file| (file, false)))?;
        let len = file.metadata()?.len();
        let block_size = BLOCK_SIZE as u64;
        if len % block_size != 0 {
            tracing::warn!(
                path = %path.display(),
                trailing = len % block_size,
                "image length is not a multiple of the block size; ignoring the tail"
            );
        }
        tracing::debug!(path = %path.display(), blocks = len / block_size, writable, "opened file store");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_count: len / block_size,
            writable,
        })
    }

    /// Create `path` (or reuse an existing file) sized to exactly
    /// `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        tracing::debug!(path = %path.display(), blocks = block_count, "sized file store");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_count,
            writable: true,
        })
    }

    /// Size `path` to `block_count` blocks ahead of a format.
    ///
    /// An existing file that already carries a device header is neither
    /// resized nor touched unless `force` is set; the call fails with
    /// [`CbdError::Format`](cbd_core::CbdError::Format) instead.
    pub fn create_for_format(
        path: impl AsRef<Path>,
        block_count: u64,
        force: bool,
    ) -> cbd_core::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let existing = Self::open(path)?;
            if existing.block_count() > 0 {
                format::ensure_formattable(&existing, force)?;
            }
        }
        Ok(Self::create(path, block_count)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn offset(&self, index: u64, len: usize) -> io::Result<u64> {
        if len != BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer is {len} bytes, expected {BLOCK_SIZE}"),
            ));
        }
        if index >= self.block_count {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "block {index} beyond end of {} ({} blocks)",
                    self.path.display(),
                    self.block_count
                ),
            ));
        }
        Ok(index * BLOCK_SIZE as u64)
    }
}

impl BlockStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> io::Result<()> {
        let offset = self.offset(index, buf.len())?;
        self.file.read_exact_at(buf, offset)
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> io::Result<()> {
        let offset = self.offset(index, buf.len())?;
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is opened read-only", self.path.display()),
            ));
        }
        self.file.write_all_at(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}
