use std::collections::HashSet;
use std::io;

use cbd_core::format::BLOCK_SIZE;
use cbd_core::BlockStore;
use parking_lot::{Mutex, RwLock};

/// In-memory block store.
///
/// Blocks are allocated on first write; unwritten blocks read as zeros.
/// Every successful write is appended to a journal of physical indices so
/// callers can check the order in which the device issued its writes, and
/// individual blocks can be set to fail on read or write.
///
/// Best for: tests, demos, and dry runs.
pub struct MemStore {
    block_count: u64,
    blocks: RwLock<Vec<Option<Box<[u8]>>>>,
    journal: Mutex<Vec<u64>>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    reads: HashSet<u64>,
    writes: HashSet<u64>,
}

impl MemStore {
    pub fn new(block_count: u64) -> Self {
        let mut blocks = Vec::new();
        blocks.resize_with(block_count as usize, || None);
        Self {
            block_count,
            blocks: RwLock::new(blocks),
            journal: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Physical indices of all successful writes, oldest first.
    pub fn journal(&self) -> Vec<u64> {
        self.journal.lock().clone()
    }

    /// Return and clear the write journal.
    pub fn take_journal(&self) -> Vec<u64> {
        std::mem::take(&mut *self.journal.lock())
    }

    /// Make every read of `index` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_reads_at(&self, index: u64) {
        self.faults.lock().reads.insert(index);
    }

    /// Make every write to `index` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes_at(&self, index: u64) {
        self.faults.lock().writes.insert(index);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.reads.clear();
        faults.writes.clear();
    }

    /// Copy of the raw bytes of physical block `index`, bypassing faults and
    /// the journal.
    pub fn raw_block(&self, index: u64) -> Vec<u8> {
        self.blocks
            .read()
            .get(index as usize)
            .and_then(|b| b.as_deref())
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| vec![0u8; BLOCK_SIZE])
    }

    /// Overwrite a single byte of physical block `index`, bypassing faults
    /// and the journal. For simulating media corruption.
    pub fn poke(&self, index: u64, offset: usize, value: u8) {
        let mut blocks = self.blocks.write();
        if let Some(slot) = blocks.get_mut(index as usize) {
            slot.get_or_insert_with(|| vec![0u8; BLOCK_SIZE].into_boxed_slice())[offset] = value;
        }
    }

    fn check(&self, index: u64, len: usize) -> io::Result<()> {
        if len != BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer is {len} bytes, expected {BLOCK_SIZE}"),
            ));
        }
        if index >= self.block_count {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block {index} beyond end of store ({} blocks)", self.block_count),
            ));
        }
        Ok(())
    }
}

impl BlockStore for MemStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check(index, buf.len())?;
        if self.faults.lock().reads.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected read fault at block {index}"),
            ));
        }
        match &self.blocks.read()[index as usize] {
            Some(block) => buf.copy_from_slice(block),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> io::Result<()> {
        self.check(index, buf.len())?;
        if self.faults.lock().writes.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected write fault at block {index}"),
            ));
        }
        self.blocks.write()[index as usize] = Some(buf.to_vec().into_boxed_slice());
        self.journal.lock().push(index);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_blocks_read_as_zero() {
        let store = MemStore::new(4);
        let mut buf = vec![0xAAu8; BLOCK_SIZE];
        store.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn journal_records_successful_writes_only() {
        let store = MemStore::new(4);
        let block = vec![7u8; BLOCK_SIZE];
        store.write_block(2, &block).unwrap();
        store.fail_writes_at(1);
        assert!(store.write_block(1, &block).is_err());
        store.write_block(0, &block).unwrap();
        assert_eq!(store.take_journal(), vec![2, 0]);
        assert!(store.journal().is_empty());
        assert_eq!(store.raw_block(2), block);
    }

    #[test]
    fn bounds_and_length_are_checked() {
        let store = MemStore::new(2);
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(
            store.read_block(2, &mut buf).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        assert_eq!(
            store.write_block(0, &buf[..10]).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
