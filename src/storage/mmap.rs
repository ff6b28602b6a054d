//! # Memory-Mapped Block Store
//!
//! [`MmapStore`] backs the [`BlockStore`] contract with a single file of
//! `block_size * num_blocks` bytes, memory-mapped once at creation. Blocks
//! are stored back to back:
//!
//! ```text
//! Offset 0:              Block 0
//! Offset block_size:     Block 1
//! Offset 2 * block_size: Block 2
//! ...
//! ```
//!
//! ## Fixed geometry
//!
//! Unlike a general pager, the store never grows. The index allocates from
//! a free list threaded through the blocks themselves, so the file size is
//! the capacity ceiling and `create` takes both dimensions up front. `open`
//! takes the block size as a parameter and derives the block count from the
//! file length; block-size discovery is the host's concern.
//!
//! ## Safety
//!
//! Memory-mapped files are `unsafe` to map because the backing file could
//! be modified externally. Every `unsafe` block below documents why the
//! usage is sound: the file is opened with exclusive read/write intent, the
//! map's lifetime is tied to the store, and all access is bounds-checked
//! through `read_block`/`write_block`.
//!
//! ## Notifications
//!
//! `notify_allocate`/`notify_deallocate` maintain plain counters, exposed
//! through [`MmapStore::allocations`] and [`MmapStore::deallocations`] so a
//! host (or a test) can observe the index's allocation traffic.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::trace::trace_log;

use super::BlockStore;

#[derive(Debug)]
pub struct MmapStore {
    mmap: MmapMut,
    block_size: usize,
    num_blocks: u32,
    allocations: u64,
    deallocations: u64,
}

impl MmapStore {
    /// Create a new store file of exactly `block_size * num_blocks` bytes,
    /// truncating any existing file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, num_blocks: u32) -> Result<Self> {
        let path = path.as_ref();

        if block_size == 0 {
            return Err(Error::BadConfig("block size must be nonzero".into()));
        }
        if num_blocks == 0 {
            return Err(Error::BadConfig("store needs at least one block".into()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let file_size = block_size as u64 * num_blocks as u64;
        file.set_len(file_size)?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally, leading to undefined behavior. This is safe
        // because:
        // 1. We just created this file with exclusive access (truncate=true)
        // 2. The file size is set to block_size * num_blocks before mapping
        // 3. The mmap lifetime is tied to MmapStore, preventing use-after-unmap
        // 4. All access goes through read_block/write_block which bounds-check
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            mmap,
            block_size,
            num_blocks,
            allocations: 0,
            deallocations: 0,
        })
    }

    /// Map an existing store file. The file length must be a nonzero
    /// multiple of `block_size`.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref();

        if block_size == 0 {
            return Err(Error::BadConfig("block size must be nonzero".into()));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        if file_size == 0 {
            return Err(Error::BadConfig(format!(
                "cannot open empty store file '{}'",
                path.display()
            )));
        }
        if file_size % block_size as u64 != 0 {
            return Err(Error::BadConfig(format!(
                "store file '{}' size {} is not a multiple of block size {}",
                path.display(),
                file_size,
                block_size
            )));
        }

        let num_blocks = (file_size / block_size as u64) as u32;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. The file is opened with exclusive read/write intent; store files
        //    are not meant to be touched by other processes
        // 2. The file length was validated as a whole number of blocks
        // 3. The mmap lifetime is tied to MmapStore, preventing use-after-unmap
        // 4. All access goes through read_block/write_block which bounds-check
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            mmap,
            block_size,
            num_blocks,
            allocations: 0,
            deallocations: 0,
        })
    }

    /// Number of allocation notifications received so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Number of deallocation notifications received so far.
    pub fn deallocations(&self) -> u64 {
        self.deallocations
    }

    fn block_range(&self, n: u32, buf_len: usize) -> Result<std::ops::Range<usize>> {
        if n >= self.num_blocks {
            return Err(Error::OutOfBounds {
                idx: n as usize,
                len: self.num_blocks as usize,
            });
        }
        if buf_len != self.block_size {
            return Err(Error::Size {
                what: "block buffer",
                expected: self.block_size,
                actual: buf_len,
            });
        }
        let start = n as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockStore for MmapStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.block_range(n, buf.len())?;
        buf.copy_from_slice(&self.mmap[range]);
        Ok(())
    }

    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<()> {
        let range = self.block_range(n, buf.len())?;
        self.mmap[range].copy_from_slice(buf);
        Ok(())
    }

    fn notify_allocate(&mut self, n: u32) {
        trace_log!("block {} allocated", n);
        self.allocations += 1;
    }

    fn notify_deallocate(&mut self, n: u32) {
        trace_log!("block {} deallocated", n);
        self.deallocations += 1;
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store(block_size: usize, num_blocks: u32) -> (tempfile::TempDir, MmapStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");
        let store = MmapStore::create(&path, block_size, num_blocks).unwrap();
        (dir, store)
    }

    #[test]
    fn create_rejects_zero_block_size() {
        let dir = tempdir().unwrap();
        let result = MmapStore::create(dir.path().join("z.idx"), 0, 4);

        assert!(matches!(result, Err(Error::BadConfig(_))));
    }

    #[test]
    fn create_rejects_zero_blocks() {
        let dir = tempdir().unwrap();
        let result = MmapStore::create(dir.path().join("z.idx"), 64, 0);

        assert!(matches!(result, Err(Error::BadConfig(_))));
    }

    #[test]
    fn blocks_round_trip() {
        let (_dir, mut store) = create_test_store(64, 4);

        let block = [0xABu8; 64];
        store.write_block(2, &block).unwrap();

        let mut out = [0u8; 64];
        store.read_block(2, &mut out).unwrap();
        assert_eq!(out, block);

        store.read_block(1, &mut out).unwrap();
        assert_eq!(out, [0u8; 64]);
    }

    #[test]
    fn read_out_of_bounds_block() {
        let (_dir, store) = create_test_store(64, 4);

        let mut buf = [0u8; 64];
        let result = store.read_block(4, &mut buf);

        assert!(matches!(
            result,
            Err(Error::OutOfBounds { idx: 4, len: 4 })
        ));
    }

    #[test]
    fn wrong_buffer_length_is_rejected() {
        let (_dir, mut store) = create_test_store(64, 4);

        let short = [0u8; 32];
        let result = store.write_block(0, &short);

        assert!(matches!(
            result,
            Err(Error::Size {
                what: "block buffer",
                expected: 64,
                actual: 32
            })
        ));
    }

    #[test]
    fn open_recovers_written_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.idx");

        {
            let mut store = MmapStore::create(&path, 32, 8).unwrap();
            store.write_block(5, &[7u8; 32]).unwrap();
            store.sync().unwrap();
        }

        let store = MmapStore::open(&path, 32).unwrap();
        assert_eq!(store.num_blocks(), 8);
        assert_eq!(store.block_size(), 32);

        let mut buf = [0u8; 32];
        store.read_block(5, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 32]);
    }

    #[test]
    fn open_rejects_misaligned_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("odd.idx");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let result = MmapStore::open(&path, 64);

        assert!(matches!(result, Err(Error::BadConfig(_))));
    }

    #[test]
    fn notifications_are_counted() {
        let (_dir, mut store) = create_test_store(64, 4);

        store.notify_allocate(2);
        store.notify_allocate(3);
        store.notify_deallocate(2);

        assert_eq!(store.allocations(), 2);
        assert_eq!(store.deallocations(), 1);
    }
}
