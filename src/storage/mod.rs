//! # Block Store Abstraction
//!
//! The index core never touches files directly. It reads and writes whole
//! blocks through the [`BlockStore`] trait, which models a fixed-size,
//! integer-addressed array of blocks:
//!
//! ```text
//! Block 0:   superblock (index metadata, free-list head)
//! Block 1:   initial root node
//! Block 2+:  tree nodes and free-chain links
//! ```
//!
//! ## Contract
//!
//! - `block_size()` and `num_blocks()` are fixed for the lifetime of the
//!   store. Every buffer handed to `read_block`/`write_block` must be
//!   exactly `block_size()` bytes long.
//! - Reads and writes are synchronous. When `write_block` returns, a
//!   subsequent `read_block` of the same block observes the written bytes.
//! - `notify_allocate`/`notify_deallocate` are advisory hooks for the
//!   host's own bookkeeping. The index calls them after its free-list
//!   bookkeeping is durable; a store may ignore them.
//! - `sync` flushes buffered state to the backing medium. The default
//!   implementation is a no-op for purely volatile stores.
//!
//! ## Sharing
//!
//! The index engine is single-threaded and holds `&mut` access to its
//! store. A host that serializes access externally can hand the engine a
//! `parking_lot` write guard directly; the blanket impls below forward
//! every method.
//!
//! ## Implementations
//!
//! - [`MmapStore`]: a memory-mapped file, one block after another. This is
//!   the store used by the tests and benchmarks and the default choice for
//!   hosts without their own paging layer.

mod mmap;

pub use mmap::MmapStore;

use crate::error::Result;

pub trait BlockStore {
    fn block_size(&self) -> usize;
    fn num_blocks(&self) -> u32;
    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<()>;

    fn notify_allocate(&mut self, _n: u32) {}
    fn notify_deallocate(&mut self, _n: u32) {}

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: BlockStore> BlockStore for &mut S {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn num_blocks(&self) -> u32 {
        (**self).num_blocks()
    }

    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(n, buf)
    }

    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<()> {
        (**self).write_block(n, buf)
    }

    fn notify_allocate(&mut self, n: u32) {
        (**self).notify_allocate(n)
    }

    fn notify_deallocate(&mut self, n: u32) {
        (**self).notify_deallocate(n)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

impl<S: BlockStore> BlockStore for parking_lot::RwLockWriteGuard<'_, S> {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn num_blocks(&self) -> u32 {
        (**self).num_blocks()
    }

    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(n, buf)
    }

    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<()> {
        (**self).write_block(n, buf)
    }

    fn notify_allocate(&mut self, n: u32) {
        (**self).notify_allocate(n)
    }

    fn notify_deallocate(&mut self, n: u32) {
        (**self).notify_deallocate(n)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}
