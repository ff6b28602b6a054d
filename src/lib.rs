//! # blocktree - Block-Addressed B-Tree Index
//!
//! `blocktree` is a persistent B-tree index that maps fixed-width byte
//! keys to fixed-width byte values. It lives on top of an external block
//! store: a fixed-size array of blocks addressed by integer block numbers.
//! The index knows nothing about disk layout or caching policy beyond that
//! interface.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------+
//! |        BTreeIndex (engine)          |
//! |  attach/detach, lookup, update,     |
//! |  insert, sanity_check, display      |
//! +-------------------------------------+
//! |  Node codec  |  Superblock/freelist |
//! +-------------------------------------+
//! |        BlockStore (trait)           |
//! +-------------------------------------+
//! |   MmapStore (memory-mapped file)    |
//! +-------------------------------------+
//! ```
//!
//! Every node occupies exactly one block. Block 0 is the superblock
//! (geometry, root pointer, free-list head); unallocated blocks form a
//! singly-linked free chain threaded through the blocks themselves.
//!
//! ## Quick Start
//!
//! ```no_run
//! use blocktree::{BTreeIndex, MmapStore};
//!
//! fn main() -> blocktree::Result<()> {
//!     let mut store = MmapStore::create("./example.idx", 4096, 1024)?;
//!     let mut index = BTreeIndex::new(8, 8, &mut store)?;
//!     index.attach(0, true)?;
//!
//!     index.insert(b"deadbeef", b"cafef00d")?;
//!     assert_eq!(index.lookup(b"deadbeef")?, b"cafef00d");
//!
//!     index.detach()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Semantics
//!
//! - Keys are opaque byte strings ordered lexicographically; duplicates
//!   are rejected with [`Error::Conflict`] and never overwrite.
//! - [`BTreeIndex::update`] overwrites the value of an existing key;
//!   [`BTreeIndex::lookup`] returns it.
//! - Inserts split proactively on the way down, so every split happens in
//!   a parent with room and operations never unwind.
//! - Deletion is intentionally unimplemented ([`Error::Unimplemented`]).
//! - The engine is single-threaded; wrap the store in external
//!   synchronization to share it.
//!
//! ## Module Overview
//!
//! - [`storage`]: the [`BlockStore`] contract and the mmap-backed store
//! - [`index`]: node codec, free-list allocator, and the tree engine
//!
//! ## Feature Flags
//!
//! - `tracing`: emit `tracing` events for allocation, splits, and height
//!   growth. Off by default; the hooks compile to nothing without it.

pub mod index;
pub mod storage;

mod error;
mod trace;

pub use error::{Error, Result};
pub use index::{
    interior_capacity, leaf_capacity, BTreeIndex, DisplayMode, Node, NodeType, Superblock,
    INITIAL_ROOT_AT, NODE_HEADER_SIZE, PTR_SIZE, SUPERBLOCK_AT,
};
pub use storage::{BlockStore, MmapStore};
