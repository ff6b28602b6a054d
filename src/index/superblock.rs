//! # Superblock and Free-List Allocator
//!
//! Block 0 holds the superblock: the configured key and value widths, the
//! current root block number, and the head of the free list. The free list
//! is a singly-linked chain threaded through the unallocated blocks
//! themselves; each free block's `free_link` names the next free block, and
//! 0 terminates the chain.
//!
//! ```text
//! superblock.free_head --> block 7 --> block 3 --> block 9 --> 0
//! ```
//!
//! [`Superblock`] is the in-memory authoritative copy. Every mutation is
//! immediately re-serialized to block 0, so the persisted head never trails
//! the in-memory one by more than the single operation in flight.
//!
//! ## Allocation
//!
//! `allocate` pops the head: the popped block must currently be marked
//! unallocated, the superblock adopts its `free_link` as the new head, and
//! the store is notified. The returned block still holds stale bytes; the
//! caller must serialize a valid node into it before anything else reads it.
//!
//! `release` pushes onto the head: the block is rewritten as an
//! unallocated node linking to the old head, then the head moves.
//!
//! `free_head == 0` exactly when no free blocks remain.

use crate::error::{Error, Result};
use crate::storage::BlockStore;
use crate::trace::trace_log;

use super::node::{read_node, write_node, Node, NodeType};

pub const SUPERBLOCK_AT: u32 = 0;

/// In-memory copy of block 0. Owned by the index engine; every mutation is
/// paired with a `store()` call.
#[derive(Debug, Clone)]
pub struct Superblock {
    key_size: usize,
    value_size: usize,
    root: u32,
    free_head: u32,
}

impl Superblock {
    pub fn new(key_size: usize, value_size: usize, root: u32, free_head: u32) -> Superblock {
        Superblock {
            key_size,
            value_size,
            root,
            free_head,
        }
    }

    /// Deserialize the superblock from block 0.
    pub fn load<S: BlockStore>(store: &S) -> Result<Superblock> {
        let node = read_node(store, SUPERBLOCK_AT)?;
        if node.node_type() != NodeType::Superblock {
            return Err(Error::Insane(format!(
                "block 0 holds a {:?} node, not the superblock",
                node.node_type()
            )));
        }
        if node.key_size() == 0 || node.value_size() == 0 {
            return Err(Error::BadConfig(
                "superblock records a zero key or value size".into(),
            ));
        }
        Ok(Superblock {
            key_size: node.key_size(),
            value_size: node.value_size(),
            root: node.root_hint(),
            free_head: node.free_link(),
        })
    }

    /// Serialize the in-memory state back into block 0.
    pub fn store<S: BlockStore>(&self, store: &mut S) -> Result<()> {
        let mut node = Node::alloc(
            NodeType::Superblock,
            self.key_size,
            self.value_size,
            store.block_size(),
            self.root,
        );
        node.set_free_link(self.free_head);
        write_node(store, SUPERBLOCK_AT, &node)
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn set_root(&mut self, root: u32) {
        self.root = root;
    }

    pub fn free_head(&self) -> u32 {
        self.free_head
    }

    /// Pop a block off the free list. The caller must immediately write a
    /// valid node into the returned block.
    pub fn allocate<S: BlockStore>(&mut self, store: &mut S) -> Result<u32> {
        let n = self.free_head;
        if n == 0 {
            return Err(Error::NoSpace);
        }

        let node = read_node(store, n)?;
        if node.node_type() != NodeType::Unallocated {
            return Err(Error::Insane(format!(
                "free-list head {} is a {:?} node, not unallocated",
                n,
                node.node_type()
            )));
        }

        self.free_head = node.free_link();
        self.store(store)?;
        store.notify_allocate(n);

        trace_log!("allocated block {}, free head now {}", n, self.free_head);
        Ok(n)
    }

    /// Push block `n` back onto the free list.
    pub fn release<S: BlockStore>(&mut self, store: &mut S, n: u32) -> Result<()> {
        let node = read_node(store, n)?;
        if node.node_type() == NodeType::Unallocated {
            return Err(Error::Insane(format!("double release of block {}", n)));
        }

        let mut freed = Node::alloc(
            NodeType::Unallocated,
            self.key_size,
            self.value_size,
            store.block_size(),
            self.root,
        );
        freed.set_free_link(self.free_head);
        write_node(store, n, &freed)?;

        self.free_head = n;
        self.store(store)?;
        store.notify_deallocate(n);

        trace_log!("released block {}", n);
        Ok(())
    }

    /// Format blocks `2..num_blocks` as a linear free chain, each linking
    /// to its successor and the last linking to 0.
    pub fn init_chain<S: BlockStore>(&self, store: &mut S) -> Result<()> {
        let num_blocks = store.num_blocks();
        for i in 2..num_blocks {
            let mut node = Node::alloc(
                NodeType::Unallocated,
                self.key_size,
                self.value_size,
                store.block_size(),
                self.root,
            );
            let next = if i + 1 == num_blocks { 0 } else { i + 1 };
            node.set_free_link(next);
            write_node(store, i, &node)?;
        }
        Ok(())
    }
}
