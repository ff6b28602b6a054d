//! # B-Tree Engine
//!
//! [`BTreeIndex`] implements the index operations on top of a
//! [`BlockStore`]: attach/detach, recursive lookup and update, proactive
//! top-down insert with node splitting, structural validation, and
//! traversal.
//!
//! ## Descent
//!
//! Every operation starts at the root block recorded in the superblock and
//! dispatches on the node type of each block it reads. At an interior node
//! the child index is the smallest `i` with `key[i] > probe`, falling back
//! to the trailing pointer; an equal probe therefore descends to the right
//! of the matching separator, which pairs with the copy-up split policy
//! (the separator in a parent is a copy of the right sibling's smallest
//! key, and that key stays in the right sibling).
//!
//! ## Insert Algorithm
//!
//! Insertion uses proactive top-down splitting: any full node encountered
//! on the way down is split before descending into it, so a split always
//! happens in a parent known to have room and nothing ever needs to
//! unwind.
//!
//! ```text
//! 1. If the root is full: allocate a new root, demote the old one to an
//!    interior node, hang it off child 0, then split it.
//! 2. If the tree is brand new: allocate two empty leaves, record the key
//!    as the root's first separator, and wire the leaves as children 0
//!    and 1. The ordinary descent then lands the record in the right leaf.
//! 3. Descend with insert_nonfull, splitting any full child before
//!    entering it.
//! ```
//!
//! A node is full exactly when `num_keys` equals its capacity. Splitting
//! keeps `floor(capacity / 2)` keys in the left node and moves the rest to
//! a fresh right sibling; the separator pushed into the parent is a copy of
//! the right sibling's first key. For interior splits the right sibling's
//! child 0 guards the empty range between the separator and itself and is
//! stored as the null block; it is never descended, because nothing below
//! the separator can reach that node and an equal probe descends to the
//! right of key 0.
//!
//! ## Write Ordering
//!
//! Within one operation, children are serialized before their parent and a
//! new root is serialized before the superblock starts pointing at it. The
//! sibling block for a split is allocated before anything is mutated, so
//! running out of space leaves the tree exactly as it was. Crash
//! consistency beyond that ordering is out of scope.
//!
//! ## Sanity Checking
//!
//! `sanity_check` walks the tree with separator bounds (the first key of a
//! bounded subtree must equal its separator, the last must stay below the
//! upper bound, keys strictly ascend), verifies that all leaves share one
//! depth, and then walks the free chain checking that it terminates, that
//! every block on it is marked unallocated, and that it is disjoint from
//! the reachable set.

use std::cmp::Ordering;
use std::io;

use hashbrown::HashSet;

use crate::error::{Error, Result};
use crate::storage::BlockStore;
use crate::trace::debug_log;

use super::display::{self, DisplayMode};
use super::node::{read_node, write_node, Node, NodeType};
use super::superblock::Superblock;

/// Block number of the initial root written by `attach(create = true)`.
pub const INITIAL_ROOT_AT: u32 = 1;

/// A B-tree index over fixed-width keys and values, stored in an external
/// block store.
pub struct BTreeIndex<'s, S: BlockStore> {
    store: &'s mut S,
    key_size: usize,
    value_size: usize,
    superblock: Option<Superblock>,
}

fn not_attached() -> Error {
    Error::BadConfig("index is not attached".into())
}

/// Child slot for `key` per the descent rule: the smallest `i` with
/// `key[i] > probe`, else the trailing pointer. An equal probe falls
/// through to the slot after the matching separator, descending right.
/// Returns the slot index and child block, or `None` when the node offers
/// no way forward.
fn choose_child(node: &Node, key: &[u8]) -> Result<Option<(usize, u32)>> {
    let n = node.num_keys();
    if n == 0 {
        let child = node.child_at(0)?;
        return Ok(if child == 0 { None } else { Some((0, child)) });
    }

    let mut idx = n;
    for j in 0..n {
        if node.key_at(j)? > key {
            idx = j;
            break;
        }
    }
    let child = node.child_at(idx)?;
    Ok(if child == 0 { None } else { Some((idx, child)) })
}

/// Exact-match scan of a leaf. Keys are ascending, so the scan stops at
/// the first key past the probe.
fn find_record(node: &Node, key: &[u8]) -> Result<Option<usize>> {
    for i in 0..node.num_keys() {
        match node.key_at(i)?.cmp(key) {
            Ordering::Equal => return Ok(Some(i)),
            Ordering::Greater => return Ok(None),
            Ordering::Less => {}
        }
    }
    Ok(None)
}

impl<'s, S: BlockStore> BTreeIndex<'s, S> {
    /// Create an engine for `key_size`-byte keys and `value_size`-byte
    /// values. The index is unusable until `attach` succeeds.
    pub fn new(key_size: usize, value_size: usize, store: &'s mut S) -> Result<Self> {
        if key_size == 0 {
            return Err(Error::BadConfig("key size must be nonzero".into()));
        }
        if value_size == 0 {
            return Err(Error::BadConfig("value size must be nonzero".into()));
        }
        Ok(BTreeIndex {
            store,
            key_size,
            value_size,
            superblock: None,
        })
    }

    /// Mount the index. With `create`, format the store first: superblock
    /// at block 0, an empty root at block 1, and all remaining blocks
    /// chained onto the free list.
    pub fn attach(&mut self, init_block: u32, create: bool) -> Result<()> {
        if init_block != 0 {
            return Err(Error::BadConfig(format!(
                "superblock must live at block 0, not {}",
                init_block
            )));
        }

        let block_size = self.store.block_size();
        let num_blocks = self.store.num_blocks();
        let interior = super::node::interior_capacity(block_size, self.key_size);
        let leaf = super::node::leaf_capacity(block_size, self.key_size, self.value_size);
        if interior < 2 || leaf < 2 {
            return Err(Error::BadConfig(format!(
                "{} byte blocks hold {} separators and {} records; at least 2 of each are needed",
                block_size, interior, leaf
            )));
        }
        if num_blocks < 3 {
            return Err(Error::BadConfig(format!(
                "store has {} blocks; the superblock, a root, and a free block are needed",
                num_blocks
            )));
        }

        if create {
            let sb = Superblock::new(self.key_size, self.value_size, INITIAL_ROOT_AT, 2);
            sb.store(&mut *self.store)?;
            self.store.notify_allocate(0);

            let root = Node::alloc(
                NodeType::Root,
                self.key_size,
                self.value_size,
                block_size,
                INITIAL_ROOT_AT,
            );
            write_node(&mut *self.store, INITIAL_ROOT_AT, &root)?;
            self.store.notify_allocate(INITIAL_ROOT_AT);

            sb.init_chain(&mut *self.store)?;
            debug_log!(
                "created index: {} blocks of {} bytes, free chain 2..{}",
                num_blocks,
                block_size,
                num_blocks
            );
        }

        let loaded = Superblock::load(&*self.store)?;
        if loaded.key_size() != self.key_size || loaded.value_size() != self.value_size {
            return Err(Error::BadConfig(format!(
                "store is formatted for {} byte keys and {} byte values, not {} and {}",
                loaded.key_size(),
                loaded.value_size(),
                self.key_size,
                self.value_size
            )));
        }
        self.superblock = Some(loaded);
        Ok(())
    }

    /// Flush the superblock and sync the store.
    pub fn detach(&mut self) -> Result<()> {
        self.persist_superblock()?;
        self.store.sync()
    }

    /// Current root block number.
    pub fn root_block(&self) -> Result<u32> {
        Ok(self.superblock()?.root())
    }

    /// Current free-list head (0 when no free blocks remain).
    pub fn free_head(&self) -> Result<u32> {
        Ok(self.superblock()?.free_head())
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let root = self.superblock()?.root();
        self.check_key(key)?;
        self.search(root, key)
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.superblock()?.root();
        self.check_key(key)?;
        self.check_value(value)?;
        self.update_at(root, key, value)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.superblock()?.root();
        self.check_key(key)?;
        self.check_value(value)?;

        let root_node = self.read(root)?;
        if root_node.node_type() != NodeType::Root {
            return Err(Error::Insane(format!(
                "block {} is a {:?} node, not the root",
                root,
                root_node.node_type()
            )));
        }

        if root_node.is_full() {
            let new_root = self.grow_root(root)?;
            self.split_child(new_root, 0)?;
            self.insert_nonfull(new_root, key, value)
        } else if root_node.num_keys() == 0 && root_node.child_at(0)? == 0 {
            self.bootstrap_root(root, key)?;
            self.insert_nonfull(root, key, value)
        } else {
            self.insert_nonfull(root, key, value)
        }
    }

    /// Deletion is intentionally not implemented.
    pub fn delete(&mut self, _key: &[u8]) -> Result<()> {
        Err(Error::Unimplemented)
    }

    /// All records in ascending key order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let root = self.superblock()?.root();
        let mut out = Vec::new();
        self.collect_entries(root, &mut out)?;
        Ok(out)
    }

    /// Depth-first dump of the tree in the requested format.
    pub fn display<W: io::Write>(&self, w: &mut W, mode: DisplayMode) -> Result<()> {
        let root = self.superblock()?.root();
        if mode == DisplayMode::DepthDot {
            writeln!(w, "digraph tree {{")?;
        }
        self.display_at(root, w, mode)?;
        if mode == DisplayMode::DepthDot {
            writeln!(w, "}}")?;
        }
        Ok(())
    }

    /// Validate the structural invariants: separator bounds and in-node
    /// ordering, uniform leaf depth, and a terminating free chain disjoint
    /// from the reachable blocks.
    pub fn sanity_check(&self) -> Result<()> {
        let sb = self.superblock()?;
        let mut reachable: HashSet<u32> = HashSet::new();
        let mut leaf_depth = None;
        self.check_subtree(sb.root(), None, None, 0, &mut reachable, &mut leaf_depth)?;

        let num_blocks = self.store.num_blocks();
        let mut hops = 0u32;
        let mut cur = sb.free_head();
        while cur != 0 {
            hops += 1;
            if hops > num_blocks {
                return Err(Error::BadConfig("free list does not terminate".into()));
            }
            if reachable.contains(&cur) {
                return Err(Error::BadConfig(format!(
                    "block {} is both reachable from the root and on the free list",
                    cur
                )));
            }
            let node = self.read(cur)?;
            if node.node_type() != NodeType::Unallocated {
                return Err(Error::BadConfig(format!(
                    "free-list block {} is a {:?} node",
                    cur,
                    node.node_type()
                )));
            }
            cur = node.free_link();
        }
        Ok(())
    }

    fn superblock(&self) -> Result<&Superblock> {
        self.superblock.as_ref().ok_or_else(not_attached)
    }

    fn persist_superblock(&mut self) -> Result<()> {
        let Some(sb) = self.superblock.as_ref() else {
            return Err(not_attached());
        };
        sb.store(&mut *self.store)
    }

    fn alloc_block(&mut self) -> Result<u32> {
        let Some(sb) = self.superblock.as_mut() else {
            return Err(not_attached());
        };
        sb.allocate(&mut *self.store)
    }

    fn release_block(&mut self, n: u32) -> Result<()> {
        let Some(sb) = self.superblock.as_mut() else {
            return Err(not_attached());
        };
        sb.release(&mut *self.store, n)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(Error::Size {
                what: "key",
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.value_size {
            return Err(Error::Size {
                what: "value",
                expected: self.value_size,
                actual: value.len(),
            });
        }
        Ok(())
    }

    fn read(&self, block: u32) -> Result<Node> {
        read_node(&*self.store, block)
    }

    fn write(&mut self, block: u32, node: &Node) -> Result<()> {
        write_node(&mut *self.store, block, node)
    }

    fn search(&self, block: u32, key: &[u8]) -> Result<Vec<u8>> {
        let node = self.read(block)?;
        match node.node_type() {
            NodeType::Root | NodeType::Interior => match choose_child(&node, key)? {
                Some((_, child)) => self.search(child, key),
                None => Err(Error::Nonexistent),
            },
            NodeType::Leaf => match find_record(&node, key)? {
                Some(i) => Ok(node.value_at(i)?.to_vec()),
                None => Err(Error::Nonexistent),
            },
            other => Err(Error::Insane(format!(
                "{:?} node reached during lookup at block {}",
                other, block
            ))),
        }
    }

    fn update_at(&mut self, block: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let mut node = self.read(block)?;
        match node.node_type() {
            NodeType::Root | NodeType::Interior => match choose_child(&node, key)? {
                Some((_, child)) => self.update_at(child, key, value),
                None => Err(Error::Nonexistent),
            },
            NodeType::Leaf => match find_record(&node, key)? {
                Some(i) => {
                    node.set_value(i, value)?;
                    self.write(block, &node)
                }
                None => Err(Error::Nonexistent),
            },
            other => Err(Error::Insane(format!(
                "{:?} node reached during update at block {}",
                other, block
            ))),
        }
    }

    /// Replace a full root: the old root is demoted to an interior node and
    /// becomes child 0 of a fresh, empty root. The caller splits it next.
    fn grow_root(&mut self, old_root: u32) -> Result<u32> {
        let new_block = self.alloc_block()?;
        debug_log!("growing tree height: new root at block {}", new_block);

        let mut demoted = self.read(old_root)?;
        demoted.set_node_type(NodeType::Interior);
        self.write(old_root, &demoted)?;

        let mut new_root = Node::alloc(
            NodeType::Root,
            self.key_size,
            self.value_size,
            self.store.block_size(),
            new_block,
        );
        new_root.set_child(0, old_root)?;
        self.write(new_block, &new_root)?;

        match self.superblock.as_mut() {
            Some(sb) => sb.set_root(new_block),
            None => return Err(not_attached()),
        }
        self.persist_superblock()?;
        Ok(new_block)
    }

    /// First insert into a fresh tree: wire two empty leaves under the root
    /// with the incoming key as the first separator. The ordinary descent
    /// then lands the record in the right leaf, so the separator equals
    /// that subtree's minimum from the start.
    fn bootstrap_root(&mut self, root_block: u32, key: &[u8]) -> Result<()> {
        let block_size = self.store.block_size();

        let left = self.alloc_block()?;
        let left_leaf = Node::alloc(
            NodeType::Leaf,
            self.key_size,
            self.value_size,
            block_size,
            root_block,
        );
        self.write(left, &left_leaf)?;

        let right = match self.alloc_block() {
            Ok(block) => block,
            Err(Error::NoSpace) => {
                self.release_block(left)?;
                return Err(Error::NoSpace);
            }
            Err(e) => return Err(e),
        };
        let right_leaf = Node::alloc(
            NodeType::Leaf,
            self.key_size,
            self.value_size,
            block_size,
            root_block,
        );
        self.write(right, &right_leaf)?;

        let mut root = self.read(root_block)?;
        root.set_num_keys(1)?;
        root.set_key(0, key)?;
        root.set_child(0, left)?;
        root.set_child(1, right)?;
        self.write(root_block, &root)?;

        debug_log!("bootstrapped leaves {} and {}", left, right);
        Ok(())
    }

    /// Split the full child at position `i` of `parent_block` around its
    /// median. The left child keeps `floor(capacity / 2)` keys, the new
    /// right sibling takes the rest, and a copy of the right sibling's
    /// first key moves up as the separator.
    fn split_child(&mut self, parent_block: u32, i: usize) -> Result<()> {
        let mut parent = self.read(parent_block)?;
        let child_block = parent.child_at(i)?;
        if child_block == 0 {
            return Err(Error::Insane(format!(
                "split of null child {} of block {}",
                i, parent_block
            )));
        }

        let mut child = self.read(child_block)?;
        if !matches!(child.node_type(), NodeType::Interior | NodeType::Leaf) {
            return Err(Error::Insane(format!(
                "split of {:?} node at block {}",
                child.node_type(),
                child_block
            )));
        }
        if !child.is_full() {
            return Err(Error::Insane(format!(
                "split of non-full block {} ({} of {} keys)",
                child_block,
                child.num_keys(),
                child.capacity()
            )));
        }

        let capacity = child.capacity();
        let keep = capacity / 2;
        let moved = capacity - keep;

        // Allocate before mutating anything so NoSpace leaves the tree
        // untouched.
        let right_block = self.alloc_block()?;

        let root_hint = self.superblock()?.root();
        let mut right = Node::alloc(
            child.node_type(),
            self.key_size,
            self.value_size,
            self.store.block_size(),
            root_hint,
        );
        right.set_num_keys(moved)?;

        if child.node_type() == NodeType::Leaf {
            for j in 0..moved {
                let (k, v) = child.entry_at(keep + j)?;
                right.set_entry(j, k, v)?;
            }
        } else {
            for j in 0..moved {
                right.set_key(j, child.key_at(keep + j)?)?;
            }
            // Child 0 guards the empty range below the retained separator
            // and is never descended.
            right.set_child(0, 0)?;
            for j in 1..=moved {
                right.set_child(j, child.child_at(keep + j)?)?;
            }
        }

        let separator = child.key_at(keep)?.to_vec();
        child.set_num_keys(keep)?;

        let parent_keys = parent.num_keys();
        parent.set_num_keys(parent_keys + 1)?;
        for j in (i..parent_keys).rev() {
            let shifted = parent.key_at(j)?.to_vec();
            parent.set_key(j + 1, &shifted)?;
        }
        for j in ((i + 1)..=parent_keys).rev() {
            let shifted = parent.child_at(j)?;
            parent.set_child(j + 1, shifted)?;
        }
        parent.set_key(i, &separator)?;
        parent.set_child(i + 1, right_block)?;

        // Children before parent.
        self.write(child_block, &child)?;
        self.write(right_block, &right)?;
        self.write(parent_block, &parent)?;

        debug_log!(
            "split block {} under {}: sibling {} takes {} keys",
            child_block,
            parent_block,
            right_block,
            moved
        );
        Ok(())
    }

    fn insert_nonfull(&mut self, block: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let mut node = self.read(block)?;
        match node.node_type() {
            NodeType::Leaf => {
                let n = node.num_keys();
                let mut pos = n;
                while pos > 0 {
                    match key.cmp(node.key_at(pos - 1)?) {
                        Ordering::Less => pos -= 1,
                        Ordering::Equal => return Err(Error::Conflict),
                        Ordering::Greater => break,
                    }
                }

                node.set_num_keys(n + 1)?;
                for j in (pos..n).rev() {
                    let (k, v) = node.entry_at(j)?;
                    let (k, v) = (k.to_vec(), v.to_vec());
                    node.set_entry(j + 1, &k, &v)?;
                }
                node.set_entry(pos, key, value)?;
                self.write(block, &node)
            }
            NodeType::Root | NodeType::Interior => {
                // Separators are copies of keys living in the leaves, so a
                // tie descends right like any other probe; a real duplicate
                // is detected at the leaf.
                let Some((child_idx, child_block)) = choose_child(&node, key)? else {
                    return Err(Error::Insane(format!(
                        "descent into null child of block {}",
                        block
                    )));
                };

                let child = self.read(child_block)?;
                let target = if child.is_full() {
                    self.split_child(block, child_idx)?;
                    // The split placed a new separator at child_idx;
                    // re-resolve which side the key belongs on.
                    let node = self.read(block)?;
                    let mut idx = child_idx;
                    if node.key_at(idx)? <= key {
                        idx += 1;
                    }
                    let target = node.child_at(idx)?;
                    if target == 0 {
                        return Err(Error::Insane(format!(
                            "descent into null child {} of block {}",
                            idx, block
                        )));
                    }
                    target
                } else {
                    child_block
                };
                self.insert_nonfull(target, key, value)
            }
            other => Err(Error::Insane(format!(
                "{:?} node reached during insert at block {}",
                other, block
            ))),
        }
    }

    fn collect_entries(&self, block: u32, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let node = self.read(block)?;
        match node.node_type() {
            NodeType::Root | NodeType::Interior => {
                for j in 0..=node.num_keys() {
                    let child = node.child_at(j)?;
                    if child != 0 {
                        self.collect_entries(child, out)?;
                    }
                }
                Ok(())
            }
            NodeType::Leaf => {
                for i in 0..node.num_keys() {
                    let (k, v) = node.entry_at(i)?;
                    out.push((k.to_vec(), v.to_vec()));
                }
                Ok(())
            }
            other => Err(Error::Insane(format!(
                "{:?} node reached during traversal at block {}",
                other, block
            ))),
        }
    }

    fn display_at<W: io::Write>(&self, block: u32, w: &mut W, mode: DisplayMode) -> Result<()> {
        let node = self.read(block)?;
        display::print_node(w, block, &node, mode)?;
        match node.node_type() {
            NodeType::Root | NodeType::Interior => {
                for j in 0..=node.num_keys() {
                    let child = node.child_at(j)?;
                    if child == 0 {
                        continue;
                    }
                    if mode == DisplayMode::DepthDot {
                        writeln!(w, "  {} -> {};", block, child)?;
                    }
                    self.display_at(child, w, mode)?;
                }
                Ok(())
            }
            NodeType::Leaf => Ok(()),
            other => Err(Error::Insane(format!(
                "{:?} node reached during display at block {}",
                other, block
            ))),
        }
    }

    fn check_subtree(
        &self,
        block: u32,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        depth: usize,
        reachable: &mut HashSet<u32>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        if !reachable.insert(block) {
            return Err(Error::BadConfig(format!(
                "block {} is reachable through two paths",
                block
            )));
        }

        let node = self.read(block)?;
        match node.node_type() {
            NodeType::Root => {
                if depth > 0 {
                    return Err(Error::BadConfig(format!(
                        "root-typed node at block {} below the root",
                        block
                    )));
                }
            }
            NodeType::Interior => {
                if depth == 0 {
                    return Err(Error::BadConfig(format!(
                        "root block {} is not root-typed",
                        block
                    )));
                }
            }
            NodeType::Leaf => {}
            other => {
                return Err(Error::Insane(format!(
                    "{:?} node reached from the root at block {}",
                    other, block
                )))
            }
        }

        let n = node.num_keys();
        if n > 0 {
            if let Some(lo) = lo {
                if node.key_at(0)? != lo {
                    return Err(Error::BadConfig(format!(
                        "block {}: first key differs from its separator",
                        block
                    )));
                }
            }
            if let Some(hi) = hi {
                if node.key_at(n - 1)? >= hi {
                    return Err(Error::BadConfig(format!(
                        "block {}: last key reaches past its upper bound",
                        block
                    )));
                }
            }
            for j in 1..n {
                if node.key_at(j - 1)? >= node.key_at(j)? {
                    return Err(Error::BadConfig(format!(
                        "block {}: keys are not strictly ascending",
                        block
                    )));
                }
            }
        }

        if node.node_type().is_interior_kind() {
            for j in 0..=n {
                let child = node.child_at(j)?;
                if child == 0 {
                    // Child 0 may be the empty range below the first
                    // separator; a null pointer anywhere else is damage.
                    if j == 0 {
                        continue;
                    }
                    return Err(Error::BadConfig(format!(
                        "block {}: null child pointer at position {}",
                        block, j
                    )));
                }
                let child_lo = if j == 0 { lo } else { Some(node.key_at(j - 1)?) };
                let child_hi = if j == n { hi } else { Some(node.key_at(j)?) };
                self.check_subtree(child, child_lo, child_hi, depth + 1, reachable, leaf_depth)?;
            }
        } else {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(Error::BadConfig(format!(
                        "leaf {} at depth {} but other leaves at depth {}",
                        block, depth, expected
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
