//! End-to-end scenarios driving the index through an mmap-backed store.
//!
//! Geometry used throughout: 39-byte blocks with 1-byte keys and values,
//! which gives a leaf capacity of 7 records and an interior capacity of 2
//! separators. Trees split early, so a couple dozen inserts exercise leaf
//! splits, interior splits, and root growth.

use blocktree::{BTreeIndex, DisplayMode, Error, MmapStore, INITIAL_ROOT_AT};
use tempfile::tempdir;

const BLOCK: usize = 39;

fn create_store(num_blocks: u32) -> (tempfile::TempDir, MmapStore) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scenario.idx");
    let store = MmapStore::create(&path, BLOCK, num_blocks).unwrap();
    (dir, store)
}

fn attached(store: &mut MmapStore) -> BTreeIndex<'_, MmapStore> {
    let mut index = BTreeIndex::new(1, 1, store).unwrap();
    index.attach(0, true).unwrap();
    index
}

#[test]
fn fresh_tree_lookup_is_nonexistent() {
    let (_dir, mut store) = create_store(8);
    let index = attached(&mut store);

    assert!(matches!(index.lookup(b"a"), Err(Error::Nonexistent)));
    index.sanity_check().unwrap();
}

#[test]
fn single_insert_round_trips() {
    let (_dir, mut store) = create_store(8);
    let mut index = attached(&mut store);

    index.insert(b"a", b"1").unwrap();

    assert_eq!(index.lookup(b"a").unwrap(), b"1");
    index.sanity_check().unwrap();
}

#[test]
fn leaf_split_preserves_order() {
    let (_dir, mut store) = create_store(16);
    let mut index = attached(&mut store);

    // Ascending inserts a..i: the right leaf fills at 7 records and the
    // 8th forces a leaf split.
    for (i, b) in (b'a'..=b'i').enumerate() {
        index.insert(&[b], &[b'1' + i as u8]).unwrap();
    }

    let entries = index.entries().unwrap();
    assert_eq!(entries.len(), 9);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(k[0], b'a' + i as u8);
        assert_eq!(v[0], b'1' + i as u8);
    }
    index.sanity_check().unwrap();
    drop(index);

    // Formatting notified blocks 0 and 1, the bootstrap allocated two
    // leaves, and the split allocated exactly one sibling.
    assert_eq!(store.allocations(), 2 + 2 + 1);
}

#[test]
fn duplicate_insert_conflicts_without_clobbering() {
    let (_dir, mut store) = create_store(8);
    let mut index = attached(&mut store);

    index.insert(b"a", b"1").unwrap();
    assert!(matches!(index.insert(b"a", b"9"), Err(Error::Conflict)));

    assert_eq!(index.lookup(b"a").unwrap(), b"1");
    index.sanity_check().unwrap();
}

#[test]
fn update_after_conflict_takes_effect() {
    let (_dir, mut store) = create_store(8);
    let mut index = attached(&mut store);

    index.insert(b"a", b"1").unwrap();
    assert!(matches!(index.insert(b"a", b"9"), Err(Error::Conflict)));

    index.update(b"a", b"9").unwrap();
    assert_eq!(index.lookup(b"a").unwrap(), b"9");
}

#[test]
fn sixteen_ascending_keys_grow_the_root() {
    let (_dir, mut store) = create_store(64);
    let mut index = attached(&mut store);

    for b in b'a'..=b'p' {
        index.insert(&[b], &[b]).unwrap();
    }

    assert_ne!(index.root_block().unwrap(), INITIAL_ROOT_AT);
    index.sanity_check().unwrap();

    let keys: Vec<u8> = index.entries().unwrap().iter().map(|(k, _)| k[0]).collect();
    let expected: Vec<u8> = (b'a'..=b'p').collect();
    assert_eq!(keys, expected);
}

#[test]
fn exhaustion_keeps_prior_inserts_intact() {
    let (_dir, mut store) = create_store(6);
    let mut index = attached(&mut store);

    let mut stored = Vec::new();
    loop {
        let b = stored.len() as u8;
        match index.insert(&[b], &[b]) {
            Ok(()) => stored.push(b),
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(!stored.is_empty());
    for b in &stored {
        assert_eq!(index.lookup(&[*b]).unwrap(), vec![*b]);
    }
    index.sanity_check().unwrap();

    // Exhaustion is stable: the next insert fails the same way.
    let next = stored.len() as u8;
    assert!(matches!(index.insert(&[next], &[next]), Err(Error::NoSpace)));
    index.sanity_check().unwrap();
}

#[test]
fn shuffled_inserts_match_sorted_enumeration() {
    let (_dir, mut store) = create_store(256);
    let mut index = attached(&mut store);

    // A fixed permutation of 0..64 with no obvious insertion order.
    let mut keys: Vec<u8> = (0..64).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, (i * 37 + 11) % (i + 1));
    }

    for &b in &keys {
        index.insert(&[b], &[b ^ 0x5A]).unwrap();
        index.sanity_check().unwrap();
    }

    let entries = index.entries().unwrap();
    assert_eq!(entries.len(), 64);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(k[0], i as u8);
        assert_eq!(v[0], i as u8 ^ 0x5A);
    }
}

#[test]
fn index_survives_detach_and_reattach() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.idx");

    {
        let mut store = MmapStore::create(&path, BLOCK, 64).unwrap();
        let mut index = BTreeIndex::new(1, 1, &mut store).unwrap();
        index.attach(0, true).unwrap();
        for b in b'a'..=b'z' {
            index.insert(&[b], &[b.to_ascii_uppercase()]).unwrap();
        }
        index.detach().unwrap();
    }

    let mut store = MmapStore::open(&path, BLOCK).unwrap();
    let mut index = BTreeIndex::new(1, 1, &mut store).unwrap();
    index.attach(0, false).unwrap();

    for b in b'a'..=b'z' {
        assert_eq!(index.lookup(&[b]).unwrap(), vec![b.to_ascii_uppercase()]);
    }
    index.sanity_check().unwrap();
}

#[test]
fn reattach_rejects_mismatched_geometry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("geom.idx");

    {
        let mut store = MmapStore::create(&path, BLOCK, 8).unwrap();
        let mut index = BTreeIndex::new(1, 1, &mut store).unwrap();
        index.attach(0, true).unwrap();
        index.detach().unwrap();
    }

    let mut store = MmapStore::open(&path, BLOCK).unwrap();
    let mut index = BTreeIndex::new(1, 2, &mut store).unwrap();

    assert!(matches!(index.attach(0, false), Err(Error::BadConfig(_))));
}

#[test]
fn free_head_reflects_allocation_traffic() {
    let (_dir, mut store) = create_store(8);
    let mut index = attached(&mut store);

    assert_eq!(index.free_head().unwrap(), 2);

    // Bootstrap consumes blocks 2 and 3 for the two leaves.
    index.insert(b"a", b"1").unwrap();
    assert_eq!(index.free_head().unwrap(), 4);
}

#[test]
fn depth_display_lists_every_node_kind() {
    let (_dir, mut store) = create_store(64);
    let mut index = attached(&mut store);

    for b in b'a'..=b'j' {
        index.insert(&[b], &[b]).unwrap();
    }

    let mut out = Vec::new();
    index.display(&mut out, DisplayMode::Depth).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("Interior:"));
    assert!(text.contains("Leaf:"));
    assert!(text.contains("(a,a)"));
}

#[test]
fn dot_display_is_a_digraph() {
    let (_dir, mut store) = create_store(64);
    let mut index = attached(&mut store);

    for b in b'a'..=b'j' {
        index.insert(&[b], &[b]).unwrap();
    }

    let mut out = Vec::new();
    index.display(&mut out, DisplayMode::DepthDot).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.starts_with("digraph tree {\n"));
    assert!(text.trim_end().ends_with('}'));
    assert!(text.contains(" -> "));
    assert!(text.contains("[ label=\""));
}

#[test]
fn sorted_display_enumerates_in_key_order() {
    let (_dir, mut store) = create_store(64);
    let mut index = attached(&mut store);

    for b in (b'a'..=b'z').rev() {
        index.insert(&[b], &[b]).unwrap();
    }

    let mut out = Vec::new();
    index.display(&mut out, DisplayMode::SortedKeyval).unwrap();
    let text = String::from_utf8(out).unwrap();

    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 26);
    for (i, line) in lines.iter().enumerate() {
        let b = (b'a' + i as u8) as char;
        assert_eq!(*line, format!("({b},{b})"));
    }
}

#[test]
fn notifications_track_tree_allocations() {
    let (_dir, mut store) = create_store(64);

    {
        let mut index = attached(&mut store);
        for b in b'a'..=b'p' {
            index.insert(&[b], &[b]).unwrap();
        }
    }

    // Formatting notified blocks 0 and 1; every further allocation came
    // off the free list, and nothing was ever released.
    assert!(store.allocations() > 2);
    assert_eq!(store.deallocations(), 0);
}
