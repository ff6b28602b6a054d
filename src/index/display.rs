//! Node rendering for the depth-first tree dumps.
//!
//! Three formats are supported:
//!
//! - `Depth`: one human-readable line per node, children after parents.
//! - `DepthDot`: a Graphviz digraph; node labels plus one edge line per
//!   child pointer (the tree driver emits the edges and the wrapper).
//! - `SortedKeyval`: `(key,value)` per leaf record, one per line. A
//!   depth-first walk of an intact tree emits records in ascending key
//!   order, so this mode is an ordered enumeration of the index.
//!
//! Key and value bytes print as ASCII where they are printable and as
//! `\xNN` escapes everywhere else.

use std::io;

use crate::error::Result;

use super::node::{Node, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Depth,
    DepthDot,
    SortedKeyval,
}

pub(crate) fn write_bytes<W: io::Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            w.write_all(&[b])?;
        } else {
            write!(w, "\\x{:02x}", b)?;
        }
    }
    Ok(())
}

fn write_interior_items<W: io::Write>(w: &mut W, node: &Node) -> Result<()> {
    for j in 0..=node.num_keys() {
        write!(w, "*{}", node.child_at(j)?)?;
        if j == node.num_keys() {
            break;
        }
        write!(w, " ")?;
        write_bytes(w, node.key_at(j)?)?;
        write!(w, " ")?;
    }
    Ok(())
}

fn write_leaf_items<W: io::Write>(w: &mut W, node: &Node) -> Result<()> {
    for i in 0..node.num_keys() {
        if i > 0 {
            write!(w, " ")?;
        }
        let (key, value) = node.entry_at(i)?;
        write!(w, "(")?;
        write_bytes(w, key)?;
        write!(w, ",")?;
        write_bytes(w, value)?;
        write!(w, ")")?;
    }
    Ok(())
}

/// Render one node. The caller drives the depth-first traversal and, for
/// `DepthDot`, the surrounding digraph and edge lines.
pub(crate) fn print_node<W: io::Write>(
    w: &mut W,
    block: u32,
    node: &Node,
    mode: DisplayMode,
) -> Result<()> {
    match mode {
        DisplayMode::SortedKeyval => {
            if node.node_type() == NodeType::Leaf {
                for i in 0..node.num_keys() {
                    let (key, value) = node.entry_at(i)?;
                    write!(w, "(")?;
                    write_bytes(w, key)?;
                    write!(w, ",")?;
                    write_bytes(w, value)?;
                    writeln!(w, ")")?;
                }
            }
        }
        DisplayMode::Depth => {
            if node.node_type().is_interior_kind() {
                write!(w, "{}: Interior: ", block)?;
                write_interior_items(w, node)?;
            } else {
                write!(w, "{}: Leaf: ", block)?;
                write_leaf_items(w, node)?;
            }
            writeln!(w)?;
        }
        DisplayMode::DepthDot => {
            write!(w, "  {} [ label=\"{}: ", block, block)?;
            if node.node_type().is_interior_kind() {
                write_interior_items(w, node)?;
            } else {
                write_leaf_items(w, node)?;
            }
            writeln!(w, "\" ];")?;
        }
    }
    Ok(())
}
