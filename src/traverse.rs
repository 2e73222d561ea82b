//! Read paths: point lookups and machine-driven traversals.
//!
//! Lookups walk from a version's root offset and may chain node reads; the
//! node store coalesces concurrent reads of the same offset, so two readers
//! racing down the same cold path issue each disk read once.

use crate::io::{IoExecutor, NodeStore};
use crate::nibbles::Nibbles;
use crate::node::Node;
use crate::node::VirtualOffset;
use crate::DbResult;

/// Point lookup of `key` from `root`. `None` when the key has no value.
pub fn get(
    store: &NodeStore,
    io: &IoExecutor,
    root: VirtualOffset,
    key: &Nibbles,
) -> DbResult<Option<Vec<u8>>> {
    let mut node = store.get(io, root)?;
    let mut pos = 0usize;
    loop {
        let path = &node.path;
        if key.len() < pos + path.len() {
            return Ok(None);
        }
        for (i, n) in path.as_slice().iter().enumerate() {
            if key.at(pos + i) != *n {
                return Ok(None);
            }
        }
        pos += path.len();
        if pos == key.len() {
            return Ok(node.value.clone());
        }
        let nibble = key.at(pos);
        pos += 1;
        match node.child(nibble) {
            Some(entry) => node = store.get(io, entry.offset)?,
            None => return Ok(None),
        }
    }
}

/// Caller-supplied control for a depth-first walk.
pub trait TraversalMachine {
    /// Called for every visited node with the nibble path from the root up
    /// to and including the node's own path. Return `false` to prune the
    /// node's subtree.
    fn visit(&mut self, path: &Nibbles, node: &Node) -> DbResult<bool>;

    /// Whether to descend into the child under `nibble`. The default visits
    /// everything `visit` did not prune.
    fn should_descend(&mut self, _path: &Nibbles, _nibble: u8) -> bool {
        true
    }
}

/// Depth-first traversal from `root`, children in ascending nibble order.
pub fn traverse<M: TraversalMachine>(
    store: &NodeStore,
    io: &IoExecutor,
    root: VirtualOffset,
    machine: &mut M,
) -> DbResult<()> {
    let node = store.get(io, root)?;
    let mut path = Nibbles::new();
    path.extend(&node.path);
    walk(store, io, &node, &mut path, machine)
}

fn walk<M: TraversalMachine>(
    store: &NodeStore,
    io: &IoExecutor,
    node: &Node,
    path: &mut Nibbles,
    machine: &mut M,
) -> DbResult<()> {
    if !machine.visit(path, node)? {
        return Ok(());
    }
    for (nibble, entry) in node.iter_children() {
        if !machine.should_descend(path, nibble) {
            continue;
        }
        let child = store.get(io, entry.offset)?;
        let before = path.len();
        path.push(nibble);
        path.extend(&child.path);
        walk(store, io, &child, path, machine)?;
        path.truncate(before);
    }
    Ok(())
}

/// Emits every `(key, value)` with `min <= key < max`, in key order.
pub struct RangedGetMachine<'a> {
    min: Nibbles,
    max: Nibbles,
    emit: &'a mut dyn FnMut(&Nibbles, &[u8]) -> DbResult<()>,
}

impl std::fmt::Debug for RangedGetMachine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedGetMachine")
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl<'a> RangedGetMachine<'a> {
    pub fn new(
        min: Nibbles,
        max: Nibbles,
        emit: &'a mut dyn FnMut(&Nibbles, &[u8]) -> DbResult<()>,
    ) -> Self {
        Self { min, max, emit }
    }

    /// Every key below `prefix`, the shape used to reassemble chunked
    /// records: `[prefix, prefix ++ 0xff..]`.
    pub fn under_prefix(
        prefix: &Nibbles,
        emit: &'a mut dyn FnMut(&Nibbles, &[u8]) -> DbResult<()>,
    ) -> Self {
        let mut max = prefix.clone();
        // Strictly larger than any extension of the prefix: bump the last
        // nibble that can be bumped.
        loop {
            if max.is_empty() {
                // Whole key space (keys bottom out at 130 nibbles).
                max = Nibbles::from_nibbles(&[0xf; 131]);
                break;
            }
            let last = max.at(max.len() - 1);
            if last < 0xf {
                let mut bumped = max.prefix(max.len() - 1);
                bumped.push(last + 1);
                max = bumped;
                break;
            }
            max.truncate(max.len() - 1);
        }
        Self {
            min: prefix.clone(),
            max,
            emit,
        }
    }

    /// Subtree at `prefix` may contain keys in `[min, max)`.
    fn intersects(&self, prefix: &Nibbles) -> bool {
        // All keys in the subtree extend `prefix`. Below the upper bound iff
        // `prefix` is lexicographically below `max` (a prefix of `max`
        // counts: it can be extended below it).
        let upper_ok = {
            let n = prefix.len().min(self.max.len());
            let mut decided = None;
            for i in 0..n {
                if prefix.at(i) != self.max.at(i) {
                    decided = Some(prefix.at(i) < self.max.at(i));
                    break;
                }
            }
            decided.unwrap_or(prefix.len() < self.max.len())
        };
        if !upper_ok {
            return false;
        }
        // Reaches the lower bound iff `prefix` is not below `min`'s
        // corresponding prefix (extensions can then climb to `min`).
        let n = prefix.len().min(self.min.len());
        for i in 0..n {
            if prefix.at(i) != self.min.at(i) {
                return prefix.at(i) > self.min.at(i);
            }
        }
        true
    }

    fn in_range(&self, key: &Nibbles) -> bool {
        key >= &self.min && key < &self.max
    }
}

impl TraversalMachine for RangedGetMachine<'_> {
    fn visit(&mut self, path: &Nibbles, node: &Node) -> DbResult<bool> {
        if !self.intersects(path) {
            return Ok(false);
        }
        if let Some(value) = &node.value {
            if self.in_range(path) {
                (self.emit)(path, value)?;
            }
        }
        Ok(true)
    }

    fn should_descend(&mut self, path: &Nibbles, nibble: u8) -> bool {
        let mut prefix = path.clone();
        prefix.push(nibble);
        self.intersects(&prefix)
    }
}
