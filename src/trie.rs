//! The trie upsert engine.
//!
//! One call takes `(old_root, ordered_updates)` and produces a new root,
//! recursing over the shared prefix of the update keys and the existing
//! paths. Children are built bottom-up and written before their parent, so a
//! crash mid-upsert leaves the previous tree fully intact: nothing below the
//! old write frontier is ever modified, and the new root only becomes
//! visible when the caller persists it after a write barrier.
//!
//! Compaction rides along: while descending, any untouched child whose
//! min-offset watermark falls below the current thresholds is rewritten to
//! the slow frontier (a pure relocation, same Merkle reference), so the
//! oldest chunk of each list drains without a separate pass and without
//! blocking readers.

use std::sync::Arc;

use tracing::trace;

use crate::compute::{HashCtx, Hasher, Section};
use crate::io::{IoExecutor, NodeStore, NodeWriter};
use crate::nibbles::Nibbles;
use crate::node::{ChildEntry, MerkleRef, Node, VirtualOffset};
use crate::pool::ChunkPool;
use crate::{DbError, DbResult};

/// What an update does at its key.
#[derive(Clone, Debug)]
pub enum UpdateAction {
    Put(Vec<u8>),
    Delete,
}

/// One entry of an ordered update batch.
#[derive(Clone, Debug)]
pub struct Update {
    /// Key nibbles, absolute within the batch's context.
    pub key: Nibbles,
    pub action: UpdateAction,
    /// Updates applied to the subtree nested below this key (storage slots
    /// below an account leaf). Keys are absolute within that subtree.
    pub nested: Vec<Update>,
    /// Replace the nested subtree instead of updating it: the existing
    /// subtree is dropped before `nested` is applied. Set when an account's
    /// incarnation changes.
    pub bump_incarnation: bool,
}

impl Update {
    pub fn put(key: Nibbles, value: Vec<u8>) -> Self {
        Self {
            key,
            action: UpdateAction::Put(value),
            nested: Vec::new(),
            bump_incarnation: false,
        }
    }

    pub fn delete(key: Nibbles) -> Self {
        Self {
            key,
            action: UpdateAction::Delete,
            nested: Vec::new(),
            bump_incarnation: false,
        }
    }

    pub fn put_nested(
        key: Nibbles,
        value: Vec<u8>,
        mut nested: Vec<Update>,
        bump_incarnation: bool,
    ) -> Self {
        nested.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            key,
            action: UpdateAction::Put(value),
            nested,
            bump_incarnation,
        }
    }
}

/// Compaction thresholds for this upsert, as packed virtual offsets. Zero
/// disables a list.
#[derive(Clone, Copy, Debug, Default)]
pub struct Thresholds {
    pub fast: u64,
    pub slow: u64,
}

impl Thresholds {
    fn wants(&self, entry: &ChildEntry) -> bool {
        (self.fast != 0 && entry.min_fast < self.fast)
            || (self.slow != 0 && entry.min_slow < self.slow)
    }
}

/// A freshly built (and written) subtree root.
#[derive(Clone, Debug)]
pub struct Built {
    pub node: Arc<Node>,
    pub offset: VirtualOffset,
    pub merkle: MerkleRef,
    pub min_fast: u64,
    pub min_slow: u64,
}

impl Built {
    fn entry(&self) -> ChildEntry {
        ChildEntry {
            offset: self.offset,
            merkle: self.merkle,
            min_fast: self.min_fast,
            min_slow: self.min_slow,
        }
    }
}

/// Everything one upsert needs. Exactly one of these is live against a DB at
/// a time; the freelist and both frontiers are only touched through it.
pub struct TrieWriter<'a> {
    pub pool: &'a ChunkPool,
    pub io: &'a IoExecutor,
    pub store: &'a NodeStore,
    pub fast: &'a mut NodeWriter,
    pub slow: &'a mut NodeWriter,
    pub thresholds: Thresholds,
}

impl std::fmt::Debug for TrieWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieWriter")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

/// Per-context walk state: which section we are hashing for and how the
/// context's consumed-nibble count maps to section-relative depth.
#[derive(Clone, Copy, Debug)]
struct WalkCtx {
    section: Section,
    depth_offset: isize,
}

impl WalkCtx {
    fn top() -> Self {
        // Keys at the top level are FINALIZED ++ section ++ section key, so
        // section-relative depth lags the consumed count by two.
        Self {
            section: Section::Root,
            depth_offset: -2,
        }
    }

    fn hash_ctx(&self, consumed_end: usize) -> HashCtx {
        HashCtx {
            section: self.section,
            depth: (self.depth_offset + consumed_end as isize).max(0) as usize,
        }
    }

    fn child(&self, consumed_branch: usize, nibble: u8) -> DbResult<WalkCtx> {
        if self.section == Section::Root && consumed_branch as isize + self.depth_offset == -1
        {
            // Crossing from the version root into a section branch.
            let section = Section::from_nibble(nibble).ok_or(DbError::Corruption {
                offset: None,
                reason: "branch into unknown section",
            })?;
            Ok(WalkCtx {
                section,
                depth_offset: -(consumed_branch as isize) - 1,
            })
        } else {
            Ok(*self)
        }
    }
}

enum OldChild {
    OnDisk(VirtualOffset),
    InMem(Node),
}

/// Apply `updates` to the trie rooted at `old_root`, returning the new root
/// (or `None` when the batch leaves the trie empty). `updates` need not be
/// sorted; an empty batch returns the old root untouched.
pub fn upsert(
    aux: &mut TrieWriter<'_>,
    old_root: Option<VirtualOffset>,
    mut updates: Vec<Update>,
) -> DbResult<Option<Built>> {
    updates.sort_by(|a, b| a.key.cmp(&b.key));
    let ctx = WalkCtx::top();
    match old_root {
        None => {
            if updates.is_empty() {
                return Ok(None);
            }
            create_new(aux, updates, 0, ctx)
        }
        Some(offset) => {
            if updates.is_empty() {
                // Idempotent no-op: recompute the root's description without
                // writing anything. Roots are always fast-frontier writes.
                let node = aux.store.get(aux.io, offset)?;
                let hasher = node_hasher(aux.store, aux.io);
                let merkle =
                    hasher.node_ref(&node, ctx.hash_ctx(node.path.len()))?;
                let (min_fast, min_slow) = mins_of(&node, offset, false);
                return Ok(Some(Built {
                    node,
                    offset,
                    merkle,
                    min_fast,
                    min_slow,
                }));
            }
            apply(aux, OldChild::OnDisk(offset), updates, 0, ctx)
        }
    }
}

fn node_hasher<'a>(store: &'a NodeStore, io: &'a IoExecutor) -> HasherHolder<'a> {
    HasherHolder {
        store,
        io,
    }
}

/// Small helper owning the closure the [`Hasher`] borrows.
struct HasherHolder<'a> {
    store: &'a NodeStore,
    io: &'a IoExecutor,
}

impl<'a> HasherHolder<'a> {
    fn node_ref(&self, node: &Node, ctx: HashCtx) -> DbResult<MerkleRef> {
        let load = |off: VirtualOffset| self.store.get(self.io, off);
        Hasher { load: &load }.node_ref(node, ctx)
    }

    fn root_hash(&self, node: &Node, ctx: HashCtx) -> DbResult<alloy_primitives::B256> {
        let load = |off: VirtualOffset| self.store.get(self.io, off);
        Hasher { load: &load }.root_hash(node, ctx)
    }
}

/// Root hash of an already-committed trie, for read-side callers.
pub fn root_hash_of(
    store: &NodeStore,
    io: &IoExecutor,
    root: VirtualOffset,
) -> DbResult<alloy_primitives::B256> {
    let node = store.get(io, root)?;
    node_hasher(store, io).root_hash(&node, WalkCtx::top().hash_ctx(node.path.len()))
}

fn mins_of(node: &Node, offset: VirtualOffset, in_slow: bool) -> (u64, u64) {
    let mut min_fast = u64::MAX;
    let mut min_slow = u64::MAX;
    for child in &node.children {
        min_fast = min_fast.min(child.min_fast);
        min_slow = min_slow.min(child.min_slow);
    }
    if in_slow {
        min_slow = min_slow.min(offset.raw());
    } else {
        min_fast = min_fast.min(offset.raw());
    }
    (min_fast, min_slow)
}

/// Longest common prefix of all update keys past `consumed`, capped at the
/// shortest remaining key.
fn common_prefix(updates: &[Update], consumed: usize) -> usize {
    let first = &updates[0].key;
    let mut lcp = first.len() - consumed;
    for update in &updates[1..] {
        let mut i = 0;
        let limit = lcp.min(update.key.len() - consumed);
        while i < limit && update.key.at(consumed + i) == first.at(consumed + i) {
            i += 1;
        }
        lcp = lcp.min(i);
    }
    lcp
}

/// Build a fresh subtree from `updates` (no existing node). Deletions of
/// absent keys drop out here.
fn create_new(
    aux: &mut TrieWriter<'_>,
    updates: Vec<Update>,
    consumed: usize,
    ctx: WalkCtx,
) -> DbResult<Option<Built>> {
    let puts: Vec<Update> = updates
        .into_iter()
        .filter(|u| matches!(u.action, UpdateAction::Put(_)))
        .collect();
    if puts.is_empty() {
        return Ok(None);
    }

    let lcp = common_prefix(&puts, consumed);
    let branch_at = consumed + lcp;
    let shared_path = puts[0].key.suffix(consumed).prefix(lcp);

    if puts.len() == 1 && puts[0].key.len() == branch_at {
        // A single leaf, possibly with a nested subtree below it.
        let update = puts.into_iter().next().unwrap();
        let UpdateAction::Put(value) = update.action else {
            unreachable!()
        };
        let path = update.key.suffix(consumed);
        let children = build_nested(aux, update.nested, ctx, branch_at)?;
        let node = assemble(path, Some(value), children);
        return write_node(aux, node, consumed, ctx, false).map(Some);
    }

    // Branch at the divergence point.
    let mut value = None;
    let mut groups: Vec<(u8, Vec<Update>)> = Vec::new();
    for update in puts {
        if update.key.len() == branch_at {
            let UpdateAction::Put(v) = update.action else {
                unreachable!()
            };
            value = Some(v);
            continue;
        }
        let nibble = update.key.at(branch_at);
        match groups.last_mut() {
            Some((n, list)) if *n == nibble => list.push(update),
            _ => groups.push((nibble, vec![update])),
        }
    }

    let mut children: [Option<ChildEntry>; 16] = Default::default();
    for (nibble, group) in groups {
        let child_ctx = ctx.child(branch_at, nibble)?;
        if let Some(built) = create_new(aux, group, branch_at + 1, child_ctx)? {
            children[nibble as usize] = Some(built.entry());
        }
    }
    finish(aux, shared_path, value, children, consumed, ctx)
}

/// Build the children of a leaf from its nested updates (a storage subtree
/// below an account). The nested context restarts key accounting at the
/// leaf's branch point.
fn build_nested(
    aux: &mut TrieWriter<'_>,
    nested: Vec<Update>,
    ctx: WalkCtx,
    leaf_end: usize,
) -> DbResult<[Option<ChildEntry>; 16]> {
    let mut children: [Option<ChildEntry>; 16] = Default::default();
    if nested.is_empty() {
        return Ok(children);
    }
    let nested_ctx = WalkCtx {
        section: ctx.section,
        depth_offset: ctx.depth_offset + leaf_end as isize,
    };
    let mut groups: Vec<(u8, Vec<Update>)> = Vec::new();
    for update in nested {
        let nibble = update.key.at(0);
        match groups.last_mut() {
            Some((n, list)) if *n == nibble => list.push(update),
            _ => groups.push((nibble, vec![update])),
        }
    }
    for (nibble, group) in groups {
        if let Some(built) = create_new(aux, group, 1, nested_ctx)? {
            children[nibble as usize] = Some(built.entry());
        }
    }
    Ok(children)
}

fn assemble(
    path: Nibbles,
    value: Option<Vec<u8>>,
    children: [Option<ChildEntry>; 16],
) -> Node {
    let mut mask = 0u16;
    let mut list = Vec::new();
    for (nibble, entry) in children.into_iter().enumerate() {
        if let Some(entry) = entry {
            mask |= 1 << nibble;
            list.push(entry);
        }
    }
    Node {
        mask,
        path,
        value,
        children: list,
    }
}

/// Assemble, coalesce, and write a rebuilt node. Returns `None` when the
/// subtree vanished entirely.
fn finish(
    aux: &mut TrieWriter<'_>,
    path: Nibbles,
    value: Option<Vec<u8>>,
    children: [Option<ChildEntry>; 16],
    consumed: usize,
    ctx: WalkCtx,
) -> DbResult<Option<Built>> {
    let count = children.iter().flatten().count();
    if value.is_none() && count == 0 {
        return Ok(None);
    }
    if value.is_none() && count == 1 {
        // Single child and no value: concatenate paths and promote the
        // child. Its content is needed, so load it if it is on disk.
        let (nibble, entry) = children
            .iter()
            .enumerate()
            .find_map(|(n, e)| e.as_ref().map(|e| (n as u8, e.clone())))
            .expect("count said one");
        let child = aux.store.get(aux.io, entry.offset)?;
        let merged = Node {
            mask: child.mask,
            path: path.join(nibble, &child.path),
            value: child.value.clone(),
            children: child.children.clone(),
        };
        let merged_ctx = ctx.child(consumed + path.len(), nibble)?;
        return write_node(aux, merged, consumed, merged_ctx, false).map(Some);
    }
    let node = assemble(path, value, children);
    write_node(aux, node, consumed, ctx, false).map(Some)
}

/// Hash, serialize and append one node; prime the cache with it.
fn write_node(
    aux: &mut TrieWriter<'_>,
    node: Node,
    consumed: usize,
    ctx: WalkCtx,
    to_slow: bool,
) -> DbResult<Built> {
    let hash_ctx = ctx.hash_ctx(consumed + node.path.len());
    let merkle = node_hasher(aux.store, aux.io).node_ref(&node, hash_ctx)?;
    let record = node.encode();
    let offset = if to_slow {
        aux.slow.append(aux.pool, aux.io, &record)?
    } else {
        aux.fast.append(aux.pool, aux.io, &record)?
    };
    let (min_fast, min_slow) = mins_of(&node, offset, to_slow);
    trace!(target: "triedb::trie", ?offset, path = ?node.path, "wrote node");
    let node = Arc::new(node);
    aux.store.insert(offset, node.clone());
    Ok(Built {
        node,
        offset,
        merkle,
        min_fast,
        min_slow,
    })
}

/// Pure relocation of a cold subtree to the slow frontier. The Merkle
/// reference is unchanged; only offsets and watermarks move.
fn compact_entry(aux: &mut TrieWriter<'_>, entry: &ChildEntry) -> DbResult<ChildEntry> {
    let node = aux.store.get(aux.io, entry.offset)?;
    let mut children = node.children.clone();
    for child in children.iter_mut() {
        if aux.thresholds.wants(child) {
            *child = compact_entry(aux, child)?;
        }
    }
    let rewritten = Node {
        mask: node.mask,
        path: node.path.clone(),
        value: node.value.clone(),
        children,
    };
    let record = rewritten.encode();
    let offset = aux.slow.append(aux.pool, aux.io, &record)?;
    let (min_fast, min_slow) = mins_of(&rewritten, offset, true);
    trace!(target: "triedb::trie", from = ?entry.offset, to = ?offset, "compacted node");
    aux.store.insert(offset, Arc::new(rewritten));
    Ok(ChildEntry {
        offset,
        merkle: entry.merkle,
        min_fast,
        min_slow,
    })
}

/// The recursive worker: merge `updates` into the subtree rooted at `old`.
fn apply(
    aux: &mut TrieWriter<'_>,
    old: OldChild,
    updates: Vec<Update>,
    consumed: usize,
    ctx: WalkCtx,
) -> DbResult<Option<Built>> {
    let old_node: Arc<Node> = match old {
        OldChild::OnDisk(offset) => aux.store.get(aux.io, offset)?,
        OldChild::InMem(node) => Arc::new(node),
    };
    let path = old_node.path.clone();

    // Divergence point: the smallest common prefix between any update key
    // and the node path.
    let mut k = path.len();
    for update in &updates {
        let rest = update.key.len() - consumed;
        let limit = k.min(rest);
        let mut i = 0;
        while i < limit && update.key.at(consumed + i) == path.at(i) {
            i += 1;
        }
        k = k.min(i);
    }

    if k < path.len() {
        return split(aux, &old_node, updates, consumed, k, ctx);
    }

    // Full path match. Partition updates into the at-node operation and
    // per-nibble descent groups.
    let branch_at = consumed + path.len();
    let mut at_node: Option<Update> = None;
    let mut groups: Vec<(u8, Vec<Update>)> = Vec::new();
    for update in updates {
        if update.key.len() == branch_at {
            at_node = Some(update);
            continue;
        }
        let nibble = update.key.at(branch_at);
        match groups.last_mut() {
            Some((n, list)) if *n == nibble => list.push(update),
            _ => groups.push((nibble, vec![update])),
        }
    }

    let mut value = old_node.value.clone();
    let mut children: [Option<ChildEntry>; 16] = Default::default();
    for (nibble, entry) in old_node.iter_children() {
        children[nibble as usize] = Some(entry.clone());
    }
    let mut nested_work: Vec<(u8, Vec<Update>)> = Vec::new();
    let mut nested_ctx = ctx;

    if let Some(update) = at_node {
        match update.action {
            UpdateAction::Put(v) => {
                value = Some(v);
                if update.bump_incarnation {
                    // Subtree replacement: drop every old child first.
                    children = Default::default();
                }
                if !update.nested.is_empty() {
                    debug_assert!(
                        groups.is_empty(),
                        "outer updates cannot descend past a nested leaf"
                    );
                    nested_ctx = WalkCtx {
                        section: ctx.section,
                        depth_offset: ctx.depth_offset + branch_at as isize,
                    };
                    let mut grouped: Vec<(u8, Vec<Update>)> = Vec::new();
                    for nested in update.nested {
                        let nibble = nested.key.at(0);
                        match grouped.last_mut() {
                            Some((n, list)) if *n == nibble => list.push(nested),
                            _ => grouped.push((nibble, vec![nested])),
                        }
                    }
                    nested_work = grouped;
                }
            }
            UpdateAction::Delete => {
                // Deleting the value of a node that owns a nested subtree
                // (an account) destroys the subtree with it.
                value = None;
                children = Default::default();
            }
        }
    }

    // Outer descent groups.
    for (nibble, group) in groups {
        let child_ctx = ctx.child(branch_at, nibble)?;
        let result = match children[nibble as usize].take() {
            Some(entry) => apply(
                aux,
                OldChild::OnDisk(entry.offset),
                group,
                branch_at + 1,
                child_ctx,
            )?,
            None => create_new(aux, group, branch_at + 1, child_ctx)?,
        };
        children[nibble as usize] = result.map(|b| b.entry());
    }

    // Nested descent groups (storage below an account leaf).
    for (nibble, group) in nested_work {
        let result = match children[nibble as usize].take() {
            Some(entry) => {
                apply(aux, OldChild::OnDisk(entry.offset), group, 1, nested_ctx)?
            }
            None => create_new(aux, group, 1, nested_ctx)?,
        };
        children[nibble as usize] = result.map(|b| b.entry());
    }

    // Untouched children stay, modulo compaction.
    for slot in children.iter_mut() {
        if let Some(entry) = slot {
            if aux.thresholds.wants(entry) {
                *entry = compact_entry(aux, entry)?;
            }
        }
    }

    finish(aux, path, value, children, consumed, ctx)
}

/// Updates diverge from the node path at `k`: build a new branch there, with
/// the path-shortened old node under its original nibble.
fn split(
    aux: &mut TrieWriter<'_>,
    old_node: &Node,
    updates: Vec<Update>,
    consumed: usize,
    k: usize,
    ctx: WalkCtx,
) -> DbResult<Option<Built>> {
    let path = &old_node.path;
    let branch_at = consumed + k;
    let old_nibble = path.at(k);

    let mut value = None;
    let mut groups: Vec<(u8, Vec<Update>)> = Vec::new();
    for update in updates {
        if update.key.len() == branch_at {
            if let UpdateAction::Put(v) = update.action {
                value = Some(v);
            }
            continue;
        }
        let nibble = update.key.at(branch_at);
        match groups.last_mut() {
            Some((n, list)) if *n == nibble => list.push(update),
            _ => groups.push((nibble, vec![update])),
        }
    }

    let shortened = Node {
        mask: old_node.mask,
        path: path.suffix(k + 1),
        value: old_node.value.clone(),
        children: old_node.children.clone(),
    };

    let mut children: [Option<ChildEntry>; 16] = Default::default();
    let mut old_descended = false;
    for (nibble, group) in groups {
        let child_ctx = ctx.child(branch_at, nibble)?;
        let result = if nibble == old_nibble {
            old_descended = true;
            apply(
                aux,
                OldChild::InMem(shortened.clone()),
                group,
                branch_at + 1,
                child_ctx,
            )?
        } else {
            create_new(aux, group, branch_at + 1, child_ctx)?
        };
        children[nibble as usize] = result.map(|b| b.entry());
    }
    if !old_descended {
        let child_ctx = ctx.child(branch_at, old_nibble)?;
        let built = write_node(aux, shortened, branch_at + 1, child_ctx, false)?;
        children[old_nibble as usize] = Some(built.entry());
    }

    finish(aux, path.prefix(k), value, children, consumed, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PREFIX_FINALIZED, PREFIX_STATE, PREFIX_TX_HASH};
    use crate::io::IoConfig;
    use crate::pool::OpenMode;
    use crate::primitives::{Account, EMPTY_ROOT};
    use crate::traverse;
    use alloy_primitives::{keccak256, Address, B256, U256};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct TestEnv {
        pool: Arc<ChunkPool>,
        io: IoExecutor,
        store: NodeStore,
        fast: NodeWriter,
        slow: NodeWriter,
        thresholds: Thresholds,
    }

    impl TestEnv {
        fn new() -> Self {
            Self::with_chunk_size(1 << 16)
        }

        fn with_chunk_size(chunk_size: u64) -> Self {
            let pool = Arc::new(
                ChunkPool::open(&[], 1 << 24, chunk_size, OpenMode::Truncate).unwrap(),
            );
            let config = IoConfig::default();
            let io = IoExecutor::new(pool.clone(), &config);
            let fast = NodeWriter::from_frontier(&pool, crate::pool::ListKind::Fast, &config);
            let slow = NodeWriter::from_frontier(&pool, crate::pool::ListKind::Slow, &config);
            Self {
                pool,
                io,
                store: NodeStore::new(1 << 16),
                fast,
                slow,
                thresholds: Thresholds::default(),
            }
        }

        fn upsert(
            &mut self,
            old: Option<VirtualOffset>,
            updates: Vec<Update>,
        ) -> Option<Built> {
            let thresholds = self.thresholds;
            let built = {
                let mut aux = TrieWriter {
                    pool: &self.pool,
                    io: &self.io,
                    store: &self.store,
                    fast: &mut self.fast,
                    slow: &mut self.slow,
                    thresholds,
                };
                upsert(&mut aux, old, updates).unwrap()
            };
            self.fast.flush(&self.pool, &self.io).unwrap();
            self.slow.flush(&self.pool, &self.io).unwrap();
            self.io.wait_until_done().unwrap();
            built
        }

        fn get(&self, root: VirtualOffset, key: &Nibbles) -> Option<Vec<u8>> {
            traverse::get(&self.store, &self.io, root, key).unwrap()
        }
    }

    /// Keys in an opaque section (raw value hashing).
    fn opaque_key(suffix: &[u8]) -> Nibbles {
        let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_TX_HASH]);
        key.extend(&Nibbles::unpack(suffix));
        key
    }

    fn account_key(address: &Address) -> Nibbles {
        let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_STATE]);
        key.extend(&Nibbles::unpack(keccak256(address).as_slice()));
        key
    }

    #[test]
    fn insert_overwrite_delete() {
        let mut env = TestEnv::new();
        let a = opaque_key(&[0x11; 32]);
        let b = opaque_key(&[0x12; 32]);
        let c = opaque_key(&[0x88; 32]);

        let root = env
            .upsert(
                None,
                vec![
                    Update::put(a.clone(), b"one".to_vec()),
                    Update::put(b.clone(), b"two".to_vec()),
                    Update::put(c.clone(), b"three".to_vec()),
                ],
            )
            .unwrap();
        assert_eq!(env.get(root.offset, &a), Some(b"one".to_vec()));
        assert_eq!(env.get(root.offset, &b), Some(b"two".to_vec()));
        assert_eq!(env.get(root.offset, &c), Some(b"three".to_vec()));

        let root2 = env
            .upsert(
                Some(root.offset),
                vec![
                    Update::put(a.clone(), b"uno".to_vec()),
                    Update::delete(b.clone()),
                ],
            )
            .unwrap();
        assert_eq!(env.get(root2.offset, &a), Some(b"uno".to_vec()));
        assert_eq!(env.get(root2.offset, &b), None);
        assert_eq!(env.get(root2.offset, &c), Some(b"three".to_vec()));
        // The old version still reads its own values.
        assert_eq!(env.get(root.offset, &a), Some(b"one".to_vec()));
        assert_eq!(env.get(root.offset, &b), Some(b"two".to_vec()));
    }

    #[test]
    fn delete_everything_empties_the_trie() {
        let mut env = TestEnv::new();
        let a = opaque_key(&[1; 32]);
        let b = opaque_key(&[2; 32]);
        let root = env
            .upsert(
                None,
                vec![
                    Update::put(a.clone(), vec![1]),
                    Update::put(b.clone(), vec![2]),
                ],
            )
            .unwrap();
        let gone = env.upsert(
            Some(root.offset),
            vec![Update::delete(a), Update::delete(b)],
        );
        assert!(gone.is_none());
    }

    #[test]
    fn deleting_absent_keys_is_harmless() {
        let mut env = TestEnv::new();
        let a = opaque_key(&[1; 32]);
        let root = env
            .upsert(None, vec![Update::put(a.clone(), vec![9])])
            .unwrap();
        let root2 = env
            .upsert(
                Some(root.offset),
                vec![Update::delete(opaque_key(&[0x55; 32]))],
            )
            .unwrap();
        assert_eq!(env.get(root2.offset, &a), Some(vec![9]));
        assert_eq!(root2.merkle, root.merkle);
    }

    #[test]
    fn empty_batch_returns_old_root() {
        let mut env = TestEnv::new();
        let root = env
            .upsert(None, vec![Update::put(opaque_key(&[7; 32]), vec![7])])
            .unwrap();
        let again = env.upsert(Some(root.offset), Vec::new()).unwrap();
        assert_eq!(again.offset, root.offset);
        assert_eq!(again.merkle, root.merkle);
    }

    // Walk the tree asserting every watermark bounds its subtree.
    fn check_watermarks(env: &TestEnv, offset: VirtualOffset) -> (u64, u64) {
        let node = env.store.get(&env.io, offset).unwrap();
        let mut min_fast = u64::MAX;
        let mut min_slow = u64::MAX;
        for entry in &node.children {
            let (child_fast, child_slow) = check_watermarks(env, entry.offset);
            assert!(entry.min_fast <= child_fast);
            assert!(entry.min_slow <= child_slow);
            min_fast = min_fast.min(entry.min_fast);
            min_slow = min_slow.min(entry.min_slow);
        }
        // Everything in these tests is written to the fast frontier unless
        // compaction moved it.
        (min_fast.min(offset.raw()), min_slow)
    }

    #[test]
    fn watermarks_bound_descendants() {
        let mut env = TestEnv::new();
        let mut rng = StdRng::seed_from_u64(7);
        let mut root: Option<Built> = None;
        for _ in 0..5 {
            let updates: Vec<Update> = (0..40)
                .map(|_| {
                    let raw: [u8; 32] = rng.gen();
                    Update::put(opaque_key(&raw), raw.to_vec())
                })
                .collect();
            root = env.upsert(root.map(|b| b.offset), updates);
        }
        let root = root.unwrap();
        check_watermarks(&env, root.offset);
    }

    fn reference_state_root(accounts: &[(Address, Account)]) -> B256 {
        let mut sorted: Vec<_> = accounts
            .iter()
            .map(|(address, account)| {
                (keccak256(address), account.encode_for_hashing(EMPTY_ROOT))
            })
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hb = alloy_trie::HashBuilder::default();
        for (hashed, value) in &sorted {
            hb.add_leaf(alloy_trie::Nibbles::unpack(hashed), value);
        }
        hb.root()
    }

    fn state_section_root(env: &TestEnv, root: &Built) -> B256 {
        let node = env.store.get(&env.io, root.offset).unwrap();
        match node.child(PREFIX_STATE) {
            Some(entry) => crate::compute::Hasher::section_root(&entry.merkle),
            None => EMPTY_ROOT,
        }
    }

    #[test]
    fn state_root_matches_reference_across_random_batches() {
        let mut env = TestEnv::new();
        let mut rng = StdRng::seed_from_u64(42);
        let mut live: Vec<(Address, Account)> = Vec::new();
        let mut root: Option<Built> = None;

        for round in 0u64..8 {
            let mut updates = vec![Update::put(
                Nibbles::from_nibbles(&[PREFIX_FINALIZED]),
                round.to_be_bytes().to_vec(),
            )];
            // Insert a handful of fresh accounts.
            for _ in 0..12 {
                let address = Address::from(rng.gen::<[u8; 20]>());
                let account = Account {
                    nonce: rng.gen_range(0..1_000),
                    balance: U256::from(rng.gen::<u64>()),
                    ..Default::default()
                };
                updates.push(Update::put(
                    account_key(&address),
                    account.encode_leaf(&address),
                ));
                live.retain(|(a, _)| a != &address);
                live.push((address, account));
            }
            // Mutate and delete a few existing ones.
            if live.len() > 6 {
                for _ in 0..3 {
                    let idx = rng.gen_range(0..live.len());
                    let (address, mut account) = live[idx];
                    account.nonce += 1;
                    updates.push(Update::put(
                        account_key(&address),
                        account.encode_leaf(&address),
                    ));
                    live[idx].1 = account;
                }
                let idx = rng.gen_range(0..live.len());
                let (address, _) = live.remove(idx);
                updates.push(Update::delete(account_key(&address)));
            }

            root = env.upsert(root.map(|b| b.offset), updates);
            let built = root.clone().unwrap();
            assert_eq!(
                state_section_root(&env, &built),
                reference_state_root(&live),
                "diverged at round {round}"
            );
        }
    }

    #[test]
    fn nested_storage_root_matches_reference() {
        let mut env = TestEnv::new();
        let address = Address::repeat_byte(0xaa);
        let account = Account {
            nonce: 1337,
            balance: U256::from(1_000_000u64),
            ..Default::default()
        };
        let slots: Vec<(B256, B256)> = vec![
            (B256::with_last_byte(1), B256::with_last_byte(0x11)),
            (B256::repeat_byte(0x1c), B256::with_last_byte(7)),
            (B256::repeat_byte(0x9e), B256::with_last_byte(0x2f)),
        ];
        let nested: Vec<Update> = slots
            .iter()
            .map(|(slot, value)| {
                Update::put(
                    Nibbles::unpack(keccak256(slot).as_slice()),
                    crate::primitives::encode_storage_leaf(slot, value),
                )
            })
            .collect();
        // A header value keeps the version root a real branch point, the
        // same shape every commit produces.
        let header_put =
            || Update::put(Nibbles::from_nibbles(&[PREFIX_FINALIZED]), vec![0x11]);
        let root = env
            .upsert(
                None,
                vec![
                    header_put(),
                    Update::put_nested(
                        account_key(&address),
                        account.encode_leaf(&address),
                        nested,
                        false,
                    ),
                ],
            )
            .unwrap();

        // Reference: storage trie root first, then the account trie.
        let mut sorted: Vec<_> = slots
            .iter()
            .map(|(slot, value)| {
                (
                    keccak256(slot),
                    alloy_rlp::encode(U256::from_be_bytes(value.0)),
                )
            })
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hb = alloy_trie::HashBuilder::default();
        for (hashed, value) in &sorted {
            hb.add_leaf(alloy_trie::Nibbles::unpack(hashed), value);
        }
        let storage_root = hb.root();

        let mut hb = alloy_trie::HashBuilder::default();
        hb.add_leaf(
            alloy_trie::Nibbles::unpack(keccak256(address)),
            &account.encode_for_hashing(storage_root),
        );
        assert_eq!(state_section_root(&env, &root), hb.root());

        // Dropping the subtree (incarnation bump) goes back to an
        // empty-storage account.
        let bumped = env
            .upsert(
                Some(root.offset),
                vec![Update::put_nested(
                    account_key(&address),
                    account.encode_leaf(&address),
                    Vec::new(),
                    true,
                )],
            )
            .unwrap();
        assert_eq!(
            state_section_root(&env, &bumped),
            reference_state_root(&[(address, account)])
        );
    }

    #[test]
    fn compaction_relocates_without_changing_hashes() {
        let mut env = TestEnv::with_chunk_size(1 << 14);
        let mut rng = StdRng::seed_from_u64(3);
        let mut root: Option<Built> = None;
        let mut keys = Vec::new();
        for _ in 0..6 {
            let updates: Vec<Update> = (0..30)
                .map(|_| {
                    let raw: [u8; 32] = rng.gen();
                    keys.push(opaque_key(&raw));
                    Update::put(opaque_key(&raw), raw.to_vec())
                })
                .collect();
            root = env.upsert(root.map(|b| b.offset), updates);
        }
        let before = root.clone().unwrap();
        assert!(
            env.pool.list_len(crate::pool::ListKind::Fast) > 1,
            "test needs several chunks"
        );

        // Target the oldest fast chunk, then upsert one fresh key.
        let (head, _) = env.pool.list_head(crate::pool::ListKind::Fast).unwrap();
        let threshold = ((head as u64) + 1) << crate::node::OFFSET_BITS;
        env.thresholds = Thresholds {
            fast: threshold,
            slow: 0,
        };
        // A delete of an absent key perturbs nothing, so every hash must
        // survive the relocation byte-for-byte.
        let absent: [u8; 32] = rng.gen();
        let after = env
            .upsert(
                Some(before.offset),
                vec![Update::delete(opaque_key(&absent))],
            )
            .unwrap();

        // Nothing live remains below the threshold, every key still reads,
        // and untouched subtree hashes did not move.
        assert!(after.min_fast >= threshold);
        for key in &keys {
            assert!(env.get(after.offset, key).is_some());
        }
        let old_node = env.store.get(&env.io, before.offset).unwrap();
        let new_node = env.store.get(&env.io, after.offset).unwrap();
        for (nibble, old_entry) in old_node.iter_children() {
            if let Some(new_entry) = new_node.child(nibble) {
                assert_eq!(old_entry.merkle, new_entry.merkle);
            }
        }
    }
}
