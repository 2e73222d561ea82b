//! The versioned DB façade.
//!
//! Blockchain-level keys map onto trie keys under a small set of nibble
//! prefixes below the FINALIZED top nibble. Each block commit builds exactly
//! one update batch (accounts, storage, code, receipts, transactions,
//! tx-hash index, call frames) and runs exactly one upsert, producing one
//! new version whose number is the block number.
//!
//! Versions form a tree while speculative: multiple proposals at the same
//! height share the latest finalized ancestor, and `finalize` collapses the
//! tree to one path. The front-of-disk root pointer only ever moves at
//! finalization, after a full write barrier, so readers never observe a
//! partially written version.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::Encodable;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::compute::Hasher;
use crate::io::{IoConfig, IoExecutor, NodeStore, NodeWriter};
use crate::nibbles::Nibbles;
use crate::node::{VirtualOffset, OFFSET_BITS};
use crate::pool::{ChunkPool, ListKind, OpenMode};
use crate::primitives::{
    chunk_call_frames, encode_storage_leaf, encode_tx_locator, Account, BlockHeader,
    CallFrame, Code, Receipt, StateDeltas, Transaction, Withdrawal, EMPTY_ROOT,
};
use crate::traverse::{self, RangedGetMachine};
use crate::trie::{self, Built, Thresholds, TrieWriter, Update};
use crate::{DbError, DbResult};

/// Top nibble of every committed key.
pub const PREFIX_FINALIZED: u8 = 0x0;
/// Section nibbles below FINALIZED.
pub const PREFIX_STATE: u8 = 0x1;
pub const PREFIX_CODE: u8 = 0x2;
pub const PREFIX_RECEIPT: u8 = 0x3;
pub const PREFIX_TRANSACTION: u8 = 0x4;
pub const PREFIX_TX_HASH: u8 = 0x5;
pub const PREFIX_CALL_FRAME: u8 = 0x6;

/// Byte budget of one call-frame chunk value.
const CALL_FRAME_CHUNK: usize = 8 * 1024;

/// DB configuration.
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Backing devices. Empty means one in-memory device.
    pub paths: Vec<PathBuf>,
    /// Capacity per device in bytes.
    pub capacity: u64,
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Finalized versions kept readable behind the latest one.
    pub history_len: u64,
    /// Enable inline compaction.
    pub compaction: bool,
    /// Chunks a list may hold before compaction starts draining its head.
    pub compaction_chunk_budget: usize,
    /// Node cache capacity (entries).
    pub node_cache: usize,
    pub io: IoConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            capacity: 1 << 30,
            chunk_size: 1 << 24,
            history_len: 256,
            compaction: true,
            compaction_chunk_budget: 4,
            node_cache: 64 * 1024,
            io: IoConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct RootEntry {
    offset: VirtualOffset,
    block_id: B256,
    parent_id: B256,
    min_fast: u64,
    min_slow: u64,
    tx_count: u32,
}

#[derive(Debug)]
struct Roots {
    finalized: BTreeMap<u64, RootEntry>,
    /// Proposals by height, in commit order. Finalization keeps the records
    /// around (the listing surface reports them) but reads resolve finalized
    /// entries first.
    proposals: Vec<(u64, RootEntry)>,
    latest_finalized: Option<u64>,
    verified: u64,
}

struct DbShared {
    pool: Arc<ChunkPool>,
    io: IoExecutor,
    store: NodeStore,
    roots: Mutex<Roots>,
    /// Fast and slow writers; holding this lock is the single-writer
    /// invariant.
    writers: Mutex<(NodeWriter, NodeWriter)>,
    code_cache: DashMap<B256, Bytes>,
    config: DbConfig,
}

impl std::fmt::Debug for DbShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbShared").finish_non_exhaustive()
    }
}

/// Handle to one open database. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct Db {
    shared: Arc<DbShared>,
}

impl Db {
    /// Open (or create) a database. An empty `paths` list opens an
    /// in-memory device, which is always truncated.
    pub fn open(config: DbConfig, mode: OpenMode) -> DbResult<Self> {
        let mode = if config.paths.is_empty() {
            OpenMode::Truncate
        } else {
            mode
        };
        let pool = Arc::new(ChunkPool::open(
            &config.paths,
            config.capacity,
            config.chunk_size,
            mode,
        )?);
        let io = IoExecutor::new(pool.clone(), &config.io);
        let store = NodeStore::new(config.node_cache);
        let fast = NodeWriter::from_frontier(&pool, ListKind::Fast, &config.io);
        let slow = NodeWriter::from_frontier(&pool, ListKind::Slow, &config.io);

        let mut roots = Roots {
            finalized: BTreeMap::new(),
            proposals: Vec::new(),
            latest_finalized: None,
            verified: 0,
        };
        let (latest_root, latest_version) = pool.latest_root();
        if latest_root.is_valid() {
            // Only the latest finalized version survives a restart; older
            // history and proposals were speculative or are rebuilt as new
            // blocks finalize.
            let node = store.get(&io, latest_root)?;
            let (min_fast, min_slow) = node
                .children
                .iter()
                .fold((latest_root.raw(), u64::MAX), |(f, s), c| {
                    (f.min(c.min_fast), s.min(c.min_slow))
                });
            roots.finalized.insert(
                latest_version,
                RootEntry {
                    offset: latest_root,
                    block_id: B256::from(U256::from(latest_version)),
                    parent_id: B256::ZERO,
                    min_fast,
                    min_slow,
                    tx_count: 0,
                },
            );
            roots.latest_finalized = Some(latest_version);
            info!(
                target: "triedb::db",
                version = latest_version,
                "recovered latest finalized version"
            );
        }

        Ok(Self {
            shared: Arc::new(DbShared {
                pool,
                io,
                store,
                roots: Mutex::new(roots),
                writers: Mutex::new((fast, slow)),
                code_cache: DashMap::new(),
                config,
            }),
        })
    }

    pub fn get_latest_finalized_version(&self) -> Option<u64> {
        self.shared.roots.lock().unwrap().latest_finalized
    }

    pub fn get_verified_version(&self) -> u64 {
        self.shared.roots.lock().unwrap().verified
    }

    /// Every block id committed at `block_number`, finalized or proposed.
    pub fn get_proposal_block_ids(&self, block_number: u64) -> Vec<B256> {
        let roots = self.shared.roots.lock().unwrap();
        let mut ids: Vec<B256> = roots
            .proposals
            .iter()
            .filter(|(n, _)| *n == block_number)
            .map(|(_, e)| e.block_id)
            .collect();
        if let Some(entry) = roots.finalized.get(&block_number) {
            if !ids.contains(&entry.block_id) {
                ids.push(entry.block_id);
            }
        }
        ids
    }

    /// Parent block id of a recorded proposal.
    pub fn get_proposal_parent(&self, block_number: u64, block_id: B256) -> Option<B256> {
        let roots = self.shared.roots.lock().unwrap();
        roots
            .proposals
            .iter()
            .find(|(n, e)| *n == block_number && e.block_id == block_id)
            .map(|(_, e)| e.parent_id)
    }

    /// Record advancement of the verified frontier.
    pub fn update_verified_block(&self, block_number: u64) {
        let mut roots = self.shared.roots.lock().unwrap();
        roots.verified = roots.verified.max(block_number);
    }

    /// Mark one proposal at `block_number` canonical, discard its siblings
    /// for read resolution, persist the root pointer, and reclaim what aged
    /// out of the history window.
    pub fn finalize(&self, block_number: u64, block_id: B256) -> DbResult<()> {
        let entry = {
            let mut roots = self.shared.roots.lock().unwrap();
            if let Some(latest) = roots.latest_finalized {
                if block_number <= latest {
                    return Err(DbError::InvalidBlockProposal {
                        reason: format!(
                            "finalize {block_number} behind latest {latest}"
                        ),
                    });
                }
            }
            let entry = roots
                .proposals
                .iter()
                .find(|(n, e)| *n == block_number && e.block_id == block_id)
                .map(|(_, e)| e.clone())
                .ok_or_else(|| DbError::InvalidBlockProposal {
                    reason: format!("no proposal {block_id} at {block_number}"),
                })?;
            roots.finalized.insert(block_number, entry.clone());
            roots.latest_finalized = Some(block_number);
            // Slide the history window.
            let keep_from =
                block_number.saturating_sub(self.shared.config.history_len);
            let stale: Vec<u64> = roots
                .finalized
                .range(..keep_from)
                .map(|(v, _)| *v)
                .collect();
            for v in stale {
                roots.finalized.remove(&v);
            }
            roots.proposals.retain(|(n, _)| *n + self.shared.config.history_len
                >= block_number);
            entry
        };
        // Data first, pointer last: the barrier ran at commit, so the
        // in-place header write cannot overtake node writes.
        self.shared.io.wait_until_done()?;
        self.shared.pool.set_latest_root(entry.offset, block_number);
        self.shared.pool.persist_header_sync()?;
        self.reclaim_chunks()?;
        debug!(target: "triedb::db", block_number, ?block_id, "finalized");
        Ok(())
    }

    /// Release list-head chunks no retained version can reach anymore.
    fn reclaim_chunks(&self) -> DbResult<()> {
        if !self.shared.config.compaction {
            return Ok(());
        }
        let roots = self.shared.roots.lock().unwrap();
        let retained: Vec<RootEntry> = roots
            .finalized
            .values()
            .cloned()
            .chain(roots.proposals.iter().map(|(_, e)| e.clone()))
            .collect();
        drop(roots);
        for kind in [ListKind::Fast, ListKind::Slow] {
            loop {
                if self.shared.pool.list_len(kind) <= 1 {
                    break;
                }
                let Some((head, _)) = self.shared.pool.list_head(kind) else {
                    break;
                };
                let threshold = ((head as u64) + 1) << OFFSET_BITS;
                let reachable = retained.iter().any(|e| {
                    let min = match kind {
                        ListKind::Fast => e.min_fast,
                        ListKind::Slow => e.min_slow,
                    };
                    min < threshold
                });
                if reachable {
                    break;
                }
                self.shared.pool.release_chunk(head)?;
                info!(target: "triedb::db", chunk = head, list = ?kind, "reclaimed chunk");
            }
        }
        Ok(())
    }

    fn root_offset(&self, version: u64, block_id: Option<B256>) -> Option<VirtualOffset> {
        let roots = self.shared.roots.lock().unwrap();
        match block_id {
            Some(id) => {
                if let Some(entry) = roots.finalized.get(&version) {
                    if entry.block_id == id {
                        return Some(entry.offset);
                    }
                }
                roots
                    .proposals
                    .iter()
                    .find(|(n, e)| *n == version && e.block_id == id)
                    .map(|(_, e)| e.offset)
            }
            None => {
                if let Some(entry) = roots.finalized.get(&version) {
                    return Some(entry.offset);
                }
                // Fall back to a lone proposal at that height.
                let mut at: Vec<&RootEntry> = roots
                    .proposals
                    .iter()
                    .filter(|(n, _)| *n == version)
                    .map(|(_, e)| e)
                    .collect();
                if at.len() == 1 {
                    Some(at.pop().unwrap().offset)
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn store(&self) -> &NodeStore {
        &self.shared.store
    }

    pub(crate) fn io(&self) -> &IoExecutor {
        &self.shared.io
    }

    pub(crate) fn root_at(
        &self,
        version: u64,
        block_id: Option<B256>,
    ) -> Option<VirtualOffset> {
        self.root_offset(version, block_id)
    }
}

/// A cursor over one version of the trie. Reads resolve from the cursor
/// position; `commit` stacks a new proposal on top of it.
#[derive(Clone, Debug)]
pub struct TrieDb {
    db: Db,
    version: Option<u64>,
    block_id: Option<B256>,
}

/// Everything one block commit carries into the DB.
#[derive(Clone, Debug, Default)]
pub struct Commit {
    pub deltas: StateDeltas,
    pub code: Code,
    pub block_id: B256,
    pub header: BlockHeader,
    pub receipts: Vec<Receipt>,
    pub transactions: Vec<Transaction>,
    pub senders: Vec<Address>,
    /// Per-transaction call frames; empty when tracing is off.
    pub call_frames: Vec<Vec<CallFrame>>,
    pub ommers: Vec<BlockHeader>,
    pub withdrawals: Option<Vec<Withdrawal>>,
}

impl TrieDb {
    pub fn new(db: Db) -> Self {
        let version = db.get_latest_finalized_version();
        Self {
            db,
            version,
            block_id: None,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Position the cursor at a finalized version.
    pub fn set_block_and_prefix(&mut self, version: u64) {
        self.version = Some(version);
        self.block_id = None;
    }

    /// Position the cursor at a specific proposal.
    pub fn set_block_and_prefix_with(&mut self, version: u64, block_id: B256) {
        self.version = Some(version);
        self.block_id = Some(block_id);
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    fn cursor_root(&self) -> Option<VirtualOffset> {
        let version = self.version?;
        self.db.root_offset(version, self.block_id)
    }

    // ---- commit --------------------------------------------------------

    /// Commit one block on top of the cursor, creating a new proposal at
    /// `header.number`. The cursor moves onto the new proposal.
    pub fn commit(&mut self, commit: Commit) -> DbResult<B256> {
        let number = commit.header.number;
        if commit.transactions.len() != commit.senders.len() {
            return Err(DbError::MissingSender {
                tx_index: commit.senders.len(),
            });
        }

        // Parent resolution. The first commit on an empty DB roots the tree.
        let (parent_offset, parent_id, parent_tx_count) = {
            let roots = self.db.shared.roots.lock().unwrap();
            let empty = roots.finalized.is_empty() && roots.proposals.is_empty();
            if roots
                .proposals
                .iter()
                .any(|(n, e)| *n == number && e.block_id == commit.block_id)
            {
                return Err(DbError::InvalidBlockProposal {
                    reason: format!("duplicate proposal at {number}"),
                });
            }
            if empty {
                (None, B256::ZERO, 0u32)
            } else {
                let parent_version = number.checked_sub(1).ok_or_else(|| {
                    DbError::InvalidBlockProposal {
                        reason: "commit at version 0 on a non-empty db".into(),
                    }
                })?;
                if self.version != Some(parent_version) {
                    return Err(DbError::InvalidBlockProposal {
                        reason: format!(
                            "cursor not at parent version {parent_version}"
                        ),
                    });
                }
                let entry = match self.block_id {
                    Some(id) => roots
                        .finalized
                        .get(&parent_version)
                        .filter(|e| e.block_id == id)
                        .cloned()
                        .or_else(|| {
                            roots
                                .proposals
                                .iter()
                                .find(|(n, e)| {
                                    *n == parent_version && e.block_id == id
                                })
                                .map(|(_, e)| e.clone())
                        }),
                    None => roots.finalized.get(&parent_version).cloned(),
                };
                let entry = entry.ok_or_else(|| DbError::InvalidBlockProposal {
                    reason: format!("parent at {parent_version} not found"),
                })?;
                (Some(entry.offset), entry.block_id, entry.tx_count)
            }
        };

        let updates = self.build_updates(&commit, parent_offset, parent_tx_count)?;

        // One upsert per block, under the single-writer lock.
        let mut writers = self.db.shared.writers.lock().unwrap();
        let thresholds = self.thresholds();
        let built = {
            let (fast, slow) = &mut *writers;
            let mut aux = TrieWriter {
                pool: &self.db.shared.pool,
                io: &self.db.shared.io,
                store: &self.db.shared.store,
                fast,
                slow,
                thresholds,
            };
            trie::upsert(&mut aux, parent_offset, updates)?
        }
        .ok_or(DbError::Corruption {
            offset: None,
            reason: "commit produced an empty trie",
        })?;
        writers.0.flush(&self.db.shared.pool, &self.db.shared.io)?;
        writers.1.flush(&self.db.shared.pool, &self.db.shared.io)?;
        drop(writers);
        // The barrier makes every node of the new version durable before it
        // becomes reachable; an error here aborts with the old root intact.
        self.db.shared.io.wait_until_done()?;

        for (hash, code) in &commit.code {
            self.db.shared.code_cache.insert(*hash, code.clone());
        }

        let Built {
            offset,
            min_fast,
            min_slow,
            ..
        } = built;
        {
            let mut roots = self.db.shared.roots.lock().unwrap();
            roots.proposals.push((
                number,
                RootEntry {
                    offset,
                    block_id: commit.block_id,
                    parent_id,
                    min_fast,
                    min_slow,
                    tx_count: commit.transactions.len() as u32,
                },
            ));
        }
        self.db.shared.store.evict();
        self.set_block_and_prefix_with(number, commit.block_id);
        debug!(
            target: "triedb::db",
            number,
            txs = commit.transactions.len(),
            "committed proposal"
        );
        Ok(commit.block_id)
    }

    /// Commit and immediately finalize, the single-finalized-chain shape.
    /// The block id is derived from the block number.
    pub fn commit_sequential(&mut self, mut commit: Commit) -> DbResult<B256> {
        let number = commit.header.number;
        if commit.block_id == B256::ZERO {
            commit.block_id = B256::from(U256::from(number));
        }
        let block_id = self.commit(commit)?;
        self.db.finalize(number, block_id)?;
        self.set_block_and_prefix(number);
        Ok(block_id)
    }

    fn thresholds(&self) -> Thresholds {
        let config = &self.db.shared.config;
        if !config.compaction {
            return Thresholds::default();
        }
        let mut out = Thresholds::default();
        for kind in [ListKind::Fast, ListKind::Slow] {
            if self.db.shared.pool.list_len(kind) > config.compaction_chunk_budget {
                if let Some((head, _)) = self.db.shared.pool.list_head(kind) {
                    let threshold = ((head as u64) + 1) << OFFSET_BITS;
                    match kind {
                        ListKind::Fast => out.fast = threshold,
                        ListKind::Slow => out.slow = threshold,
                    }
                }
            }
        }
        out
    }

    fn build_updates(
        &self,
        commit: &Commit,
        parent_offset: Option<VirtualOffset>,
        parent_tx_count: u32,
    ) -> DbResult<Vec<Update>> {
        let mut updates = Vec::new();

        // The version root carries the block header.
        updates.push(Update::put(
            Nibbles::from_nibbles(&[PREFIX_FINALIZED]),
            commit.header.encode_rlp(),
        ));

        // Accounts and storage.
        for (address, delta) in &commit.deltas {
            let key = state_key(address);
            match &delta.account {
                (_, Some(post)) => {
                    let mut nested = Vec::with_capacity(delta.storage.len());
                    for (slot, (_, value)) in &delta.storage {
                        let slot_key = Nibbles::unpack(keccak256(slot).as_slice());
                        if value.is_zero() {
                            nested.push(Update::delete(slot_key));
                        } else {
                            nested.push(Update::put(
                                slot_key,
                                encode_storage_leaf(slot, value),
                            ));
                        }
                    }
                    let bump = match &delta.account.0 {
                        Some(pre) => pre.incarnation != post.incarnation,
                        None => false,
                    };
                    updates.push(Update::put_nested(
                        key,
                        post.encode_leaf(address),
                        nested,
                        bump,
                    ));
                }
                (Some(_), None) => updates.push(Update::delete(key)),
                (None, None) => {} // touched but never modified
            }
        }

        // Code, content addressed; never deleted.
        for (hash, code) in &commit.code {
            updates.push(Update::put(code_key(hash), code.to_vec()));
        }

        // Receipts with their cumulative log-index bases.
        let mut log_index = 0u64;
        for (i, receipt) in commit.receipts.iter().enumerate() {
            updates.push(Update::put(
                receipt_key(i as u32),
                receipt.encode_db(log_index),
            ));
            log_index += receipt.logs.len() as u64;
        }

        // Transactions with senders, plus the hash index.
        for (i, (tx, sender)) in commit
            .transactions
            .iter()
            .zip(commit.senders.iter())
            .enumerate()
        {
            updates.push(Update::put(tx_key(i as u32), tx.encode_db(sender)));
            updates.push(Update::put(
                tx_hash_key(&tx.hash()),
                encode_tx_locator(commit.header.number, i as u32),
            ));
        }

        // The per-block index spaces shrink when this block has fewer
        // entries than its parent; stale tails must go.
        let new_count = commit
            .transactions
            .len()
            .max(commit.receipts.len()) as u32;
        for i in new_count..parent_tx_count {
            updates.push(Update::delete(receipt_key(i)));
            updates.push(Update::delete(tx_key(i)));
        }

        // Call frames, chunked per transaction.
        let mut new_chunks: Vec<u16> = Vec::new();
        for (i, frames) in commit.call_frames.iter().enumerate() {
            let chunks = chunk_call_frames(frames, CALL_FRAME_CHUNK);
            new_chunks.push(chunks.len() as u16);
            for (j, chunk) in chunks.into_iter().enumerate() {
                updates.push(Update::put(call_frame_key(i as u32, j as u16), chunk));
            }
        }
        if let Some(parent) = parent_offset {
            self.collect_stale_call_frames(parent, &new_chunks, &mut updates)?;
        }

        Ok(updates)
    }

    /// Walk the parent's CALL_FRAME section and delete every chunk key this
    /// block does not overwrite.
    fn collect_stale_call_frames(
        &self,
        parent: VirtualOffset,
        new_chunks: &[u16],
        updates: &mut Vec<Update>,
    ) -> DbResult<()> {
        let prefix = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_CALL_FRAME]);
        let mut stale = Vec::new();
        {
            let mut emit = |key: &Nibbles, _value: &[u8]| {
                // key = prefix ++ be32(tx) ++ be16(chunk)
                if key.len() == prefix.len() + 12 {
                    let mut tx = 0u32;
                    for i in 0..8 {
                        tx = tx << 4 | key.at(prefix.len() + i) as u32;
                    }
                    let mut chunk = 0u16;
                    for i in 8..12 {
                        chunk = chunk << 4 | key.at(prefix.len() + i) as u16;
                    }
                    let keep = (tx as usize) < new_chunks.len()
                        && chunk < new_chunks[tx as usize];
                    if !keep {
                        stale.push(key.clone());
                    }
                }
                Ok(())
            };
            let mut machine = RangedGetMachine::under_prefix(&prefix, &mut emit);
            traverse::traverse(
                &self.db.shared.store,
                &self.db.shared.io,
                parent,
                &mut machine,
            )?;
        }
        for key in stale {
            updates.push(Update::delete(key));
        }
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    fn read_key(&self, key: &Nibbles) -> DbResult<Option<Vec<u8>>> {
        let Some(root) = self.cursor_root() else {
            return Ok(None);
        };
        traverse::get(&self.db.shared.store, &self.db.shared.io, root, key)
    }

    pub fn read_header(&self) -> DbResult<Option<BlockHeader>> {
        match self.read_key(&Nibbles::from_nibbles(&[PREFIX_FINALIZED]))? {
            Some(bytes) => Ok(Some(BlockHeader::decode_rlp(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_account(&self, address: &Address) -> DbResult<Option<Account>> {
        match self.read_key(&state_key(address))? {
            Some(bytes) => Ok(Some(Account::decode_leaf(&bytes)?.1)),
            None => Ok(None),
        }
    }

    /// Storage read under a specific incarnation. Slots written under an
    /// older incarnation read as zero.
    pub fn read_storage(
        &self,
        address: &Address,
        incarnation: crate::primitives::Incarnation,
        slot: &B256,
    ) -> DbResult<B256> {
        match self.read_account(address)? {
            Some(account) if account.incarnation == incarnation => {}
            Some(_) | None => return Ok(B256::ZERO),
        }
        let mut key = state_key(address);
        key.extend(&Nibbles::unpack(keccak256(slot).as_slice()));
        match self.read_key(&key)? {
            Some(bytes) => {
                let (_, value) = crate::primitives::decode_storage_leaf(&bytes)?;
                Ok(value)
            }
            None => Ok(B256::ZERO),
        }
    }

    /// Storage read trusting the stored account's incarnation.
    pub fn read_storage_latest(
        &self,
        address: &Address,
        slot: &B256,
    ) -> DbResult<B256> {
        let mut key = state_key(address);
        key.extend(&Nibbles::unpack(keccak256(slot).as_slice()));
        match self.read_key(&key)? {
            Some(bytes) => {
                let (_, value) = crate::primitives::decode_storage_leaf(&bytes)?;
                Ok(value)
            }
            None => Ok(B256::ZERO),
        }
    }

    pub fn read_code(&self, code_hash: &B256) -> DbResult<Option<Bytes>> {
        if *code_hash == crate::primitives::EMPTY_CODE_HASH
            || *code_hash == B256::ZERO
        {
            return Ok(Some(Bytes::new()));
        }
        if let Some(hit) = self.db.shared.code_cache.get(code_hash) {
            return Ok(Some(hit.clone()));
        }
        match self.read_key(&code_key(code_hash))? {
            Some(bytes) => {
                let code = Bytes::from(bytes);
                self.db.shared.code_cache.insert(*code_hash, code.clone());
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    pub fn read_receipt(&self, tx_index: u32) -> DbResult<Option<(Receipt, u64)>> {
        match self.read_key(&receipt_key(tx_index))? {
            Some(bytes) => Ok(Some(Receipt::decode_db(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_transaction(
        &self,
        tx_index: u32,
    ) -> DbResult<Option<(Transaction, Address)>> {
        match self.read_key(&tx_key(tx_index))? {
            Some(bytes) => Ok(Some(Transaction::decode_db(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolve a transaction hash to `(block_number, tx_index)`.
    pub fn read_tx_locator(&self, tx_hash: &B256) -> DbResult<Option<(u64, u32)>> {
        match self.read_key(&tx_hash_key(tx_hash))? {
            Some(bytes) => Ok(Some(crate::primitives::decode_tx_locator(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reassemble a transaction's call frames from its ordered chunks.
    pub fn read_call_frames(&self, tx_index: u32) -> DbResult<Vec<CallFrame>> {
        let Some(root) = self.cursor_root() else {
            return Ok(Vec::new());
        };
        let mut prefix = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_CALL_FRAME]);
        prefix.extend(&Nibbles::unpack(&tx_index.to_be_bytes()));
        let mut joined = Vec::new();
        {
            let mut emit = |_key: &Nibbles, value: &[u8]| {
                joined.extend_from_slice(value);
                Ok(())
            };
            let mut machine = RangedGetMachine::under_prefix(&prefix, &mut emit);
            traverse::traverse(
                &self.db.shared.store,
                &self.db.shared.io,
                root,
                &mut machine,
            )?;
        }
        crate::primitives::decode_call_frames(&joined)
    }

    fn section_root(&self, section: u8) -> DbResult<B256> {
        let Some(root) = self.cursor_root() else {
            return Ok(EMPTY_ROOT);
        };
        let node = self.db.shared.store.get(&self.db.shared.io, root)?;
        match node.child(section) {
            Some(entry) => Ok(Hasher::section_root(&entry.merkle)),
            None => Ok(EMPTY_ROOT),
        }
    }

    /// Ethereum state root of the cursor version.
    pub fn state_root(&self) -> DbResult<B256> {
        self.section_root(PREFIX_STATE)
    }

    /// Ethereum receipts root of the cursor version's block.
    pub fn receipts_root(&self) -> DbResult<B256> {
        self.section_root(PREFIX_RECEIPT)
    }

    /// Ethereum transactions root of the cursor version's block.
    pub fn transactions_root(&self) -> DbResult<B256> {
        self.section_root(PREFIX_TRANSACTION)
    }
}

// ---- key builders -----------------------------------------------------

pub(crate) fn state_key(address: &Address) -> Nibbles {
    let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_STATE]);
    key.extend(&Nibbles::unpack(keccak256(address).as_slice()));
    key
}

pub(crate) fn code_key(code_hash: &B256) -> Nibbles {
    let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_CODE]);
    key.extend(&Nibbles::unpack(code_hash.as_slice()));
    key
}

pub(crate) fn receipt_key(tx_index: u32) -> Nibbles {
    let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_RECEIPT]);
    let mut enc = Vec::with_capacity(5);
    (tx_index as u64).encode(&mut enc);
    key.extend(&Nibbles::unpack(&enc));
    key
}

pub(crate) fn tx_key(tx_index: u32) -> Nibbles {
    let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_TRANSACTION]);
    let mut enc = Vec::with_capacity(5);
    (tx_index as u64).encode(&mut enc);
    key.extend(&Nibbles::unpack(&enc));
    key
}

pub(crate) fn tx_hash_key(tx_hash: &B256) -> Nibbles {
    let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_TX_HASH]);
    key.extend(&Nibbles::unpack(tx_hash.as_slice()));
    key
}

pub(crate) fn call_frame_key(tx_index: u32, chunk: u16) -> Nibbles {
    let mut key = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_CALL_FRAME]);
    key.extend(&Nibbles::unpack(&tx_index.to_be_bytes()));
    key.extend(&Nibbles::unpack(&chunk.to_be_bytes()));
    key
}
