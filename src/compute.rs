//! Merkle reference computation.
//!
//! Every node carries a cached reference: keccak256 of its RLP
//! representation, or the representation itself when shorter than 32 bytes
//! (the hex-trie inline rule). What "its RLP representation" means depends on
//! which section of the versioned trie the node lives in:
//!
//! - STATE hashes exactly like Ethereum's secure state trie. Account leaves
//!   sit 64 nibbles below the section root and hash
//!   `rlp([nonce, balance, storage_root, code_hash])`, with `storage_root`
//!   derived from the nested subtree hanging below the leaf. Storage leaves
//!   sit at 128 nibbles and hash the RLP of their trimmed value.
//! - RECEIPT and TRANSACTION hash like Ethereum's per-block index tries, so
//!   the section roots reproduce the reference `receipts_root` and
//!   `transactions_root`.
//! - Everything else (code, tx-hash index, call frames, the version root)
//!   uses the same node structure with the stored value hashed verbatim;
//!   those roots only need to be deterministic, not externally compatible.

use std::sync::Arc;

use alloy_primitives::{keccak256, B256};

use crate::node::{MerkleRef, Node, VirtualOffset};
use crate::primitives::{Account, Receipt, Transaction, EMPTY_ROOT};
use crate::{DbError, DbResult};

/// Which top-level section a node belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Section {
    /// The version root node itself (above the section branches).
    Root,
    State,
    Code,
    Receipt,
    Transaction,
    TxHash,
    CallFrame,
}

impl Section {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            crate::db::PREFIX_STATE => Some(Section::State),
            crate::db::PREFIX_CODE => Some(Section::Code),
            crate::db::PREFIX_RECEIPT => Some(Section::Receipt),
            crate::db::PREFIX_TRANSACTION => Some(Section::Transaction),
            crate::db::PREFIX_TX_HASH => Some(Section::TxHash),
            crate::db::PREFIX_CALL_FRAME => Some(Section::CallFrame),
            _ => None,
        }
    }
}

/// Hash context of one node: its section and the section-relative depth of
/// the point where its path ends (where its value or children attach).
#[derive(Clone, Copy, Debug)]
pub struct HashCtx {
    pub section: Section,
    pub depth: usize,
}

/// Nibble depth of an account leaf below the STATE section root.
pub const ACCOUNT_DEPTH: usize = 64;
/// Nibble depth of a storage leaf below the STATE section root.
pub const STORAGE_DEPTH: usize = 128;

fn rlp_str(out: &mut Vec<u8>, s: &[u8]) {
    if s.len() == 1 && s[0] < 0x80 {
        out.push(s[0]);
    } else {
        alloy_rlp::Header {
            list: false,
            payload_length: s.len(),
        }
        .encode(out);
        out.extend_from_slice(s);
    }
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: usize = items.iter().map(|i| i.len()).sum();
    let mut out = Vec::with_capacity(payload + 4);
    alloy_rlp::Header {
        list: true,
        payload_length: payload,
    }
    .encode(&mut out);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

/// Computes node references, loading the odd extra node when a nested
/// storage root needs its single child's full representation.
pub struct Hasher<'a> {
    /// Fetch a node by offset; in-memory children are resolved by the upsert
    /// engine before it calls in here.
    pub load: &'a dyn Fn(VirtualOffset) -> DbResult<Arc<Node>>,
}

impl std::fmt::Debug for Hasher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}

impl<'a> Hasher<'a> {
    /// The in-branch reference of `node`: inline RLP when shorter than 32
    /// bytes, keccak otherwise.
    pub fn node_ref(&self, node: &Node, ctx: HashCtx) -> DbResult<MerkleRef> {
        let preimage = self.preimage(node, ctx)?;
        Ok(if preimage.len() < 32 {
            MerkleRef::new(&preimage)
        } else {
            MerkleRef::new(keccak256(&preimage).as_slice())
        })
    }

    /// The root hash of the (sub)trie rooted at `node`. A root is always a
    /// keccak, even when its representation is short.
    pub fn root_hash(&self, node: &Node, ctx: HashCtx) -> DbResult<B256> {
        Ok(keccak256(self.preimage(node, ctx)?))
    }

    /// Root hash of a section given the section child's cached reference.
    /// Short references get the final keccak the root rule requires.
    pub fn section_root(merkle: &MerkleRef) -> B256 {
        if merkle.is_hash() {
            B256::from_slice(merkle.as_slice())
        } else {
            keccak256(merkle.as_slice())
        }
    }

    fn preimage(&self, node: &Node, ctx: HashCtx) -> DbResult<Vec<u8>> {
        let account_boundary = ctx.section == Section::State
            && ctx.depth == ACCOUNT_DEPTH
            && node.value.is_some();
        if node.mask == 0 || account_boundary {
            // Leaf. For an account leaf the nested storage subtree is not
            // part of this trie; it only contributes the storage root.
            let value = self.value_for_hash(node, ctx)?;
            let hp = node.path.hex_prefix(true);
            let mut items = Vec::with_capacity(2);
            let mut item = Vec::with_capacity(hp.len() + 1);
            rlp_str(&mut item, &hp);
            items.push(item);
            let mut item = Vec::with_capacity(value.len() + 3);
            rlp_str(&mut item, &value);
            items.push(item);
            return Ok(rlp_list(&items));
        }

        // Branch of 16 child slots plus the value slot.
        let mut items: Vec<Vec<u8>> = Vec::with_capacity(17);
        for nibble in 0u8..16 {
            match node.child(nibble) {
                Some(entry) => {
                    if entry.merkle.is_hash() {
                        let mut item = Vec::with_capacity(33);
                        rlp_str(&mut item, entry.merkle.as_slice());
                        items.push(item);
                    } else {
                        // Inline representation embeds verbatim.
                        items.push(entry.merkle.as_slice().to_vec());
                    }
                }
                None => items.push(vec![0x80]),
            }
        }
        match &node.value {
            Some(_) => {
                let value = self.value_for_hash(node, ctx)?;
                let mut item = Vec::with_capacity(value.len() + 3);
                rlp_str(&mut item, &value);
                items.push(item);
            }
            None => items.push(vec![0x80]),
        }
        let branch = rlp_list(&items);

        if node.path.is_empty() {
            return Ok(branch);
        }
        // Extension wrapping the branch.
        let hp = node.path.hex_prefix(false);
        let mut items = Vec::with_capacity(2);
        let mut item = Vec::with_capacity(hp.len() + 1);
        rlp_str(&mut item, &hp);
        items.push(item);
        if branch.len() < 32 {
            items.push(branch);
        } else {
            let mut item = Vec::with_capacity(33);
            rlp_str(&mut item, keccak256(&branch).as_slice());
            items.push(item);
        }
        Ok(rlp_list(&items))
    }

    fn value_for_hash(&self, node: &Node, ctx: HashCtx) -> DbResult<Vec<u8>> {
        let value = node.value.as_ref().expect("leaf without value");
        match (ctx.section, ctx.depth) {
            (Section::State, ACCOUNT_DEPTH) => {
                let (_, account) = Account::decode_leaf(value)?;
                let storage_root = self.storage_root(node)?;
                Ok(account.encode_for_hashing(storage_root))
            }
            (Section::State, STORAGE_DEPTH) => {
                use alloy_rlp::Encodable;
                let (_, slot_value) = crate::primitives::decode_storage_leaf(value)?;
                let as_int = alloy_primitives::U256::from_be_bytes(slot_value.0);
                let mut out = Vec::with_capacity(33);
                as_int.encode(&mut out);
                Ok(out)
            }
            (Section::State, _) => Err(DbError::Corruption {
                offset: None,
                reason: "state value at non-leaf depth",
            }),
            (Section::Receipt, _) => Ok(Receipt::payload_of_db(value)?.to_vec()),
            (Section::Transaction, _) => {
                Ok(Transaction::payload_of_db(value)?.to_vec())
            }
            _ => Ok(value.clone()),
        }
    }

    /// Root of the storage subtree nested below an account leaf.
    fn storage_root(&self, account: &Node) -> DbResult<B256> {
        match account.child_count() {
            0 => Ok(EMPTY_ROOT),
            1 => {
                // As a standalone trie root, the single child's path gains
                // the branch nibble it hangs from, so its cached in-branch
                // reference does not apply; recompute from its content.
                let (nibble, entry) = account
                    .iter_children()
                    .next()
                    .expect("child_count said one");
                let child = (self.load)(entry.offset)?;
                let as_root = Node {
                    mask: child.mask,
                    path: crate::nibbles::Nibbles::new().join(nibble, &child.path),
                    value: child.value.clone(),
                    children: child.children.clone(),
                };
                let depth = ACCOUNT_DEPTH + 1 + child.path.len();
                self.root_hash(
                    &as_root,
                    HashCtx {
                        section: Section::State,
                        depth,
                    },
                )
            }
            _ => {
                // A bare branch: the children's cached references line up
                // with their in-branch slots.
                let mut items: Vec<Vec<u8>> = Vec::with_capacity(17);
                for nibble in 0u8..16 {
                    match account.child(nibble) {
                        Some(entry) => {
                            if entry.merkle.is_hash() {
                                let mut item = Vec::with_capacity(33);
                                rlp_str(&mut item, entry.merkle.as_slice());
                                items.push(item);
                            } else {
                                items.push(entry.merkle.as_slice().to_vec());
                            }
                        }
                        None => items.push(vec![0x80]),
                    }
                }
                items.push(vec![0x80]);
                Ok(keccak256(rlp_list(&items)))
            }
        }
    }
}
