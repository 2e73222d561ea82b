//! Shared helpers: in-memory DBs, reference tries, canned accounts.

use alloy_primitives::{keccak256, Address, B256, U256};
use triedb::db::{Db, DbConfig};
use triedb::pool::OpenMode;
use triedb::primitives::{Account, EMPTY_ROOT};

pub fn mem_db() -> Db {
    mem_db_with(|_| {})
}

pub fn mem_db_with(tune: impl FnOnce(&mut DbConfig)) -> Db {
    let mut config = DbConfig {
        capacity: 1 << 26,
        chunk_size: 1 << 18,
        ..Default::default()
    };
    tune(&mut config);
    Db::open(config, OpenMode::Truncate).unwrap()
}

/// Reference state root over full accounts (with storage), built with the
/// reference trie implementation.
pub fn reference_state_root(accounts: &[(Address, Account, Vec<(B256, B256)>)]) -> B256 {
    let mut leaves: Vec<(B256, Vec<u8>)> = accounts
        .iter()
        .map(|(address, account, storage)| {
            let storage_root = reference_storage_root(storage);
            (
                keccak256(address),
                account.encode_for_hashing(storage_root),
            )
        })
        .collect();
    leaves.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hb = alloy_trie::HashBuilder::default();
    for (hashed, value) in &leaves {
        hb.add_leaf(alloy_trie::Nibbles::unpack(hashed), value);
    }
    hb.root()
}

pub fn reference_storage_root(storage: &[(B256, B256)]) -> B256 {
    if storage.is_empty() {
        return EMPTY_ROOT;
    }
    let mut leaves: Vec<(B256, Vec<u8>)> = storage
        .iter()
        .filter(|(_, value)| !value.is_zero())
        .map(|(slot, value)| {
            (
                keccak256(slot),
                alloy_rlp::encode(U256::from_be_bytes(value.0)),
            )
        })
        .collect();
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    leaves.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hb = alloy_trie::HashBuilder::default();
    for (hashed, value) in &leaves {
        hb.add_leaf(alloy_trie::Nibbles::unpack(hashed), value);
    }
    hb.root()
}

/// Reference root of a per-block index trie (receipts, transactions):
/// `rlp(index) -> payload`.
pub fn reference_index_root(payloads: &[Vec<u8>]) -> B256 {
    if payloads.is_empty() {
        return EMPTY_ROOT;
    }
    let mut leaves: Vec<(Vec<u8>, &Vec<u8>)> = payloads
        .iter()
        .enumerate()
        .map(|(i, payload)| (alloy_rlp::encode(i as u64), payload))
        .collect();
    leaves.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hb = alloy_trie::HashBuilder::default();
    for (key, value) in &leaves {
        hb.add_leaf(alloy_trie::Nibbles::unpack(key), value);
    }
    hb.root()
}

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn b256(v: u64) -> B256 {
    B256::from(U256::from(v))
}
