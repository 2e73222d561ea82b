//! Snapshot load and dump.
//!
//! Two binary streams in one directory:
//! `accounts` = `[len:2B][address:20B][account][count:u32][key:32B value:32B]*`
//! repeated, and `code` = `[code_hash:32B][len:u32][bytes]*` repeated. The
//! account blob is `nonce:8B LE | balance:32B BE | code_hash:32B |
//! incarnation_block:8B LE | incarnation_tx:4B LE`, and `len` names its size
//! so the format can grow fields.

use std::io::{Read, Write};
use std::path::Path;

use ahash::AHashMap;
use alloy_primitives::{Address, Bytes, B256, U256};
use tracing::info;

use crate::db::{Commit, TrieDb, PREFIX_CODE, PREFIX_FINALIZED, PREFIX_STATE};
use crate::nibbles::Nibbles;
use crate::primitives::{Account, BlockHeader, Code, Incarnation, StateDelta, StateDeltas};
use crate::traverse::{self, RangedGetMachine};
use crate::{DbError, DbResult};

const ACCOUNT_BLOB_LEN: u16 = 8 + 32 + 32 + 8 + 4;

fn encode_account(out: &mut Vec<u8>, account: &Account) {
    out.extend_from_slice(&account.nonce.to_le_bytes());
    out.extend_from_slice(&account.balance.to_be_bytes::<32>());
    out.extend_from_slice(account.code_hash.as_slice());
    out.extend_from_slice(&account.incarnation.block.to_le_bytes());
    out.extend_from_slice(&account.incarnation.tx.to_le_bytes());
}

fn decode_account(buf: &[u8]) -> Account {
    Account {
        nonce: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        balance: U256::from_be_bytes::<32>(buf[8..40].try_into().unwrap()),
        code_hash: B256::from_slice(&buf[40..72]),
        incarnation: Incarnation::new(
            u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            u32::from_le_bytes(buf[80..84].try_into().unwrap()),
        ),
    }
}

/// Write the cursor version's full state to `dir`.
pub fn dump(tdb: &TrieDb, dir: &Path) -> DbResult<()> {
    std::fs::create_dir_all(dir).map_err(DbError::io)?;
    let root = tdb
        .db()
        .root_at(tdb.version().unwrap_or_default(), None)
        .ok_or(DbError::Corruption {
            offset: None,
            reason: "no version to dump",
        })?;

    let mut accounts_out: Vec<u8> = Vec::new();
    {
        let prefix = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_STATE]);
        let account_key_len = prefix.len() + 64;
        let storage_key_len = account_key_len + 64;
        // One record accumulates until the next account leaf arrives.
        let mut pending: Option<(Address, Account, Vec<(B256, B256)>)> = None;
        let mut flush = |pending: &mut Option<(Address, Account, Vec<(B256, B256)>)>,
                         out: &mut Vec<u8>| {
            if let Some((address, account, storage)) = pending.take() {
                out.extend_from_slice(&ACCOUNT_BLOB_LEN.to_le_bytes());
                out.extend_from_slice(address.as_slice());
                encode_account(out, &account);
                out.extend_from_slice(&(storage.len() as u32).to_le_bytes());
                for (slot, value) in storage {
                    out.extend_from_slice(slot.as_slice());
                    out.extend_from_slice(value.as_slice());
                }
            }
        };
        let mut emit = |key: &Nibbles, value: &[u8]| -> DbResult<()> {
            if key.len() == account_key_len {
                flush(&mut pending, &mut accounts_out);
                let (address, account) = Account::decode_leaf(value)?;
                pending = Some((address, account, Vec::new()));
            } else if key.len() == storage_key_len {
                if let Some((_, _, storage)) = pending.as_mut() {
                    storage.push(crate::primitives::decode_storage_leaf(value)?);
                }
            }
            Ok(())
        };
        let mut machine = RangedGetMachine::under_prefix(&prefix, &mut emit);
        traverse::traverse(tdb.db().store(), tdb.db().io(), root, &mut machine)?;
        flush(&mut pending, &mut accounts_out);
    }

    let mut code_out: Vec<u8> = Vec::new();
    {
        let prefix = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_CODE]);
        let mut emit = |key: &Nibbles, value: &[u8]| -> DbResult<()> {
            if key.len() == prefix.len() + 64 {
                let hash = key.suffix(prefix.len()).pack();
                code_out.extend_from_slice(&hash);
                code_out.extend_from_slice(&(value.len() as u32).to_le_bytes());
                code_out.extend_from_slice(value);
            }
            Ok(())
        };
        let mut machine = RangedGetMachine::under_prefix(&prefix, &mut emit);
        traverse::traverse(tdb.db().store(), tdb.db().io(), root, &mut machine)?;
    }

    let mut f = std::fs::File::create(dir.join("accounts")).map_err(DbError::io)?;
    f.write_all(&accounts_out).map_err(DbError::io)?;
    let mut f = std::fs::File::create(dir.join("code")).map_err(DbError::io)?;
    f.write_all(&code_out).map_err(DbError::io)?;
    info!(target: "triedb::snapshot", dir = %dir.display(), "dumped snapshot");
    Ok(())
}

/// Load a snapshot and commit it as the state of `block_number`.
pub fn load(tdb: &mut TrieDb, dir: &Path, block_number: u64) -> DbResult<()> {
    let mut accounts_raw = Vec::new();
    std::fs::File::open(dir.join("accounts"))
        .map_err(DbError::io)?
        .read_to_end(&mut accounts_raw)
        .map_err(DbError::io)?;
    let mut code_raw = Vec::new();
    std::fs::File::open(dir.join("code"))
        .map_err(DbError::io)?
        .read_to_end(&mut code_raw)
        .map_err(DbError::io)?;

    let corrupt = || DbError::Corruption {
        offset: None,
        reason: "malformed snapshot stream",
    };

    let mut deltas: StateDeltas = AHashMap::new();
    let mut pos = 0usize;
    while pos < accounts_raw.len() {
        if pos + 2 > accounts_raw.len() {
            return Err(corrupt());
        }
        let blob_len =
            u16::from_le_bytes(accounts_raw[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if blob_len < ACCOUNT_BLOB_LEN as usize
            || pos + 20 + blob_len + 4 > accounts_raw.len()
        {
            return Err(corrupt());
        }
        let address = Address::from_slice(&accounts_raw[pos..pos + 20]);
        pos += 20;
        let account = decode_account(&accounts_raw[pos..pos + blob_len]);
        pos += blob_len;
        let count =
            u32::from_le_bytes(accounts_raw[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + count * 64 > accounts_raw.len() {
            return Err(corrupt());
        }
        let mut storage = AHashMap::with_capacity(count);
        for _ in 0..count {
            let slot = B256::from_slice(&accounts_raw[pos..pos + 32]);
            let value = B256::from_slice(&accounts_raw[pos + 32..pos + 64]);
            storage.insert(slot, (B256::ZERO, value));
            pos += 64;
        }
        deltas.insert(
            address,
            StateDelta {
                account: (None, Some(account)),
                storage,
            },
        );
    }

    let mut code: Code = AHashMap::new();
    let mut pos = 0usize;
    while pos < code_raw.len() {
        if pos + 36 > code_raw.len() {
            return Err(corrupt());
        }
        let hash = B256::from_slice(&code_raw[pos..pos + 32]);
        pos += 32;
        let len = u32::from_le_bytes(code_raw[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > code_raw.len() {
            return Err(corrupt());
        }
        code.insert(hash, Bytes::from(code_raw[pos..pos + len].to_vec()));
        pos += len;
    }

    let accounts = deltas.len();
    tdb.commit_sequential(Commit {
        deltas,
        code,
        header: BlockHeader {
            number: block_number,
            ..Default::default()
        },
        ..Default::default()
    })?;
    info!(
        target: "triedb::snapshot",
        accounts,
        block_number,
        "loaded snapshot"
    );
    Ok(())
}
