//! The statesync server hook.
//!
//! Streams (address, account, storage-slots, code) records between two trie
//! versions to a remote peer. The walk runs against a read-only DB handle on
//! its own I/O context, so serving a peer never blocks the writer.

use alloy_primitives::{Address, Bytes, B256, U256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::db::{Db, TrieDb, PREFIX_FINALIZED, PREFIX_STATE};
use crate::nibbles::Nibbles;
use crate::primitives::{Account, Incarnation};
use crate::traverse::{self, RangedGetMachine};
use crate::{DbError, DbResult};

/// One account's delta between two versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRecord {
    pub address: Address,
    pub account: Account,
    /// Changed slots only.
    pub storage: Vec<(B256, B256)>,
    /// Bytecode when the target version introduces it.
    pub code: Option<Bytes>,
}

/// A streamed item: an upserted account or a deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncItem {
    Upsert(SyncRecord),
    Delete(Address),
}

/// Walk the state at `to` and emit every record that differs from `from`
/// (`None` compares against emptiness), then deletions of accounts `from`
/// had and `to` does not. Records arrive in hashed-address order.
pub fn collect_deltas(
    to: &TrieDb,
    from: Option<&TrieDb>,
    sink: &mut dyn FnMut(SyncItem) -> DbResult<()>,
) -> DbResult<()> {
    let Some(root) = to.db().root_at(
        to.version().unwrap_or_default(),
        None,
    ) else {
        return Ok(());
    };
    let prefix = Nibbles::from_nibbles(&[PREFIX_FINALIZED, PREFIX_STATE]);
    let account_key_len = prefix.len() + 64;
    let storage_key_len = account_key_len + 64;

    // The walk emits an account leaf before its storage leaves, so one
    // record accumulates until the next account boundary.
    let mut pending: Option<SyncRecord> = None;
    {
        let mut flush = |record: SyncRecord,
                         sink: &mut dyn FnMut(SyncItem) -> DbResult<()>|
         -> DbResult<()> {
            let base = match from {
                Some(from) => from.read_account(&record.address)?,
                None => None,
            };
            let mut changed: Vec<(B256, B256)> = Vec::new();
            for (slot, value) in &record.storage {
                let old = match from {
                    Some(from) => {
                        from.read_storage(&record.address, record.account.incarnation, slot)?
                    }
                    None => B256::ZERO,
                };
                if old != *value {
                    changed.push((*slot, *value));
                }
            }
            if base == Some(record.account) && changed.is_empty() {
                return Ok(());
            }
            let code = if record.account.has_code()
                && base.map_or(true, |b| b.code_hash != record.account.code_hash)
            {
                to.read_code(&record.account.code_hash)?
            } else {
                None
            };
            sink(SyncItem::Upsert(SyncRecord {
                storage: changed,
                code,
                ..record
            }))
        };

        let mut emit = |key: &Nibbles, value: &[u8]| -> DbResult<()> {
            if key.len() == account_key_len {
                if let Some(record) = pending.take() {
                    flush(record, sink)?;
                }
                let (address, account) = Account::decode_leaf(value)?;
                pending = Some(SyncRecord {
                    address,
                    account,
                    storage: Vec::new(),
                    code: None,
                });
            } else if key.len() == storage_key_len {
                let (slot, slot_value) = crate::primitives::decode_storage_leaf(value)?;
                if let Some(record) = pending.as_mut() {
                    record.storage.push((slot, slot_value));
                }
            }
            Ok(())
        };
        let mut machine = RangedGetMachine::under_prefix(&prefix, &mut emit);
        traverse::traverse(to.db().store(), to.db().io(), root, &mut machine)?;
        if let Some(record) = pending.take() {
            flush(record, sink)?;
        }
    }

    // Deletions: accounts the source version had that the target lost.
    if let Some(from) = from {
        if let Some(from_root) = from
            .db()
            .root_at(from.version().unwrap_or_default(), None)
        {
            let mut emit = |key: &Nibbles, value: &[u8]| -> DbResult<()> {
                if key.len() != account_key_len {
                    return Ok(());
                }
                let (address, _) = Account::decode_leaf(value)?;
                if to.read_account(&address)?.is_none() {
                    sink(SyncItem::Delete(address))?;
                }
                Ok(())
            };
            let mut machine = RangedGetMachine::under_prefix(&prefix, &mut emit);
            traverse::traverse(from.db().store(), from.db().io(), from_root, &mut machine)?;
        }
    }
    Ok(())
}

// ---- wire format ------------------------------------------------------

fn encode_item(item: &SyncItem) -> Vec<u8> {
    let mut out = Vec::new();
    match item {
        SyncItem::Delete(address) => {
            out.push(0);
            out.extend_from_slice(address.as_slice());
        }
        SyncItem::Upsert(record) => {
            out.push(1);
            out.extend_from_slice(record.address.as_slice());
            out.extend_from_slice(&record.account.nonce.to_le_bytes());
            out.extend_from_slice(&record.account.balance.to_be_bytes::<32>());
            out.extend_from_slice(record.account.code_hash.as_slice());
            out.extend_from_slice(&record.account.incarnation.block.to_le_bytes());
            out.extend_from_slice(&record.account.incarnation.tx.to_le_bytes());
            out.extend_from_slice(&(record.storage.len() as u32).to_le_bytes());
            for (slot, value) in &record.storage {
                out.extend_from_slice(slot.as_slice());
                out.extend_from_slice(value.as_slice());
            }
            match &record.code {
                Some(code) => {
                    out.extend_from_slice(&(code.len() as u32).to_le_bytes());
                    out.extend_from_slice(code);
                }
                None => out.extend_from_slice(&u32::MAX.to_le_bytes()),
            }
        }
    }
    out
}

/// Decode one wire item, the inverse of the server's encoding.
pub fn decode_item(buf: &[u8]) -> DbResult<SyncItem> {
    let corrupt = || DbError::Corruption {
        offset: None,
        reason: "malformed statesync item",
    };
    if buf.is_empty() {
        return Err(corrupt());
    }
    let tag = buf[0];
    let rest = &buf[1..];
    if tag == 0 {
        if rest.len() != 20 {
            return Err(corrupt());
        }
        return Ok(SyncItem::Delete(Address::from_slice(rest)));
    }
    if rest.len() < 20 + 8 + 32 + 32 + 8 + 4 + 4 {
        return Err(corrupt());
    }
    let mut pos = 0;
    let address = Address::from_slice(&rest[pos..pos + 20]);
    pos += 20;
    let nonce = u64::from_le_bytes(rest[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let balance = U256::from_be_bytes::<32>(rest[pos..pos + 32].try_into().unwrap());
    pos += 32;
    let code_hash = B256::from_slice(&rest[pos..pos + 32]);
    pos += 32;
    let block = u64::from_le_bytes(rest[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let tx = u32::from_le_bytes(rest[pos..pos + 4].try_into().unwrap());
    pos += 4;
    let count = u32::from_le_bytes(rest[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if rest.len() < pos + count * 64 + 4 {
        return Err(corrupt());
    }
    let mut storage = Vec::with_capacity(count);
    for _ in 0..count {
        let slot = B256::from_slice(&rest[pos..pos + 32]);
        let value = B256::from_slice(&rest[pos + 32..pos + 64]);
        storage.push((slot, value));
        pos += 64;
    }
    let code_len = u32::from_le_bytes(rest[pos..pos + 4].try_into().unwrap());
    pos += 4;
    let code = if code_len == u32::MAX {
        None
    } else {
        let code_len = code_len as usize;
        if rest.len() < pos + code_len {
            return Err(corrupt());
        }
        Some(Bytes::from(rest[pos..pos + code_len].to_vec()))
    };
    Ok(SyncItem::Upsert(SyncRecord {
        address,
        account: Account {
            nonce,
            balance,
            code_hash,
            incarnation: Incarnation::new(block, tx),
        },
        storage,
        code,
    }))
}

/// Serve statesync requests on a Unix socket. Each connection sends two
/// little-endian u64 versions (`u64::MAX` as the first means "from empty");
/// the server answers with length-prefixed items and a zero-length
/// terminator.
pub async fn serve(socket_path: std::path::PathBuf, db: Db) -> DbResult<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).map_err(DbError::io)?;
    info!(target: "triedb::statesync", path = %socket_path.display(), "listening");
    loop {
        let (mut socket, _) = listener.accept().await.map_err(DbError::io)?;
        let db = db.clone();
        tokio::spawn(async move {
            let result: DbResult<()> = async {
                let from_version = socket.read_u64_le().await.map_err(DbError::io)?;
                let to_version = socket.read_u64_le().await.map_err(DbError::io)?;
                let items = tokio::task::spawn_blocking(move || {
                    let mut to = TrieDb::new(db.clone());
                    to.set_block_and_prefix(to_version);
                    let from = (from_version != u64::MAX).then(|| {
                        let mut handle = TrieDb::new(db.clone());
                        handle.set_block_and_prefix(from_version);
                        handle
                    });
                    let mut items = Vec::new();
                    collect_deltas(&to, from.as_ref(), &mut |item| {
                        items.push(item);
                        Ok(())
                    })?;
                    Ok::<_, DbError>(items)
                })
                .await
                .map_err(|e| DbError::Execution(e.to_string()))??;
                for item in &items {
                    let encoded = encode_item(item);
                    socket
                        .write_u32_le(encoded.len() as u32)
                        .await
                        .map_err(DbError::io)?;
                    socket.write_all(&encoded).await.map_err(DbError::io)?;
                }
                socket.write_u32_le(0).await.map_err(DbError::io)?;
                Ok(())
            }
            .await;
            if let Err(err) = result {
                warn!(target: "triedb::statesync", %err, "session failed");
            }
        });
    }
}
