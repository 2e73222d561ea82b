//! Chain-level value types and their encodings.
//!
//! Two families live here: the Ethereum-compatible wire encodings (headers,
//! transactions, receipts) whose RLP must reproduce reference hashes, and the
//! disk encodings stored in trie leaves, which additionally carry the key
//! preimages (address, slot) so snapshots and statesync can walk the trie
//! without an external index.

use ahash::AHashMap;
use alloy_primitives::{b256, keccak256, Address, Bloom, Bytes, B256, B64, U256};
use alloy_rlp::{Decodable, Encodable, Header as RlpHeader};

use crate::{DbError, DbResult};

/// keccak256 of the empty byte string: the code hash of a codeless account.
pub const EMPTY_CODE_HASH: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// Root hash of an empty hex trie: keccak256(rlp("")).
pub const EMPTY_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Tag distinguishing successive lives of the same address. An account
/// recreated after selfdestruct gets a fresh incarnation; storage written
/// under the old one is unreachable from the new one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Incarnation {
    pub block: u64,
    pub tx: u32,
}

impl Incarnation {
    pub fn new(block: u64, tx: u32) -> Self {
        Self { block, tx }
    }
}

/// An account as stored in the state trie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: B256,
    pub incarnation: Incarnation,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            code_hash: EMPTY_CODE_HASH,
            incarnation: Incarnation::default(),
        }
    }
}

impl Account {
    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH && self.code_hash != B256::ZERO
    }

    /// EIP-161: an account is empty when nonce, balance and code are all
    /// unset.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && !self.has_code()
    }

    /// Disk form of a state-trie account leaf. Carries the address preimage
    /// ahead of the account fields so trie walks can name the account.
    pub fn encode_leaf(&self, address: &Address) -> Vec<u8> {
        let mut out = Vec::with_capacity(80);
        let payload = address.length()
            + self.nonce.length()
            + self.balance.length()
            + self.code_hash.length()
            + self.incarnation.block.length()
            + (self.incarnation.tx as u64).length();
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        address.encode(&mut out);
        self.nonce.encode(&mut out);
        self.balance.encode(&mut out);
        self.code_hash.encode(&mut out);
        self.incarnation.block.encode(&mut out);
        (self.incarnation.tx as u64).encode(&mut out);
        out
    }

    pub fn decode_leaf(mut buf: &[u8]) -> DbResult<(Address, Account)> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed account leaf",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let address = Address::decode(buf).map_err(|_| corrupt())?;
        let nonce = u64::decode(buf).map_err(|_| corrupt())?;
        let balance = U256::decode(buf).map_err(|_| corrupt())?;
        let code_hash = B256::decode(buf).map_err(|_| corrupt())?;
        let block = u64::decode(buf).map_err(|_| corrupt())?;
        let tx = u64::decode(buf).map_err(|_| corrupt())? as u32;
        Ok((
            address,
            Account {
                nonce,
                balance,
                code_hash,
                incarnation: Incarnation::new(block, tx),
            },
        ))
    }

    /// The Merkle leaf value: `rlp([nonce, balance, storage_root,
    /// code_hash])`, the reference Ethereum account encoding.
    pub fn encode_for_hashing(&self, storage_root: B256) -> Vec<u8> {
        let mut out = Vec::with_capacity(110);
        let code_hash = if self.code_hash == B256::ZERO {
            EMPTY_CODE_HASH
        } else {
            self.code_hash
        };
        let payload = self.nonce.length()
            + self.balance.length()
            + storage_root.length()
            + code_hash.length();
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        self.nonce.encode(&mut out);
        self.balance.encode(&mut out);
        storage_root.encode(&mut out);
        code_hash.encode(&mut out);
        out
    }
}

/// Disk form of a storage-slot leaf: `rlp([key, value])` with the full slot
/// key preimage.
pub fn encode_storage_leaf(key: &B256, value: &B256) -> Vec<u8> {
    let mut out = Vec::with_capacity(70);
    let payload = key.length() + value.length();
    RlpHeader {
        list: true,
        payload_length: payload,
    }
    .encode(&mut out);
    key.encode(&mut out);
    value.encode(&mut out);
    out
}

pub fn decode_storage_leaf(mut buf: &[u8]) -> DbResult<(B256, B256)> {
    let buf = &mut buf;
    let corrupt = || DbError::Corruption {
        offset: None,
        reason: "malformed storage leaf",
    };
    let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
    if !header.list {
        return Err(corrupt());
    }
    let key = B256::decode(buf).map_err(|_| corrupt())?;
    let value = B256::decode(buf).map_err(|_| corrupt())?;
    Ok((key, value))
}

/// Per-account state transition collected from one block.
#[derive(Clone, Debug, Default)]
pub struct StateDelta {
    /// (pre, post). `None` pre means created, `None` post means destroyed.
    pub account: (Option<Account>, Option<Account>),
    /// slot -> (pre, post) under the *post* incarnation.
    pub storage: AHashMap<B256, (B256, B256)>,
}

/// Every account touched by a block.
pub type StateDeltas = AHashMap<Address, StateDelta>;

/// Contract code by content hash.
pub type Code = AHashMap<B256, Bytes>;

// ---- logs & receipts --------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, alloy_rlp::RlpEncodable, alloy_rlp::RlpDecodable)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// EIP-2718 transaction type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxType {
    Legacy,
    Eip2930,
    Eip1559,
}

impl TxType {
    pub fn byte(self) -> u8 {
        match self {
            TxType::Legacy => 0,
            TxType::Eip2930 => 1,
            TxType::Eip1559 => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TxType::Legacy),
            1 => Some(TxType::Eip2930),
            2 => Some(TxType::Eip1559),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_type: TxType,
    pub status: bool,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Bloom filter over this receipt's logs (the m3:2048 scheme).
    pub fn bloom(&self) -> Bloom {
        let mut bloom = [0u8; 256];
        for log in &self.logs {
            accrue_bloom(&mut bloom, log.address.as_slice());
            for topic in &log.topics {
                accrue_bloom(&mut bloom, topic.as_slice());
            }
        }
        Bloom::from(bloom)
    }

    /// The EIP-2718 receipt encoding hashed into the receipts root:
    /// `rlp([status, cumulative_gas_used, bloom, logs])`, type-prefixed for
    /// non-legacy transactions.
    pub fn encode_2718(&self) -> Vec<u8> {
        let bloom = self.bloom();
        let status: u8 = if self.status { 1 } else { 0 };
        let payload = status.length()
            + self.cumulative_gas_used.length()
            + bloom.length()
            + list_length(&self.logs);
        let mut out = Vec::with_capacity(payload + 10);
        if self.tx_type != TxType::Legacy {
            out.push(self.tx_type.byte());
        }
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        status.encode(&mut out);
        self.cumulative_gas_used.encode(&mut out);
        bloom.encode(&mut out);
        encode_list_items(&self.logs, &mut out);
        out
    }

    pub fn decode_2718(buf: &[u8]) -> DbResult<Receipt> {
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed receipt",
        };
        let (tx_type, mut rest) = if !buf.is_empty() && buf[0] <= 0x7f {
            (TxType::from_byte(buf[0]).ok_or_else(corrupt)?, &buf[1..])
        } else {
            (TxType::Legacy, buf)
        };
        let rest = &mut rest;
        let header = RlpHeader::decode(rest).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let status = u8::decode(rest).map_err(|_| corrupt())? == 1;
        let cumulative_gas_used = u64::decode(rest).map_err(|_| corrupt())?;
        let _bloom = Bloom::decode(rest).map_err(|_| corrupt())?;
        let logs = Vec::<Log>::decode(rest).map_err(|_| corrupt())?;
        Ok(Receipt {
            tx_type,
            status,
            cumulative_gas_used,
            logs,
        })
    }

    /// Disk form under the RECEIPT prefix: the 2718 bytes plus the block-wide
    /// index of this transaction's first log.
    pub fn encode_db(&self, log_index_base: u64) -> Vec<u8> {
        let encoded = Bytes::from(self.encode_2718());
        let payload = encoded.length() + log_index_base.length();
        let mut out = Vec::with_capacity(payload + 4);
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        encoded.encode(&mut out);
        log_index_base.encode(&mut out);
        out
    }

    pub fn decode_db(mut buf: &[u8]) -> DbResult<(Receipt, u64)> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed receipt record",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let encoded = Bytes::decode(buf).map_err(|_| corrupt())?;
        let log_index_base = u64::decode(buf).map_err(|_| corrupt())?;
        Ok((Receipt::decode_2718(&encoded)?, log_index_base))
    }

    /// Extract the hash preimage from a disk record without re-encoding.
    pub(crate) fn payload_of_db(mut buf: &[u8]) -> DbResult<Bytes> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed receipt record",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        Bytes::decode(buf).map_err(|_| corrupt())
    }
}

fn accrue_bloom(bloom: &mut [u8; 256], input: &[u8]) {
    let hash = keccak256(input);
    for i in [0usize, 2, 4] {
        let bit = ((hash[i] as usize) << 8 | hash[i + 1] as usize) & 0x7ff;
        bloom[255 - bit / 8] |= 1 << (bit % 8);
    }
}

fn list_length<T: Encodable>(items: &[T]) -> usize {
    let payload: usize = items.iter().map(|i| i.length()).sum();
    RlpHeader {
        list: true,
        payload_length: payload,
    }
    .length()
        + payload
}

fn encode_list_items<T: Encodable>(items: &[T], out: &mut Vec<u8>) {
    let payload: usize = items.iter().map(|i| i.length()).sum();
    RlpHeader {
        list: true,
        payload_length: payload,
    }
    .encode(out);
    for item in items {
        item.encode(out);
    }
}

// ---- transactions -----------------------------------------------------

/// Signature fields as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxSignature {
    pub y_parity: bool,
    pub r: U256,
    pub s: U256,
}

/// A signed transaction: legacy, EIP-2930 or EIP-1559.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub tx_type: TxType,
    /// `None` only for pre-EIP-155 legacy transactions.
    pub chain_id: Option<u64>,
    pub nonce: u64,
    /// Legacy/2930 gas price, or the 1559 max fee per gas.
    pub max_fee_per_gas: u128,
    /// 1559 only.
    pub max_priority_fee_per_gas: Option<u128>,
    pub gas_limit: u64,
    /// `None` means contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub access_list: Vec<AccessListItem>,
    pub signature: TxSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, alloy_rlp::RlpEncodable, alloy_rlp::RlpDecodable)]
pub struct AccessListItem {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

fn encode_to(to: &Option<Address>, out: &mut Vec<u8>) {
    match to {
        Some(address) => address.encode(out),
        None => out.push(alloy_rlp::EMPTY_STRING_CODE),
    }
}

fn to_length(to: &Option<Address>) -> usize {
    match to {
        Some(address) => address.length(),
        None => 1,
    }
}

fn decode_to(buf: &mut &[u8]) -> Result<Option<Address>, alloy_rlp::Error> {
    if buf.first() == Some(&alloy_rlp::EMPTY_STRING_CODE) {
        *buf = &buf[1..];
        Ok(None)
    } else {
        Address::decode(buf).map(Some)
    }
}

impl Transaction {
    /// Legacy v value: 27/28 pre-155, chain_id*2 + 35/36 after.
    fn legacy_v(&self) -> u64 {
        let parity = self.signature.y_parity as u64;
        match self.chain_id {
            Some(chain_id) => chain_id * 2 + 35 + parity,
            None => 27 + parity,
        }
    }

    /// The EIP-2718 encoding: the raw legacy list, or type byte plus typed
    /// payload. Hashing this yields the transaction hash.
    pub fn encode_2718(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        match self.tx_type {
            TxType::Legacy => {
                let v = self.legacy_v();
                let payload = self.nonce.length()
                    + self.max_fee_per_gas.length()
                    + self.gas_limit.length()
                    + to_length(&self.to)
                    + self.value.length()
                    + self.input.length()
                    + v.length()
                    + self.signature.r.length()
                    + self.signature.s.length();
                RlpHeader {
                    list: true,
                    payload_length: payload,
                }
                .encode(&mut out);
                self.nonce.encode(&mut out);
                self.max_fee_per_gas.encode(&mut out);
                self.gas_limit.encode(&mut out);
                encode_to(&self.to, &mut out);
                self.value.encode(&mut out);
                self.input.encode(&mut out);
                v.encode(&mut out);
                self.signature.r.encode(&mut out);
                self.signature.s.encode(&mut out);
            }
            TxType::Eip2930 | TxType::Eip1559 => {
                out.push(self.tx_type.byte());
                let chain_id = self.chain_id.unwrap_or(1);
                let parity = self.signature.y_parity as u8;
                let mut payload = chain_id.length()
                    + self.nonce.length()
                    + self.gas_limit.length()
                    + to_length(&self.to)
                    + self.value.length()
                    + self.input.length()
                    + list_length(&self.access_list)
                    + parity.length()
                    + self.signature.r.length()
                    + self.signature.s.length();
                payload += self.max_fee_per_gas.length();
                if self.tx_type == TxType::Eip1559 {
                    payload += self.max_priority_fee_per_gas.unwrap_or(0).length();
                }
                RlpHeader {
                    list: true,
                    payload_length: payload,
                }
                .encode(&mut out);
                chain_id.encode(&mut out);
                self.nonce.encode(&mut out);
                if self.tx_type == TxType::Eip1559 {
                    self.max_priority_fee_per_gas.unwrap_or(0).encode(&mut out);
                }
                self.max_fee_per_gas.encode(&mut out);
                self.gas_limit.encode(&mut out);
                encode_to(&self.to, &mut out);
                self.value.encode(&mut out);
                self.input.encode(&mut out);
                encode_list_items(&self.access_list, &mut out);
                parity.encode(&mut out);
                self.signature.r.encode(&mut out);
                self.signature.s.encode(&mut out);
            }
        }
        out
    }

    pub fn decode_2718(buf: &[u8]) -> DbResult<Transaction> {
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed transaction",
        };
        if buf.is_empty() {
            return Err(corrupt());
        }
        if buf[0] > 0x7f {
            Self::decode_legacy(buf)
        } else {
            let tx_type = TxType::from_byte(buf[0]).ok_or_else(corrupt)?;
            Self::decode_typed(tx_type, &buf[1..])
        }
    }

    fn decode_legacy(mut buf: &[u8]) -> DbResult<Transaction> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed transaction",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let nonce = u64::decode(buf).map_err(|_| corrupt())?;
        let gas_price = u128::decode(buf).map_err(|_| corrupt())?;
        let gas_limit = u64::decode(buf).map_err(|_| corrupt())?;
        let to = decode_to(buf).map_err(|_| corrupt())?;
        let value = U256::decode(buf).map_err(|_| corrupt())?;
        let input = Bytes::decode(buf).map_err(|_| corrupt())?;
        let v = u64::decode(buf).map_err(|_| corrupt())?;
        let r = U256::decode(buf).map_err(|_| corrupt())?;
        let s = U256::decode(buf).map_err(|_| corrupt())?;
        let (chain_id, y_parity) = if v >= 35 {
            (Some((v - 35) / 2), (v - 35) % 2 == 1)
        } else if v == 27 || v == 28 {
            (None, v == 28)
        } else {
            return Err(corrupt());
        };
        Ok(Transaction {
            tx_type: TxType::Legacy,
            chain_id,
            nonce,
            max_fee_per_gas: gas_price,
            max_priority_fee_per_gas: None,
            gas_limit,
            to,
            value,
            input,
            access_list: Vec::new(),
            signature: TxSignature { y_parity, r, s },
        })
    }

    fn decode_typed(tx_type: TxType, mut buf: &[u8]) -> DbResult<Transaction> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed transaction",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let chain_id = u64::decode(buf).map_err(|_| corrupt())?;
        let nonce = u64::decode(buf).map_err(|_| corrupt())?;
        let max_priority = if tx_type == TxType::Eip1559 {
            Some(u128::decode(buf).map_err(|_| corrupt())?)
        } else {
            None
        };
        let max_fee = u128::decode(buf).map_err(|_| corrupt())?;
        let gas_limit = u64::decode(buf).map_err(|_| corrupt())?;
        let to = decode_to(buf).map_err(|_| corrupt())?;
        let value = U256::decode(buf).map_err(|_| corrupt())?;
        let input = Bytes::decode(buf).map_err(|_| corrupt())?;
        let access_list = Vec::<AccessListItem>::decode(buf).map_err(|_| corrupt())?;
        let y_parity = u8::decode(buf).map_err(|_| corrupt())? == 1;
        let r = U256::decode(buf).map_err(|_| corrupt())?;
        let s = U256::decode(buf).map_err(|_| corrupt())?;
        Ok(Transaction {
            tx_type,
            chain_id: Some(chain_id),
            nonce,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
            gas_limit,
            to,
            value,
            input,
            access_list,
            signature: TxSignature { y_parity, r, s },
        })
    }

    pub fn hash(&self) -> B256 {
        keccak256(self.encode_2718())
    }

    /// The hash the sender signed.
    pub fn signing_hash(&self) -> B256 {
        let mut out = Vec::with_capacity(128);
        match self.tx_type {
            TxType::Legacy => {
                let extra = match self.chain_id {
                    // EIP-155 folds (chain_id, 0, 0) into the preimage.
                    Some(chain_id) => chain_id.length() + 2,
                    None => 0,
                };
                let payload = self.nonce.length()
                    + self.max_fee_per_gas.length()
                    + self.gas_limit.length()
                    + to_length(&self.to)
                    + self.value.length()
                    + self.input.length()
                    + extra;
                RlpHeader {
                    list: true,
                    payload_length: payload,
                }
                .encode(&mut out);
                self.nonce.encode(&mut out);
                self.max_fee_per_gas.encode(&mut out);
                self.gas_limit.encode(&mut out);
                encode_to(&self.to, &mut out);
                self.value.encode(&mut out);
                self.input.encode(&mut out);
                if let Some(chain_id) = self.chain_id {
                    chain_id.encode(&mut out);
                    0u8.encode(&mut out);
                    0u8.encode(&mut out);
                }
            }
            TxType::Eip2930 | TxType::Eip1559 => {
                out.push(self.tx_type.byte());
                let chain_id = self.chain_id.unwrap_or(1);
                let mut payload = chain_id.length()
                    + self.nonce.length()
                    + self.gas_limit.length()
                    + to_length(&self.to)
                    + self.value.length()
                    + self.input.length()
                    + list_length(&self.access_list)
                    + self.max_fee_per_gas.length();
                if self.tx_type == TxType::Eip1559 {
                    payload += self.max_priority_fee_per_gas.unwrap_or(0).length();
                }
                RlpHeader {
                    list: true,
                    payload_length: payload,
                }
                .encode(&mut out);
                chain_id.encode(&mut out);
                self.nonce.encode(&mut out);
                if self.tx_type == TxType::Eip1559 {
                    self.max_priority_fee_per_gas.unwrap_or(0).encode(&mut out);
                }
                self.max_fee_per_gas.encode(&mut out);
                self.gas_limit.encode(&mut out);
                encode_to(&self.to, &mut out);
                self.value.encode(&mut out);
                self.input.encode(&mut out);
                encode_list_items(&self.access_list, &mut out);
            }
        }
        keccak256(out)
    }

    /// Recover the sender address from the signature, or `None` when the
    /// signature does not resolve to a key.
    pub fn recover_sender(&self) -> Option<Address> {
        let signature = alloy_primitives::Signature::from_rs_and_parity(
            self.signature.r,
            self.signature.s,
            alloy_primitives::Parity::Parity(self.signature.y_parity),
        )
        .ok()?;
        signature
            .recover_address_from_prehash(&self.signing_hash())
            .ok()
    }

    /// Disk form under the TRANSACTION prefix: the 2718 bytes plus the
    /// recovered sender.
    pub fn encode_db(&self, sender: &Address) -> Vec<u8> {
        let encoded = Bytes::from(self.encode_2718());
        let payload = encoded.length() + sender.length();
        let mut out = Vec::with_capacity(payload + 4);
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        encoded.encode(&mut out);
        sender.encode(&mut out);
        out
    }

    pub fn decode_db(mut buf: &[u8]) -> DbResult<(Transaction, Address)> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed transaction record",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let encoded = Bytes::decode(buf).map_err(|_| corrupt())?;
        let sender = Address::decode(buf).map_err(|_| corrupt())?;
        Ok((Transaction::decode_2718(&encoded)?, sender))
    }

    pub(crate) fn payload_of_db(mut buf: &[u8]) -> DbResult<Bytes> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed transaction record",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        Bytes::decode(buf).map_err(|_| corrupt())
    }
}

/// Value under the TX_HASH prefix: `rlp([block_number, tx_index])`.
pub fn encode_tx_locator(block_number: u64, tx_index: u32) -> Vec<u8> {
    let payload = block_number.length() + (tx_index as u64).length();
    let mut out = Vec::with_capacity(payload + 2);
    RlpHeader {
        list: true,
        payload_length: payload,
    }
    .encode(&mut out);
    block_number.encode(&mut out);
    (tx_index as u64).encode(&mut out);
    out
}

pub fn decode_tx_locator(mut buf: &[u8]) -> DbResult<(u64, u32)> {
    let buf = &mut buf;
    let corrupt = || DbError::Corruption {
        offset: None,
        reason: "malformed tx locator",
    };
    let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
    if !header.list {
        return Err(corrupt());
    }
    let block = u64::decode(buf).map_err(|_| corrupt())?;
    let index = u64::decode(buf).map_err(|_| corrupt())? as u32;
    Ok((block, index as u32))
}

// ---- call frames ------------------------------------------------------

/// One node of the per-transaction call tree emitted by the execution
/// collaborator. `to` is the zero address for creations that never landed.
#[derive(Clone, Debug, PartialEq, Eq, alloy_rlp::RlpEncodable, alloy_rlp::RlpDecodable)]
pub struct CallFrame {
    pub kind: u8,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas: u64,
    pub gas_used: u64,
    pub input: Bytes,
    pub output: Bytes,
    pub success: bool,
    pub depth: u32,
}

/// Serialize a transaction's call frames as a concatenated RLP stream and
/// split it into chunks of at most `budget` bytes, never splitting one frame.
pub fn chunk_call_frames(frames: &[CallFrame], budget: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for frame in frames {
        let mut encoded = Vec::with_capacity(frame.length());
        frame.encode(&mut encoded);
        if !current.is_empty() && current.len() + encoded.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&encoded);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Reassemble the stream produced by [`chunk_call_frames`].
pub fn decode_call_frames(mut buf: &[u8]) -> DbResult<Vec<CallFrame>> {
    let mut frames = Vec::new();
    let buf = &mut buf;
    while !buf.is_empty() {
        let frame = CallFrame::decode(buf).map_err(|_| DbError::Corruption {
            offset: None,
            reason: "malformed call frame stream",
        })?;
        frames.push(frame);
    }
    Ok(frames)
}

// ---- headers, blocks, withdrawals -------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, alloy_rlp::RlpEncodable, alloy_rlp::RlpDecodable)]
pub struct Withdrawal {
    pub index: u64,
    pub validator_index: u64,
    pub address: Address,
    /// Amount in gwei, as on the consensus layer.
    pub amount: u64,
}

/// Execution-layer block header.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub ommers_hash: B256,
    pub beneficiary: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
    pub base_fee_per_gas: Option<u64>,
    pub withdrawals_root: Option<B256>,
    pub blob_gas_used: Option<u64>,
    pub excess_blob_gas: Option<u64>,
    pub parent_beacon_block_root: Option<B256>,
}

impl BlockHeader {
    fn payload_length(&self) -> usize {
        let mut len = self.parent_hash.length()
            + self.ommers_hash.length()
            + self.beneficiary.length()
            + self.state_root.length()
            + self.transactions_root.length()
            + self.receipts_root.length()
            + self.logs_bloom.length()
            + self.difficulty.length()
            + self.number.length()
            + self.gas_limit.length()
            + self.gas_used.length()
            + self.timestamp.length()
            + self.extra_data.length()
            + self.mix_hash.length()
            + self.nonce.length();
        // Trailing optionals only encode while the suffix is present.
        if let Some(v) = self.base_fee_per_gas {
            len += v.length();
        }
        if let Some(v) = self.withdrawals_root {
            len += v.length();
        }
        if let Some(v) = self.blob_gas_used {
            len += v.length();
        }
        if let Some(v) = self.excess_blob_gas {
            len += v.length();
        }
        if let Some(v) = self.parent_beacon_block_root {
            len += v.length();
        }
        len
    }

    pub fn encode_rlp(&self) -> Vec<u8> {
        let payload = self.payload_length();
        let mut out = Vec::with_capacity(payload + 4);
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        self.parent_hash.encode(&mut out);
        self.ommers_hash.encode(&mut out);
        self.beneficiary.encode(&mut out);
        self.state_root.encode(&mut out);
        self.transactions_root.encode(&mut out);
        self.receipts_root.encode(&mut out);
        self.logs_bloom.encode(&mut out);
        self.difficulty.encode(&mut out);
        self.number.encode(&mut out);
        self.gas_limit.encode(&mut out);
        self.gas_used.encode(&mut out);
        self.timestamp.encode(&mut out);
        self.extra_data.encode(&mut out);
        self.mix_hash.encode(&mut out);
        self.nonce.encode(&mut out);
        if let Some(v) = self.base_fee_per_gas {
            v.encode(&mut out);
        }
        if let Some(v) = self.withdrawals_root {
            v.encode(&mut out);
        }
        if let Some(v) = self.blob_gas_used {
            v.encode(&mut out);
        }
        if let Some(v) = self.excess_blob_gas {
            v.encode(&mut out);
        }
        if let Some(v) = self.parent_beacon_block_root {
            v.encode(&mut out);
        }
        out
    }

    pub fn decode_rlp(mut buf: &[u8]) -> DbResult<BlockHeader> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed block header",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let started = buf.len();
        let mut out = BlockHeader {
            parent_hash: B256::decode(buf).map_err(|_| corrupt())?,
            ommers_hash: B256::decode(buf).map_err(|_| corrupt())?,
            beneficiary: Address::decode(buf).map_err(|_| corrupt())?,
            state_root: B256::decode(buf).map_err(|_| corrupt())?,
            transactions_root: B256::decode(buf).map_err(|_| corrupt())?,
            receipts_root: B256::decode(buf).map_err(|_| corrupt())?,
            logs_bloom: Bloom::decode(buf).map_err(|_| corrupt())?,
            difficulty: U256::decode(buf).map_err(|_| corrupt())?,
            number: u64::decode(buf).map_err(|_| corrupt())?,
            gas_limit: u64::decode(buf).map_err(|_| corrupt())?,
            gas_used: u64::decode(buf).map_err(|_| corrupt())?,
            timestamp: u64::decode(buf).map_err(|_| corrupt())?,
            extra_data: Bytes::decode(buf).map_err(|_| corrupt())?,
            mix_hash: B256::decode(buf).map_err(|_| corrupt())?,
            nonce: B64::decode(buf).map_err(|_| corrupt())?,
            ..Default::default()
        };
        // Trailing optionals appear in fork order; a header stops after the
        // last field its fork defines.
        if started - buf.len() < header.payload_length {
            out.base_fee_per_gas = Some(u64::decode(buf).map_err(|_| corrupt())?);
        }
        if started - buf.len() < header.payload_length {
            out.withdrawals_root = Some(B256::decode(buf).map_err(|_| corrupt())?);
        }
        if started - buf.len() < header.payload_length {
            out.blob_gas_used = Some(u64::decode(buf).map_err(|_| corrupt())?);
        }
        if started - buf.len() < header.payload_length {
            out.excess_blob_gas = Some(u64::decode(buf).map_err(|_| corrupt())?);
        }
        if started - buf.len() < header.payload_length {
            out.parent_beacon_block_root = Some(B256::decode(buf).map_err(|_| corrupt())?);
        }
        Ok(out)
    }

    pub fn hash(&self) -> B256 {
        keccak256(self.encode_rlp())
    }
}

/// A full block as stored in the block archive.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub ommers: Vec<BlockHeader>,
    pub withdrawals: Option<Vec<Withdrawal>>,
}

impl Block {
    pub fn encode_rlp(&self) -> Vec<u8> {
        let header = Bytes::from(self.header.encode_rlp());
        let txs: Vec<Bytes> = self
            .transactions
            .iter()
            .map(|t| Bytes::from(t.encode_2718()))
            .collect();
        let ommers: Vec<Bytes> = self
            .ommers
            .iter()
            .map(|o| Bytes::from(o.encode_rlp()))
            .collect();
        let mut payload = header.length() + list_length(&txs) + list_length(&ommers);
        if let Some(w) = &self.withdrawals {
            payload += list_length(w);
        }
        let mut out = Vec::with_capacity(payload + 4);
        RlpHeader {
            list: true,
            payload_length: payload,
        }
        .encode(&mut out);
        header.encode(&mut out);
        encode_list_items(&txs, &mut out);
        encode_list_items(&ommers, &mut out);
        if let Some(w) = &self.withdrawals {
            encode_list_items(w, &mut out);
        }
        out
    }

    pub fn decode_rlp(mut buf: &[u8]) -> DbResult<Block> {
        let buf = &mut buf;
        let corrupt = || DbError::Corruption {
            offset: None,
            reason: "malformed block",
        };
        let header = RlpHeader::decode(buf).map_err(|_| corrupt())?;
        if !header.list {
            return Err(corrupt());
        }
        let header_bytes = Bytes::decode(buf).map_err(|_| corrupt())?;
        let tx_bytes = Vec::<Bytes>::decode(buf).map_err(|_| corrupt())?;
        let ommer_bytes = Vec::<Bytes>::decode(buf).map_err(|_| corrupt())?;
        let withdrawals = if buf.is_empty() {
            None
        } else {
            Some(Vec::<Withdrawal>::decode(buf).map_err(|_| corrupt())?)
        };
        let mut transactions = Vec::with_capacity(tx_bytes.len());
        for t in &tx_bytes {
            transactions.push(Transaction::decode_2718(t)?);
        }
        let mut ommers = Vec::with_capacity(ommer_bytes.len());
        for o in &ommer_bytes {
            ommers.push(BlockHeader::decode_rlp(o)?);
        }
        Ok(Block {
            header: BlockHeader::decode_rlp(&header_bytes)?,
            transactions,
            ommers,
            withdrawals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_leaf_round_trip() {
        let address = Address::repeat_byte(0xaa);
        let account = Account {
            nonce: 7,
            balance: U256::from(1_000_000u64),
            code_hash: EMPTY_CODE_HASH,
            incarnation: Incarnation::new(3, 2),
        };
        let leaf = account.encode_leaf(&address);
        let (addr2, acct2) = Account::decode_leaf(&leaf).unwrap();
        assert_eq!(addr2, address);
        assert_eq!(acct2, account);
    }

    #[test]
    fn storage_leaf_round_trip() {
        let key = B256::repeat_byte(0x1c);
        let value = B256::with_last_byte(7);
        let leaf = encode_storage_leaf(&key, &value);
        assert_eq!(decode_storage_leaf(&leaf).unwrap(), (key, value));
    }

    #[test]
    fn receipt_round_trip_with_logs() {
        let receipt = Receipt {
            tx_type: TxType::Eip1559,
            status: true,
            cumulative_gas_used: 65_092,
            logs: vec![Log {
                address: Address::repeat_byte(0x8d),
                topics: vec![B256::repeat_byte(1), B256::repeat_byte(2)],
                data: Bytes::from(vec![0xde, 0xad]),
            }],
        };
        let db = receipt.encode_db(3);
        let (decoded, base) = Receipt::decode_db(&db).unwrap();
        assert_eq!(decoded, receipt);
        assert_eq!(base, 3);
        // The typed payload carries the type byte up front.
        assert_eq!(receipt.encode_2718()[0], 2);
    }

    #[test]
    fn bloom_marks_address_bits() {
        let receipt = Receipt {
            tx_type: TxType::Legacy,
            status: true,
            cumulative_gas_used: 21_000,
            logs: vec![Log {
                address: Address::repeat_byte(0x11),
                topics: vec![],
                data: Bytes::new(),
            }],
        };
        assert_ne!(receipt.bloom(), Bloom::default());
        let empty = Receipt {
            logs: vec![],
            ..receipt
        };
        assert_eq!(empty.bloom(), Bloom::default());
    }

    #[test]
    fn legacy_transaction_round_trip() {
        let tx = Transaction {
            tx_type: TxType::Legacy,
            chain_id: Some(1),
            nonce: 9,
            max_fee_per_gas: 20_000_000_000,
            max_priority_fee_per_gas: None,
            gas_limit: 21_000,
            to: Some(Address::repeat_byte(0x35)),
            value: U256::from(10u64).pow(U256::from(18u64)),
            input: Bytes::new(),
            access_list: Vec::new(),
            signature: TxSignature {
                y_parity: false,
                r: U256::from(1u64),
                s: U256::from(2u64),
            },
        };
        let encoded = tx.encode_2718();
        let decoded = Transaction::decode_2718(&encoded).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.legacy_v(), 37);
    }

    #[test]
    fn eip1559_transaction_round_trip() {
        let tx = Transaction {
            tx_type: TxType::Eip1559,
            chain_id: Some(1),
            nonce: 0,
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: Some(1_000_000_000),
            gas_limit: 100_000,
            to: None,
            value: U256::ZERO,
            input: Bytes::from(vec![0x60, 0x80]),
            access_list: vec![AccessListItem {
                address: Address::repeat_byte(2),
                storage_keys: vec![B256::ZERO],
            }],
            signature: TxSignature {
                y_parity: true,
                r: U256::from(11u64),
                s: U256::from(12u64),
            },
        };
        let encoded = tx.encode_2718();
        assert_eq!(encoded[0], 2);
        assert_eq!(Transaction::decode_2718(&encoded).unwrap(), tx);
    }

    #[test]
    fn tx_db_record_keeps_sender() {
        let tx = Transaction {
            tx_type: TxType::Legacy,
            chain_id: None,
            nonce: 0,
            max_fee_per_gas: 1,
            max_priority_fee_per_gas: None,
            gas_limit: 21_000,
            to: Some(Address::ZERO),
            value: U256::ZERO,
            input: Bytes::new(),
            access_list: Vec::new(),
            signature: TxSignature {
                y_parity: false,
                r: U256::from(1u64),
                s: U256::from(1u64),
            },
        };
        let sender = Address::repeat_byte(0x42);
        let record = tx.encode_db(&sender);
        let (tx2, sender2) = Transaction::decode_db(&record).unwrap();
        assert_eq!(tx2, tx);
        assert_eq!(sender2, sender);
        assert_eq!(
            Transaction::payload_of_db(&record).unwrap(),
            Bytes::from(tx.encode_2718())
        );
    }

    #[test]
    fn call_frame_chunking_reassembles() {
        let frames: Vec<CallFrame> = (0..16)
            .map(|i| CallFrame {
                kind: 0,
                from: Address::repeat_byte(i as u8),
                to: Address::repeat_byte(0xff),
                value: U256::from(i),
                gas: 100_000,
                gas_used: 30_000,
                input: Bytes::from(vec![i as u8; 100]),
                output: Bytes::new(),
                success: true,
                depth: i,
            })
            .collect();
        let chunks = chunk_call_frames(&frames, 256);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.is_empty()));
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(decode_call_frames(&joined).unwrap(), frames);
    }

    #[test]
    fn header_round_trip_with_optional_tail() {
        let mut header = BlockHeader {
            number: 17_000_000,
            gas_limit: 30_000_000,
            gas_used: 12_345_678,
            timestamp: 1_680_000_000,
            base_fee_per_gas: Some(7),
            withdrawals_root: Some(EMPTY_ROOT),
            ..Default::default()
        };
        let decoded = BlockHeader::decode_rlp(&header.encode_rlp()).unwrap();
        assert_eq!(decoded, header);

        // Pre-London headers stop before the optional tail.
        header.base_fee_per_gas = None;
        header.withdrawals_root = None;
        let decoded = BlockHeader::decode_rlp(&header.encode_rlp()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn block_round_trip() {
        let block = Block {
            header: BlockHeader {
                number: 1,
                ..Default::default()
            },
            transactions: vec![Transaction {
                tx_type: TxType::Legacy,
                chain_id: Some(1),
                nonce: 0,
                max_fee_per_gas: 10,
                max_priority_fee_per_gas: None,
                gas_limit: 21_000,
                to: Some(Address::repeat_byte(9)),
                value: U256::from(5u64),
                input: Bytes::new(),
                access_list: Vec::new(),
                signature: TxSignature {
                    y_parity: true,
                    r: U256::from(3u64),
                    s: U256::from(4u64),
                },
            }],
            ommers: Vec::new(),
            withdrawals: Some(vec![Withdrawal {
                index: 0,
                validator_index: 1,
                address: Address::repeat_byte(7),
                amount: 32_000_000_000,
            }]),
        };
        assert_eq!(Block::decode_rlp(&block.encode_rlp()).unwrap(), block);
    }
}
