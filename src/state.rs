//! The block-state concurrency layer.
//!
//! Transactions execute optimistically: each gets a [`State`] that records
//! every pre-image it observed (accounts and storage slots) while buffering
//! its writes locally. Merging happens strictly in transaction order: if the
//! shared [`BlockState`] still shows every observed pre-image, the write set
//! folds in; otherwise the transaction re-executes against the current view.
//! A merge conflict is therefore never surfaced to callers, only paid for in
//! re-execution time.
//!
//! The shared view lives in concurrent maps so executing transactions can
//! read it from worker threads while the merge loop (single-threaded) is the
//! only writer.

use ahash::{AHashMap, AHashSet};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use dashmap::DashMap;
use tracing::trace;

use crate::db::TrieDb;
use crate::exec::Revision;
use crate::primitives::{Account, Code, Incarnation, StateDelta, StateDeltas};
use crate::DbResult;

/// EIP-1283/2200/3529 storage-write classification, mirroring the canonical
/// EVMC statuses. The execution collaborator maps these to gas and refunds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageStatus {
    /// No-op or dirty overwrite without a special case.
    Assigned,
    /// 0 -> nonzero on a clean slot.
    Added,
    /// nonzero -> 0 on a clean slot.
    Deleted,
    /// nonzero -> different nonzero on a clean slot.
    Modified,
    /// Deleted earlier in the transaction, now set again.
    DeletedAdded,
    /// Modified earlier, now deleted.
    ModifiedDeleted,
    /// Deleted earlier, original value restored.
    DeletedRestored,
    /// Added earlier in the transaction, now deleted again.
    AddedDeleted,
    /// Modified earlier, original value restored.
    ModifiedRestored,
}

fn classify(original: B256, current: B256, new: B256) -> StorageStatus {
    use StorageStatus::*;
    if current == new {
        return Assigned;
    }
    if original == current {
        if original.is_zero() {
            Added
        } else if new.is_zero() {
            Deleted
        } else {
            Modified
        }
    } else if original.is_zero() {
        if new.is_zero() {
            AddedDeleted
        } else {
            Assigned
        }
    } else if current.is_zero() {
        if new == original {
            DeletedRestored
        } else {
            DeletedAdded
        }
    } else if new.is_zero() {
        ModifiedDeleted
    } else if new == original {
        ModifiedRestored
    } else {
        Assigned
    }
}

#[derive(Clone, Debug)]
struct VersionedAccount {
    /// Value at block start (the base version).
    original: Option<Account>,
    /// Latest merged value.
    current: Option<Account>,
}

#[derive(Clone, Copy, Debug)]
struct SlotState {
    /// Value at block start under the account's base incarnation.
    original: B256,
    current: B256,
}

/// The merged view of a block in flight, layered over a parent-version
/// cursor.
pub struct BlockState<'db> {
    base: &'db TrieDb,
    accounts: DashMap<Address, VersionedAccount>,
    storage: DashMap<(Address, B256), SlotState>,
    code: DashMap<B256, Bytes>,
}

impl std::fmt::Debug for BlockState<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockState")
            .field("accounts", &self.accounts.len())
            .finish_non_exhaustive()
    }
}

impl<'db> BlockState<'db> {
    /// `base` must be positioned at the parent version.
    pub fn new(base: &'db TrieDb) -> Self {
        Self {
            base,
            accounts: DashMap::new(),
            storage: DashMap::new(),
            code: DashMap::new(),
        }
    }

    /// The current merged account value, faulting the base version in on
    /// first touch.
    pub fn account_view(&self, address: &Address) -> DbResult<Option<Account>> {
        if let Some(entry) = self.accounts.get(address) {
            return Ok(entry.current);
        }
        let base = self.base.read_account(address)?;
        // Two racers read the same base value; either insert wins.
        self.accounts.entry(*address).or_insert(VersionedAccount {
            original: base,
            current: base,
        });
        Ok(base)
    }

    /// The current merged slot value. Slots of incarnations newer than the
    /// base version never reach the base trie.
    pub fn storage_view(&self, address: &Address, slot: &B256) -> DbResult<B256> {
        if let Some(entry) = self.storage.get(&(*address, *slot)) {
            return Ok(entry.current);
        }
        let base_incarnation = self
            .accounts
            .get(address)
            .map(|e| e.original.map(|a| a.incarnation))
            .unwrap_or_else(|| self.base_incarnation(address));
        let current_incarnation = self.account_view(address)?.map(|a| a.incarnation);
        let value = match (base_incarnation, current_incarnation) {
            (Some(base_inc), Some(cur_inc)) if base_inc == cur_inc => {
                self.base.read_storage_latest(address, slot)?
            }
            _ => B256::ZERO,
        };
        self.storage.entry((*address, *slot)).or_insert(SlotState {
            original: value,
            current: value,
        });
        Ok(value)
    }

    fn base_incarnation(&self, address: &Address) -> Option<Incarnation> {
        self.base
            .read_account(address)
            .ok()
            .flatten()
            .map(|a| a.incarnation)
    }

    pub fn code_view(&self, code_hash: &B256) -> DbResult<Bytes> {
        if let Some(hit) = self.code.get(code_hash) {
            return Ok(hit.clone());
        }
        Ok(self.base.read_code(code_hash)?.unwrap_or_default())
    }

    /// Validate every pre-image `state` observed against the current view.
    pub fn can_merge(&self, state: &State<'_, 'db>) -> DbResult<bool> {
        for (address, observed) in &state.read_accounts {
            if self.account_view(address)? != *observed {
                trace!(target: "triedb::state", ?address, "account conflict");
                return Ok(false);
            }
        }
        for ((address, slot), observed) in &state.read_storage {
            if self.storage_view(address, slot)? != *observed {
                trace!(target: "triedb::state", ?address, ?slot, "storage conflict");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fold a transaction's write set in. Caller guarantees `can_merge`
    /// returned true and calls in transaction order.
    pub fn merge(&self, state: State<'_, 'db>) {
        for (address, post) in state.accounts {
            let bumped = match (&post, self.accounts.get(&address).and_then(|e| e.current))
            {
                (Some(new), Some(old)) => new.incarnation != old.incarnation,
                (None, Some(_)) => true,
                _ => false,
            };
            if bumped {
                // A destructed (or recreated) account leaves no readable
                // slots behind.
                self.storage.retain(|(a, _), _| a != &address);
            }
            match self.accounts.entry(address) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    entry.get_mut().current = post;
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(VersionedAccount {
                        original: None,
                        current: post,
                    });
                }
            }
        }
        for ((address, slot), value) in state.storage {
            match self.storage.entry((address, slot)) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    entry.get_mut().current = value;
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(SlotState {
                        original: B256::ZERO,
                        current: value,
                    });
                }
            }
        }
        for (hash, code) in state.code_writes {
            self.code.insert(hash, code);
        }
    }

    /// Credit a balance outside any transaction (withdrawals, rewards).
    pub fn credit(&self, address: &Address, amount: U256) -> DbResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let current = self.account_view(address)?;
        let mut account = current.unwrap_or_default();
        account.balance += amount;
        self.accounts
            .entry(*address)
            .and_modify(|e| e.current = Some(account))
            .or_insert(VersionedAccount {
                original: None,
                current: Some(account),
            });
        Ok(())
    }

    /// Collapse into per-account deltas for the commit.
    pub fn into_deltas(self) -> (StateDeltas, Code) {
        let mut deltas: StateDeltas = AHashMap::new();
        for (address, versions) in self.accounts {
            deltas.insert(
                address,
                StateDelta {
                    account: (versions.original, versions.current),
                    storage: AHashMap::new(),
                },
            );
        }
        for ((address, slot), ss) in self.storage {
            if ss.original == ss.current {
                continue;
            }
            let delta = deltas.entry(address).or_default();
            // Storage without an account record cannot commit; account_view
            // always populated the account on first storage touch.
            delta.storage.insert(slot, (ss.original, ss.current));
        }
        // Accounts that were only read do not belong in the delta.
        deltas.retain(|_, d| {
            d.account.0 != d.account.1 || !d.storage.is_empty()
        });
        let mut code: Code = AHashMap::new();
        for (hash, bytes) in self.code {
            code.insert(hash, bytes);
        }
        (deltas, code)
    }
}

/// Warm/cold access status per EIP-2929.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessStatus {
    Cold,
    Warm,
}

/// Per-transaction state: observed reads, buffered writes, transient
/// storage, and the destruct bookkeeping the revision rules need.
pub struct State<'b, 'db> {
    block: &'b BlockState<'db>,
    /// Incarnation this transaction would assign on contract creation.
    pub incarnation: Incarnation,
    read_accounts: AHashMap<Address, Option<Account>>,
    read_storage: AHashMap<(Address, B256), B256>,
    accounts: AHashMap<Address, Option<Account>>,
    storage: AHashMap<(Address, B256), B256>,
    /// Transaction-start values, for the storage-status classification.
    original_storage: AHashMap<(Address, B256), B256>,
    transient: AHashMap<(Address, B256), B256>,
    accessed_accounts: AHashSet<Address>,
    accessed_storage: AHashSet<(Address, B256)>,
    touched: AHashSet<Address>,
    destructed: AHashSet<Address>,
    created: AHashSet<Address>,
    code_writes: AHashMap<B256, Bytes>,
}

impl std::fmt::Debug for State<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("incarnation", &self.incarnation)
            .field("writes", &self.accounts.len())
            .finish_non_exhaustive()
    }
}

impl<'b, 'db> State<'b, 'db> {
    pub fn new(block: &'b BlockState<'db>, incarnation: Incarnation) -> Self {
        Self {
            block,
            incarnation,
            read_accounts: AHashMap::new(),
            read_storage: AHashMap::new(),
            accounts: AHashMap::new(),
            storage: AHashMap::new(),
            original_storage: AHashMap::new(),
            transient: AHashMap::new(),
            accessed_accounts: AHashSet::new(),
            accessed_storage: AHashSet::new(),
            touched: AHashSet::new(),
            destructed: AHashSet::new(),
            created: AHashSet::new(),
            code_writes: AHashMap::new(),
        }
    }

    fn account(&mut self, address: &Address) -> DbResult<Option<Account>> {
        if let Some(local) = self.accounts.get(address) {
            return Ok(*local);
        }
        let view = self.block.account_view(address)?;
        self.read_accounts.entry(*address).or_insert(view);
        Ok(view)
    }

    fn write_account(&mut self, address: Address, account: Option<Account>) {
        self.touched.insert(address);
        self.accounts.insert(address, account);
    }

    // ---- account surface ----------------------------------------------

    /// EIP-2929 warm/cold account access.
    pub fn access_account(&mut self, address: &Address) -> AccessStatus {
        if self.accessed_accounts.insert(*address) {
            AccessStatus::Cold
        } else {
            AccessStatus::Warm
        }
    }

    /// EIP-2929 warm/cold storage access.
    pub fn access_storage(&mut self, address: &Address, slot: &B256) -> AccessStatus {
        if self.accessed_storage.insert((*address, *slot)) {
            AccessStatus::Cold
        } else {
            AccessStatus::Warm
        }
    }

    pub fn account_exists(&mut self, address: &Address) -> DbResult<bool> {
        Ok(self.account(address)?.is_some())
    }

    /// Install a fresh contract account. Balance carried over from any
    /// existing account at the address; storage starts from the new
    /// incarnation, so every slot reads zero until written.
    pub fn create_contract(&mut self, address: &Address) -> DbResult<()> {
        let prior = self.account(address)?;
        let account = Account {
            nonce: 0,
            balance: prior.map(|a| a.balance).unwrap_or_default(),
            code_hash: crate::primitives::EMPTY_CODE_HASH,
            incarnation: self.incarnation,
        };
        self.created.insert(*address);
        self.destructed.remove(address);
        // Drop any storage writes this transaction already made there.
        self.storage.retain(|(a, _), _| a != address);
        self.write_account(*address, Some(account));
        Ok(())
    }

    pub fn get_balance(&mut self, address: &Address) -> DbResult<U256> {
        Ok(self.account(address)?.map(|a| a.balance).unwrap_or_default())
    }

    pub fn add_balance(&mut self, address: &Address, amount: U256) -> DbResult<()> {
        let mut account = self.account(address)?.unwrap_or_default();
        account.balance += amount;
        self.write_account(*address, Some(account));
        Ok(())
    }

    pub fn subtract_balance(&mut self, address: &Address, amount: U256) -> DbResult<()> {
        let mut account = self.account(address)?.unwrap_or_default();
        account.balance = account.balance.saturating_sub(amount);
        self.write_account(*address, Some(account));
        Ok(())
    }

    pub fn get_nonce(&mut self, address: &Address) -> DbResult<u64> {
        Ok(self.account(address)?.map(|a| a.nonce).unwrap_or_default())
    }

    pub fn set_nonce(&mut self, address: &Address, nonce: u64) -> DbResult<()> {
        let mut account = self.account(address)?.unwrap_or_default();
        account.nonce = nonce;
        self.write_account(*address, Some(account));
        Ok(())
    }

    pub fn get_code_hash(&mut self, address: &Address) -> DbResult<B256> {
        Ok(self
            .account(address)?
            .map(|a| a.code_hash)
            .unwrap_or(crate::primitives::EMPTY_CODE_HASH))
    }

    pub fn set_code_hash(&mut self, address: &Address, code_hash: B256) -> DbResult<()> {
        let mut account = self.account(address)?.unwrap_or_default();
        account.code_hash = code_hash;
        self.write_account(*address, Some(account));
        Ok(())
    }

    pub fn get_code(&mut self, address: &Address) -> DbResult<Bytes> {
        let hash = self.get_code_hash(address)?;
        if let Some(code) = self.code_writes.get(&hash) {
            return Ok(code.clone());
        }
        self.block.code_view(&hash)
    }

    /// Copy a slice of an account's code into `out`, returning the copied
    /// length.
    pub fn copy_code(
        &mut self,
        address: &Address,
        offset: usize,
        out: &mut [u8],
    ) -> DbResult<usize> {
        let code = self.get_code(address)?;
        if offset >= code.len() {
            return Ok(0);
        }
        let n = out.len().min(code.len() - offset);
        out[..n].copy_from_slice(&code[offset..offset + n]);
        Ok(n)
    }

    /// Store new code and point the account at it.
    pub fn set_code(&mut self, address: &Address, code: Bytes) -> DbResult<B256> {
        let hash = keccak256(&code);
        self.code_writes.insert(hash, code);
        self.set_code_hash(address, hash)?;
        Ok(hash)
    }

    // ---- storage surface ----------------------------------------------

    pub fn get_storage(&mut self, address: &Address, slot: &B256) -> DbResult<B256> {
        if let Some(local) = self.storage.get(&(*address, *slot)) {
            return Ok(*local);
        }
        if self.destructed.contains(address) {
            return Ok(B256::ZERO);
        }
        // A contract created in this transaction starts from empty storage.
        if self.created.contains(address) {
            return Ok(B256::ZERO);
        }
        let value = self.block.storage_view(address, slot)?;
        self.read_storage.entry((*address, *slot)).or_insert(value);
        Ok(value)
    }

    /// Write a slot and classify the transition for gas accounting.
    pub fn set_storage(
        &mut self,
        address: &Address,
        slot: &B256,
        value: B256,
    ) -> DbResult<StorageStatus> {
        let current = self.get_storage(address, slot)?;
        let original = match self.original_storage.entry((*address, *slot)) {
            std::collections::hash_map::Entry::Occupied(e) => *e.get(),
            std::collections::hash_map::Entry::Vacant(e) => *e.insert(current),
        };
        let status = classify(original, current, value);
        self.storage.insert((*address, *slot), value);
        Ok(status)
    }

    pub fn get_transient_storage(&self, address: &Address, slot: &B256) -> B256 {
        self.transient
            .get(&(*address, *slot))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_transient_storage(&mut self, address: &Address, slot: &B256, value: B256) {
        self.transient.insert((*address, *slot), value);
    }

    // ---- destruction --------------------------------------------------

    /// Schedule `address` for destruction, moving its balance to the
    /// beneficiary immediately. Returns false when already scheduled.
    pub fn selfdestruct(
        &mut self,
        address: &Address,
        beneficiary: &Address,
    ) -> DbResult<bool> {
        if self.destructed.contains(address) {
            return Ok(false);
        }
        let balance = self.get_balance(address)?;
        if address != beneficiary {
            self.add_balance(beneficiary, balance)?;
        }
        let mut account = self.account(address)?.unwrap_or_default();
        account.balance = U256::ZERO;
        self.write_account(*address, Some(account));
        self.destructed.insert(*address);
        Ok(true)
    }

    /// Apply scheduled destructions at end of transaction. From Cancun the
    /// account only dies when it was created in this same transaction.
    pub fn destruct_suicides(&mut self, revision: Revision) {
        let scheduled: Vec<Address> = self.destructed.iter().copied().collect();
        for address in scheduled {
            if revision >= Revision::Cancun && !self.created.contains(&address) {
                continue;
            }
            self.storage.retain(|(a, _), _| a != &address);
            self.accounts.insert(address, None);
        }
    }

    /// EIP-161: delete touched accounts that ended the transaction empty.
    pub fn destruct_touched_dead(&mut self) {
        let touched: Vec<Address> = self.touched.iter().copied().collect();
        for address in touched {
            let dead = matches!(
                self.accounts.get(&address),
                Some(Some(account)) if account.is_empty()
            );
            if dead {
                self.storage.retain(|(a, _), _| a != &address);
                self.accounts.insert(address, None);
            }
        }
    }

    /// Clear transaction-scoped state so the same `State` can be reused for
    /// a re-execution.
    pub fn reset(&mut self) {
        self.read_accounts.clear();
        self.read_storage.clear();
        self.accounts.clear();
        self.storage.clear();
        self.original_storage.clear();
        self.transient.clear();
        self.accessed_accounts.clear();
        self.accessed_storage.clear();
        self.touched.clear();
        self.destructed.clear();
        self.created.clear();
        self.code_writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(v: u64) -> B256 {
        B256::from(U256::from(v))
    }

    #[test]
    fn storage_status_clean_transitions() {
        use StorageStatus::*;
        // current == new is always a no-op assignment.
        assert_eq!(classify(b(1), b(1), b(1)), Assigned);
        assert_eq!(classify(b(0), b(0), b(3)), Added);
        assert_eq!(classify(b(2), b(2), b(0)), Deleted);
        assert_eq!(classify(b(2), b(2), b(5)), Modified);
    }

    #[test]
    fn storage_status_dirty_transitions() {
        use StorageStatus::*;
        assert_eq!(classify(b(0), b(3), b(0)), AddedDeleted);
        assert_eq!(classify(b(0), b(3), b(4)), Assigned);
        assert_eq!(classify(b(2), b(0), b(2)), DeletedRestored);
        assert_eq!(classify(b(2), b(0), b(5)), DeletedAdded);
        assert_eq!(classify(b(2), b(3), b(0)), ModifiedDeleted);
        assert_eq!(classify(b(2), b(3), b(2)), ModifiedRestored);
        assert_eq!(classify(b(2), b(3), b(4)), Assigned);
    }
}
