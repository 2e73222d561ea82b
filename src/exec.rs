//! Interfaces of the external collaborators: the EVM execution engine, the
//! consensus source, and the chain rules. The core consumes these; it never
//! implements EVM semantics itself.

use alloy_primitives::{Address, B256};

use crate::primitives::{Block, BlockHeader, CallFrame, Code, Receipt, StateDeltas, Transaction};
use crate::state::State;
use crate::DbResult;

/// EVM revisions, newest last so ordering comparisons read naturally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Revision {
    Frontier,
    Homestead,
    SpuriousDragon,
    Byzantium,
    Istanbul,
    Berlin,
    London,
    Shanghai,
    Cancun,
}

/// Ring of the most recent block hashes, feeding the BLOCKHASH surface of
/// the execution engine's pre-state view.
#[derive(Clone, Debug)]
pub struct BlockHashBuffer {
    hashes: Vec<B256>,
    next: u64,
}

impl BlockHashBuffer {
    const DEPTH: u64 = 256;

    pub fn new() -> Self {
        Self {
            hashes: vec![B256::ZERO; Self::DEPTH as usize],
            next: 0,
        }
    }

    /// Record the hash of `number`; numbers must arrive in order.
    pub fn set(&mut self, number: u64, hash: B256) {
        self.hashes[(number % Self::DEPTH) as usize] = hash;
        self.next = number + 1;
    }

    pub fn get(&self, number: u64) -> Option<B256> {
        if number >= self.next || self.next - number > Self::DEPTH {
            return None;
        }
        Some(self.hashes[(number % Self::DEPTH) as usize])
    }
}

impl Default for BlockHashBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an engine sees besides the transaction and the state view.
#[derive(Debug)]
pub struct TxContext<'a> {
    pub header: &'a BlockHeader,
    pub revision: Revision,
    pub tx_index: u32,
    pub sender: Address,
    pub block_hashes: &'a BlockHashBuffer,
}

/// What one transaction execution produces besides its state delta (which
/// accumulates in the [`State`] it ran against).
#[derive(Clone, Debug)]
pub struct TxOutput {
    /// Receipt with `cumulative_gas_used` holding this transaction's own gas
    /// use; the runloop folds in the running total.
    pub receipt: Receipt,
    pub call_frames: Vec<CallFrame>,
}

/// The EVM executor. Implementations read and write exclusively through the
/// passed [`State`], which records the read set used for conflict detection.
pub trait ExecutionEngine: Send + Sync {
    fn execute(
        &self,
        ctx: &TxContext<'_>,
        tx: &Transaction,
        state: &mut State<'_, '_>,
    ) -> Result<TxOutput, String>;
}

/// Chain-specific validation rules and revision schedule.
pub trait Chain: Send + Sync {
    fn id(&self) -> alloy_chains::Chain;

    fn revision(&self, block_number: u64, timestamp: u64) -> Revision;

    /// Static header validation against the parent.
    fn validate_header(
        &self,
        parent: Option<&BlockHeader>,
        header: &BlockHeader,
    ) -> DbResult<()>;

    /// Account allocation committed as version 0 when the DB starts empty.
    /// Chains bootstrapped from snapshots leave this empty.
    fn genesis_state(&self) -> (StateDeltas, Code) {
        (StateDeltas::default(), Code::default())
    }
}

/// A block proposal delivered by consensus.
#[derive(Clone, Debug)]
pub struct ProposedBlock {
    pub block: Block,
    pub block_id: B256,
    pub parent_id: B256,
}

/// Ordered block proposals and finalization events from the consensus
/// ledger. Both heads are polled by the multi-proposal runloop.
pub trait ConsensusSource: Send + Sync {
    /// The next proposal not yet handed out, if any.
    fn next_proposal(&self) -> Option<ProposedBlock>;

    /// The highest finalized `(block_number, block_id)`.
    fn finalized_head(&self) -> Option<(u64, B256)>;
}
