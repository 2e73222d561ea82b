//! A versioned, copy-on-write Merkle-Patricia trie storage engine on raw
//! block devices, and the block-state execution layer that commits one trie
//! version per block.
//!
//! The storage side owns its devices as a pool of fixed-size chunks, appends
//! node records through an ordered write pipeline, and reclaims cold chunks
//! with inline compaction while readers keep resolving historical versions.
//! The execution side runs transactions optimistically against a shared
//! block state, re-executes on conflict, and folds the surviving deltas into
//! exactly one trie upsert.
//!
//! EVM bytecode execution, consensus, and chain validation rules live behind
//! the traits in [`exec`]; this crate consumes them.

use crate::node::VirtualOffset;

/// Errors surfaced by the storage engine and the runloop.
///
/// Key misses are not errors; they surface as `None` at the DB façade.
/// Merge conflicts are recovered inside the block-state layer by
/// re-execution and never escape it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    /// A disk read or write failed. Fatal to the current upsert; the core
    /// never retries.
    #[error("i/o failure{}: {message}", offset.map(|o| format!(" at {o:?}")).unwrap_or_default())]
    Io {
        offset: Option<VirtualOffset>,
        message: String,
    },
    /// A commit targeted a parent that does not exist, duplicated an
    /// existing proposal, or skipped a version.
    #[error("invalid block proposal: {reason}")]
    InvalidBlockProposal { reason: String },
    /// Static block or header validation failed.
    #[error("validation failed: {kind}")]
    Validation { kind: String },
    /// Sender recovery could not produce an address for a transaction.
    #[error("missing sender for transaction {tx_index}")]
    MissingSender { tx_index: usize },
    /// The execution collaborator failed.
    #[error("execution failed: {0}")]
    Execution(String),
    /// A node record failed structural checks. Fatal.
    #[error("corruption{}: {reason}", offset.map(|o| format!(" at {o:?}")).unwrap_or_default())]
    Corruption {
        offset: Option<VirtualOffset>,
        reason: &'static str,
    },
}

impl DbError {
    pub(crate) fn io(err: std::io::Error) -> Self {
        DbError::Io {
            offset: None,
            message: err.to_string(),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

pub mod block_db;
pub mod chain;
pub mod compute;
pub mod db;
pub mod exec;
pub mod io;
pub mod nibbles;
pub mod node;
pub mod pool;
pub mod primitives;
pub mod runloop;
pub mod snapshot;
pub mod state;
pub mod statesync;
pub mod traverse;
pub mod trie;

pub use db::{Db, DbConfig, TrieDb};
pub use exec::{Chain, ConsensusSource, ExecutionEngine, Revision};
pub use primitives::{Account, Incarnation, StateDelta, StateDeltas};
pub use state::{BlockState, State, StorageStatus};
