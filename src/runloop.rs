//! The block runloop.
//!
//! Two modes share the execution core. The single-finalized-chain mode
//! replays an archive: fetch, validate, recover senders, execute, commit,
//! finalize immediately. The multi-proposal mode follows a consensus source:
//! execute proposals as they arrive, apply finalizations in order, and nap
//! for 100 microseconds when caught up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256, U256};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::block_db::BlockDb;
use crate::db::{Commit, Db, TrieDb};
use crate::exec::{
    BlockHashBuffer, Chain, ConsensusSource, ExecutionEngine, Revision, TxContext,
};
use crate::primitives::{Block, CallFrame, Code, Incarnation, Receipt, StateDeltas};
use crate::state::{BlockState, State};
use crate::{DbError, DbResult};

/// Gwei-to-wei factor for withdrawal amounts.
const GWEI: u64 = 1_000_000_000;

/// Counters the runloop reports on exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunStats {
    pub blocks: u64,
    pub txs: u64,
}

/// Recover every transaction sender in parallel.
pub fn recover_senders(transactions: &[crate::primitives::Transaction]) -> DbResult<Vec<Address>> {
    let recovered: Vec<Option<Address>> = transactions
        .par_iter()
        .map(|tx| tx.recover_sender())
        .collect();
    recovered
        .into_iter()
        .enumerate()
        .map(|(tx_index, sender)| sender.ok_or(DbError::MissingSender { tx_index }))
        .collect()
}

/// The result of executing one block, ready to hand to `TrieDb::commit`.
#[derive(Debug)]
pub struct ExecutedBlock {
    pub deltas: StateDeltas,
    pub code: Code,
    pub receipts: Vec<Receipt>,
    pub call_frames: Vec<Vec<CallFrame>>,
}

/// Execute a block's transactions against the cursor version of `tdb`.
///
/// All transactions run optimistically in parallel first; the merge loop
/// then folds them in block order, re-executing any transaction whose
/// observed pre-images the earlier merges invalidated. Conflicts never
/// escape this function.
pub fn execute_block(
    tdb: &TrieDb,
    chain: &dyn Chain,
    engine: &dyn ExecutionEngine,
    block: &Block,
    senders: &[Address],
    block_hashes: &BlockHashBuffer,
    trace_calls: bool,
) -> DbResult<ExecutedBlock> {
    let header = &block.header;
    let revision = chain.revision(header.number, header.timestamp);
    let block_state = BlockState::new(tdb);

    let run_one = |i: usize,
                   state: &mut State<'_, '_>|
     -> DbResult<crate::exec::TxOutput> {
        let ctx = TxContext {
            header,
            revision,
            tx_index: i as u32,
            sender: senders[i],
            block_hashes,
        };
        let out = engine
            .execute(&ctx, &block.transactions[i], state)
            .map_err(DbError::Execution)?;
        if revision >= Revision::SpuriousDragon {
            state.destruct_touched_dead();
        }
        state.destruct_suicides(revision);
        Ok(out)
    };

    // Optimistic first pass.
    let mut first_pass: Vec<Option<(State<'_, '_>, crate::exec::TxOutput)>> =
        (0..block.transactions.len())
            .into_par_iter()
            .map(|i| {
                let mut state = State::new(
                    &block_state,
                    Incarnation::new(header.number, i as u32),
                );
                run_one(i, &mut state).map(|out| Some((state, out)))
            })
            .collect::<DbResult<Vec<_>>>()?;

    // Ordered merge with local conflict recovery.
    let mut receipts = Vec::with_capacity(first_pass.len());
    let mut call_frames = Vec::with_capacity(first_pass.len());
    let mut cumulative_gas = 0u64;
    for i in 0..first_pass.len() {
        let (mut state, mut out) = first_pass[i].take().expect("merged once");
        if !block_state.can_merge(&state)? {
            state.reset();
            out = run_one(i, &mut state)?;
        }
        block_state.merge(state);
        cumulative_gas += out.receipt.cumulative_gas_used;
        out.receipt.cumulative_gas_used = cumulative_gas;
        receipts.push(out.receipt);
        call_frames.push(if trace_calls { out.call_frames } else { Vec::new() });
    }

    if let Some(withdrawals) = &block.withdrawals {
        for withdrawal in withdrawals {
            block_state.credit(
                &withdrawal.address,
                U256::from(withdrawal.amount) * U256::from(GWEI),
            )?;
        }
    }

    let (deltas, code) = block_state.into_deltas();
    Ok(ExecutedBlock {
        deltas,
        code,
        receipts,
        call_frames,
    })
}

fn log_tps(blocks: u64, to_block: u64, txs: u64, gas: u64, begin: Instant) {
    let elapsed = begin.elapsed().as_micros().max(1) as u64;
    info!(
        target: "triedb::runloop",
        blocks,
        to_block,
        txs,
        tps = txs * 1_000_000 / elapsed,
        gps_m = gas / elapsed,
        "progress"
    );
}

fn commit_from(
    block: Block,
    senders: Vec<Address>,
    executed: ExecutedBlock,
    block_id: B256,
) -> Commit {
    Commit {
        deltas: executed.deltas,
        code: executed.code,
        block_id,
        header: block.header,
        receipts: executed.receipts,
        transactions: block.transactions,
        senders,
        call_frames: executed.call_frames,
        ommers: block.ommers,
        withdrawals: block.withdrawals,
    }
}

/// Replay an archive on a single finalized chain. Stops cleanly after the
/// current block once `stop` is raised.
pub fn run_ethereum(
    chain: &dyn Chain,
    archive: &BlockDb,
    db: &Db,
    engine: &dyn ExecutionEngine,
    nblocks: Option<u64>,
    trace_calls: bool,
    stop: &AtomicBool,
) -> DbResult<RunStats> {
    let mut tdb = TrieDb::new(db.clone());
    let mut block_hashes = BlockHashBuffer::new();
    if db.get_latest_finalized_version().is_none() {
        let (deltas, code) = chain.genesis_state();
        if !deltas.is_empty() || !code.is_empty() {
            tdb.commit_sequential(Commit {
                deltas,
                code,
                header: crate::primitives::BlockHeader::default(),
                ..Default::default()
            })?;
        }
    }
    let start = db
        .get_latest_finalized_version()
        .map(|v| v + 1)
        .unwrap_or(0);
    // Prime the hash ring from the archive so BLOCKHASH sees history.
    for n in start.saturating_sub(256)..start {
        if let Some(prior) = archive.read(n)? {
            block_hashes.set(n, prior.header.hash());
        }
    }

    let mut stats = RunStats::default();
    let mut parent_header = if start > 0 {
        archive.read(start - 1)?.map(|b| b.header)
    } else {
        None
    };
    let batch_begin = Instant::now();
    let mut batch_blocks = 0u64;
    let mut batch_txs = 0u64;
    let mut batch_gas = 0u64;
    let mut number = start;

    while !stop.load(Ordering::Relaxed) {
        if let Some(limit) = nblocks {
            if stats.blocks >= limit {
                break;
            }
        }
        let Some(block) = archive.read(number)? else {
            break;
        };
        chain.validate_header(parent_header.as_ref(), &block.header)?;
        let senders = recover_senders(&block.transactions)?;
        let executed = execute_block(
            &tdb,
            chain,
            engine,
            &block,
            &senders,
            &block_hashes,
            trace_calls,
        )?;
        let header = block.header.clone();
        stats.txs += block.transactions.len() as u64;
        batch_txs += block.transactions.len() as u64;
        batch_gas += header.gas_used;
        tdb.commit_sequential(commit_from(block, senders, executed, B256::ZERO))?;
        block_hashes.set(number, header.hash());
        parent_header = Some(header);
        stats.blocks += 1;
        batch_blocks += 1;
        if batch_blocks == 1000 {
            log_tps(batch_blocks, number, batch_txs, batch_gas, batch_begin);
            batch_blocks = 0;
            batch_txs = 0;
            batch_gas = 0;
        }
        number += 1;
    }
    if batch_blocks > 0 {
        log_tps(batch_blocks, number.saturating_sub(1), batch_txs, batch_gas, batch_begin);
    }
    if stop.load(Ordering::Relaxed) {
        warn!(target: "triedb::runloop", "stopped by signal");
    }
    Ok(stats)
}

/// Follow a consensus ledger: execute proposals as they arrive and apply
/// finalizations in order.
pub fn run_proposals(
    chain: &dyn Chain,
    consensus: &dyn ConsensusSource,
    db: &Db,
    engine: &dyn ExecutionEngine,
    trace_calls: bool,
    stop: &AtomicBool,
) -> DbResult<RunStats> {
    let mut stats = RunStats::default();
    let block_hashes = BlockHashBuffer::new();

    while !stop.load(Ordering::Relaxed) {
        let mut progressed = false;

        if let Some(proposal) = consensus.next_proposal() {
            let number = proposal.block.header.number;
            let mut tdb = TrieDb::new(db.clone());
            if number > 0 {
                // The parent may be the finalized head or a sibling
                // proposal; the commit path validates either way.
                tdb.set_block_and_prefix_with(number - 1, proposal.parent_id);
                if db.root_at(number - 1, Some(proposal.parent_id)).is_none() {
                    tdb.set_block_and_prefix(number - 1);
                }
            }
            let parent_header = tdb.read_header()?;
            chain.validate_header(parent_header.as_ref(), &proposal.block.header)?;
            let senders = recover_senders(&proposal.block.transactions)?;
            let executed = execute_block(
                &tdb,
                chain,
                engine,
                &proposal.block,
                &senders,
                &block_hashes,
                trace_calls,
            )?;
            stats.txs += proposal.block.transactions.len() as u64;
            tdb.commit(commit_from(
                proposal.block,
                senders,
                executed,
                proposal.block_id,
            ))?;
            stats.blocks += 1;
            progressed = true;
        }

        if let Some((number, block_id)) = consensus.finalized_head() {
            let latest = db.get_latest_finalized_version().unwrap_or(0);
            if number > latest {
                // Finalize the whole ancestor chain up to the head, walking
                // parent ids downward first.
                let mut chain_ids = vec![(number, block_id)];
                let mut cursor = (number, block_id);
                while cursor.0 > latest + 1 {
                    match db.get_proposal_parent(cursor.0, cursor.1) {
                        Some(parent_id) => {
                            cursor = (cursor.0 - 1, parent_id);
                            chain_ids.push(cursor);
                        }
                        None => break,
                    }
                }
                for (n, id) in chain_ids.into_iter().rev() {
                    db.finalize(n, id)?;
                    progressed = true;
                }
            }
        }

        if !progressed {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
    Ok(stats)
}
