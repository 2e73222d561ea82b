//! The runloop binary: replay a block archive (or follow consensus) into
//! the trie database.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::U256;
use clap::Parser;
use tracing::{error, info};

use triedb::block_db::BlockDb;
use triedb::chain::ChainKind;
use triedb::db::{Db, DbConfig, TrieDb};
use triedb::exec::{ExecutionEngine, TxContext, TxOutput};
use triedb::pool::OpenMode;
use triedb::primitives::{CallFrame, Receipt, Transaction, TxType};
use triedb::runloop;
use triedb::state::State;
use triedb::{DbError, DbResult};

#[derive(Debug, Parser)]
#[command(name = "triedb-node", about = "execution node runloop")]
struct Args {
    /// Chain config to run: ethereum_mainnet, devnet, testnet, testnet2,
    /// mainnet.
    #[arg(long)]
    chain: String,

    /// Block archive directory.
    #[arg(long)]
    block_db: PathBuf,

    /// Number of blocks to execute before exiting.
    #[arg(long)]
    nblocks: Option<u64>,

    /// Worker threads for execution and sender recovery.
    #[arg(long)]
    nthreads: Option<usize>,

    /// Concurrent read operations in flight.
    #[arg(long)]
    nfibers: Option<usize>,

    /// Disable compaction.
    #[arg(long = "no-compaction")]
    no_compaction: bool,

    /// Backing devices, comma separated. In-memory when omitted.
    #[arg(long, value_delimiter = ',')]
    db: Vec<PathBuf>,

    /// Device capacity in GiB when creating fresh backing files.
    #[arg(long, default_value_t = 16)]
    db_size_gib: u64,

    /// Snapshot directory (accounts + code files) to initialize from.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Unix socket to serve statesync on.
    #[arg(long)]
    statesync: Option<PathBuf>,

    /// Record call frames while executing.
    #[arg(long)]
    trace_calls: bool,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// CPU to pin the write submission thread to (accepted for
    /// compatibility; pinning is delegated to the service manager).
    #[arg(long)]
    sq_thread_cpu: Option<u32>,

    /// CPU for the read-only context's submission thread (see above).
    #[arg(long)]
    ro_sq_thread_cpu: Option<u32>,

    /// Write a snapshot of the final state to this directory on exit.
    #[arg(long)]
    dump_snapshot: Option<PathBuf>,
}

/// Built-in engine for chains without a linked EVM: executes plain value
/// transfers and refuses anything that needs bytecode.
struct TransferEngine;

impl ExecutionEngine for TransferEngine {
    fn execute(
        &self,
        ctx: &TxContext<'_>,
        tx: &Transaction,
        state: &mut State<'_, '_>,
    ) -> Result<TxOutput, String> {
        const TRANSFER_GAS: u64 = 21_000;
        let Some(to) = tx.to else {
            return Err("transfer-only engine cannot deploy contracts".into());
        };
        if !tx.input.is_empty() {
            return Err("transfer-only engine cannot run bytecode".into());
        }
        let base_fee = ctx.header.base_fee_per_gas.unwrap_or(0) as u128;
        let gas_price = match tx.tx_type {
            TxType::Eip1559 => tx
                .max_fee_per_gas
                .min(base_fee + tx.max_priority_fee_per_gas.unwrap_or(0)),
            _ => tx.max_fee_per_gas,
        };
        let err = |e: &str| e.to_string();
        let nonce = state.get_nonce(&ctx.sender).map_err(|e| err(&e.to_string()))?;
        if tx.nonce != nonce {
            return Err(format!("nonce mismatch: tx {} account {nonce}", tx.nonce));
        }
        let cost = tx.value + U256::from(gas_price) * U256::from(TRANSFER_GAS);
        let balance = state
            .get_balance(&ctx.sender)
            .map_err(|e| err(&e.to_string()))?;
        if balance < cost {
            return Err("insufficient balance".into());
        }
        state
            .subtract_balance(&ctx.sender, cost)
            .map_err(|e| err(&e.to_string()))?;
        state
            .set_nonce(&ctx.sender, nonce + 1)
            .map_err(|e| err(&e.to_string()))?;
        state
            .add_balance(&to, tx.value)
            .map_err(|e| err(&e.to_string()))?;
        let tip = U256::from(gas_price.saturating_sub(base_fee))
            * U256::from(TRANSFER_GAS);
        state
            .add_balance(&ctx.header.beneficiary, tip)
            .map_err(|e| err(&e.to_string()))?;

        Ok(TxOutput {
            receipt: Receipt {
                tx_type: tx.tx_type,
                status: true,
                cumulative_gas_used: TRANSFER_GAS,
                logs: Vec::new(),
            },
            call_frames: vec![CallFrame {
                kind: 0,
                from: ctx.sender,
                to,
                value: tx.value,
                gas: tx.gas_limit,
                gas_used: TRANSFER_GAS,
                input: Default::default(),
                output: Default::default(),
                success: true,
                depth: 0,
            }],
        })
    }
}

fn run(args: &Args) -> DbResult<runloop::RunStats> {
    let kind = ChainKind::from_name(&args.chain).ok_or_else(|| DbError::Validation {
        kind: format!("unknown chain {}", args.chain),
    })?;
    let chain = kind.spec();

    if let Some(n) = args.nthreads {
        let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
    }
    if let Some(cpu) = args.sq_thread_cpu.or(args.ro_sq_thread_cpu) {
        info!(target: "triedb::node", cpu, "cpu pinning delegated to the service manager");
    }

    let mut config = DbConfig {
        paths: args.db.clone(),
        capacity: args.db_size_gib << 30,
        compaction: !args.no_compaction,
        ..Default::default()
    };
    if let Some(nfibers) = args.nfibers {
        config.io.read_buffers = nfibers.max(1);
    }
    let mode = if args.db.iter().any(|p| p.exists()) {
        OpenMode::OpenExisting
    } else {
        OpenMode::Truncate
    };
    let db = Db::open(config, mode)?;

    if let Some(snapshot_dir) = &args.snapshot {
        if db.get_latest_finalized_version().is_none() {
            let mut tdb = TrieDb::new(db.clone());
            triedb::snapshot::load(&mut tdb, snapshot_dir, 0)?;
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    // SIGINT handling and the statesync socket share a small runtime on a
    // side thread; the runloop itself stays synchronous.
    let runtime_stop = stop.clone();
    let statesync = args.statesync.clone();
    let statesync_db = db.clone();
    std::thread::Builder::new()
        .name("triedb-signals".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .expect("build signal runtime");
            runtime.block_on(async move {
                if let Some(path) = statesync {
                    tokio::spawn(async move {
                        if let Err(err) =
                            triedb::statesync::serve(path, statesync_db).await
                        {
                            error!(target: "triedb::node", %err, "statesync server exited");
                        }
                    });
                }
                let _ = tokio::signal::ctrl_c().await;
                runtime_stop.store(true, Ordering::Relaxed);
            });
        })
        .expect("spawn signal thread");

    let archive = BlockDb::new(&args.block_db);
    let engine = TransferEngine;
    let stats = runloop::run_ethereum(
        chain.as_ref(),
        &archive,
        &db,
        &engine,
        args.nblocks,
        args.trace_calls,
        &stop,
    )?;

    if let Some(dir) = &args.dump_snapshot {
        let tdb = TrieDb::new(db.clone());
        triedb::snapshot::dump(&tdb, dir)?;
    }
    Ok(stats)
}

fn main() {
    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&args) {
        Ok(stats) => {
            info!(
                target: "triedb::node",
                blocks = stats.blocks,
                txs = stats.txs,
                "runloop finished"
            );
        }
        Err(err) => {
            error!(target: "triedb::node", %err, "runloop failed");
            std::process::exit(1);
        }
    }
}
