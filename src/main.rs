// Entry point for the ledger-forge command-line node
use clap::Parser;
use ledger_forge::core::monetary::conversions::{format_balance, format_satoshis, parse_coins};
use ledger_forge::storage::open_store;
use ledger_forge::{
    Block, Blockchain, Command, Config, Engine, Hash256, JobStatus, Opt, SyncOutcome, Transaction,
};
use log::{error, info, LevelFilter};
use std::fs;
use std::process;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    // Info by default; RUST_LOG still wins
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(opt.config.as_deref())?;

    match opt.command {
        Command::Init { reset } => {
            let blockchain = if reset {
                let store = open_store(&config.node_data_dir())?;
                Blockchain::reset(store, config.chain_params())?
            } else {
                Engine::open(config.clone())?.blockchain().clone()
            };
            println!(
                "Chain ready in {} ({} blocks, tip {})",
                config.node_data_dir().display(),
                blockchain.len()?,
                blockchain.tip_hash()?
            );
        }
        Command::Send {
            from,
            to,
            amount,
            fee,
            mine,
        } => {
            // The pool lives in this process, so an unmined transfer would be lost on exit
            let Some(miner) = mine else {
                return Err("the mempool is not persisted; pass --mine <MINER> to include the transfer in a block".into());
            };
            let tx = Transaction::transfer(&from, &to, parse_coins(&amount)?, parse_coins(&fee)?)?;
            let engine = Engine::open(config)?;
            let id = engine.submit_transaction(tx)?;
            println!("Submitted transaction {id}");
            mine_block(&engine, &miner, Duration::from_secs(600))?;
        }
        Command::Mine { miner, timeout } => {
            let engine = Engine::open(config)?;
            mine_block(&engine, &miner, Duration::from_secs(timeout))?;
        }
        Command::Printchain => {
            let engine = Engine::open(config)?;
            for block in engine.get_chain()? {
                print_block(&block);
            }
        }
        Command::Block { index } => {
            let engine = Engine::open(config)?;
            let block = engine.get_block(index)?;
            println!("{}", serde_json::to_string_pretty(&block)?);
        }
        Command::Validate => {
            let engine = Engine::open(config)?;
            let validity = engine.chain_validity()?;
            match validity.first_invalid_index {
                None => println!("Chain is valid"),
                Some(index) => println!("Chain is INVALID from block {index}"),
            }
        }
        Command::Prove { txid } => {
            let engine = Engine::open(config)?;
            let id = Hash256::from_str(&txid)?;
            let (index, proof) = engine.prove_transaction(&id)?;
            println!("Transaction {id} is in block {index}");
            println!("{}", serde_json::to_string_pretty(&proof)?);
            println!("Verified: {}", engine.verify_proof(&id, &proof, index)?);
        }
        Command::Balance { account } => {
            let engine = Engine::open(config)?;
            let balance = engine.balance(&account)?;
            println!("Balance of {account}: {}", format_balance(balance));
        }
        Command::Stats => {
            let engine = Engine::open(config)?;
            println!("{}", serde_json::to_string_pretty(&engine.stats()?)?);
            println!("{}", serde_json::to_string_pretty(&engine.store_stats()?)?);
        }
        Command::Peers => {
            let engine = Engine::open(config)?;
            for peer in engine.list_peers() {
                println!(
                    "{} reachable={} tip={} last_seen={}",
                    peer.address,
                    peer.reachable,
                    peer.tip_height.map_or("-".to_string(), |h| h.to_string()),
                    peer.last_seen.map_or("-".to_string(), |t| t.to_string())
                );
            }
        }
        Command::Addpeer { address } => {
            let engine = Engine::open(config)?;
            if engine.add_peer(&address)? {
                println!("Added peer {address}");
            } else {
                println!("Peer {address} already known");
            }
        }
        Command::Sync { address } => {
            let engine = Engine::open(config)?;
            let results = match address {
                Some(address) => vec![(address.clone(), engine.sync_from_peer(&address))],
                None => engine.sync_all()?,
            };
            if results.is_empty() {
                println!("No reachable peers");
            }
            for (peer, result) in results {
                match result {
                    Ok(SyncOutcome::Replaced { length }) => {
                        println!("{peer}: adopted chain of {length} blocks")
                    }
                    Ok(SyncOutcome::Kept(reason)) => println!("{peer}: kept local chain ({reason})"),
                    Err(e) => println!("{peer}: {e}"),
                }
            }
        }
        Command::Serve => {
            let engine = Engine::open(config)?;
            info!("Serving chain on {}", engine.config().node_address);
            engine.serve()?;
        }
        Command::Snapshot { import } => {
            let engine = Engine::open(config)?;
            match import {
                Some(path) => {
                    let json = fs::read_to_string(&path)?;
                    if engine.import_snapshot(&json)? {
                        println!("Adopted chain from {}", path.display());
                    } else {
                        println!("Kept local chain; snapshot was not longer and valid");
                    }
                }
                None => println!("{}", engine.snapshot()?),
            }
        }
        Command::Mempool => {
            let engine = Engine::open(config)?;
            let pending = engine.mempool().all();
            println!(
                "{} pending, {} in fees",
                pending.len(),
                format_satoshis(engine.mempool().total_fees())
            );
            for tx in pending {
                println!("- {} fee={}", tx.id(), tx.fee());
            }
        }
    }
    Ok(())
}

/// Start a job and report progress once a second until it finishes
fn mine_block(
    engine: &Engine,
    miner: &str,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = engine.start_mining(miner)?;
    println!("Mining job {job} started");
    let deadline = Instant::now() + timeout;

    loop {
        let status = engine.mining_status(&job)?;
        match status.status {
            JobStatus::Succeeded => {
                let hash = status.block_hash.unwrap_or(Hash256::ZERO);
                println!(
                    "Block {} mined: {hash} ({} hashes in {} ms)",
                    status.block_index, status.hashes_tried, status.elapsed_ms
                );
                return Ok(());
            }
            JobStatus::Failed => {
                let reason = status
                    .failure
                    .map_or("unknown".to_string(), |f| f.to_string());
                return Err(format!("mining failed: {reason}").into());
            }
            JobStatus::Cancelled => return Err("mining was cancelled".into()),
            JobStatus::Pending | JobStatus::Running => {}
        }

        if Instant::now() >= deadline {
            engine.cancel_mining(&job);
            return Err(format!("no block found within {} s", timeout.as_secs()).into());
        }
        println!(
            "  {} hashes, {:.0} H/s, ~{}",
            status.hashes_tried,
            status.hash_rate,
            status
                .estimated_remaining_secs
                .map_or("?".to_string(), |s| format!("{s:.0}s left"))
        );
        thread::sleep(Duration::from_secs(1));
    }
}

fn print_block(block: &Block) {
    let header = block.header();
    println!("Block {}", header.index);
    println!("  Hash:       {}", block.hash());
    println!("  Previous:   {}", header.previous_hash);
    println!("  Merkle:     {}", header.merkle_root);
    println!("  Timestamp:  {}", header.timestamp);
    println!("  Difficulty: {}  Nonce: {}", header.difficulty, header.nonce);
    for tx in block.transactions() {
        match tx {
            Transaction::Transfer(t) => println!(
                "  - {} {} -> {} amount={} fee={}",
                tx.id(),
                t.sender,
                t.recipient,
                t.amount,
                t.fee
            ),
            Transaction::Coinbase(c) => println!(
                "  - {} coinbase -> {} reward={} fees={}",
                tx.id(),
                c.recipient,
                c.reward,
                c.fees
            ),
            Transaction::RawData(r) => println!("  - {} data {:?}", tx.id(), r.payload),
        }
    }
    println!();
}
