//! Test utilities for ledger testing

use crate::config::Config;
use crate::core::{
    Block, Blockchain, BodySource, Chain, ChainParams, ProofOfWork, SearchOutcome, Transaction,
};
use crate::engine::Engine;
use crate::error::{BlockchainError, Result};
use crate::network::{PeerHealth, PeerTransport};
use crate::storage::{ChainStore, SledStore};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

/// Difficulty of blocks built by [`next_block`]; a few attempts on average
pub const TEST_DIFFICULTY: u32 = 2;

/// Reward 50 base units, no cap, floor of 1
pub fn test_params() -> ChainParams {
    ChainParams {
        block_reward: 50,
        supply_cap: None,
        min_difficulty: 1,
    }
}

/// Seal `candidate` by brute force from nonce 0
pub fn mine(candidate: Block) -> Block {
    let pow = ProofOfWork::new(candidate.header());
    let cancel = AtomicBool::new(false);
    match pow.search(0, 1_000, &cancel, |_, _| {}) {
        SearchOutcome::Found { nonce, .. } => candidate.seal(nonce),
        other => panic!("test block could not be mined: {other:?}"),
    }
}

/// A mined block extending `chain`, paying the full reward plus fees to `miner`
pub fn next_block(chain: &Chain, miner: &str, transactions: Vec<Transaction>) -> Block {
    let index = chain.len() as u64;
    let fees = transactions.iter().map(Transaction::fee).sum();
    let coinbase =
        Transaction::coinbase(miner, chain.params().block_reward, fees, index).unwrap();
    let mut body = vec![coinbase];
    body.extend(transactions);
    let candidate = Block::candidate(
        index,
        chain.tip_hash().unwrap(),
        BodySource::Structured(body),
        TEST_DIFFICULTY,
    )
    .unwrap();
    mine(candidate)
}

/// A valid chain of `len` blocks, genesis included
pub fn mined_chain(len: usize) -> Chain {
    let mut chain = Chain::new(test_params());
    while chain.len() < len {
        let block = next_block(&chain, "miner", vec![]);
        chain.push(block).unwrap();
    }
    chain
}

/// Append `count` empty mined blocks through the shared handle
pub fn extend_chain(blockchain: &Blockchain, count: usize) {
    for _ in 0..count {
        let block = blockchain
            .view(|chain| next_block(chain, "miner", vec![]))
            .unwrap();
        blockchain.append(block).unwrap();
    }
}

/// A sled store in a fresh temporary directory; keep the `TempDir` alive
pub fn temp_store() -> (TempDir, Arc<dyn ChainStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::open(&dir.path().join("sled")).unwrap();
    (dir, Arc::new(store))
}

/// Configuration matching [`test_params`], with cheap mining and short timeouts
pub fn test_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        node_address: "127.0.0.1:0".to_string(),
        difficulty: TEST_DIFFICULTY,
        min_difficulty: 1,
        block_reward: 50,
        supply_cap: None,
        max_transactions_per_block: 100,
        progress_interval: 100,
        job_retention_secs: 60,
        peer_timeout_ms: 500,
        randomize_nonce_start: false,
    }
}

/// Transport for engines that never talk to peers
pub struct OfflineTransport;

impl PeerTransport for OfflineTransport {
    fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
        Err(BlockchainError::PeerUnreachable(peer.to_string()))
    }

    fn health_check(&self, _peer: &str) -> PeerHealth {
        PeerHealth::unreachable()
    }
}

/// An engine over a temporary sled store with no peers
pub fn test_engine() -> (TempDir, Engine) {
    let (dir, store) = temp_store();
    let engine = Engine::open_with(test_config(dir.path()), store, Arc::new(OfflineTransport))
        .unwrap();
    (dir, engine)
}
