//! Ledger integration tests
//!
//! Drive the engine through its public API the way a node does: submit,
//! mine, persist, restart and reconcile with peers.

use ledger_forge::core::monetary::conversions::coins_to_satoshis;
use ledger_forge::core::{BodySource, SearchOutcome};
use ledger_forge::mining::SchedulerSettings;
use ledger_forge::storage::FileStore;
use ledger_forge::{
    Block, BlockchainError, Blockchain, Chain, ChainParams, ChainStore, Config, Engine,
    FailureReason, JobStatus, MemoryPool, MiningScheduler, PeerHealth, PeerServer, PeerTransport,
    ProofOfWork, SledStore, SyncOutcome, TcpTransport, Transaction,
};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_secs(30);

struct Offline;

impl PeerTransport for Offline {
    fn fetch_chain(&self, peer: &str) -> ledger_forge::Result<Vec<Block>> {
        Err(BlockchainError::PeerUnreachable(peer.to_string()))
    }

    fn health_check(&self, _peer: &str) -> PeerHealth {
        PeerHealth::unreachable()
    }
}

fn config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        difficulty: 4,
        block_reward: coins_to_satoshis(50.0),
        progress_interval: 100,
        peer_timeout_ms: 2_000,
        randomize_nonce_start: false,
        ..Config::default()
    }
}

fn params() -> ChainParams {
    config(Path::new(".")).chain_params()
}

fn sled_store(dir: &TempDir) -> Arc<dyn ChainStore> {
    Arc::new(SledStore::open(&dir.path().join("sled")).unwrap())
}

fn offline_engine(dir: &TempDir, store: Arc<dyn ChainStore>) -> Engine {
    Engine::open_with(config(dir.path()), store, Arc::new(Offline)).unwrap()
}

fn mine(candidate: Block) -> Block {
    let pow = ProofOfWork::new(candidate.header());
    match pow.search(0, 1_000, &AtomicBool::new(false), |_, _| {}) {
        SearchOutcome::Found { nonce, .. } => candidate.seal(nonce),
        other => panic!("could not mine test block: {other:?}"),
    }
}

fn empty_block(chain: &Chain, miner: &str) -> Block {
    let index = chain.len() as u64;
    let coinbase = Transaction::coinbase(miner, chain.params().block_reward, 0, index).unwrap();
    mine(
        Block::candidate(
            index,
            chain.tip_hash().unwrap(),
            BodySource::Structured(vec![coinbase]),
            4,
        )
        .unwrap(),
    )
}

fn mine_blocks(engine: &Engine, count: usize) {
    for _ in 0..count {
        let job = engine.start_mining("miner").unwrap();
        let status = engine.wait_for_job(&job, WAIT).unwrap();
        assert_eq!(status.status, JobStatus::Succeeded);
    }
}

#[test]
fn test_transfer_is_mined_end_to_end() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    assert_eq!(engine.get_chain().unwrap().len(), 1);

    let tx = Transaction::transfer(
        "alice",
        "bob",
        coins_to_satoshis(10.0),
        coins_to_satoshis(0.1),
    )
    .unwrap();
    let tx_id = engine.submit_transaction(tx).unwrap();

    let job = engine.start_mining("miner").unwrap();
    let status = loop {
        let status = engine.mining_status(&job).unwrap();
        if status.status.is_terminal() {
            break status;
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(status.status, JobStatus::Succeeded);

    let chain = engine.get_chain().unwrap();
    assert_eq!(chain.len(), 2);
    let txs = chain[1].transactions();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs.iter().filter(|tx| tx.is_coinbase()).count(), 1);
    assert_eq!(txs[1].id(), tx_id);
    assert!(engine.mempool().is_empty());
    assert_eq!(status.block_hash, Some(chain[1].hash()));
    assert!(ProofOfWork::validate(chain[1].header()));
}

#[test]
fn test_chain_survives_restart() {
    let dir = tempdir().unwrap();
    let store = sled_store(&dir);
    let before = {
        let engine = offline_engine(&dir, store.clone());
        mine_blocks(&engine, 3);
        engine.get_chain().unwrap()
    };

    let engine = offline_engine(&dir, store);
    let after = engine.get_chain().unwrap();
    assert_eq!(after.len(), 4);
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.hash(), b.hash());
    }
    assert!(engine.chain_validity().unwrap().is_valid);
}

#[test]
fn test_tampered_header_fails_at_its_index() {
    let dir = tempdir().unwrap();
    let engine = offline_engine(&dir, sled_store(&dir));
    mine_blocks(&engine, 4);
    let blocks = engine.get_chain().unwrap();
    assert!(Chain::from_blocks(blocks.clone(), params()).is_ok());

    for index in 1..blocks.len() - 1 {
        let mut tampered = blocks.clone();
        let (mut header, body, hash) = tampered[index].clone().into_parts();
        header.timestamp += 1;
        tampered[index] = Block::from_parts(header, body, hash);

        match Chain::from_blocks(tampered, params()) {
            Err(BlockchainError::InvalidBlock { index: bad, .. }) => {
                assert_eq!(bad, index as u64)
            }
            other => panic!("tampering block {index} gave {other:?}"),
        }
    }
}

#[test]
fn test_tampered_store_is_reported_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.bin");
    let mut chain = Chain::new(params());
    for _ in 0..2 {
        let block = empty_block(&chain, "miner");
        chain.push(block).unwrap();
    }

    let mut blocks = chain.blocks().to_vec();
    let (mut header, body, hash) = blocks[1].clone().into_parts();
    header.nonce = header.nonce.wrapping_add(1);
    blocks[1] = Block::from_parts(header, body, hash);
    let store = FileStore::open(&path).unwrap();
    let state = ledger_forge::storage::StateRecord::for_chain(&chain, true);
    store.replace_all(&blocks, &state).unwrap();

    let store: Arc<dyn ChainStore> = Arc::new(FileStore::open(&path).unwrap());
    assert!(matches!(
        Blockchain::open(store.clone(), params()),
        Err(BlockchainError::CorruptStore(_))
    ));

    // Reset is the way back
    let fresh = Blockchain::reset(store.clone(), params()).unwrap();
    assert_eq!(fresh.len().unwrap(), 1);
    assert_eq!(Blockchain::open(store, params()).unwrap().len().unwrap(), 1);
}

#[test]
fn test_failed_append_is_all_or_nothing() {
    let dir = tempdir().unwrap();
    let blockchain = Blockchain::open(sled_store(&dir), params()).unwrap();
    let good = blockchain.view(|c| empty_block(c, "miner")).unwrap();
    let tip = blockchain.tip_hash().unwrap();

    // Wrong parent
    let (mut header, body, _) = good.clone().into_parts();
    header.previous_hash = ledger_forge::Hash256::ZERO;
    let orphan = mine(Block::from_parts(header, body, None));
    assert!(matches!(
        blockchain.append(orphan),
        Err(BlockchainError::InvalidBlock { index: 1, .. })
    ));
    assert_eq!(blockchain.len().unwrap(), 1);
    assert_eq!(blockchain.tip_hash().unwrap(), tip);

    blockchain.append(good).unwrap();
    assert_eq!(blockchain.len().unwrap(), 2);
}

#[test]
fn test_supply_cap_refuses_over_minting_block() {
    let capped = ChainParams {
        supply_cap: Some(10),
        ..params()
    };
    let mut chain = Chain::new(capped);
    let block = empty_block(&chain, "miner");
    assert!(matches!(
        chain.push(block),
        Err(BlockchainError::SupplyCapExceeded {
            remaining: 10,
            ..
        })
    ));
    assert_eq!(chain.len(), 1);
}

#[test]
fn test_cancelled_job_never_succeeds() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.difficulty = 80;
    let engine = Engine::open_with(cfg, sled_store(&dir), Arc::new(Offline)).unwrap();

    let job = engine.start_mining("miner").unwrap();
    assert!(matches!(
        engine.start_mining("miner"),
        Err(BlockchainError::MinerBusy(_))
    ));
    assert!(engine.cancel_mining(&job));
    assert!(!engine.cancel_mining(&job));

    let status = engine.wait_for_job(&job, WAIT).unwrap();
    assert_eq!(status.status, JobStatus::Cancelled);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(
        engine.mining_status(&job).unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(engine.get_chain().unwrap().len(), 1);
}

#[test]
fn test_miner_racing_a_new_tip_reports_stale_parent() {
    let dir = tempdir().unwrap();
    let blockchain = Blockchain::open(sled_store(&dir), params()).unwrap();
    let parent = blockchain.tip_hash().unwrap();
    let candidate = blockchain
        .view(|chain| {
            let coinbase = Transaction::coinbase("slow", chain.params().block_reward, 0, 1)
                .unwrap();
            Block::candidate(1, parent, BodySource::Structured(vec![coinbase]), 4).unwrap()
        })
        .unwrap();

    // Someone else extends the chain first
    let winner = blockchain.view(|c| empty_block(c, "fast")).unwrap();
    blockchain.append(winner).unwrap();

    let scheduler = MiningScheduler::new(SchedulerSettings {
        randomize_nonce_start: false,
        ..SchedulerSettings::default()
    });
    let handle = blockchain.clone();
    let job = scheduler
        .submit(
            candidate,
            Box::new(move |block| handle.append_on(block, parent)),
        )
        .unwrap();
    let status = scheduler.wait(&job, WAIT).unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.failure, Some(FailureReason::StaleParent));
    assert_eq!(blockchain.len().unwrap(), 2);
}

#[test]
fn test_mempool_selection_is_deterministic() {
    let pool = MemoryPool::new();
    for (sender, fee, ts) in [("a", 5, 3), ("b", 9, 2), ("c", 5, 1), ("d", 1, 0), ("e", 9, 2)] {
        pool.add(Transaction::transfer_at(sender, "z", 10, fee, ts).unwrap())
            .unwrap();
    }

    let first = pool.select_for_block(4);
    assert_eq!(first, pool.select_for_block(4));
    let fees: Vec<u64> = first.iter().map(Transaction::fee).collect();
    assert_eq!(fees, vec![9, 9, 5, 5]);
    assert_eq!(first[2].sender(), Some("c"));
}

#[test]
fn test_peer_sync_over_tcp() {
    let dir_a = tempdir().unwrap();
    let node_a = offline_engine(&dir_a, sled_store(&dir_a));
    mine_blocks(&node_a, 2);

    let server = PeerServer::bind(
        "127.0.0.1:0",
        node_a.blockchain().clone(),
        Duration::from_secs(5),
    )
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    server.spawn();

    let dir_b = tempdir().unwrap();
    let node_b = Engine::open_with(
        config(dir_b.path()),
        sled_store(&dir_b),
        Arc::new(TcpTransport::new(Duration::from_secs(5))),
    )
    .unwrap();

    let outcome = node_b.sync_from_peer(&addr).unwrap();
    assert_eq!(outcome, SyncOutcome::Replaced { length: 3 });
    assert_eq!(node_b.get_chain().unwrap(), node_a.get_chain().unwrap());

    let peer = &node_b.list_peers()[0];
    assert_eq!(peer.address, addr);
    assert!(peer.reachable);
    assert_eq!(peer.tip_height, Some(2));

    // Nothing new the second time
    assert!(matches!(
        node_b.sync_from_peer(&addr).unwrap(),
        SyncOutcome::Kept(_)
    ));
}

#[test]
fn test_snapshot_export_and_import() {
    let dir_a = tempdir().unwrap();
    let node_a = offline_engine(&dir_a, sled_store(&dir_a));
    mine_blocks(&node_a, 2);
    let json = node_a.snapshot().unwrap();

    let dir_b = tempdir().unwrap();
    let node_b = offline_engine(&dir_b, sled_store(&dir_b));
    assert!(node_b.import_snapshot(&json).unwrap());
    assert_eq!(node_b.get_chain().unwrap(), node_a.get_chain().unwrap());
    assert!(!node_b.import_snapshot(&json).unwrap());
}
