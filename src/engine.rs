//! The ledger engine: one owned instance per node.
//!
//! Ties the chain, mempool, mining scheduler and peer table together and
//! exposes the operations an API layer calls. Nothing here is global, so tests
//! can run several engines side by side.

use crate::config::Config;
use crate::core::{
    Block, Blockchain, BodySource, ChainStats, ChainValidity, MerkleProof, MerkleTree, Transaction,
};
use crate::error::{BlockchainError, Result};
use crate::mining::{JobId, MiningScheduler, MiningStatus, SchedulerSettings};
use crate::network::{
    check_address, reconcile, KeepReason, PeerHealth, PeerServer, PeerTable, PeerTransport,
    Reconciliation, TcpTransport,
};
use crate::storage::{import_snapshot, open_store, ChainStore, MemoryPool, PeerRecord, StoreStats};
use crate::utils::{current_timestamp, Hash256};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// What a sync with one peer did to the local chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Replaced { length: usize },
    Kept(KeepReason),
}

pub struct Engine {
    config: Config,
    blockchain: Blockchain,
    mempool: Arc<MemoryPool>,
    scheduler: MiningScheduler,
    peers: Arc<PeerTable>,
    transport: Arc<dyn PeerTransport>,
}

impl Engine {
    /// Open the node's store under `config.node_data_dir()` and talk to peers
    /// over TCP
    pub fn open(config: Config) -> Result<Engine> {
        config.check()?;
        let store = open_store(&config.node_data_dir())?;
        let transport = Arc::new(TcpTransport::new(Duration::from_millis(
            config.peer_timeout_ms,
        )));
        Engine::open_with(config, store, transport)
    }

    pub fn open_with(
        config: Config,
        store: Arc<dyn ChainStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Engine> {
        config.check()?;
        let peers = PeerTable::from_records(store.load_peers()?);
        let blockchain = Blockchain::open(store, config.chain_params())?;
        let scheduler = MiningScheduler::new(SchedulerSettings {
            progress_interval: config.progress_interval.max(1),
            retention: Duration::from_secs(config.job_retention_secs),
            randomize_nonce_start: config.randomize_nonce_start,
        });
        info!(
            "Engine ready: {} blocks, {} known peers, {:?} store",
            blockchain.len()?,
            peers.len(),
            blockchain.store().backend()
        );
        Ok(Engine {
            config,
            blockchain,
            mempool: Arc::new(MemoryPool::new()),
            scheduler,
            peers: Arc::new(peers),
            transport,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn mempool(&self) -> &MemoryPool {
        &self.mempool
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Queue a transaction for the next block
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256> {
        let id = tx.id();
        if self
            .blockchain
            .view(|chain| chain.contains_transaction(&id))?
        {
            return Err(BlockchainError::DuplicateTransaction(id.to_hex()));
        }
        self.mempool.add(tx)
    }

    /// Build a candidate on the current tip from the mempool and mine it in the
    /// background. Fails with `MinerBusy` while another job is in flight.
    ///
    /// Under a supply cap, transactions whose fees no longer fit are skipped
    /// and stay pending; the rest of the pool is still mined.
    pub fn start_mining(&self, miner: &str) -> Result<JobId> {
        if let Some(active) = self.scheduler.active() {
            return Err(BlockchainError::MinerBusy(active.to_string()));
        }

        let candidates = self.mempool.all();
        let (index, parent, block_reward, remaining, committed) =
            self.blockchain.view(|chain| {
                let committed: Vec<Hash256> = candidates
                    .iter()
                    .map(Transaction::id)
                    .filter(|id| chain.contains_transaction(id))
                    .collect();
                (
                    chain.len() as u64,
                    chain.tip_hash().unwrap_or(Hash256::ZERO),
                    chain.params().block_reward,
                    chain.remaining_supply(),
                    committed,
                )
            })?;
        if !committed.is_empty() {
            // Lost a race with a commit; never offer these again
            self.mempool.remove(&committed);
        }

        let (selected, fees) = fit_fees(
            candidates
                .into_iter()
                .filter(|tx| !committed.contains(&tx.id())),
            self.config.max_transactions_per_block,
            remaining,
        );
        let reward = match remaining {
            Some(remaining) => block_reward.min(remaining - fees),
            None => block_reward,
        };

        let coinbase = self
            .mempool
            .build_coinbase(miner, reward, &selected, index)?;
        let ids: Vec<Hash256> = selected.iter().map(Transaction::id).collect();
        let mut body = Vec::with_capacity(selected.len() + 1);
        body.push(coinbase);
        body.extend(selected);

        let candidate = Block::candidate(
            index,
            parent,
            BodySource::Structured(body),
            self.config.difficulty,
        )?;

        let blockchain = self.blockchain.clone();
        let mempool = self.mempool.clone();
        self.scheduler.submit(
            candidate,
            Box::new(move |block| {
                let hash = blockchain.append_on(block, parent)?;
                mempool.remove(&ids);
                Ok(hash)
            }),
        )
    }

    pub fn mining_status(&self, id: &JobId) -> Result<MiningStatus> {
        self.scheduler.status(id)
    }

    pub fn cancel_mining(&self, id: &JobId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Block until the job finishes or `timeout` passes
    pub fn wait_for_job(&self, id: &JobId, timeout: Duration) -> Result<MiningStatus> {
        self.scheduler.wait(id, timeout)
    }

    pub fn mining_jobs(&self) -> Vec<MiningStatus> {
        self.scheduler.jobs()
    }

    pub fn get_chain(&self) -> Result<Vec<Block>> {
        self.blockchain.blocks()
    }

    pub fn get_block(&self, index: u64) -> Result<Block> {
        self.blockchain.block(index)
    }

    /// Merkle inclusion proof for a committed transaction: (block index, proof)
    pub fn prove_transaction(&self, tx_id: &Hash256) -> Result<(u64, MerkleProof)> {
        self.blockchain
            .view(|chain| {
                let (index, position) = chain.find_transaction(tx_id)?;
                let proof = chain.block(index)?.merkle_proof(position)?;
                Some((index, proof))
            })?
            .ok_or_else(|| BlockchainError::NotFound(format!("transaction {tx_id}")))
    }

    /// Check `proof` against the Merkle root committed in block `block_index`
    pub fn verify_proof(
        &self,
        tx_digest: &Hash256,
        proof: &MerkleProof,
        block_index: u64,
    ) -> Result<bool> {
        let block = self.blockchain.block(block_index)?;
        Ok(MerkleTree::verify(
            tx_digest,
            proof,
            &block.header().merkle_root,
        ))
    }

    pub fn chain_validity(&self) -> Result<ChainValidity> {
        self.blockchain.validate()
    }

    pub fn balance(&self, account: &str) -> Result<i128> {
        self.blockchain.view(|chain| chain.balance(account))
    }

    pub fn stats(&self) -> Result<ChainStats> {
        self.blockchain.stats()
    }

    pub fn store_stats(&self) -> Result<StoreStats> {
        self.blockchain.store().stats()
    }

    /// Pretty JSON of every stored block
    pub fn snapshot(&self) -> Result<String> {
        self.blockchain.store().snapshot()
    }

    /// Adopt a JSON snapshot under the same rule as a peer chain
    pub fn import_snapshot(&self, json: &str) -> Result<bool> {
        let replaced = self.blockchain.replace(import_snapshot(json)?)?;
        if replaced {
            self.purge_committed()?;
        }
        Ok(replaced)
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.list()
    }

    /// Remember a peer across restarts; false if it was already known
    pub fn add_peer(&self, address: &str) -> Result<bool> {
        let added = self.peers.add(address)?;
        if added {
            self.save_peers()?;
        }
        Ok(added)
    }

    fn save_peers(&self) -> Result<()> {
        self.blockchain.store().save_peers(&self.peers.list())
    }

    /// Fetch `address`'s chain and adopt it if it is longer and valid.
    ///
    /// The fetch happens without any chain lock held; only the final swap
    /// takes the write lock. A mining job racing the swap fails with
    /// `StaleParent`.
    pub fn sync_from_peer(&self, address: &str) -> Result<SyncOutcome> {
        check_address(address)?;
        if self.peers.add(address)? {
            self.save_peers()?;
        }

        let remote = match self.transport.fetch_chain(address) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("Could not fetch chain from {address}: {e}");
                self.peers.mark_unreachable(address);
                self.save_peers()?;
                return Err(e);
            }
        };
        let remote_height = (remote.len() as u64).saturating_sub(1);

        let local = self.blockchain.snapshot()?;
        let outcome = match reconcile(&local, remote) {
            Reconciliation::Replace(chain) => {
                let length = chain.len();
                if self.blockchain.replace_with(chain)? {
                    self.purge_committed()?;
                    SyncOutcome::Replaced { length }
                } else {
                    // Local grew while the remote chain was being checked
                    SyncOutcome::Kept(KeepReason::NotLonger {
                        local: self.blockchain.len()?,
                        remote: length,
                    })
                }
            }
            Reconciliation::Keep { reason } => SyncOutcome::Kept(reason),
        };

        self.peers.record_health(
            address,
            &PeerHealth {
                reachable: true,
                tip_height: Some(remote_height),
            },
            current_timestamp()?,
        );
        self.save_peers()?;
        info!("Sync with {address}: {outcome:?}");
        Ok(outcome)
    }

    /// Health-check every known peer, then sync from the reachable ones,
    /// most promising first
    pub fn sync_all(&self) -> Result<Vec<(String, Result<SyncOutcome>)>> {
        let now = current_timestamp()?;
        for peer in self.peers.list() {
            let health = self.transport.health_check(&peer.address);
            self.peers.record_health(&peer.address, &health, now);
        }
        self.save_peers()?;

        let mut results = Vec::new();
        for address in self.peers.prioritized() {
            let reachable = self
                .peers
                .get(&address)
                .map(|record| record.reachable)
                .unwrap_or(false);
            if !reachable {
                warn!("Skipping unreachable peer {address}");
                continue;
            }
            let outcome = self.sync_from_peer(&address);
            results.push((address, outcome));
        }
        Ok(results)
    }

    /// Answer peer requests on `config.node_address` until the process exits
    pub fn serve(&self) -> Result<()> {
        let server = PeerServer::bind(
            &self.config.node_address,
            self.blockchain.clone(),
            Duration::from_millis(self.config.peer_timeout_ms),
        )?;
        server.run()
    }

    /// Drop pool entries that the current chain already contains
    fn purge_committed(&self) -> Result<()> {
        let pending: Vec<Hash256> = self.mempool.all().iter().map(Transaction::id).collect();
        let committed: Vec<Hash256> = self.blockchain.view(|chain| {
            pending
                .into_iter()
                .filter(|id| chain.contains_transaction(id))
                .collect()
        })?;
        if !committed.is_empty() {
            info!(
                "Removed {} transactions now on chain from mempool",
                committed.len()
            );
            self.mempool.remove(&committed);
        }
        Ok(())
    }
}

/// Take transactions in selection order, skipping any whose fee would push
/// the total past `budget`. Returns the picks and their summed fees.
fn fit_fees(
    candidates: impl IntoIterator<Item = Transaction>,
    max_count: usize,
    budget: Option<u64>,
) -> (Vec<Transaction>, u64) {
    let mut selected = Vec::new();
    let mut fees: u64 = 0;
    for tx in candidates {
        if selected.len() >= max_count {
            break;
        }
        let total = fees.saturating_add(tx.fee());
        if budget.is_some_and(|budget| total > budget) {
            continue;
        }
        fees = total;
        selected.push(tx);
    }
    (selected, fees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monetary::conversions::coins_to_satoshis;
    use crate::core::Chain;
    use crate::mining::JobStatus;
    use crate::testnet::test_utils::{mined_chain, next_block, temp_store, test_config, test_engine};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(30);

    /// In-process transport serving canned chains
    #[derive(Default)]
    struct FakeTransport {
        chains: Mutex<HashMap<String, Vec<Block>>>,
    }

    impl FakeTransport {
        fn serve(&self, peer: &str, blocks: Vec<Block>) {
            self.chains.lock().unwrap().insert(peer.to_string(), blocks);
        }
    }

    impl PeerTransport for FakeTransport {
        fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
            self.chains
                .lock()
                .unwrap()
                .get(peer)
                .cloned()
                .ok_or_else(|| BlockchainError::PeerUnreachable(peer.to_string()))
        }

        fn health_check(&self, peer: &str) -> PeerHealth {
            match self.chains.lock().unwrap().get(peer) {
                Some(blocks) => PeerHealth {
                    reachable: true,
                    tip_height: Some(blocks.len() as u64 - 1),
                },
                None => PeerHealth::unreachable(),
            }
        }
    }

    fn engine_with_fake() -> (tempfile::TempDir, Engine, Arc<FakeTransport>) {
        let (dir, store) = temp_store();
        let transport = Arc::new(FakeTransport::default());
        let engine =
            Engine::open_with(test_config(dir.path()), store, transport.clone()).unwrap();
        (dir, engine, transport)
    }

    #[test]
    fn test_mine_transfer_end_to_end() {
        let (_dir, engine) = test_engine();
        let tx = Transaction::transfer(
            "alice",
            "bob",
            coins_to_satoshis(10.0),
            coins_to_satoshis(0.1),
        )
        .unwrap();
        let tx_id = engine.submit_transaction(tx).unwrap();

        let job = engine.start_mining("miner").unwrap();
        let status = engine.wait_for_job(&job, WAIT).unwrap();
        assert_eq!(status.status, JobStatus::Succeeded);

        let chain = engine.get_chain().unwrap();
        assert_eq!(chain.len(), 2);
        let txs = chain[1].transactions();
        assert_eq!(txs.len(), 2);
        assert!(txs[0].is_coinbase());
        assert_eq!(txs[1].id(), tx_id);
        assert!(engine.mempool().is_empty());

        assert_eq!(engine.balance("bob").unwrap(), 1_000_000_000);
        assert_eq!(
            engine.balance("miner").unwrap(),
            i128::from(engine.config().block_reward + coins_to_satoshis(0.1))
        );

        let (index, proof) = engine.prove_transaction(&tx_id).unwrap();
        assert_eq!(index, 1);
        assert!(engine.verify_proof(&tx_id, &proof, 1).unwrap());
        assert!(!engine.verify_proof(&Hash256::ZERO, &proof, 1).unwrap());
    }

    #[test]
    fn test_committed_transaction_cannot_be_resubmitted() {
        let (_dir, engine) = test_engine();
        let tx = Transaction::transfer("alice", "bob", 5, 1).unwrap();
        engine.submit_transaction(tx.clone()).unwrap();
        assert!(matches!(
            engine.submit_transaction(tx.clone()),
            Err(BlockchainError::DuplicateTransaction(_))
        ));

        let job = engine.start_mining("miner").unwrap();
        engine.wait_for_job(&job, WAIT).unwrap();
        assert!(matches!(
            engine.submit_transaction(tx),
            Err(BlockchainError::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn test_committed_transaction_back_in_pool_is_dropped() {
        let (_dir, engine) = test_engine();
        let tx = Transaction::transfer_at("alice", "bob", 5, 1, 10).unwrap();
        let id = engine.submit_transaction(tx.clone()).unwrap();
        let job = engine.start_mining("miner").unwrap();
        engine.wait_for_job(&job, WAIT).unwrap();

        // Re-added straight to the pool, as a submit racing the commit would
        engine.mempool().add(tx).unwrap();
        let job = engine.start_mining("miner").unwrap();
        let status = engine.wait_for_job(&job, WAIT).unwrap();
        assert_eq!(status.status, JobStatus::Succeeded);

        assert!(engine.mempool().is_empty());
        assert_eq!(engine.get_block(2).unwrap().transactions().len(), 1);
        assert_eq!(engine.prove_transaction(&id).unwrap().0, 1);
        assert_eq!(engine.balance("alice").unwrap(), -6);
    }

    #[test]
    fn test_second_job_is_refused_while_busy() {
        let (dir, store) = temp_store();
        let mut config = test_config(dir.path());
        config.difficulty = 64;
        let engine = Engine::open_with(config, store, Arc::new(FakeTransport::default())).unwrap();

        let job = engine.start_mining("miner").unwrap();
        assert!(matches!(
            engine.start_mining("miner"),
            Err(BlockchainError::MinerBusy(_))
        ));
        assert!(engine.cancel_mining(&job));
        let status = engine.wait_for_job(&job, WAIT).unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);
        assert_eq!(engine.get_chain().unwrap().len(), 1);
    }

    #[test]
    fn test_supply_cap_clips_reward() {
        let (dir, store) = temp_store();
        let mut config = test_config(dir.path());
        config.supply_cap = Some(config.block_reward + 30);
        let engine = Engine::open_with(config, store, Arc::new(FakeTransport::default())).unwrap();

        for _ in 0..2 {
            let job = engine.start_mining("miner").unwrap();
            let status = engine.wait_for_job(&job, WAIT).unwrap();
            assert_eq!(status.status, JobStatus::Succeeded);
        }
        let stats = engine.stats().unwrap();
        assert_eq!(stats.total_supply, engine.config().block_reward + 30);
        assert!(engine.chain_validity().unwrap().is_valid);
    }

    #[test]
    fn test_fees_over_the_cap_stay_pending() {
        let (dir, store) = temp_store();
        let mut config = test_config(dir.path());
        config.supply_cap = Some(config.block_reward);
        let engine = Engine::open_with(config, store, Arc::new(FakeTransport::default())).unwrap();

        let job = engine.start_mining("miner").unwrap();
        engine.wait_for_job(&job, WAIT).unwrap();
        assert_eq!(engine.blockchain().view(Chain::remaining_supply).unwrap(), Some(0));

        let paying = Transaction::transfer_at("alice", "bob", 5, 1, 10).unwrap();
        let free = Transaction::transfer_at("carol", "dave", 5, 0, 10).unwrap();
        let paying_id = engine.submit_transaction(paying).unwrap();
        let free_id = engine.submit_transaction(free).unwrap();

        let job = engine.start_mining("miner").unwrap();
        let status = engine.wait_for_job(&job, WAIT).unwrap();
        assert_eq!(status.status, JobStatus::Succeeded);

        let tip = engine.get_block(2).unwrap();
        let ids: Vec<Hash256> = tip.transactions().iter().map(Transaction::id).collect();
        assert!(ids.contains(&free_id));
        assert!(!ids.contains(&paying_id));
        assert_eq!(engine.mempool().len(), 1);
        assert!(engine.mempool().contains(&paying_id));
        assert_eq!(engine.stats().unwrap().total_supply, engine.config().block_reward);
    }

    #[test]
    fn test_fit_fees_skips_what_does_not_fit() {
        let txs: Vec<Transaction> = [5, 3, 2, 1]
            .iter()
            .enumerate()
            .map(|(i, fee)| Transaction::transfer_at("alice", "bob", 1, *fee, i as i64).unwrap())
            .collect();

        let (picked, fees) = fit_fees(txs.clone(), 10, Some(4));
        assert_eq!(fees, 4);
        assert_eq!(
            picked.iter().map(Transaction::fee).collect::<Vec<_>>(),
            vec![3, 1]
        );

        let (picked, fees) = fit_fees(txs, 2, None);
        assert_eq!((picked.len(), fees), (2, 8));
    }

    #[test]
    fn test_sync_adopts_longer_valid_chain() {
        let (_dir, engine, transport) = engine_with_fake();
        let remote = mined_chain(4);
        transport.serve("10.0.0.1:2001", remote.clone().into_blocks());

        let outcome = engine.sync_from_peer("10.0.0.1:2001").unwrap();
        assert_eq!(outcome, SyncOutcome::Replaced { length: 4 });
        assert_eq!(engine.stats().unwrap().tip_hash, remote.tip_hash().unwrap());

        let peer = engine.peers().get("10.0.0.1:2001").unwrap();
        assert!(peer.reachable);
        assert_eq!(peer.tip_height, Some(3));

        // Same chain again is a tie
        assert!(matches!(
            engine.sync_from_peer("10.0.0.1:2001").unwrap(),
            SyncOutcome::Kept(KeepReason::NotLonger { .. })
        ));
    }

    #[test]
    fn test_sync_refuses_invalid_chain() {
        let (_dir, engine, transport) = engine_with_fake();
        let mut blocks = mined_chain(4).into_blocks();
        blocks.swap(1, 2);
        transport.serve("10.0.0.1:2001", blocks);

        let outcome = engine.sync_from_peer("10.0.0.1:2001").unwrap();
        assert!(matches!(outcome, SyncOutcome::Kept(KeepReason::Invalid(_))));
        assert_eq!(engine.get_chain().unwrap().len(), 1);
    }

    #[test]
    fn test_unreachable_peer_is_marked() {
        let (_dir, engine, _transport) = engine_with_fake();
        let err = engine.sync_from_peer("10.0.0.9:2001").unwrap_err();
        assert!(matches!(err, BlockchainError::PeerUnreachable(_)));
        assert!(!engine.peers().get("10.0.0.9:2001").unwrap().reachable);
    }

    #[test]
    fn test_sync_all_skips_dead_peers_and_takes_best() {
        let (_dir, engine, transport) = engine_with_fake();
        engine.add_peer("10.0.0.1:2001").unwrap();
        engine.add_peer("10.0.0.2:2001").unwrap();
        engine.add_peer("10.0.0.3:2001").unwrap();
        transport.serve("10.0.0.1:2001", mined_chain(3).into_blocks());
        let best = mined_chain(5);
        transport.serve("10.0.0.2:2001", best.clone().into_blocks());

        let results = engine.sync_all().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "10.0.0.2:2001");
        assert_eq!(
            results[0].1.as_ref().unwrap(),
            &SyncOutcome::Replaced { length: 5 }
        );
        assert_eq!(engine.stats().unwrap().tip_hash, best.tip_hash().unwrap());
        assert!(!engine.peers().get("10.0.0.3:2001").unwrap().reachable);
    }

    #[test]
    fn test_peers_survive_restart() {
        let (dir, store) = temp_store();
        let transport = Arc::new(FakeTransport::default());
        {
            let engine =
                Engine::open_with(test_config(dir.path()), store.clone(), transport.clone())
                    .unwrap();
            assert!(engine.add_peer("10.0.0.1:2001").unwrap());
            assert!(!engine.add_peer("10.0.0.1:2001").unwrap());
        }
        let engine = Engine::open_with(test_config(dir.path()), store, transport).unwrap();
        assert_eq!(engine.list_peers().len(), 1);
    }

    #[test]
    fn test_replacement_purges_committed_transactions() {
        let (_dir, engine, transport) = engine_with_fake();
        let tx = Transaction::transfer_at("alice", "bob", 5, 1, 10).unwrap();
        engine.submit_transaction(tx.clone()).unwrap();

        let mut remote = mined_chain(1);
        let block = next_block(&remote, "other", vec![tx]);
        remote.push(block).unwrap();
        let block = next_block(&remote, "other", vec![]);
        remote.push(block).unwrap();
        transport.serve("10.0.0.1:2001", remote.into_blocks());

        engine.sync_from_peer("10.0.0.1:2001").unwrap();
        assert!(engine.mempool().is_empty());
    }
}
