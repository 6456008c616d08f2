// Shared, persistent handle over the chain.
// One RwLock guards the in-memory chain; every mutation holds the write lock across
// validate + persist + commit, so readers never see a half-applied block and a
// failed write never leaves memory ahead of disk.

use crate::core::{Block, Chain, ChainParams, ChainStats, ChainValidity};
use crate::error::{BlockchainError, Result};
use crate::storage::{ChainStore, StateRecord};
use crate::utils::Hash256;
use log::{info, warn};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone)]
pub struct Blockchain {
    inner: Arc<RwLock<Chain>>,
    store: Arc<dyn ChainStore>,
}

impl Blockchain {
    /// Load the chain from `store`, creating and saving genesis for an empty store.
    ///
    /// A store that exists but does not replay into a valid chain fails with
    /// [`BlockchainError::CorruptStore`].
    pub fn open(store: Arc<dyn ChainStore>, params: ChainParams) -> Result<Blockchain> {
        let chain = match store.load(params.clone())? {
            Some(chain) => {
                info!(
                    "Loaded chain of {} blocks, tip {}",
                    chain.len(),
                    chain.tip_hash().unwrap_or(Hash256::ZERO).short()
                );
                chain
            }
            None => {
                let chain = Chain::new(params);
                store.save(&chain)?;
                info!("Created new chain with genesis block");
                chain
            }
        };
        Ok(Blockchain {
            inner: Arc::new(RwLock::new(chain)),
            store,
        })
    }

    /// Throw away whatever `store` holds and start again from genesis
    pub fn reset(store: Arc<dyn ChainStore>, params: ChainParams) -> Result<Blockchain> {
        let chain = Chain::new(params);
        store.save(&chain)?;
        warn!("Chain store reset to genesis");
        Ok(Blockchain {
            inner: Arc::new(RwLock::new(chain)),
            store,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Chain>> {
        self.inner
            .read()
            .map_err(|_| BlockchainError::Persistence("chain lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Chain>> {
        self.inner
            .write()
            .map_err(|_| BlockchainError::Persistence("chain lock poisoned".to_string()))
    }

    /// Validate, persist and commit `block`. All or nothing.
    pub fn append(&self, block: Block) -> Result<Hash256> {
        let mut chain = self.write()?;
        self.append_locked(&mut chain, block)
    }

    /// Like [`append`](Self::append), but only if the tip is still `expected_parent`.
    ///
    /// This is how a miner commits: if the chain moved while it was searching
    /// (another block or a peer replacement), it gets `StaleParent` back.
    pub fn append_on(&self, block: Block, expected_parent: Hash256) -> Result<Hash256> {
        let mut chain = self.write()?;
        let tip = chain.tip_hash().unwrap_or(Hash256::ZERO);
        if tip != expected_parent {
            return Err(BlockchainError::StaleParent {
                expected_parent: expected_parent.to_hex(),
                tip: tip.to_hex(),
            });
        }
        self.append_locked(&mut chain, block)
    }

    fn append_locked(&self, chain: &mut Chain, block: Block) -> Result<Hash256> {
        let index = block.index();
        let pending = chain.prepare(block).map_err(|e| {
            warn!("Rejected block {index}: {e}");
            e
        })?;

        let state = StateRecord {
            tip_hash: pending.hash(),
            total_supply: chain.total_supply().saturating_add(pending.emission()),
            block_count: chain.len() as u64 + 1,
            last_validated: true,
        };
        // Disk first: if this fails the in-memory chain is untouched
        self.store.append_block(pending.block(), &state)?;
        let hash = chain.commit(pending);

        info!(
            "Committed block {index} ({}), chain length {}",
            hash.short(),
            chain.len()
        );
        Ok(hash)
    }

    /// Longest-valid-chain rule.
    ///
    /// `blocks` is replayed from genesis outside the lock; the swap happens only
    /// if the result is valid and strictly longer than the current chain.
    /// Returns whether the chain was replaced.
    pub fn replace(&self, blocks: Vec<Block>) -> Result<bool> {
        let params = self.params()?;
        match Chain::from_blocks(blocks, params) {
            Ok(candidate) => self.replace_with(candidate),
            Err(e) => {
                warn!("Candidate chain refused: {e}");
                Ok(false)
            }
        }
    }

    /// Swap in an already validated chain if it is strictly longer
    pub fn replace_with(&self, candidate: Chain) -> Result<bool> {
        let mut chain = self.write()?;
        if candidate.len() <= chain.len() {
            return Ok(false);
        }
        self.store.save(&candidate)?;
        info!(
            "Replaced chain of {} blocks with {} blocks",
            chain.len(),
            candidate.len()
        );
        *chain = candidate;
        Ok(true)
    }

    /// Consistent copy of the whole chain
    pub fn snapshot(&self) -> Result<Chain> {
        Ok(self.read()?.clone())
    }

    /// Run `f` against the chain under the read lock. Keep it short.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Chain) -> T,
    {
        let chain = self.read()?;
        Ok(f(&chain))
    }

    pub fn blocks(&self) -> Result<Vec<Block>> {
        self.view(|chain| chain.blocks().to_vec())
    }

    pub fn block(&self, index: u64) -> Result<Block> {
        self.view(|chain| chain.block(index).cloned())?
            .ok_or_else(|| BlockchainError::NotFound(format!("block {index}")))
    }

    pub fn tip_hash(&self) -> Result<Hash256> {
        self.view(|chain| chain.tip_hash().unwrap_or(Hash256::ZERO))
    }

    pub fn len(&self) -> Result<usize> {
        self.view(Chain::len)
    }

    pub fn height(&self) -> Result<u64> {
        self.view(Chain::height)
    }

    pub fn params(&self) -> Result<ChainParams> {
        self.view(|chain| chain.params().clone())
    }

    pub fn stats(&self) -> Result<ChainStats> {
        self.view(Chain::stats)
    }

    /// Full re-walk from genesis, run on a snapshot so writers are not held up
    pub fn validate(&self) -> Result<ChainValidity> {
        let snapshot = self.snapshot()?;
        Ok(snapshot.validity())
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }
}
