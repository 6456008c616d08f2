use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::utils::Hash256;
use log::{debug, error};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

/// Pending transactions keyed by content id ( K -> tx id, V => Transaction ).
///
/// Entries leave the pool only through [`remove`](MemoryPool::remove) (after a
/// commit) or [`clear`](MemoryPool::clear); nothing is evicted behind the
/// caller's back.
pub struct MemoryPool {
    inner: RwLock<HashMap<Hash256, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Selection order: highest fee first, then earliest timestamp, then id
fn selection_order(a: &(Hash256, Transaction), b: &(Hash256, Transaction)) -> Ordering {
    b.1.fee()
        .cmp(&a.1.fee())
        .then_with(|| a.1.timestamp().cmp(&b.1.timestamp()))
        .then_with(|| a.0.cmp(&b.0))
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a user transaction.
    ///
    /// Fails with `InvalidTransaction` for coinbase/raw entries or broken
    /// invariants, and `DuplicateTransaction` if the same content is already
    /// pending.
    pub fn add(&self, tx: Transaction) -> Result<Hash256> {
        if tx.is_coinbase() || tx.is_raw_data() {
            return Err(BlockchainError::InvalidTransaction(
                "only transfers can be submitted".to_string(),
            ));
        }
        tx.validate()?;

        let id = tx.id();
        let mut pool = self.inner.write().map_err(|_| {
            error!("Failed to acquire write lock on memory pool");
            BlockchainError::Persistence("memory pool lock poisoned".to_string())
        })?;
        if pool.contains_key(&id) {
            return Err(BlockchainError::DuplicateTransaction(id.to_hex()));
        }
        pool.insert(id, tx);
        debug!("Transaction {} added to mempool ({} pending)", id.short(), pool.len());
        Ok(id)
    }

    pub fn get(&self, id: &Hash256) -> Option<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.get(id).cloned(),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                None
            }
        }
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.contains_key(id),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    /// Drop every id in `ids`; unknown ids are ignored
    pub fn remove(&self, ids: &[Hash256]) {
        match self.inner.write() {
            Ok(mut pool) => {
                for id in ids {
                    pool.remove(id);
                }
            }
            Err(_) => {
                error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.len(),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_fees(&self) -> u64 {
        match self.inner.read() {
            Ok(pool) => pool
                .values()
                .fold(0u64, |acc, tx| acc.saturating_add(tx.fee())),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    /// Every pending transaction, in selection order
    pub fn all(&self) -> Vec<Transaction> {
        self.select_for_block(usize::MAX)
    }

    /// Greedy pick of up to `max_count` transactions by descending fee.
    ///
    /// Ties are broken by timestamp and then id, so two nodes with the same
    /// pool build byte-identical bodies.
    pub fn select_for_block(&self, max_count: usize) -> Vec<Transaction> {
        let mut entries: Vec<(Hash256, Transaction)> = match self.inner.read() {
            Ok(pool) => pool.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            Err(_) => {
                error!("Failed to acquire read lock on memory pool");
                return Vec::new();
            }
        };
        entries.sort_by(selection_order);
        entries
            .into_iter()
            .take(max_count)
            .map(|(_, tx)| tx)
            .collect()
    }

    /// Coinbase paying `reward` plus the fees of `selected` to `miner`
    pub fn build_coinbase(
        &self,
        miner: &str,
        reward: u64,
        selected: &[Transaction],
        height: u64,
    ) -> Result<Transaction> {
        let fees = selected.iter().try_fold(0u64, |acc, tx| {
            acc.checked_add(tx.fee()).ok_or_else(|| {
                BlockchainError::InvalidTransaction("selected fees overflow".to_string())
            })
        })?;
        Transaction::coinbase(miner, reward, fees, height)
    }

    pub fn clear(&self) {
        match self.inner.write() {
            Ok(mut pool) => pool.clear(),
            Err(_) => {
                error!("Failed to acquire write lock on memory pool");
            }
        }
    }
}
