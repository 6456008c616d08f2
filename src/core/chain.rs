// The in-memory ledger: an ordered list of committed blocks plus the aggregates
// (balances, supply, tip) derived from them. Everything here is pure; locking and
// persistence live in `Blockchain`.

use crate::core::{Block, ProofOfWork, Transaction, INITIAL_BLOCK_REWARD};
use crate::error::{BlockRejection, BlockchainError, Result};
use crate::utils::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Consensus parameters every block is checked against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    /// Maximum newly minted amount per block
    pub block_reward: u64,
    /// Cap on cumulative emission, `None` for unlimited
    pub supply_cap: Option<u64>,
    /// Lowest difficulty a non-genesis block may declare
    pub min_difficulty: u32,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            block_reward: INITIAL_BLOCK_REWARD,
            supply_cap: None,
            min_difficulty: 1,
        }
    }
}

/// What committing a block changes, computed during validation
#[derive(Debug, Clone, Default)]
struct BlockEffects {
    emission: u64,
    deltas: Vec<(String, i128)>,
    tx_ids: Vec<Hash256>,
}

/// A block that passed every rule against the current tip, ready to commit
#[derive(Debug, Clone)]
pub struct PendingBlock {
    block: Block,
    hash: Hash256,
    effects: BlockEffects,
}

impl PendingBlock {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Newly minted amount this block adds to the supply
    pub fn emission(&self) -> u64 {
        self.effects.emission
    }
}

/// Result of a full re-walk, as reported to API callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainValidity {
    pub is_valid: bool,
    pub first_invalid_index: Option<u64>,
}

impl From<std::result::Result<(), u64>> for ChainValidity {
    fn from(outcome: std::result::Result<(), u64>) -> Self {
        match outcome {
            Ok(()) => ChainValidity {
                is_valid: true,
                first_invalid_index: None,
            },
            Err(index) => ChainValidity {
                is_valid: false,
                first_invalid_index: Some(index),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStats {
    pub length: usize,
    pub tip_hash: Hash256,
    pub tip_difficulty: u32,
    pub total_supply: u64,
    pub transaction_count: usize,
}

#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,
    hashes: Vec<Hash256>,
    params: ChainParams,
    balances: HashMap<String, i128>,
    total_supply: u64,
    /// Ids of every committed transfer and coinbase
    tx_ids: HashSet<Hash256>,
}

impl Chain {
    /// A chain holding only the deterministic genesis block
    pub fn new(params: ChainParams) -> Chain {
        let mut chain = Chain::empty(params);
        let genesis = Block::genesis();
        let effects = BlockEffects::default();
        chain.apply(genesis, effects);
        chain
    }

    fn empty(params: ChainParams) -> Chain {
        Chain {
            blocks: Vec::new(),
            hashes: Vec::new(),
            params,
            balances: HashMap::new(),
            total_supply: 0,
            tx_ids: HashSet::new(),
        }
    }

    /// Replay `blocks` from genesis, checking every rule on the way.
    ///
    /// Fails with [`BlockchainError::InvalidBlock`] naming the first bad index.
    pub fn from_blocks(blocks: Vec<Block>, params: ChainParams) -> Result<Chain> {
        if blocks.is_empty() {
            return Err(BlockchainError::invalid_block(
                0,
                BlockRejection::Genesis("chain has no blocks".to_string()),
            ));
        }
        let mut chain = Chain::empty(params);
        for block in blocks {
            chain.push(block)?;
        }
        Ok(chain)
    }

    /// Validate `block` as the next block and commit it
    pub fn push(&mut self, block: Block) -> Result<Hash256> {
        let pending = self.prepare(block)?;
        Ok(self.commit(pending))
    }

    /// Run every rule against the current tip without changing anything
    pub fn prepare(&self, block: Block) -> Result<PendingBlock> {
        let effects = self.check_block_effects(&block)?;
        Ok(PendingBlock {
            hash: block.hash(),
            block,
            effects,
        })
    }

    /// Commit a block prepared against this exact tip
    pub fn commit(&mut self, pending: PendingBlock) -> Hash256 {
        let hash = pending.hash;
        self.apply(pending.block, pending.effects);
        hash
    }

    /// Validate `block` against the current tip without changing anything.
    ///
    /// Rules run in a fixed order: index, genesis identity, linkage, recorded
    /// hash, difficulty floor, proof-of-work, Merkle root, body shape, supply
    /// cap, transactions.
    pub fn check_block(&self, block: &Block) -> Result<()> {
        self.check_block_effects(block).map(|_| ())
    }

    fn check_block_effects(&self, block: &Block) -> Result<BlockEffects> {
        let header = block.header();
        // Rejections name the position the block was offered at
        let index = self.blocks.len() as u64;
        let reject = |reason| Err(BlockchainError::invalid_block(index, reason));

        if header.index != index {
            return reject(BlockRejection::IndexMismatch {
                expected: index,
                found: header.index,
            });
        }

        if index == 0 && block.hash() != Block::genesis().hash() {
            return reject(BlockRejection::Genesis(format!(
                "block 0 hashes to {}, not the shared genesis",
                block.hash()
            )));
        }

        let expected_parent = self.tip_hash().unwrap_or(Hash256::ZERO);
        if header.previous_hash != expected_parent {
            return reject(BlockRejection::PreviousHashMismatch);
        }

        match block.sealed_hash() {
            Some(recorded) if recorded == block.hash() => {}
            Some(_) => return reject(BlockRejection::HashMismatch),
            None => return reject(BlockRejection::Unsealed),
        }

        if index > 0 && header.difficulty < self.params.min_difficulty {
            return reject(BlockRejection::DifficultyTooLow {
                minimum: self.params.min_difficulty,
                found: header.difficulty,
            });
        }

        if !ProofOfWork::validate(header) {
            return reject(BlockRejection::InsufficientWork);
        }

        if !block.verify_merkle_root() {
            return reject(BlockRejection::MerkleRootMismatch);
        }

        let transactions = block.transactions();
        if transactions.is_empty() {
            return reject(BlockRejection::EmptyBody);
        }

        if block.body().is_raw_payload() {
            // Raw-data blocks mint nothing and move nothing
            return Ok(BlockEffects::default());
        }

        let coinbase = match &transactions[0] {
            Transaction::Coinbase(coinbase) => coinbase,
            _ => return reject(BlockRejection::MissingCoinbase),
        };
        if transactions[1..].iter().any(Transaction::is_coinbase) {
            return reject(BlockRejection::MisplacedCoinbase);
        }

        let remaining = self.remaining_supply();
        let requested = coinbase.reward.saturating_add(coinbase.fees);
        if let Some(remaining) = remaining {
            if requested > remaining {
                return Err(BlockchainError::SupplyCapExceeded {
                    requested,
                    remaining,
                });
            }
        }

        let mut deltas = Vec::with_capacity(transactions.len() * 2);
        let mut tx_ids = Vec::with_capacity(transactions.len());
        let mut seen = HashSet::with_capacity(transactions.len());
        let mut collected_fees: u64 = 0;
        for (position, tx) in transactions.iter().enumerate() {
            if let Err(err) = tx.validate() {
                return reject(BlockRejection::Transaction(format!(
                    "transaction {position}: {err}"
                )));
            }
            let id = tx.id();
            if self.tx_ids.contains(&id) {
                return reject(BlockRejection::DuplicateTransaction {
                    id,
                    committed: true,
                });
            }
            if !seen.insert(id) {
                return reject(BlockRejection::DuplicateTransaction {
                    id,
                    committed: false,
                });
            }
            tx_ids.push(id);
            match tx {
                Transaction::Transfer(t) => {
                    collected_fees = collected_fees.saturating_add(t.fee);
                    deltas.push((
                        t.sender.clone(),
                        -(i128::from(t.amount) + i128::from(t.fee)),
                    ));
                    deltas.push((t.recipient.clone(), i128::from(t.amount)));
                }
                Transaction::Coinbase(c) => {
                    deltas.push((c.recipient.clone(), i128::from(tx.amount())));
                    if c.height != index {
                        return reject(BlockRejection::CoinbaseAmount(format!(
                            "coinbase height {} in block {index}",
                            c.height
                        )));
                    }
                }
                Transaction::RawData(_) => {
                    return reject(BlockRejection::Transaction(format!(
                        "raw data at position {position} of a structured body"
                    )));
                }
            }
        }

        if coinbase.fees != collected_fees {
            return reject(BlockRejection::CoinbaseAmount(format!(
                "claims {} fees, block pays {collected_fees}",
                coinbase.fees
            )));
        }
        if coinbase.reward > self.params.block_reward {
            return reject(BlockRejection::CoinbaseAmount(format!(
                "reward {} above block reward {}",
                coinbase.reward, self.params.block_reward
            )));
        }

        Ok(BlockEffects {
            emission: coinbase.reward,
            deltas,
            tx_ids,
        })
    }

    fn apply(&mut self, block: Block, effects: BlockEffects) {
        for (account, delta) in effects.deltas {
            *self.balances.entry(account).or_insert(0) += delta;
        }
        self.total_supply = self.total_supply.saturating_add(effects.emission);
        self.tx_ids.extend(effects.tx_ids);
        self.hashes.push(block.hash());
        self.blocks.push(block);
    }

    pub fn validity(&self) -> ChainValidity {
        self.validate().into()
    }

    /// Full re-walk of every rule from genesis.
    ///
    /// Returns the index of the first block that fails.
    pub fn validate(&self) -> std::result::Result<(), u64> {
        match Chain::from_blocks(self.blocks.clone(), self.params.clone()) {
            Ok(_) => Ok(()),
            Err(BlockchainError::InvalidBlock { index, .. }) => Err(index),
            Err(BlockchainError::SupplyCapExceeded { .. }) => {
                Err(self.first_over_cap_index().unwrap_or(0))
            }
            Err(_) => Err(0),
        }
    }

    fn first_over_cap_index(&self) -> Option<u64> {
        let cap = self.params.supply_cap?;
        let mut minted: u64 = 0;
        for block in &self.blocks {
            if let Some(Transaction::Coinbase(c)) = block.transactions().first() {
                if c.reward.saturating_add(c.fees) > cap.saturating_sub(minted) {
                    return Some(block.index());
                }
                minted = minted.saturating_add(c.reward);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the tip block
    pub fn height(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.hashes.last().copied()
    }

    pub fn block(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    pub fn block_hash(&self, index: u64) -> Option<Hash256> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.hashes.get(i))
            .copied()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Net balance of `account`; negative when it has spent more than received
    pub fn balance(&self, account: &str) -> i128 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn total_supply(&self) -> u64 {
        self.total_supply
    }

    pub fn remaining_supply(&self) -> Option<u64> {
        self.params
            .supply_cap
            .map(|cap| cap.saturating_sub(self.total_supply))
    }

    /// Whether a transfer or coinbase with this id is already committed
    pub fn contains_transaction(&self, id: &Hash256) -> bool {
        self.tx_ids.contains(id)
    }

    /// Locate a committed transaction: (block index, position in block)
    pub fn find_transaction(&self, id: &Hash256) -> Option<(u64, usize)> {
        self.blocks.iter().find_map(|block| {
            block
                .transactions()
                .iter()
                .position(|tx| tx.id() == *id)
                .map(|position| (block.index(), position))
        })
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            length: self.len(),
            tip_hash: self.tip_hash().unwrap_or(Hash256::ZERO),
            tip_difficulty: self.tip().map(Block::difficulty).unwrap_or(0),
            total_supply: self.total_supply,
            transaction_count: self.blocks.iter().map(|b| b.transactions().len()).sum(),
        }
    }
}
