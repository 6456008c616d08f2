//! Core ledger functionality
//!
//! Transactions, the Merkle engine, the block model and its proof-of-work
//! predicate, the pure chain rules, and the shared persistent chain handle.

pub mod block;
pub mod blockchain;
pub mod chain;
pub mod merkle;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;

pub use block::{Block, BlockBody, BlockHeader, BodySource, GENESIS_PAYLOAD};
pub use blockchain::Blockchain;
pub use chain::{Chain, ChainParams, ChainStats, ChainValidity, PendingBlock};
pub use merkle::{merkle_root, MerkleProof, MerkleTree, ProofStep, Side};
pub use monetary::{DEFAULT_SUPPLY_CAP, INITIAL_BLOCK_REWARD, SATOSHIS_PER_COIN};
pub use proof_of_work::{ProofOfWork, SearchOutcome, MAX_DIFFICULTY};
pub use transaction::{Coinbase, RawData, Transaction, Transfer, TxSignature};
