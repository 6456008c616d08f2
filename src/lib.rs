//! # Ledger Forge - a proof-of-work ledger engine
//!
//! An append-only ledger of blocks linked by SHA-256 hashes, sealed by
//! proof-of-work, persisted in sled and reconciled with peers by the
//! longest-valid-chain rule.
//!
//! ## How the code is organized
//! - `utils/`: hashing, canonical byte encoding, bincode/JSON helpers
//! - `core/`: transactions, Merkle trees, blocks, proof-of-work and chain rules
//! - `storage/`: the mempool and the durable chain store
//! - `mining/`: background mining jobs that can be polled and cancelled
//! - `network/`: peer table, transport and chain reconciliation
//! - `wallet/`: the signing capability and addresses
//! - `config/`: layered configuration
//! - `engine.rs`: one owned node, the entry point for every operation
//! - `cli/`: command-line parsing for the binary
//!
//! ## Where to start reading
//! 1. `engine.rs` for the operations a caller has
//! 2. `core/chain.rs` for what makes a block acceptable
//! 3. `mining/scheduler.rs` for how a block gets sealed and committed
//! 4. `storage/persistence.rs` for what survives a restart

pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod mining;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{
    Block, BlockHeader, Blockchain, BodySource, Chain, ChainParams, ChainValidity, MerkleProof,
    MerkleTree, ProofOfWork, Transaction,
};
pub use engine::{Engine, SyncOutcome};
pub use error::{BlockRejection, BlockchainError, Result};
pub use mining::{FailureReason, JobId, JobStatus, MiningScheduler, MiningStatus};
pub use network::{PeerHealth, PeerServer, PeerTable, PeerTransport, TcpTransport};
pub use storage::{open_store, ChainStore, FileStore, MemoryPool, SledStore};
pub use utils::{current_timestamp, sha256_digest, Hash256};
pub use wallet::{validate_address, Signer, Wallet};
