//! Error handling for the ledger engine
//!
//! Every engine-boundary failure is one of these variants. Callers match on the
//! variant to decide whether to retry, correct their input, or give up.

use crate::utils::Hash256;
use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Why a block was refused by the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRejection {
    /// `header.index` does not continue the chain
    IndexMismatch { expected: u64, found: u64 },
    /// `header.previous_hash` is not the hash of the preceding header
    PreviousHashMismatch,
    /// Block was never sealed (no recorded hash)
    Unsealed,
    /// Recorded hash differs from the hash of the header
    HashMismatch,
    /// The header hash does not satisfy its declared difficulty
    InsufficientWork,
    /// The declared difficulty is below the network minimum
    DifficultyTooLow { minimum: u32, found: u32 },
    /// `header.merkle_root` does not commit to the body
    MerkleRootMismatch,
    /// The body has no transactions at all
    EmptyBody,
    /// Structured body without a coinbase at position 0
    MissingCoinbase,
    /// A coinbase appears somewhere other than position 0
    MisplacedCoinbase,
    /// Coinbase reward/fees do not match the block contents
    CoinbaseAmount(String),
    /// A transaction inside the block breaks its own invariants
    Transaction(String),
    /// A transaction id repeats inside the block or is already on chain
    DuplicateTransaction { id: Hash256, committed: bool },
    /// Block 0 is not the shared genesis block
    Genesis(String),
}

impl fmt::Display for BlockRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRejection::IndexMismatch { expected, found } => {
                write!(f, "index {found} does not follow chain (expected {expected})")
            }
            BlockRejection::PreviousHashMismatch => write!(f, "previous hash does not link to tip"),
            BlockRejection::Unsealed => write!(f, "block was never sealed"),
            BlockRejection::HashMismatch => write!(f, "recorded hash does not match header"),
            BlockRejection::InsufficientWork => write!(f, "hash does not meet difficulty target"),
            BlockRejection::DifficultyTooLow { minimum, found } => {
                write!(f, "difficulty {found} below network minimum {minimum}")
            }
            BlockRejection::MerkleRootMismatch => write!(f, "merkle root does not match body"),
            BlockRejection::EmptyBody => write!(f, "block body is empty"),
            BlockRejection::MissingCoinbase => write!(f, "first transaction is not a coinbase"),
            BlockRejection::MisplacedCoinbase => write!(f, "coinbase outside position 0"),
            BlockRejection::CoinbaseAmount(msg) => write!(f, "bad coinbase amount: {msg}"),
            BlockRejection::Transaction(msg) => write!(f, "invalid transaction: {msg}"),
            BlockRejection::DuplicateTransaction { id, committed: true } => {
                write!(f, "transaction {id} is already on chain")
            }
            BlockRejection::DuplicateTransaction { id, committed: false } => {
                write!(f, "transaction {id} appears twice in the block")
            }
            BlockRejection::Genesis(msg) => write!(f, "invalid genesis: {msg}"),
        }
    }
}

/// Comprehensive error types for ledger operations
#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Transaction breaks amount/fee/party invariants or carries a bad signature
    InvalidTransaction(String),
    /// Transaction content identifier already present in the mempool
    DuplicateTransaction(String),
    /// Block failed hash/link/PoW/merkle validation
    InvalidBlock { index: u64, reason: BlockRejection },
    /// Mined block no longer extends the tip it was built on
    StaleParent { expected_parent: String, tip: String },
    /// Coinbase emission would exceed the configured cap
    SupplyCapExceeded { requested: u64, remaining: u64 },
    /// A mining job is already running
    MinerBusy(String),
    /// Requested item (block, job, peer) does not exist
    NotFound(String),
    /// Durable store I/O failure
    Persistence(String),
    /// Durable store contents are corrupt or partially written
    CorruptStore(String),
    /// Peer could not be reached
    PeerUnreachable(String),
    /// Peer did not answer in time
    Timeout(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Configuration errors
    Config(String),
    /// Cryptographic operation errors
    Crypto(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {msg}"),
            BlockchainError::DuplicateTransaction(id) => {
                write!(f, "Duplicate transaction: {id}")
            }
            BlockchainError::InvalidBlock { index, reason } => {
                write!(f, "Invalid block {index}: {reason}")
            }
            BlockchainError::StaleParent {
                expected_parent,
                tip,
            } => write!(
                f,
                "Stale parent: block was built on {expected_parent} but tip is {tip}"
            ),
            BlockchainError::SupplyCapExceeded {
                requested,
                remaining,
            } => write!(
                f,
                "Supply cap exceeded: requested {requested}, remaining {remaining}"
            ),
            BlockchainError::MinerBusy(job) => write!(f, "Miner busy with job {job}"),
            BlockchainError::NotFound(what) => write!(f, "Not found: {what}"),
            BlockchainError::Persistence(msg) => write!(f, "Persistence error: {msg}"),
            BlockchainError::CorruptStore(msg) => write!(f, "Corrupt store: {msg}"),
            BlockchainError::PeerUnreachable(peer) => write!(f, "Peer unreachable: {peer}"),
            BlockchainError::Timeout(peer) => write!(f, "Timed out waiting for {peer}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl BlockchainError {
    pub fn invalid_block(index: u64, reason: BlockRejection) -> Self {
        BlockchainError::InvalidBlock { index, reason }
    }

    /// Recoverable errors are the ones a caller can fix by retrying or correcting input
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            BlockchainError::Persistence(_) | BlockchainError::CorruptStore(_)
        )
    }
}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => BlockchainError::CorruptStore(err.to_string()),
            other => BlockchainError::Persistence(other.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}
