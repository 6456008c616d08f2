use crate::core::merkle::{MerkleProof, MerkleTree};
use crate::core::{ProofOfWork, Transaction};
use crate::error::Result;
use crate::utils::{current_timestamp, sha256_digest, CanonicalWriter, Hash256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload carried by the genesis block
pub const GENESIS_PAYLOAD: &str = "Genesis Block";

/// Compact, hash-linked identity of a block.
///
/// The block hash is a pure function of these six fields; the body only
/// enters through `merkle_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockHeader {
    pub index: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub nonce: u64,
    pub difficulty: u32,
}

impl BlockHeader {
    /// Canonical encoding of every field except the nonce.
    ///
    /// The nonce is always appended last, which lets the miner hash this
    /// prefix once and only feed the eight nonce bytes per attempt.
    pub fn preimage_without_nonce(&self) -> Vec<u8> {
        CanonicalWriter::new(b"LFHDR1")
            .u64(self.index)
            .i64(self.timestamp)
            .digest(&self.previous_hash)
            .digest(&self.merkle_root)
            .u32(self.difficulty)
            .finish()
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = self.preimage_without_nonce();
        bytes.extend_from_slice(&self.nonce.to_be_bytes());
        bytes
    }

    pub fn hash(&self) -> Hash256 {
        sha256_digest(&self.canonical_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// How a block body is constructed.
///
/// `RawPayload` keeps old "block of data" call sites working: the payload is
/// wrapped as a single [`Transaction::RawData`] so everything downstream only
/// ever sees a transaction list.
#[derive(Debug, Clone)]
pub enum BodySource {
    Structured(Vec<Transaction>),
    RawPayload(String),
}

impl BlockBody {
    pub fn from_source(source: BodySource, timestamp: i64) -> BlockBody {
        let transactions = match source {
            BodySource::Structured(transactions) => transactions,
            BodySource::RawPayload(payload) => vec![Transaction::raw_data(&payload, timestamp)],
        };
        BlockBody {
            transactions,
            metadata: None,
        }
    }

    pub fn transaction_ids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::id).collect()
    }

    pub fn merkle_root(&self) -> Hash256 {
        crate::core::merkle::merkle_root(&self.transaction_ids())
    }

    pub fn is_raw_payload(&self) -> bool {
        matches!(self.transactions.as_slice(), [tx] if tx.is_raw_data())
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee()))
    }
}

/// A block moves from candidate (no recorded hash) to sealed (nonce found and
/// hash recorded) to committed (accepted by the chain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    header: BlockHeader,
    body: BlockBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<Hash256>,
}

impl Block {
    /// Build an unsealed candidate (nonce 0) on top of `previous_hash`
    pub fn candidate(
        index: u64,
        previous_hash: Hash256,
        source: BodySource,
        difficulty: u32,
    ) -> Result<Block> {
        Ok(Self::candidate_at(
            index,
            previous_hash,
            source,
            difficulty,
            current_timestamp()?,
        ))
    }

    pub fn candidate_at(
        index: u64,
        previous_hash: Hash256,
        source: BodySource,
        difficulty: u32,
        timestamp: i64,
    ) -> Block {
        let body = BlockBody::from_source(source, timestamp);
        let header = BlockHeader {
            index,
            timestamp,
            previous_hash,
            merkle_root: body.merkle_root(),
            nonce: 0,
            difficulty,
        };
        Block {
            header,
            body,
            hash: None,
        }
    }

    /// The one genesis every peer derives: fixed timestamp, zero parent,
    /// difficulty 0, so its hash is the same everywhere.
    pub fn genesis() -> Block {
        Self::candidate_at(
            0,
            Hash256::ZERO,
            BodySource::RawPayload(GENESIS_PAYLOAD.to_string()),
            0,
            0,
        )
        .seal(0)
    }

    /// Reassemble a block from stored parts without recomputing anything
    pub fn from_parts(header: BlockHeader, body: BlockBody, hash: Option<Hash256>) -> Block {
        Block { header, body, hash }
    }

    pub fn into_parts(self) -> (BlockHeader, BlockBody, Option<Hash256>) {
        (self.header, self.body, self.hash)
    }

    /// Fix the nonce and record the resulting header hash
    pub fn seal(mut self, nonce: u64) -> Block {
        self.header.nonce = nonce;
        self.hash = Some(self.header.hash());
        self
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn body(&self) -> &BlockBody {
        &self.body
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.body.transactions
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn previous_hash(&self) -> Hash256 {
        self.header.previous_hash
    }

    pub fn difficulty(&self) -> u32 {
        self.header.difficulty
    }

    /// Identity hash, always recomputed from the header
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Hash recorded when the block was sealed
    pub fn sealed_hash(&self) -> Option<Hash256> {
        self.hash
    }

    /// True when a hash was recorded, still matches the header, and meets
    /// the declared difficulty
    pub fn is_sealed(&self) -> bool {
        self.hash == Some(self.header.hash()) && ProofOfWork::validate(&self.header)
    }

    pub fn verify_merkle_root(&self) -> bool {
        self.body.merkle_root() == self.header.merkle_root
    }

    pub fn merkle_tree(&self) -> MerkleTree {
        MerkleTree::new(&self.body.transaction_ids())
    }

    /// Inclusion proof for the transaction at `tx_index`
    pub fn merkle_proof(&self, tx_index: usize) -> Option<MerkleProof> {
        self.merkle_tree().prove(tx_index)
    }

    /// Check a proof against this block's committed root
    pub fn verify_merkle_proof(&self, tx_id: &Hash256, proof: &MerkleProof) -> bool {
        MerkleTree::verify(tx_id, proof, &self.header.merkle_root)
    }
}
