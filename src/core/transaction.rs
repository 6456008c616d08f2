// Transactions are the only thing that moves value on the ledger.
// The model is account-style: a transfer debits `sender` and credits `recipient`,
// and each block opens with a coinbase that pays the miner.

use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, ecdsa_p256_sha256_sign_verify, sha256_digest};
use crate::utils::{CanonicalWriter, Hash256};
use crate::wallet::{address_from_public_key, Signer};
use serde::{Deserialize, Serialize};

const TRANSFER_TAG: u8 = 1;
const COINBASE_TAG: u8 = 2;
const RAW_DATA_TAG: u8 = 3;

/// Public key plus signature over [`Transaction::signing_bytes`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TxSignature {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transfer {
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub fee: u64,
    pub timestamp: i64,
    pub signature: Option<TxSignature>,
}

/// Miner reward. There is no sender; `reward` is newly minted and `fees` are
/// the fees collected from the other transactions in the same block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Coinbase {
    pub recipient: String,
    pub reward: u64,
    pub fees: u64,
    /// Height of the block this coinbase belongs to, keeps ids unique per block
    pub height: u64,
    pub timestamp: i64,
}

/// Pseudo-transaction wrapping an opaque payload for raw-data blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RawData {
    pub payload: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transaction {
    Transfer(Transfer),
    Coinbase(Coinbase),
    RawData(RawData),
}

impl Transaction {
    /// Create a transfer stamped with the current time and check its invariants
    pub fn transfer(sender: &str, recipient: &str, amount: u64, fee: u64) -> Result<Transaction> {
        Self::transfer_at(sender, recipient, amount, fee, current_timestamp()?)
    }

    pub fn transfer_at(
        sender: &str,
        recipient: &str,
        amount: u64,
        fee: u64,
        timestamp: i64,
    ) -> Result<Transaction> {
        let tx = Transaction::Transfer(Transfer {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp,
            signature: None,
        });
        tx.validate()?;
        Ok(tx)
    }

    pub fn coinbase(recipient: &str, reward: u64, fees: u64, height: u64) -> Result<Transaction> {
        Ok(Transaction::Coinbase(Coinbase {
            recipient: recipient.to_string(),
            reward,
            fees,
            height,
            timestamp: current_timestamp()?,
        }))
    }

    pub fn raw_data(payload: &str, timestamp: i64) -> Transaction {
        Transaction::RawData(RawData {
            payload: payload.to_string(),
            timestamp,
        })
    }

    /// Bytes covered by the content identifier and by signatures
    pub fn signing_bytes(&self) -> Vec<u8> {
        match self {
            Transaction::Transfer(t) => CanonicalWriter::new(b"LFTX1")
                .u8(TRANSFER_TAG)
                .str(&t.sender)
                .str(&t.recipient)
                .u64(t.amount)
                .u64(t.fee)
                .i64(t.timestamp)
                .finish(),
            Transaction::Coinbase(c) => CanonicalWriter::new(b"LFTX1")
                .u8(COINBASE_TAG)
                .str(&c.recipient)
                .u64(c.reward)
                .u64(c.fees)
                .u64(c.height)
                .i64(c.timestamp)
                .finish(),
            Transaction::RawData(r) => CanonicalWriter::new(b"LFTX1")
                .u8(RAW_DATA_TAG)
                .str(&r.payload)
                .i64(r.timestamp)
                .finish(),
        }
    }

    /// Content identifier: SHA-256 of the canonical fields, signature excluded
    pub fn id(&self) -> Hash256 {
        sha256_digest(&self.signing_bytes())
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    pub fn is_raw_data(&self) -> bool {
        matches!(self, Transaction::RawData(_))
    }

    /// Value credited to the recipient
    pub fn amount(&self) -> u64 {
        match self {
            Transaction::Transfer(t) => t.amount,
            Transaction::Coinbase(c) => c.reward.saturating_add(c.fees),
            Transaction::RawData(_) => 0,
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            Transaction::Transfer(t) => t.fee,
            _ => 0,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Transaction::Transfer(t) => t.timestamp,
            Transaction::Coinbase(c) => c.timestamp,
            Transaction::RawData(r) => r.timestamp,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            Transaction::Transfer(t) => Some(t.sender.as_str()),
            _ => None,
        }
    }

    pub fn recipient(&self) -> Option<&str> {
        match self {
            Transaction::Transfer(t) => Some(t.recipient.as_str()),
            Transaction::Coinbase(c) => Some(c.recipient.as_str()),
            Transaction::RawData(_) => None,
        }
    }

    /// Attach a signature produced by `signer` over the signing bytes
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        let message = self.signing_bytes();
        match self {
            Transaction::Transfer(t) => {
                let signature = signer.sign(&message)?;
                t.signature = Some(TxSignature {
                    public_key: signer.public_key().to_vec(),
                    signature,
                });
                Ok(())
            }
            _ => Err(BlockchainError::InvalidTransaction(
                "only transfers carry signatures".to_string(),
            )),
        }
    }

    /// Check the stand-alone invariants of this transaction.
    ///
    /// Transfers need a positive amount and two distinct, non-empty parties; a
    /// signature, when present, must come from the sender's key and verify. Coinbase and raw-data entries only
    /// need a recipient / payload.
    pub fn validate(&self) -> Result<()> {
        match self {
            Transaction::Transfer(t) => {
                if t.amount == 0 {
                    return Err(BlockchainError::InvalidTransaction(
                        "amount must be positive".to_string(),
                    ));
                }
                if t.sender.trim().is_empty() || t.recipient.trim().is_empty() {
                    return Err(BlockchainError::InvalidTransaction(
                        "sender and recipient are required".to_string(),
                    ));
                }
                if t.sender == t.recipient {
                    return Err(BlockchainError::InvalidTransaction(format!(
                        "sender and recipient are both {}",
                        t.sender
                    )));
                }
                if t.amount.checked_add(t.fee).is_none() {
                    return Err(BlockchainError::InvalidTransaction(
                        "amount plus fee overflows".to_string(),
                    ));
                }
                if let Some(sig) = &t.signature {
                    if address_from_public_key(&sig.public_key) != t.sender {
                        return Err(BlockchainError::InvalidTransaction(format!(
                            "signing key does not belong to {}",
                            t.sender
                        )));
                    }
                    if !ecdsa_p256_sha256_sign_verify(
                        &sig.public_key,
                        &sig.signature,
                        &self.signing_bytes(),
                    ) {
                        return Err(BlockchainError::InvalidTransaction(
                            "signature does not verify".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            Transaction::Coinbase(c) => {
                if c.recipient.trim().is_empty() {
                    return Err(BlockchainError::InvalidTransaction(
                        "coinbase needs a recipient".to_string(),
                    ));
                }
                if c.reward.checked_add(c.fees).is_none() {
                    return Err(BlockchainError::InvalidTransaction(
                        "coinbase amount overflows".to_string(),
                    ));
                }
                Ok(())
            }
            Transaction::RawData(_) => Ok(()),
        }
    }
}
