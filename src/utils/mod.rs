//! Utility functions and helpers
//!
//! Hashing, canonical encoding, key primitives and (de)serialization used
//! throughout the ledger.

pub mod canonical;
pub mod crypto;
pub mod serialization;

pub use canonical::CanonicalWriter;
pub use crypto::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest, sha256_pair,
    Hash256, DIGEST_LEN,
};

pub use serialization::{deserialize, from_json, serialize, to_json_pretty};
