//! Signing capability and addresses
//!
//! Transactions are signed through the [`Signer`] trait; [`Wallet`] is the
//! ECDSA P-256 implementation with base58 check-summed addresses.

#[allow(clippy::module_inception)]
pub mod wallet;

pub use wallet::{
    address_from_public_key, hash_pub_key, validate_address, Signer, Wallet,
    ADDRESS_CHECK_SUM_LEN,
};
