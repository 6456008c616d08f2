use crate::error::{BlockchainError, Result};
use crate::utils::{
    base58_decode, base58_encode, ecdsa_p256_sha256_sign_digest, new_key_pair, ripemd160_digest,
    sha256_digest,
};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

const VERSION: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;

/// The signing capability transactions are signed through.
///
/// The ledger never looks inside a key; it only needs the public key to embed
/// and a signature over the canonical signing bytes.
pub trait Signer {
    fn public_key(&self) -> &[u8];

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Address derived from the public key
    fn address(&self) -> String {
        address_from_public_key(self.public_key())
    }
}

/// ECDSA P-256 key pair held as PKCS#8
#[derive(Clone)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        Self::from_pkcs8(new_key_pair()?)
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Wallet> {
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| {
                    BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
                })?;
        let public_key = key_pair.public_key().as_ref().to_vec();
        Ok(Wallet { pkcs8, public_key })
    }

    pub fn address(&self) -> String {
        address_from_public_key(&self.public_key)
    }

    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }
}

impl Signer for Wallet {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        ecdsa_p256_sha256_sign_digest(&self.pkcs8, message)
    }
}

pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let pub_key_sha256 = sha256_digest(pub_key);
    ripemd160_digest(pub_key_sha256.as_bytes())
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let first_sha = sha256_digest(payload);
    let second_sha = sha256_digest(first_sha.as_bytes());
    second_sha.as_bytes()[..ADDRESS_CHECK_SUM_LEN].to_vec()
}

/// version + ripemd160(sha256(public key)) + checksum, base58 encoded
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let mut payload = vec![VERSION];
    payload.extend(hash_pub_key(public_key));
    let checksum = checksum(&payload);
    payload.extend(checksum);
    base58_encode(&payload)
}

pub fn validate_address(address: &str) -> bool {
    let payload = match base58_decode(address) {
        Ok(payload) => payload,
        Err(_) => return false,
    };
    if payload.len() < ADDRESS_CHECK_SUM_LEN + 1 {
        return false;
    }
    let (body, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    checksum(body) == actual_checksum
}
