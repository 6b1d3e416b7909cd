// Copyright (c) 2025 The Lode Foundation

#![deny(unsafe_code)]

//! Ethereum signature recovery for wallet-authenticated requests.
//!
//! The loyalty backend authenticates callers by recovering the signer's
//! address from an EIP-191 personal-sign signature and comparing it to the
//! claimed wallet address. This crate provides the hashing, recovery, and
//! EIP-55 checksum pieces, plus a small keypair type used to produce
//! signatures in tests.
//!
//! # Examples
//!
//! ```
//! use lode_crypto_eth::{recover_address, Secp256k1Keypair};
//!
//! let keypair = Secp256k1Keypair::from_bytes(&[7u8; 32]).unwrap();
//! let signature = keypair.sign_message(b"Purpose: login");
//!
//! let recovered = recover_address(b"Purpose: login", &signature).unwrap();
//! assert_eq!(recovered.to_lowercase(), keypair.eth_address().to_lowercase());
//! ```

use k256::{
    ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey},
    SecretKey,
};
use sha3::{Digest, Keccak256};
use zeroize::ZeroizeOnDrop;

/// Errors that can occur during signature operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid private key")]
    InvalidPrivateKey,

    #[error("Invalid signature encoding")]
    InvalidSignature,
}

/// Compute the EIP-191 personal-sign hash for a message.
///
/// The message is prefixed with `"\x19Ethereum Signed Message:\n{length}"`
/// before hashing, matching what wallet `personal_sign` implementations do.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Recover the signer's address from an EIP-191 message signature.
///
/// The signature is the 65-byte `r || s || v` form produced by
/// `personal_sign`, with `v` either 27/28 or 0/1. Returns an EIP-55
/// checksummed address, or `None` if recovery fails.
pub fn recover_address(message: &[u8], signature: &[u8; 65]) -> Option<String> {
    let hash = eip191_hash(message);
    recover_address_from_hash(&hash, signature)
}

/// Recover the signer's address from a raw 32-byte hash.
pub fn recover_address_from_hash(hash: &[u8; 32], signature: &[u8; 65]) -> Option<String> {
    let sig = K256Signature::from_slice(&signature[..64]).ok()?;

    let v = signature[64];
    let recovery_id = if v >= 27 {
        RecoveryId::try_from(v - 27).ok()?
    } else {
        RecoveryId::try_from(v).ok()?
    };

    let verifying_key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id).ok()?;
    let point = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix, hash the 64 bytes of x || y
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let address_bytes: [u8; 20] = digest[12..32].try_into().ok()?;

    Some(checksum_encode(&address_bytes))
}

/// Parse a hex signature string (with or without `0x` prefix) into the
/// 65-byte `r || s || v` form.
pub fn parse_signature(hex_str: &str) -> Result<[u8; 65], Error> {
    let trimmed = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(trimmed).map_err(|_| Error::InvalidSignature)?;
    bytes.try_into().map_err(|_| Error::InvalidSignature)
}

/// EIP-55 checksum encode a 20-byte address.
pub fn checksum_encode(address: &[u8; 20]) -> String {
    let hex_addr = hex::encode(address);
    let hash = Keccak256::digest(hex_addr.as_bytes());

    let mut result = String::with_capacity(42);
    result.push_str("0x");

    for (i, c) in hex_addr.chars().enumerate() {
        if c.is_ascii_digit() {
            result.push(c);
        } else {
            let hash_byte = hash[i / 2];
            let hash_nibble = if i % 2 == 0 {
                hash_byte >> 4
            } else {
                hash_byte & 0x0f
            };

            if hash_nibble >= 8 {
                result.push(c.to_ascii_uppercase());
            } else {
                result.push(c);
            }
        }
    }

    result
}

/// A secp256k1 keypair that can produce wallet-style signatures.
///
/// The service itself never signs; this exists so tests and tooling can
/// exercise the verification path end to end.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Secp256k1Keypair {
    #[zeroize(skip)] // SigningKey implements its own zeroization
    signing_key: SigningKey,
}

impl core::fmt::Debug for Secp256k1Keypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Secp256k1Keypair {{ address: {} }}", self.eth_address())
    }
}

impl Secp256k1Keypair {
    /// Create a keypair from raw 32-byte private key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        let secret_key =
            SecretKey::from_bytes(bytes.into()).map_err(|_| Error::InvalidPrivateKey)?;

        Ok(Self {
            signing_key: SigningKey::from(secret_key),
        })
    }

    /// Get the EIP-55 checksummed address for this keypair.
    pub fn eth_address(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let digest = Keccak256::digest(&point.as_bytes()[1..]);
        let address_bytes: [u8; 20] = digest[12..32].try_into().expect("keccak output is 32 bytes");
        checksum_encode(&address_bytes)
    }

    /// Sign a message using EIP-191 personal-sign format.
    ///
    /// Returns a 65-byte signature `r || s || v` with `v = recovery_id + 27`.
    pub fn sign_message(&self, message: &[u8]) -> [u8; 65] {
        let hash = eip191_hash(message);
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&hash)
            .expect("signing should not fail with valid key");

        let mut result = [0u8; 65];
        result[..64].copy_from_slice(&signature.to_bytes());
        result[64] = recovery_id.to_byte() + 27;
        result
    }
}
