// Copyright (c) 2025 The Lode Foundation

//! Wallet-signed request verification.
//!
//! Every inbound action carries a wallet address, a Unix timestamp, and a
//! `personal_sign` signature over a purpose-tagged message. The purpose tag
//! stops a signature captured for one action from being replayed against
//! another; the timestamp bounds how long any signature stays usable.

use lode_crypto_eth::{parse_signature, recover_address};
use lode_loyalty_core::types::{canonical_wallet, is_valid_address};
use lode_loyalty_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::chain::ChainReader;

/// The exact text a wallet signs for an action.
pub fn signing_message(purpose: &str, address: &str, timestamp: i64) -> String {
    format!(
        "Purpose: {}\nAddress: {}\nTimestamp: {}",
        purpose, address, timestamp
    )
}

/// A signed request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    /// Claimed wallet address.
    pub address: String,

    /// Unix timestamp the signature was produced at.
    pub timestamp: i64,

    /// Hex-encoded 65-byte `r || s || v` signature.
    pub signature: String,
}

impl SignedRequest {
    /// Verify the envelope for a purpose and return the canonical wallet.
    pub fn verify_wallet(&self, purpose: &str, freshness_window_secs: i64) -> Result<String> {
        self.verify_wallet_at(purpose, freshness_window_secs, chrono::Utc::now().timestamp())
    }

    /// Verification against an explicit clock.
    pub fn verify_wallet_at(
        &self,
        purpose: &str,
        freshness_window_secs: i64,
        now: i64,
    ) -> Result<String> {
        if !is_valid_address(&self.address) {
            return Err(Error::InvalidInput(format!(
                "invalid address: {}",
                self.address
            )));
        }

        if (now - self.timestamp).abs() > freshness_window_secs {
            return Err(Error::SignatureExpired);
        }

        let signature = parse_signature(&self.signature).map_err(|_| Error::SignatureInvalid)?;
        let message = signing_message(purpose, &self.address, self.timestamp);
        let recovered =
            recover_address(message.as_bytes(), &signature).ok_or(Error::SignatureInvalid)?;

        if !recovered.eq_ignore_ascii_case(&self.address) {
            return Err(Error::SignatureInvalid);
        }

        Ok(canonical_wallet(&self.address))
    }

    /// Verify the envelope and additionally require the signer to be the
    /// platform contract owner.
    pub async fn verify_admin(
        &self,
        purpose: &str,
        freshness_window_secs: i64,
        chain: &dyn ChainReader,
    ) -> Result<String> {
        let wallet = self.verify_wallet(purpose, freshness_window_secs)?;

        let owner = chain.owner().await?;
        if !owner.eq_ignore_ascii_case(&wallet) {
            return Err(Error::NotAuthorized);
        }

        Ok(wallet)
    }
}
