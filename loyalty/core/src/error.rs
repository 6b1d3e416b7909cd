// Copyright (c) 2025 The Lode Foundation

//! Error taxonomy for the loyalty backend.
//!
//! Every variant maps to a short machine-stable reason string exposed at the
//! service boundary; internal details stay in the `Display` text and logs.

/// Errors surfaced by the loyalty service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed address, hash, or missing fields. Caller error, no retry.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The signature does not recover to the claimed wallet address.
    #[error("Signature does not match the claimed wallet")]
    SignatureInvalid,

    /// The signed timestamp is outside the freshness window.
    #[error("Signature timestamp outside freshness window")]
    SignatureExpired,

    /// Admin-only action attempted by a caller who is not the contract owner.
    #[error("Caller is not the contract owner")]
    NotAuthorized,

    /// RPC/provider failure. Transient and safe to retry; chain reads always
    /// precede store writes, so no store state is corrupted.
    #[error("Chain read failed: {0}")]
    ChainRead(String),

    /// The referenced transaction is missing or reverted.
    #[error("Transaction not found or reverted: {0}")]
    TxNotFound(String),

    /// The transaction contains no purchase event from the platform contract.
    #[error("No purchase event found in transaction {0}")]
    EventNotFound(String),

    /// The decoded purchase event belongs to a different wallet than claimed.
    #[error("Purchase event belongs to a different wallet")]
    EventUserMismatch,

    /// The wallet has not completed on-chain registration.
    #[error("Wallet is not registered on-chain: {0}")]
    NotRegistered(String),

    /// Relational store failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Machine-stable reason string for the service boundary.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::SignatureInvalid => "signature_invalid",
            Error::SignatureExpired => "signature_expired",
            Error::NotAuthorized => "not_authorized",
            Error::ChainRead(_) => "chain_read_failure",
            Error::TxNotFound(_) => "tx_not_found",
            Error::EventNotFound(_) => "event_not_found",
            Error::EventUserMismatch => "event_user_mismatch",
            Error::NotRegistered(_) => "not_registered",
            Error::Store(_) => "store_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ChainRead(_) | Error::Store(_))
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(Error::SignatureInvalid.reason(), "signature_invalid");
        assert_eq!(Error::NotAuthorized.reason(), "not_authorized");
        assert_eq!(
            Error::TxNotFound("0xabc".into()).reason(),
            "tx_not_found"
        );
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(Error::ChainRead("timeout".into()).is_retryable());
        assert!(!Error::EventUserMismatch.is_retryable());
        assert!(!Error::InvalidInput("bad address".into()).is_retryable());
    }
}
