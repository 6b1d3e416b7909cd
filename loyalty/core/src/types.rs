// Copyright (c) 2025 The Lode Foundation

//! Ledger entities and chain-facing value types.

use chrono::{DateTime, NaiveDate, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Coins credited for the first login of each UTC calendar day.
pub const LOGIN_REWARD_COINS: i64 = 1;

/// Coins credited to a referrer when a referred wallet first syncs.
pub const REFERRAL_REWARD_COINS: i64 = 5;

/// The zero-address sentinel meaning "no referrer".
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Canonicalize a wallet address: lower-case, `0x` prefix preserved.
pub fn canonical_wallet(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Canonicalize a user identifier: upper-case.
pub fn canonical_user_id(user_id: &str) -> String {
    user_id.trim().to_ascii_uppercase()
}

/// Check that a string is a well-formed `0x`-prefixed 20-byte address.
pub fn is_valid_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// Check that a string is a well-formed `0x`-prefixed 32-byte tx hash.
pub fn is_valid_tx_hash(hash: &str) -> bool {
    let Some(body) = hash.strip_prefix("0x") else {
        return false;
    };
    body.len() == 64 && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// Whether an address is the zero-address sentinel.
pub fn is_zero_address(address: &str) -> bool {
    is_valid_address(address)
        && address[2..].chars().all(|c| c == '0')
}

/// A loyalty program user, created on first on-chain-verified sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Wallet address, canonicalized lower-case. Unique.
    pub wallet: String,

    /// User identifier assigned on-chain, canonicalized upper-case.
    /// Unique once assigned.
    pub user_id: String,

    /// Referrer's user identifier, if any.
    pub referrer_id: Option<String>,

    /// Current coin balance (monotonic ledger total, corrected only by
    /// reconciliation).
    pub coin_balance: i64,

    /// Activity flag, refreshed on sync and login.
    pub is_active: bool,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One login per wallet per UTC calendar day. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRecord {
    pub wallet: String,
    pub login_date: NaiveDate,
}

/// A one-time referral reward, created at most once per referred wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralReward {
    /// The referred wallet. Unique: guards against duplicate rewards.
    pub referred_wallet: String,

    /// The referrer's user identifier (the balance beneficiary).
    pub referrer_id: String,

    /// Reward amount in coins.
    pub amount: i64,

    pub created_at: DateTime<Utc>,
}

/// Crediting state of a mining purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditState {
    /// No days credited yet.
    Created,
    /// Some but not all eligible days credited.
    PartiallyCredited,
    /// All eligible days credited; the stream is exhausted.
    FullyCredited,
}

impl CreditState {
    /// Check if this is a terminal state (no further accrual possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CreditState::FullyCredited)
    }
}

impl std::fmt::Display for CreditState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreditState::Created => write!(f, "created"),
            CreditState::PartiallyCredited => write!(f, "partially_credited"),
            CreditState::FullyCredited => write!(f, "fully_credited"),
        }
    }
}

/// One on-chain miner purchase and its accrual bookkeeping.
///
/// Invariants: `0 <= credited_days <= total_days`; `credited_days` only ever
/// increases; `daily_coins` may be corrected in place by rate normalization
/// without affecting the credit state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningPurchase {
    /// Store row id.
    pub id: i64,

    /// Transaction hash, unique when present. `None` only for admin-injected
    /// synthetic rows.
    pub tx_hash: Option<String>,

    /// Owning wallet, canonicalized lower-case.
    pub wallet: String,

    /// Daily accrual rate in whole coins.
    pub daily_coins: i64,

    /// Total eligible accrual days.
    pub total_days: i64,

    /// Days already credited to the balance. Monotonically non-decreasing.
    pub credited_days: i64,

    /// Accrual start date (UTC calendar date). The start day itself counts
    /// as day 1.
    pub start_date: NaiveDate,

    /// Date of the most recent crediting pass that touched this row.
    pub last_credit_date: Option<NaiveDate>,

    pub created_at: DateTime<Utc>,
}

impl MiningPurchase {
    /// Current position in the credit state machine.
    pub fn credit_state(&self) -> CreditState {
        if self.credited_days == 0 {
            CreditState::Created
        } else if self.credited_days < self.total_days {
            CreditState::PartiallyCredited
        } else {
            CreditState::FullyCredited
        }
    }

    /// Total coins this row has contributed to the balance so far.
    pub fn mined_total(&self) -> i64 {
        self.daily_coins.saturating_mul(self.credited_days)
    }

    /// Whether the stored rate looks implausible and should be re-derived
    /// from the original chain log.
    pub fn rate_is_weird(&self, weird_rate_max: i64) -> bool {
        self.daily_coins <= 0 || self.daily_coins > weird_rate_max
    }
}

/// On-chain registration facts for a wallet.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Whether the wallet is registered on the platform contract.
    pub registered: bool,

    /// The user identifier assigned on-chain (upper-cased).
    pub user_id: String,

    /// The referrer's wallet address, or empty if the zero address.
    pub referrer_wallet: String,
}

/// A decoded miner-purchase event.
#[derive(Debug, Clone)]
pub struct PurchaseEvent {
    /// Transaction hash the event came from.
    pub tx_hash: String,

    /// The purchasing wallet, canonicalized lower-case.
    pub wallet: String,

    /// Raw fixed-point token amount from the event.
    pub raw_amount: U256,

    /// Accrual start as a Unix timestamp from the event.
    pub start_time: i64,
}

impl PurchaseEvent {
    /// The UTC calendar date accrual starts on.
    pub fn start_date(&self) -> NaiveDate {
        DateTime::from_timestamp(self.start_time, 0)
            .unwrap_or_else(Utc::now)
            .date_naive()
    }
}
