// Copyright (c) 2025 The Lode Foundation

//! Daily accrual arithmetic: rate derivation, pending-day crediting, and
//! stored-rate self-healing.
//!
//! Crediting is idempotent by construction. Every pass computes eligible
//! days from the calendar, subtracts what was already credited, and applies
//! the difference with a compare-and-swap guard in the store. Running the
//! same pass twice, or two passes concurrently, can never double-credit.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use lode_loyalty_core::{
    AccrualPolicy, Error, MiningPurchase, Result, LOGIN_REWARD_COINS,
};
use primitive_types::U256;
use tracing::{info, warn};

use crate::chain::ChainReader;
use crate::db::{CreditUpdate, Ledger};

/// Derive the whole-coin daily rate from a raw fixed-point token amount.
///
/// The fractional part is discarded. Returns `None` when the amount is too
/// small to yield a single whole coin, or too large to fit the ledger's
/// integer arithmetic.
pub fn compute_daily_rate(raw_amount: U256, decimals: u32) -> Option<i64> {
    let whole = raw_amount / U256::exp10(decimals as usize);
    if whole.is_zero() || whole > U256::from(i64::MAX as u64) {
        return None;
    }
    Some(whole.as_u64() as i64)
}

/// Days of accrual elapsed by `today`, counting the start day itself as
/// day 1. A start date in the future yields 0.
pub fn elapsed_days(start_date: NaiveDate, today: NaiveDate) -> i64 {
    ((today - start_date).num_days() + 1).max(0)
}

/// The accrual engine: walks a wallet's purchase rows and settles whatever
/// the calendar says is owed.
pub struct AccrualEngine {
    db: Ledger,
    chain: Arc<dyn ChainReader>,
    policy: AccrualPolicy,
}

impl AccrualEngine {
    pub fn new(db: Ledger, chain: Arc<dyn ChainReader>, policy: AccrualPolicy) -> Self {
        Self { db, chain, policy }
    }

    pub fn policy(&self) -> &AccrualPolicy {
        &self.policy
    }

    /// Credit all pending accrual days for a wallet as of today (UTC).
    /// Returns the coin delta applied.
    pub async fn credit_pending_days(&self, wallet: &str) -> Result<i64> {
        self.credit_pending_days_at(wallet, Utc::now().date_naive())
            .await
    }

    /// Credit pending days as of an explicit date.
    ///
    /// A row with an implausible stored rate is re-derived from its chain
    /// transaction first. If the self-heal fails the stored rate is used
    /// unchanged; a later normalization plus reconciliation corrects any
    /// drift that crediting at the stale rate introduced.
    pub async fn credit_pending_days_at(&self, wallet: &str, today: NaiveDate) -> Result<i64> {
        let purchases = self.db.purchases_for_wallet(wallet)?;
        let mut updates = Vec::new();

        for mut purchase in purchases {
            if purchase.rate_is_weird(self.policy.weird_rate_max) {
                match self.normalize_purchase(&purchase).await {
                    Some(rate) => purchase.daily_coins = rate,
                    None => warn!(
                        purchase_id = purchase.id,
                        daily_coins = purchase.daily_coins,
                        "Rate self-heal failed, crediting at stored rate"
                    ),
                }
            }

            let eligible = elapsed_days(purchase.start_date, today).min(purchase.total_days);
            let pending = eligible - purchase.credited_days;
            if pending > 0 {
                updates.push(CreditUpdate {
                    purchase_id: purchase.id,
                    observed_credited_days: purchase.credited_days,
                    pending_days: pending,
                    daily_coins: purchase.daily_coins,
                    credit_date: today,
                });
            }
        }

        let delta = self.db.apply_credits(wallet, &updates)?;
        if delta > 0 {
            info!(wallet, delta, "Credited pending mining days");
        }
        Ok(delta)
    }

    /// Re-derive a purchase row's daily rate from its original transaction
    /// and store the correction.
    ///
    /// Best effort: chain failures and underivable rates are logged and
    /// yield `None`. Returns the healthy rate (corrected or confirmed).
    pub async fn normalize_purchase(&self, purchase: &MiningPurchase) -> Option<i64> {
        let tx_hash = purchase.tx_hash.as_deref()?;

        let event = match self
            .chain
            .purchase_event(tx_hash, Some(&purchase.wallet))
            .await
        {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    purchase_id = purchase.id,
                    tx_hash, "Rate normalization read failed: {}", e
                );
                return None;
            }
        };

        let decimals = self.chain.token_decimals().await;
        let rate = compute_daily_rate(event.raw_amount, decimals)?;
        if rate == purchase.daily_coins {
            return Some(rate);
        }

        if let Err(e) = self.db.set_purchase_rate(purchase.id, rate) {
            warn!(purchase_id = purchase.id, "Rate correction write failed: {}", e);
            return None;
        }

        info!(
            purchase_id = purchase.id,
            old_rate = purchase.daily_coins,
            new_rate = rate,
            "Corrected stored daily rate from chain"
        );
        Some(rate)
    }

    /// Recompute a wallet's balance from its five ledgers: logins, referral
    /// rewards earned, mined totals, manual coin audits, and mining
    /// adjustments. Each component is floored at zero.
    pub fn expected_balance(&self, wallet: &str) -> Result<i64> {
        let user = self
            .db
            .get_user(wallet)?
            .ok_or_else(|| Error::NotRegistered(wallet.to_string()))?;

        let logins = self
            .db
            .login_count(wallet)?
            .saturating_mul(LOGIN_REWARD_COINS)
            .max(0);
        let referrals = if user.user_id.is_empty() {
            0
        } else {
            self.db.referral_sum(&user.user_id)?.max(0)
        };
        let mined = self.db.mined_sum(wallet)?.max(0);
        let audits = self.db.audit_sum(wallet)?.max(0);
        let adjustments = self.db.adjustment_sum(wallet)?.max(0);

        Ok(logins
            .saturating_add(referrals)
            .saturating_add(mined)
            .saturating_add(audits)
            .saturating_add(adjustments))
    }
}
