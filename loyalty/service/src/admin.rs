// Copyright (c) 2025 The Lode Foundation

//! Operator tools: historical imports, bulk rate normalization, balance
//! reconciliation, and audited manual adjustments.
//!
//! These run with operator privileges (the CLI, or a request that passed the
//! contract-owner gate) and are built to be safe to re-run: imports dedup on
//! transaction hash, normalization converges, and reconciliation recomputes
//! from the ledgers rather than trusting the stored balance.

use std::sync::Arc;

use chrono::NaiveDate;
use lode_loyalty_core::types::{canonical_user_id, canonical_wallet, is_valid_address};
use lode_loyalty_core::{AccrualPolicy, Error, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::accrual::{compute_daily_rate, AccrualEngine};
use crate::chain::ChainReader;
use crate::db::Ledger;

/// What a reconciliation pass did for one wallet.
#[derive(Debug, Serialize)]
pub struct ReconcileReport {
    pub wallet: String,
    /// Purchases newly imported from chain history.
    pub imported: usize,
    /// Purchase rows whose rate was re-derived.
    pub normalized: usize,
    /// Coins credited by the accrual pass.
    pub credited: i64,
    /// Stored balance before reconciliation.
    pub previous_balance: i64,
    /// Balance recomputed from the ledgers.
    pub expected_balance: i64,
    /// True when the stored balance had drifted and was overwritten.
    pub corrected: bool,
}

pub struct AdminTools {
    db: Ledger,
    chain: Arc<dyn ChainReader>,
    engine: AccrualEngine,
    policy: AccrualPolicy,
}

impl AdminTools {
    pub fn new(db: Ledger, chain: Arc<dyn ChainReader>, policy: AccrualPolicy) -> Self {
        let engine = AccrualEngine::new(db.clone(), chain.clone(), policy.clone());
        Self {
            db,
            chain,
            engine,
            policy,
        }
    }

    /// Import purchase events from chain history that the ledger is missing.
    /// Safe to re-run; known transaction hashes are skipped. Returns the
    /// number of rows inserted.
    pub async fn import_from_logs(&self, wallet: &str, lookback_days: u64) -> Result<usize> {
        let lookback_blocks = lookback_days.saturating_mul(self.policy.blocks_per_day);
        let events = self.chain.purchase_logs(wallet, lookback_blocks).await?;
        let decimals = self.chain.token_decimals().await;

        let mut imported = 0;
        for event in &events {
            let Some(daily_coins) = compute_daily_rate(event.raw_amount, decimals) else {
                warn!(
                    tx_hash = %event.tx_hash,
                    raw_amount = %event.raw_amount,
                    "Skipping import of purchase with no whole-coin rate"
                );
                continue;
            };

            let inserted = self.db.insert_purchase(
                Some(&event.tx_hash),
                wallet,
                daily_coins,
                self.policy.default_total_days,
                event.start_date(),
            )?;
            if inserted {
                imported += 1;
            }
        }

        if imported > 0 {
            info!(wallet, imported, "Imported historical purchases");
        }
        Ok(imported)
    }

    /// Re-derive the rate of every implausible purchase row for a wallet.
    /// Returns the number of rows healed.
    pub async fn bulk_normalize(&self, wallet: &str) -> Result<usize> {
        let mut normalized = 0;
        for purchase in self.db.purchases_for_wallet(wallet)? {
            if !purchase.rate_is_weird(self.policy.weird_rate_max) {
                continue;
            }
            if self.engine.normalize_purchase(&purchase).await.is_some() {
                normalized += 1;
            }
        }
        Ok(normalized)
    }

    /// Resolve an operator-supplied key, either a wallet address or an
    /// assigned user identifier, to the canonical wallet.
    pub fn resolve_wallet(&self, key: &str) -> Result<String> {
        let key = key.trim();
        if is_valid_address(key) {
            return Ok(canonical_wallet(key));
        }

        let user_id = canonical_user_id(key);
        match self.db.get_user_by_id(&user_id)? {
            Some(user) => Ok(user.wallet),
            None => Err(Error::NotRegistered(key.to_string())),
        }
    }

    /// Full repair pass for one user, addressed by wallet or user id:
    /// import missing purchases, heal rates, settle accrual, then recompute
    /// the balance from the ledgers and overwrite it if it drifted.
    ///
    /// Chain outages degrade the import step to a no-op; the ledger-side
    /// repair still runs.
    pub async fn reconcile_user(&self, key: &str, lookback_days: u64) -> Result<ReconcileReport> {
        let wallet = self.resolve_wallet(key)?;
        let wallet = wallet.as_str();

        let user = self
            .db
            .get_user(wallet)?
            .ok_or_else(|| Error::NotRegistered(wallet.to_string()))?;
        let previous_balance = user.coin_balance;

        let imported = match self.import_from_logs(wallet, lookback_days).await {
            Ok(imported) => imported,
            Err(e) => {
                warn!(wallet, "Import skipped during reconciliation: {}", e);
                0
            }
        };

        let normalized = self.bulk_normalize(wallet).await?;
        let credited = self.engine.credit_pending_days(wallet).await?;

        let expected_balance = self.engine.expected_balance(wallet)?;
        let current = self
            .db
            .get_user(wallet)?
            .map(|u| u.coin_balance)
            .unwrap_or(0);
        let corrected = current != expected_balance;
        if corrected {
            warn!(
                wallet,
                current, expected_balance, "Stored balance drifted, overwriting"
            );
            self.db.set_balance(wallet, expected_balance)?;
        }

        Ok(ReconcileReport {
            wallet: wallet.to_string(),
            imported,
            normalized,
            credited,
            previous_balance,
            expected_balance,
            corrected,
        })
    }

    /// Apply an audited manual coin delta. Returns the new balance.
    pub fn adjust_coins(
        &self,
        wallet: &str,
        delta: i64,
        reason: &str,
        admin_address: &str,
    ) -> Result<i64> {
        self.require_user(wallet)?;
        let balance = self.db.add_coin_audit(wallet, delta, reason, admin_address)?;
        info!(wallet, delta, reason, "Applied manual coin adjustment");
        Ok(balance)
    }

    /// Apply an audited manual mining delta. Returns the new balance.
    pub fn adjust_mining(
        &self,
        wallet: &str,
        delta: i64,
        reason: &str,
        admin_address: &str,
    ) -> Result<i64> {
        self.require_user(wallet)?;
        let balance = self
            .db
            .add_mining_adjustment(wallet, delta, reason, admin_address)?;
        info!(wallet, delta, reason, "Applied manual mining adjustment");
        Ok(balance)
    }

    /// Inject a synthetic purchase row with no chain transaction behind it.
    /// It accrues like any other row but can never be rate-normalized.
    pub fn force_purchase(
        &self,
        wallet: &str,
        daily_coins: i64,
        total_days: i64,
        start_date: NaiveDate,
    ) -> Result<()> {
        self.require_user(wallet)?;
        if daily_coins <= 0 {
            return Err(Error::InvalidInput(format!(
                "daily_coins must be positive, got {}",
                daily_coins
            )));
        }
        if total_days <= 0 {
            return Err(Error::InvalidInput(format!(
                "total_days must be positive, got {}",
                total_days
            )));
        }

        self.db
            .insert_purchase(None, wallet, daily_coins, total_days, start_date)?;
        info!(wallet, daily_coins, total_days, "Injected synthetic purchase");
        Ok(())
    }

    /// Delete a purchase row and claw back its already-credited coins.
    /// Returns the deduction applied.
    pub fn delete_purchase(&self, id: i64) -> Result<i64> {
        let deduction = self
            .db
            .delete_purchase(id)?
            .ok_or_else(|| Error::InvalidInput(format!("no purchase with id {}", id)))?;
        info!(purchase_id = id, deduction, "Deleted purchase");
        Ok(deduction)
    }

    fn require_user(&self, wallet: &str) -> Result<()> {
        if self.db.get_user(wallet)?.is_none() {
            return Err(Error::NotRegistered(wallet.to_string()));
        }
        Ok(())
    }
}
