// Copyright (c) 2025 The Lode Foundation

//! The inbound wallet-facing actions: sync, login, record-purchase, stats.
//!
//! Every action verifies a purpose-tagged signature, mirrors whatever
//! on-chain facts it needs into the ledger, and settles any accrual owed
//! before reporting balances. The chain is the authority for identity and
//! purchases; the ledger is the authority for coins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use lode_loyalty_core::types::{canonical_wallet, is_valid_tx_hash};
use lode_loyalty_core::{
    Error, MiningPurchase, PurchaseEvent, Result, ServiceConfig, LOGIN_REWARD_COINS,
    REFERRAL_REWARD_COINS,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::accrual::{compute_daily_rate, AccrualEngine};
use crate::auth::SignedRequest;
use crate::chain::ChainReader;
use crate::db::Ledger;
use crate::ratelimit::SyncGuard;

/// Result of a sync action.
#[derive(Debug, Serialize)]
pub struct SyncOutcome {
    pub wallet: String,
    pub user_id: String,
    pub referrer_id: Option<String>,
    pub coin_balance: i64,
    /// True when the cooldown refused a fresh chain read and stored state
    /// was returned instead.
    pub rate_limited: bool,
    /// True when this sync granted the one-time referral reward.
    pub referral_rewarded: bool,
}

/// Result of a login action.
#[derive(Debug, Serialize)]
pub struct LoginOutcome {
    pub wallet: String,
    pub login_date: NaiveDate,
    /// False on a repeat login within the same UTC day.
    pub rewarded: bool,
    pub coin_balance: i64,
}

/// Result of recording a purchase.
#[derive(Debug, Serialize)]
pub struct PurchaseOutcome {
    pub wallet: String,
    pub tx_hash: String,
    pub daily_coins: i64,
    pub total_days: i64,
    pub start_date: NaiveDate,
    /// False when the transaction hash was already recorded.
    pub inserted: bool,
    pub coin_balance: i64,
}

/// Per-wallet breakdown reported by the stats action.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub wallet: String,
    pub user_id: String,
    pub referrer_id: Option<String>,
    pub coin_balance: i64,
    pub login_days: i64,
    pub referral_coins: i64,
    pub mined_coins: i64,
    pub audit_coins: i64,
    pub adjustment_coins: i64,
    pub purchases: Vec<MiningPurchase>,
}

/// The loyalty service facade.
pub struct LoyaltyService {
    db: Ledger,
    chain: Arc<dyn ChainReader>,
    engine: AccrualEngine,
    sync_guard: SyncGuard,
    config: ServiceConfig,
}

impl LoyaltyService {
    pub fn new(db: Ledger, chain: Arc<dyn ChainReader>, config: ServiceConfig) -> Self {
        let engine = AccrualEngine::new(db.clone(), chain.clone(), config.accrual.clone());
        let sync_guard = SyncGuard::new(Duration::from_secs(config.sync_rate_limit_secs));

        Self {
            db,
            chain,
            engine,
            sync_guard,
            config,
        }
    }

    pub fn engine(&self) -> &AccrualEngine {
        &self.engine
    }

    /// Mirror a wallet's on-chain registration into the ledger, grant the
    /// one-time referral reward if due, and settle pending accrual.
    pub async fn sync_user(&self, request: &SignedRequest) -> Result<SyncOutcome> {
        let wallet = request.verify_wallet("sync", self.config.freshness_window_secs)?;

        if !self.sync_guard.try_acquire(&wallet) {
            let user = self
                .db
                .get_user(&wallet)?
                .ok_or_else(|| Error::NotRegistered(wallet.clone()))?;
            return Ok(SyncOutcome {
                wallet,
                user_id: user.user_id,
                referrer_id: user.referrer_id,
                coin_balance: user.coin_balance,
                rate_limited: true,
                referral_rewarded: false,
            });
        }

        let registration = match self.chain.registration(&wallet).await {
            Ok(registration) => registration,
            Err(e) => {
                // A transient chain failure must not burn the cooldown slot
                self.sync_guard.release(&wallet);
                return Err(e);
            }
        };
        if !registration.registered {
            return Err(Error::NotRegistered(wallet));
        }

        let referrer_id = self.resolve_referrer_id(&registration.referrer_wallet).await;
        self.db
            .upsert_user(&wallet, &registration.user_id, referrer_id.as_deref())?;

        let mut referral_rewarded = false;
        if let Some(referrer_id) = &referrer_id {
            // Granted only once the referrer has a ledger row to credit,
            // retried on every sync until then
            if !self.db.has_referral_reward(&wallet)?
                && self.db.get_user_by_id(referrer_id)?.is_some()
            {
                referral_rewarded =
                    self.db
                        .insert_referral_reward(&wallet, referrer_id, REFERRAL_REWARD_COINS)?;
                if referral_rewarded {
                    info!(%wallet, %referrer_id, "Granted referral reward");
                }
            }
        }

        self.engine.credit_pending_days(&wallet).await?;

        let user = self
            .db
            .get_user(&wallet)?
            .ok_or_else(|| Error::Store("user row vanished after upsert".to_string()))?;

        Ok(SyncOutcome {
            wallet,
            user_id: user.user_id,
            referrer_id: user.referrer_id,
            coin_balance: user.coin_balance,
            rate_limited: false,
            referral_rewarded,
        })
    }

    /// Record the first login of the UTC day and credit the daily coin.
    pub async fn login(&self, request: &SignedRequest) -> Result<LoginOutcome> {
        let wallet = request.verify_wallet("login", self.config.freshness_window_secs)?;
        self.require_user(&wallet)?;

        let today = Utc::now().date_naive();
        let rewarded = self.db.record_login(&wallet, today, LOGIN_REWARD_COINS)?;

        Ok(LoginOutcome {
            coin_balance: self.balance(&wallet)?,
            wallet,
            login_date: today,
            rewarded,
        })
    }

    /// Record a miner purchase claimed by its buyer. The transaction's event
    /// is fetched and must name the signing wallet as buyer.
    pub async fn record_purchase(
        &self,
        request: &SignedRequest,
        tx_hash: &str,
    ) -> Result<PurchaseOutcome> {
        let wallet = request.verify_wallet("record-purchase", self.config.freshness_window_secs)?;
        self.require_user(&wallet)?;

        let tx_hash = validate_tx_hash(tx_hash)?;
        let event = self.chain.purchase_event(&tx_hash, Some(&wallet)).await?;
        self.record_from_event(&event).await
    }

    /// Record a purchase from a bare transaction hash. No signature; the
    /// decoded event alone decides which wallet owns the purchase.
    pub async fn record_purchase_lite(&self, tx_hash: &str) -> Result<PurchaseOutcome> {
        let tx_hash = validate_tx_hash(tx_hash)?;
        let event = self.chain.purchase_event(&tx_hash, None).await?;

        let wallet = canonical_wallet(&event.wallet);
        self.require_user(&wallet)?;

        self.record_from_event(&event).await
    }

    /// Record a purchase event whose authenticity was already established.
    pub async fn record_from_event(&self, event: &PurchaseEvent) -> Result<PurchaseOutcome> {
        let wallet = canonical_wallet(&event.wallet);

        let decimals = self.chain.token_decimals().await;
        let daily_coins = compute_daily_rate(event.raw_amount, decimals).ok_or_else(|| {
            Error::InvalidInput(format!(
                "purchase amount {} yields no whole-coin daily rate",
                event.raw_amount
            ))
        })?;

        let total_days = self.config.accrual.default_total_days;
        let start_date = event.start_date();

        let inserted =
            self.db
                .insert_purchase(Some(&event.tx_hash), &wallet, daily_coins, total_days, start_date)?;
        if inserted {
            info!(%wallet, tx_hash = %event.tx_hash, daily_coins, "Recorded miner purchase");
        } else {
            // A replayed hash is a no-op, not an error
            info!(tx_hash = %event.tx_hash, "Purchase already recorded");
        }

        self.engine.credit_pending_days(&wallet).await?;

        Ok(PurchaseOutcome {
            coin_balance: self.balance(&wallet)?,
            wallet,
            tx_hash: event.tx_hash.clone(),
            daily_coins,
            total_days,
            start_date,
            inserted,
        })
    }

    /// Settle pending accrual, then report the wallet's full breakdown.
    pub async fn stats(&self, request: &SignedRequest) -> Result<StatsReport> {
        let wallet = request.verify_wallet("stats", self.config.freshness_window_secs)?;
        self.stats_for_wallet(&wallet).await
    }

    /// The stats breakdown without signature verification, for operator
    /// tooling with direct store access.
    pub async fn stats_for_wallet(&self, wallet: &str) -> Result<StatsReport> {
        let wallet = canonical_wallet(wallet);
        let user = self.require_user(&wallet)?;

        self.engine.credit_pending_days(&wallet).await?;

        let referral_coins = if user.user_id.is_empty() {
            0
        } else {
            self.db.referral_sum(&user.user_id)?
        };

        Ok(StatsReport {
            coin_balance: self.balance(&wallet)?,
            login_days: self.db.login_count(&wallet)?,
            referral_coins,
            mined_coins: self.db.mined_sum(&wallet)?,
            audit_coins: self.db.audit_sum(&wallet)?,
            adjustment_coins: self.db.adjustment_sum(&wallet)?,
            purchases: self.db.purchases_for_wallet(&wallet)?,
            wallet,
            user_id: user.user_id,
            referrer_id: user.referrer_id,
        })
    }

    /// Resolve a referrer wallet to its user identifier, preferring the
    /// ledger and falling back to the chain. Failures are logged and yield
    /// `None` so a sync never fails on its referrer.
    async fn resolve_referrer_id(&self, referrer_wallet: &str) -> Option<String> {
        if referrer_wallet.is_empty() {
            return None;
        }
        let referrer_wallet = canonical_wallet(referrer_wallet);

        match self.db.get_user(&referrer_wallet) {
            Ok(Some(user)) if !user.user_id.is_empty() => return Some(user.user_id),
            Ok(_) => {}
            Err(e) => warn!(%referrer_wallet, "Referrer lookup failed: {}", e),
        }

        match self.chain.user_id_of(&referrer_wallet).await {
            Ok(user_id) if !user_id.is_empty() => Some(user_id),
            Ok(_) => None,
            Err(e) => {
                warn!(%referrer_wallet, "Referrer chain read failed: {}", e);
                None
            }
        }
    }

    fn require_user(&self, wallet: &str) -> Result<lode_loyalty_core::User> {
        self.db
            .get_user(wallet)?
            .ok_or_else(|| Error::NotRegistered(wallet.to_string()))
    }

    fn balance(&self, wallet: &str) -> Result<i64> {
        Ok(self.db.get_user(wallet)?.map(|u| u.coin_balance).unwrap_or(0))
    }
}

fn validate_tx_hash(tx_hash: &str) -> Result<String> {
    let tx_hash = tx_hash.trim().to_ascii_lowercase();
    if !is_valid_tx_hash(&tx_hash) {
        return Err(Error::InvalidInput(format!("invalid tx hash: {}", tx_hash)));
    }
    Ok(tx_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::signing_message;
    use crate::testutil::MockChain;
    use chrono::Duration as ChronoDuration;
    use lode_crypto_eth::Secp256k1Keypair;
    use primitive_types::U256;

    fn keypair(seed: u8) -> Secp256k1Keypair {
        Secp256k1Keypair::from_bytes(&[seed; 32]).unwrap()
    }

    fn wallet_of(keypair: &Secp256k1Keypair) -> String {
        keypair.eth_address().to_lowercase()
    }

    fn signed(keypair: &Secp256k1Keypair, purpose: &str) -> SignedRequest {
        let address = keypair.eth_address();
        let timestamp = Utc::now().timestamp();
        let message = signing_message(purpose, &address, timestamp);
        let signature = keypair.sign_message(message.as_bytes());

        SignedRequest {
            address,
            timestamp,
            signature: format!("0x{}", hex::encode(signature)),
        }
    }

    fn service_with_cooldown(secs: u64) -> (LoyaltyService, Ledger, Arc<MockChain>) {
        let db = Ledger::open_in_memory().unwrap();
        db.migrate().unwrap();

        let chain = Arc::new(MockChain::new());
        let config = ServiceConfig {
            sync_rate_limit_secs: secs,
            ..Default::default()
        };
        let service = LoyaltyService::new(db.clone(), chain.clone(), config);
        (service, db, chain)
    }

    fn service() -> (LoyaltyService, Ledger, Arc<MockChain>) {
        service_with_cooldown(0)
    }

    fn tx(n: u8) -> String {
        format!("0x{}", format!("{:02x}", n).repeat(32))
    }

    fn purchase_event(tx_hash: &str, wallet: &str, tokens: u64, days_ago: i64) -> PurchaseEvent {
        PurchaseEvent {
            tx_hash: tx_hash.to_string(),
            wallet: wallet.to_string(),
            raw_amount: U256::from(tokens) * U256::exp10(18),
            start_time: (Utc::now() - ChronoDuration::days(days_ago)).timestamp(),
        }
    }

    #[tokio::test]
    async fn sync_mirrors_registration() {
        let (service, db, chain) = service();
        let keypair = keypair(7);
        let wallet = wallet_of(&keypair);
        chain.register(&wallet, "LODE1", "");

        let outcome = service.sync_user(&signed(&keypair, "sync")).await.unwrap();
        assert_eq!(outcome.user_id, "LODE1");
        assert_eq!(outcome.referrer_id, None);
        assert_eq!(outcome.coin_balance, 0);
        assert!(!outcome.rate_limited);

        assert!(db.get_user(&wallet).unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_rejects_unregistered_wallet() {
        let (service, _, _) = service();
        let keypair = keypair(7);

        assert!(matches!(
            service.sync_user(&signed(&keypair, "sync")).await,
            Err(Error::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn sync_rejects_wrong_purpose_signature() {
        let (service, _, chain) = service();
        let keypair = keypair(7);
        chain.register(&wallet_of(&keypair), "LODE1", "");

        assert!(matches!(
            service.sync_user(&signed(&keypair, "login")).await,
            Err(Error::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn referral_reward_is_granted_exactly_once() {
        let (service, db, chain) = service();
        let referrer = keypair(7);
        let referred = keypair(9);
        chain.register(&wallet_of(&referrer), "LODE1", "");
        chain.register(&wallet_of(&referred), "LODE2", &wallet_of(&referrer));

        service.sync_user(&signed(&referrer, "sync")).await.unwrap();

        let outcome = service.sync_user(&signed(&referred, "sync")).await.unwrap();
        assert!(outcome.referral_rewarded);
        assert_eq!(outcome.referrer_id.as_deref(), Some("LODE1"));

        // A later sync must not grant it again
        let outcome = service.sync_user(&signed(&referred, "sync")).await.unwrap();
        assert!(!outcome.referral_rewarded);

        let referrer_user = db.get_user(&wallet_of(&referrer)).unwrap().unwrap();
        assert_eq!(referrer_user.coin_balance, REFERRAL_REWARD_COINS);
    }

    #[tokio::test]
    async fn referral_waits_for_referrer_row() {
        let (service, _, chain) = service();
        let referrer = keypair(7);
        let referred = keypair(9);
        chain.register(&wallet_of(&referrer), "LODE1", "");
        chain.register(&wallet_of(&referred), "LODE2", &wallet_of(&referrer));

        // Referred syncs before the referrer has ever synced
        let outcome = service.sync_user(&signed(&referred, "sync")).await.unwrap();
        assert!(!outcome.referral_rewarded);
        assert_eq!(outcome.referrer_id.as_deref(), Some("LODE1"));

        service.sync_user(&signed(&referrer, "sync")).await.unwrap();
        let outcome = service.sync_user(&signed(&referred, "sync")).await.unwrap();
        assert!(outcome.referral_rewarded);
    }

    #[tokio::test]
    async fn rate_limited_sync_returns_stored_state() {
        let (service, _, chain) = service_with_cooldown(60);
        let keypair = keypair(7);
        chain.register(&wallet_of(&keypair), "LODE1", "");

        let first = service.sync_user(&signed(&keypair, "sync")).await.unwrap();
        assert!(!first.rate_limited);

        // Inside the cooldown the chain is not consulted at all
        chain.set_failing(true);
        let second = service.sync_user(&signed(&keypair, "sync")).await.unwrap();
        assert!(second.rate_limited);
        assert_eq!(second.user_id, "LODE1");
    }

    #[tokio::test]
    async fn failed_first_sync_retries_without_waiting_out_cooldown() {
        let (service, _, chain) = service_with_cooldown(60);
        let keypair = keypair(7);
        chain.register(&wallet_of(&keypair), "LODE1", "");

        chain.set_failing(true);
        assert!(matches!(
            service.sync_user(&signed(&keypair, "sync")).await,
            Err(Error::ChainRead(_))
        ));

        // The failed attempt released its slot, so recovery is immediate
        chain.set_failing(false);
        let outcome = service.sync_user(&signed(&keypair, "sync")).await.unwrap();
        assert!(!outcome.rate_limited);
        assert_eq!(outcome.user_id, "LODE1");
    }

    #[tokio::test]
    async fn login_rewards_once_per_day() {
        let (service, _, chain) = service();
        let keypair = keypair(7);
        chain.register(&wallet_of(&keypair), "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();

        let first = service.login(&signed(&keypair, "login")).await.unwrap();
        assert!(first.rewarded);
        assert_eq!(first.coin_balance, 1);

        let second = service.login(&signed(&keypair, "login")).await.unwrap();
        assert!(!second.rewarded);
        assert_eq!(second.coin_balance, 1);
    }

    #[tokio::test]
    async fn login_requires_synced_user() {
        let (service, _, _) = service();
        let keypair = keypair(7);

        assert!(matches!(
            service.login(&signed(&keypair, "login")).await,
            Err(Error::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn purchase_backlog_settles_on_record() {
        let (service, db, chain) = service();
        let keypair = keypair(7);
        let wallet = wallet_of(&keypair);
        chain.register(&wallet, "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();

        // 30 tokens/day, started 10 days ago: 10 days owed immediately
        chain.add_event(purchase_event(&tx(1), &wallet, 30, 9));

        let outcome = service
            .record_purchase(&signed(&keypair, "record-purchase"), &tx(1))
            .await
            .unwrap();
        assert!(outcome.inserted);
        assert_eq!(outcome.daily_coins, 30);
        assert_eq!(outcome.total_days, 30);
        assert_eq!(outcome.coin_balance, 300);

        assert_eq!(db.get_user(&wallet).unwrap().unwrap().coin_balance, 300);
    }

    #[tokio::test]
    async fn duplicate_purchase_is_a_noop_success() {
        let (service, _, chain) = service();
        let keypair = keypair(7);
        let wallet = wallet_of(&keypair);
        chain.register(&wallet, "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();
        chain.add_event(purchase_event(&tx(1), &wallet, 30, 9));

        let first = service
            .record_purchase(&signed(&keypair, "record-purchase"), &tx(1))
            .await
            .unwrap();
        let second = service
            .record_purchase(&signed(&keypair, "record-purchase"), &tx(1))
            .await
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(second.coin_balance, first.coin_balance);
    }

    #[tokio::test]
    async fn purchase_must_name_the_signer_as_buyer() {
        let (service, _, chain) = service();
        let buyer = keypair(7);
        let thief = keypair(9);
        chain.register(&wallet_of(&buyer), "LODE1", "");
        chain.register(&wallet_of(&thief), "LODE2", "");
        service.sync_user(&signed(&buyer, "sync")).await.unwrap();
        service.sync_user(&signed(&thief, "sync")).await.unwrap();

        chain.add_event(purchase_event(&tx(1), &wallet_of(&buyer), 30, 0));

        assert!(matches!(
            service
                .record_purchase(&signed(&thief, "record-purchase"), &tx(1))
                .await,
            Err(Error::EventUserMismatch)
        ));
    }

    #[tokio::test]
    async fn lite_recording_trusts_the_event() {
        let (service, db, chain) = service();
        let keypair = keypair(7);
        let wallet = wallet_of(&keypair);
        chain.register(&wallet, "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();
        chain.add_event(purchase_event(&tx(1), &wallet, 7, 0));

        let outcome = service.record_purchase_lite(&tx(1)).await.unwrap();
        assert_eq!(outcome.wallet, wallet);
        assert_eq!(outcome.daily_coins, 7);
        // Day 1 settles immediately
        assert_eq!(db.get_user(&wallet).unwrap().unwrap().coin_balance, 7);
    }

    #[tokio::test]
    async fn sub_coin_purchase_is_rejected() {
        let (service, _, chain) = service();
        let keypair = keypair(7);
        let wallet = wallet_of(&keypair);
        chain.register(&wallet, "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();

        chain.add_event(PurchaseEvent {
            tx_hash: tx(1),
            wallet: wallet.clone(),
            raw_amount: U256::exp10(17), // 0.1 tokens
            start_time: Utc::now().timestamp(),
        });

        assert!(matches!(
            service
                .record_purchase(&signed(&keypair, "record-purchase"), &tx(1))
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn malformed_tx_hash_is_rejected() {
        let (service, _, chain) = service();
        let keypair = keypair(7);
        chain.register(&wallet_of(&keypair), "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();

        assert!(matches!(
            service
                .record_purchase(&signed(&keypair, "record-purchase"), "0x1234")
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn stats_settles_then_reports_breakdown() {
        let (service, db, chain) = service();
        let keypair = keypair(7);
        let wallet = wallet_of(&keypair);
        chain.register(&wallet, "LODE1", "");
        service.sync_user(&signed(&keypair, "sync")).await.unwrap();

        service.login(&signed(&keypair, "login")).await.unwrap();
        chain.add_event(purchase_event(&tx(1), &wallet, 30, 9));
        service
            .record_purchase(&signed(&keypair, "record-purchase"), &tx(1))
            .await
            .unwrap();
        db.insert_referral_reward("0xother", "LODE1", REFERRAL_REWARD_COINS)
            .unwrap();

        let report = service.stats(&signed(&keypair, "stats")).await.unwrap();
        assert_eq!(report.login_days, 1);
        assert_eq!(report.referral_coins, 5);
        assert_eq!(report.mined_coins, 300);
        assert_eq!(report.coin_balance, 306);
        assert_eq!(report.purchases.len(), 1);
    }
}
