//! Shared test doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lode_loyalty_core::{Error, PurchaseEvent, Registration, Result};

use crate::chain::ChainReader;

/// In-memory stand-in for the platform contract.
#[derive(Default)]
pub struct MockChain {
    registrations: Mutex<HashMap<String, Registration>>,
    events: Mutex<HashMap<String, PurchaseEvent>>,
    logs: Mutex<HashMap<String, Vec<PurchaseEvent>>>,
    owner: Mutex<String>,
    decimals: AtomicU32,
    fail: AtomicBool,
}

impl MockChain {
    pub fn new() -> Self {
        let chain = Self::default();
        chain.decimals.store(18, Ordering::SeqCst);
        chain
    }

    pub fn register(&self, wallet: &str, user_id: &str, referrer_wallet: &str) {
        self.registrations.lock().unwrap().insert(
            wallet.to_string(),
            Registration {
                registered: true,
                user_id: user_id.to_string(),
                referrer_wallet: referrer_wallet.to_string(),
            },
        );
    }

    pub fn add_event(&self, event: PurchaseEvent) {
        self.events
            .lock()
            .unwrap()
            .insert(event.tx_hash.clone(), event);
    }

    pub fn add_log(&self, wallet: &str, event: PurchaseEvent) {
        self.logs
            .lock()
            .unwrap()
            .entry(wallet.to_string())
            .or_default()
            .push(event);
    }

    pub fn set_owner(&self, owner: &str) {
        *self.owner.lock().unwrap() = owner.to_string();
    }

    pub fn set_decimals(&self, decimals: u32) {
        self.decimals.store(decimals, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with a chain error.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ChainRead("mock chain down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn registration(&self, wallet: &str) -> Result<Registration> {
        self.check_up()?;
        Ok(self
            .registrations
            .lock()
            .unwrap()
            .get(wallet)
            .cloned()
            .unwrap_or_default())
    }

    async fn user_id_of(&self, wallet: &str) -> Result<String> {
        self.check_up()?;
        Ok(self
            .registrations
            .lock()
            .unwrap()
            .get(wallet)
            .map(|r| r.user_id.clone())
            .unwrap_or_default())
    }

    async fn owner(&self) -> Result<String> {
        self.check_up()?;
        Ok(self.owner.lock().unwrap().clone())
    }

    async fn purchase_event(
        &self,
        tx_hash: &str,
        expected_wallet: Option<&str>,
    ) -> Result<PurchaseEvent> {
        self.check_up()?;
        let event = self
            .events
            .lock()
            .unwrap()
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| Error::TxNotFound(tx_hash.to_string()))?;

        if let Some(expected) = expected_wallet {
            if !event.wallet.eq_ignore_ascii_case(expected) {
                return Err(Error::EventUserMismatch);
            }
        }

        Ok(event)
    }

    async fn purchase_logs(&self, wallet: &str, _lookback_blocks: u64) -> Result<Vec<PurchaseEvent>> {
        self.check_up()?;
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(wallet)
            .cloned()
            .unwrap_or_default())
    }

    async fn token_decimals(&self) -> u32 {
        self.decimals.load(Ordering::SeqCst)
    }
}
