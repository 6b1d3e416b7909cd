//! Per-wallet sync rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries are pruned once the map grows past this, keeping memory bounded
/// no matter how many distinct wallets probe the service.
const PRUNE_THRESHOLD: usize = 10_000;

/// Tracks the last accepted sync per wallet and refuses repeats inside the
/// cooldown window. An anti-spam guard, not a correctness mechanism: a
/// refused sync reports the stored state unchanged.
pub struct SyncGuard {
    cooldown: Duration,
    last_sync: Mutex<HashMap<String, Instant>>,
}

impl SyncGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sync: Mutex::new(HashMap::new()),
        }
    }

    /// Try to start a sync for a wallet. Returns false while the wallet is
    /// still cooling down from its last accepted sync.
    pub fn try_acquire(&self, wallet: &str) -> bool {
        self.try_acquire_at(wallet, Instant::now())
    }

    fn try_acquire_at(&self, wallet: &str, now: Instant) -> bool {
        let mut map = self.last_sync.lock().expect("sync guard lock poisoned");

        if let Some(last) = map.get(wallet) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }

        if map.len() >= PRUNE_THRESHOLD {
            let cooldown = self.cooldown;
            map.retain(|_, last| now.duration_since(*last) < cooldown);
        }

        map.insert(wallet.to_string(), now);
        true
    }

    /// Give back a slot whose sync did not complete, so a transient failure
    /// does not lock the wallet out for the whole cooldown.
    pub fn release(&self, wallet: &str) {
        if let Ok(mut map) = self.last_sync.lock() {
            map.remove(wallet);
        }
    }
}
