//! Chain reads against the platform contract.
//!
//! All access is plain JSON-RPC over HTTP. The contract surface is a few
//! view functions plus the miner-purchase event; responses are decoded with
//! the helpers in [`crate::abi`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lode_loyalty_core::types::{canonical_user_id, canonical_wallet, is_zero_address};
use lode_loyalty_core::{Error, PurchaseEvent, Registration, Result};
use serde_json::{json, Value};

use crate::abi;

/// Event emitted by the platform contract for each miner purchase:
/// `MinerPurchased(address indexed buyer, uint256 amount, uint256 startTime)`.
pub const PURCHASE_EVENT_SIG: &str = "MinerPurchased(address,uint256,uint256)";

const FN_IS_REGISTERED: &str = "isRegistered(address)";
const FN_USER_ID_OF: &str = "userIdOf(address)";
const FN_REFERRER_OF: &str = "referrerOf(address)";
const FN_OWNER: &str = "owner()";
const FN_PAYMENT_TOKEN: &str = "paymentToken()";
const FN_DECIMALS: &str = "decimals()";

/// Read-only view of the platform contract.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// On-chain registration facts for a wallet. The referrer field is empty
    /// when the contract reports the zero address.
    async fn registration(&self, wallet: &str) -> Result<Registration>;

    /// The user identifier assigned to a wallet, upper-cased.
    async fn user_id_of(&self, wallet: &str) -> Result<String>;

    /// The contract owner address (admin gate), lower-cased.
    async fn owner(&self) -> Result<String>;

    /// Locate and decode the purchase event in a transaction.
    ///
    /// Returns `TxNotFound` if the transaction is missing or reverted,
    /// `EventNotFound` if no matching log exists, and `EventUserMismatch`
    /// if `expected_wallet` is given and the decoded buyer differs.
    async fn purchase_event(
        &self,
        tx_hash: &str,
        expected_wallet: Option<&str>,
    ) -> Result<PurchaseEvent>;

    /// Historical purchase events for a wallet over the last
    /// `lookback_blocks` blocks.
    async fn purchase_logs(&self, wallet: &str, lookback_blocks: u64) -> Result<Vec<PurchaseEvent>>;

    /// Decimal precision of the payment token. Never fails: falls back to
    /// the configured default when the token cannot be resolved.
    async fn token_decimals(&self) -> u32;
}

/// JSON-RPC implementation of [`ChainReader`].
pub struct RpcChainReader {
    client: reqwest::Client,
    rpc_url: String,
    contract: String,
    fallback_decimals: u32,
    /// Discovered token decimals, cached for the process lifetime. Only
    /// successful probes are cached so a transient failure can be retried.
    cached_decimals: Mutex<Option<u32>>,
}

impl RpcChainReader {
    /// Create a reader for one platform contract.
    pub fn new(rpc_url: &str, contract: &str, fallback_decimals: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::ChainRead(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract: canonical_wallet(contract),
            fallback_decimals,
            cached_decimals: Mutex::new(None),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let response: Value = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| Error::ChainRead(format!("{}: {}", method, e)))?
            .json()
            .await
            .map_err(|e| Error::ChainRead(format!("{}: {}", method, e)))?;

        if let Some(err) = response.get("error") {
            return Err(Error::ChainRead(format!("{}: {}", method, err)));
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| Error::ChainRead(format!("{}: no result in response", method)))
    }

    async fn eth_call(&self, to: &str, data: String) -> Result<Vec<u8>> {
        let result = self
            .rpc("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| Error::ChainRead("eth_call: non-string result".to_string()))?;
        abi::decode_hex(hex_str).map_err(|e| Error::ChainRead(format!("eth_call: {}", e)))
    }

    async fn call_contract(&self, signature: &str, address_args: &[&str]) -> Result<Vec<u8>> {
        let data = abi::call_data(signature, address_args)?;
        self.eth_call(&self.contract, data).await
    }

    async fn probe_decimals(&self) -> Result<u32> {
        let token_word = self.call_contract(FN_PAYMENT_TOKEN, &[]).await?;
        let token = abi::decode_address(abi::word(&token_word, 0)?);
        if is_zero_address(&token) {
            return Err(Error::ChainRead("payment token address unset".to_string()));
        }

        let data = abi::call_data(FN_DECIMALS, &[])?;
        let decimals_word = self.eth_call(&token, data).await?;
        let decimals = abi::decode_u256(abi::word(&decimals_word, 0)?);
        if decimals > primitive_types::U256::from(77u64) {
            return Err(Error::ChainRead(format!(
                "implausible token decimals: {}",
                decimals
            )));
        }
        Ok(decimals.as_u32())
    }

    fn decode_purchase_log(&self, log: &Value) -> Result<PurchaseEvent> {
        let topics = log
            .get("topics")
            .and_then(|t| t.as_array())
            .ok_or_else(|| Error::ChainRead("log has no topics".to_string()))?;

        let buyer_topic = topics
            .get(1)
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::ChainRead("purchase log missing buyer topic".to_string()))?;
        let buyer_bytes = abi::decode_hex(buyer_topic)?;
        let wallet = abi::decode_address(abi::word(&buyer_bytes, 0)?);

        let data_hex = log
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::ChainRead("purchase log missing data".to_string()))?;
        let data = abi::decode_hex(data_hex)?;

        let raw_amount = abi::decode_u256(abi::word(&data, 0)?);
        let start_time = abi::decode_u256(abi::word(&data, 1)?);
        if start_time > primitive_types::U256::from(i64::MAX as u64) {
            return Err(Error::ChainRead("purchase start time out of range".to_string()));
        }

        let tx_hash = log
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        Ok(PurchaseEvent {
            tx_hash,
            wallet,
            raw_amount,
            start_time: start_time.as_u64() as i64,
        })
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn registration(&self, wallet: &str) -> Result<Registration> {
        let registered_word = self.call_contract(FN_IS_REGISTERED, &[wallet]).await?;
        let registered = abi::decode_bool(abi::word(&registered_word, 0)?);
        if !registered {
            return Ok(Registration::default());
        }

        let user_id_data = self.call_contract(FN_USER_ID_OF, &[wallet]).await?;
        let user_id = canonical_user_id(&abi::decode_string(&user_id_data)?);

        let referrer_word = self.call_contract(FN_REFERRER_OF, &[wallet]).await?;
        let referrer = abi::decode_address(abi::word(&referrer_word, 0)?);
        let referrer_wallet = if is_zero_address(&referrer) {
            String::new()
        } else {
            referrer
        };

        Ok(Registration {
            registered: true,
            user_id,
            referrer_wallet,
        })
    }

    async fn user_id_of(&self, wallet: &str) -> Result<String> {
        let data = self.call_contract(FN_USER_ID_OF, &[wallet]).await?;
        Ok(canonical_user_id(&abi::decode_string(&data)?))
    }

    async fn owner(&self) -> Result<String> {
        let word = self.call_contract(FN_OWNER, &[]).await?;
        Ok(abi::decode_address(abi::word(&word, 0)?))
    }

    async fn purchase_event(
        &self,
        tx_hash: &str,
        expected_wallet: Option<&str>,
    ) -> Result<PurchaseEvent> {
        let receipt = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if receipt.is_null() {
            return Err(Error::TxNotFound(tx_hash.to_string()));
        }

        let status = receipt.get("status").and_then(|s| s.as_str()).unwrap_or("");
        if status != "0x1" {
            return Err(Error::TxNotFound(format!("{} (reverted)", tx_hash)));
        }

        let logs = receipt
            .get("logs")
            .and_then(|l| l.as_array())
            .ok_or_else(|| Error::ChainRead("receipt has no logs field".to_string()))?;

        let topic0 = abi::event_topic(PURCHASE_EVENT_SIG);
        let matching = logs.iter().find(|log| {
            let address_ok = log
                .get("address")
                .and_then(|a| a.as_str())
                .map(|a| a.eq_ignore_ascii_case(&self.contract))
                .unwrap_or(false);
            let topic_ok = log
                .get("topics")
                .and_then(|t| t.as_array())
                .and_then(|t| t.first())
                .and_then(|t| t.as_str())
                .map(|t| t.eq_ignore_ascii_case(&topic0))
                .unwrap_or(false);
            address_ok && topic_ok
        });

        let log = matching.ok_or_else(|| Error::EventNotFound(tx_hash.to_string()))?;
        let mut event = self.decode_purchase_log(log)?;
        event.tx_hash = tx_hash.to_ascii_lowercase();

        if let Some(expected) = expected_wallet {
            if !event.wallet.eq_ignore_ascii_case(expected) {
                return Err(Error::EventUserMismatch);
            }
        }

        Ok(event)
    }

    async fn purchase_logs(&self, wallet: &str, lookback_blocks: u64) -> Result<Vec<PurchaseEvent>> {
        let latest_hex = self.rpc("eth_blockNumber", json!([])).await?;
        let latest = abi::parse_quantity(
            latest_hex
                .as_str()
                .ok_or_else(|| Error::ChainRead("eth_blockNumber: non-string result".to_string()))?,
        )?;
        let from_block = latest.saturating_sub(lookback_blocks);

        let filter = json!([{
            "address": self.contract,
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": "latest",
            "topics": [
                abi::event_topic(PURCHASE_EVENT_SIG),
                abi::address_topic(wallet)?,
            ],
        }]);

        let result = self.rpc("eth_getLogs", filter).await?;
        let logs = result
            .as_array()
            .ok_or_else(|| Error::ChainRead("eth_getLogs: non-array result".to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            match self.decode_purchase_log(log) {
                Ok(event) => events.push(event),
                // A single malformed log must not sink the whole import
                Err(e) => tracing::warn!("Skipping undecodable purchase log: {}", e),
            }
        }

        Ok(events)
    }

    async fn token_decimals(&self) -> u32 {
        // A poisoned cache must not take this path down; worst case the
        // probe just runs again on every call
        if let Ok(cached) = self.cached_decimals.lock() {
            if let Some(decimals) = *cached {
                return decimals;
            }
        }

        match self.probe_decimals().await {
            Ok(decimals) => {
                if let Ok(mut cached) = self.cached_decimals.lock() {
                    *cached = Some(decimals);
                }
                decimals
            }
            Err(e) => {
                tracing::warn!(
                    "Token decimals probe failed, assuming {}: {}",
                    self.fallback_decimals,
                    e
                );
                self.fallback_decimals
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    fn reader() -> RpcChainReader {
        RpcChainReader::new(
            "http://localhost:8545",
            "0xAbCdEF0000000000000000000000000000000001",
            18,
        )
        .unwrap()
    }

    #[test]
    fn contract_address_is_canonicalized() {
        let reader = reader();
        assert_eq!(reader.contract, "0xabcdef0000000000000000000000000000000001");
    }

    #[test]
    fn decode_purchase_log_extracts_fields() {
        let reader = reader();

        let buyer = "0x00000000000000000000000011112222333344445555666677778888999900aa";
        let mut data = vec![0u8; 64];
        // amount = 30e18
        let amount = U256::from(30u64) * U256::exp10(18);
        amount.to_big_endian(&mut data[..32]);
        // startTime = 1735689600 (2025-01-01)
        U256::from(1_735_689_600u64).to_big_endian(&mut data[32..]);

        let log = json!({
            "address": "0xabcdef0000000000000000000000000000000001",
            "topics": [abi::event_topic(PURCHASE_EVENT_SIG), buyer],
            "data": format!("0x{}", hex::encode(&data)),
            "transactionHash": format!("0x{}", "1".repeat(64)),
        });

        let event = reader.decode_purchase_log(&log).unwrap();
        assert_eq!(event.wallet, "0x11112222333344445555666677778888999900aa");
        assert_eq!(event.raw_amount, amount);
        assert_eq!(event.start_time, 1_735_689_600);
    }

    #[tokio::test]
    async fn poisoned_decimals_cache_falls_back() {
        // Discard port, nothing listens there
        let reader = RpcChainReader::new(
            "http://127.0.0.1:9",
            "0xabcdef0000000000000000000000000000000001",
            18,
        )
        .unwrap();

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = reader.cached_decimals.lock().unwrap();
            panic!("poison the cache");
        }));
        assert!(reader.cached_decimals.lock().is_err());

        // Probe fails (no server) and the fallback is reported, no panic
        assert_eq!(reader.token_decimals().await, 18);
    }

    #[test]
    fn decode_purchase_log_rejects_short_data() {
        let reader = reader();
        let log = json!({
            "address": "0xabcdef0000000000000000000000000000000001",
            "topics": [abi::event_topic(PURCHASE_EVENT_SIG)],
            "data": "0x00",
        });
        assert!(reader.decode_purchase_log(&log).is_err());
    }
}
