// Copyright (c) 2025 The Lode Foundation

//! Service configuration and accrual policy tunables.

use serde::{Deserialize, Serialize};

use crate::types::is_valid_address;

/// Policy knobs for the accrual engine.
///
/// These are deployment policy, not domain law: in particular the weird-rate
/// threshold is a heuristic for catching corrupted rows and should be tuned
/// per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccrualPolicy {
    /// Eligible accrual days for a new purchase.
    #[serde(default = "default_total_days")]
    pub default_total_days: i64,

    /// Stored daily rates above this are considered corrupted and re-derived
    /// from the original transaction.
    #[serde(default = "default_weird_rate_max")]
    pub weird_rate_max: i64,

    /// Token decimals assumed when the payment token cannot be resolved.
    #[serde(default = "default_fallback_decimals")]
    pub fallback_decimals: u32,

    /// Approximate blocks per day, used to convert a lookback window in days
    /// to a block range for historical log imports.
    #[serde(default = "default_blocks_per_day")]
    pub blocks_per_day: u64,
}

fn default_total_days() -> i64 {
    30
}

fn default_weird_rate_max() -> i64 {
    100_000
}

fn default_fallback_decimals() -> u32 {
    18
}

fn default_blocks_per_day() -> u64 {
    7_200 // ~12s blocks
}

impl Default for AccrualPolicy {
    fn default() -> Self {
        Self {
            default_total_days: default_total_days(),
            weird_rate_max: default_weird_rate_max(),
            fallback_decimals: default_fallback_decimals(),
            blocks_per_day: default_blocks_per_day(),
        }
    }
}

/// Loyalty service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// JSON-RPC endpoint for the chain.
    pub rpc_url: String,

    /// Platform contract address.
    pub contract_address: String,

    /// Path to the SQLite ledger database.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Minimum seconds between chain syncs for the same wallet (anti-spam
    /// guard, not a correctness mechanism).
    #[serde(default = "default_sync_rate_limit_secs")]
    pub sync_rate_limit_secs: u64,

    /// Signed-request freshness window in seconds (applied as +/-).
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: i64,

    /// Accrual policy tunables.
    #[serde(default)]
    pub accrual: AccrualPolicy,
}

fn default_db_path() -> String {
    "loyalty.db".to_string()
}

fn default_sync_rate_limit_secs() -> u64 {
    60
}

fn default_freshness_window_secs() -> i64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            contract_address: "0x0000000000000000000000000000000000000000".to_string(),
            db_path: default_db_path(),
            sync_rate_limit_secs: default_sync_rate_limit_secs(),
            freshness_window_secs: default_freshness_window_secs(),
            accrual: AccrualPolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::InvalidInput(format!("Failed to read config: {}", e)))?;
        let config: ServiceConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::InvalidInput(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.rpc_url.is_empty() {
            return Err(crate::Error::InvalidInput(
                "rpc_url must be specified".to_string(),
            ));
        }

        if !is_valid_address(&self.contract_address) {
            return Err(crate::Error::InvalidInput(format!(
                "contract_address is not a valid address: {}",
                self.contract_address
            )));
        }

        if self.accrual.default_total_days <= 0 {
            return Err(crate::Error::InvalidInput(
                "accrual.default_total_days must be positive".to_string(),
            ));
        }

        if self.accrual.weird_rate_max <= 0 {
            return Err(crate::Error::InvalidInput(
                "accrual.weird_rate_max must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_policy() {
        let policy = AccrualPolicy::default();
        assert_eq!(policy.default_total_days, 30);
        assert_eq!(policy.weird_rate_max, 100_000);
        assert_eq!(policy.fallback_decimals, 18);
        assert_eq!(policy.blocks_per_day, 7_200);
    }

    #[test]
    fn validate_rejects_bad_contract() {
        let config = ServiceConfig {
            contract_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
rpc_url = "http://localhost:8545"
contract_address = "0xabcdef0000000000000000000000000000000001"

[accrual]
weird_rate_max = 50000
"#
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.accrual.weird_rate_max, 50_000);
        // Unspecified fields fall back to defaults
        assert_eq!(config.accrual.default_total_days, 30);
        assert_eq!(config.sync_rate_limit_secs, 60);
        assert_eq!(config.db_path, "loyalty.db");
    }
}
