//! Operator CLI for the Lode loyalty service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lode_loyalty_core::types::canonical_wallet;
use lode_loyalty_core::ServiceConfig;
use lode_loyalty_service::admin::AdminTools;
use lode_loyalty_service::chain::RpcChainReader;
use lode_loyalty_service::db::Ledger;
use lode_loyalty_service::ops::LoyaltyService;

#[derive(Parser)]
#[command(name = "lode-loyalty")]
#[command(about = "Lode loyalty program accrual and reconciliation service")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "loyalty.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the database schema
    Migrate,

    /// Parse and validate the configuration file
    ValidateConfig,

    /// Settle pending accrual for a wallet and print its breakdown
    Stats {
        /// Wallet address
        wallet: String,
    },

    /// Import missing purchases, heal rates, settle accrual, and correct
    /// the stored balance for a user
    Reconcile {
        /// Wallet address or assigned user id
        user: String,

        /// Chain history window for the import step, in days
        #[arg(long, default_value_t = 90)]
        lookback_days: u64,
    },

    /// Import purchase events from chain history
    Import {
        /// Wallet address
        wallet: String,

        /// Chain history window, in days
        #[arg(long, default_value_t = 90)]
        lookback_days: u64,
    },

    /// Re-derive implausible stored daily rates from chain transactions
    Normalize {
        /// Wallet address
        wallet: String,
    },

    /// Apply an audited manual coin delta to a wallet
    AdjustCoins {
        /// Wallet address
        wallet: String,

        /// Coin delta (may be negative)
        #[arg(allow_hyphen_values = true)]
        delta: i64,

        /// Reason recorded in the audit trail
        #[arg(long)]
        reason: String,
    },

    /// Apply an audited manual mining delta to a wallet
    AdjustMining {
        /// Wallet address
        wallet: String,

        /// Coin delta (may be negative)
        #[arg(allow_hyphen_values = true)]
        delta: i64,

        /// Reason recorded in the audit trail
        #[arg(long)]
        reason: String,
    },

    /// Inject a synthetic purchase row with no chain transaction behind it
    ForcePurchase {
        /// Wallet address
        wallet: String,

        /// Daily accrual rate in whole coins
        daily_coins: i64,

        /// Accrual start date (YYYY-MM-DD)
        start_date: NaiveDate,

        /// Total eligible accrual days
        #[arg(long, default_value_t = 30)]
        total_days: i64,
    },

    /// Delete a purchase row and claw back its credited coins
    DeletePurchase {
        /// Purchase row id
        id: i64,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::ValidateConfig) {
        let config = ServiceConfig::from_file(&cli.config)
            .with_context(|| format!("invalid config at {}", cli.config.display()))?;
        println!("Configuration OK");
        println!("  rpc_url: {}", config.rpc_url);
        println!("  contract: {}", config.contract_address);
        println!("  db_path: {}", config.db_path);
        return Ok(());
    }

    let config = ServiceConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config at {}", cli.config.display()))?;

    let db = Ledger::open(&config.db_path).context("failed to open ledger database")?;
    db.migrate().context("failed to migrate ledger database")?;

    let chain = Arc::new(RpcChainReader::new(
        &config.rpc_url,
        &config.contract_address,
        config.accrual.fallback_decimals,
    )?);
    let admin = AdminTools::new(db.clone(), chain.clone(), config.accrual.clone());

    // Manual deltas applied from the CLI are attributed to the operator
    const CLI_OPERATOR: &str = "cli";

    match cli.command {
        Commands::ValidateConfig => unreachable!("handled above"),

        Commands::Migrate => {
            info!("Schema is up to date at {}", config.db_path);
        }

        Commands::Stats { wallet } => {
            let service = LoyaltyService::new(db, chain, config);
            let report = service.stats_for_wallet(&wallet).await?;
            print_json(&report)?;
        }

        Commands::Reconcile {
            user,
            lookback_days,
        } => {
            let report = admin.reconcile_user(&user, lookback_days).await?;
            print_json(&report)?;
        }

        Commands::Import {
            wallet,
            lookback_days,
        } => {
            let imported = admin
                .import_from_logs(&canonical_wallet(&wallet), lookback_days)
                .await?;
            println!("Imported {} purchase(s)", imported);
        }

        Commands::Normalize { wallet } => {
            let normalized = admin.bulk_normalize(&canonical_wallet(&wallet)).await?;
            println!("Normalized {} purchase rate(s)", normalized);
        }

        Commands::AdjustCoins {
            wallet,
            delta,
            reason,
        } => {
            let balance =
                admin.adjust_coins(&canonical_wallet(&wallet), delta, &reason, CLI_OPERATOR)?;
            println!("New balance: {}", balance);
        }

        Commands::AdjustMining {
            wallet,
            delta,
            reason,
        } => {
            let balance =
                admin.adjust_mining(&canonical_wallet(&wallet), delta, &reason, CLI_OPERATOR)?;
            println!("New balance: {}", balance);
        }

        Commands::ForcePurchase {
            wallet,
            daily_coins,
            start_date,
            total_days,
        } => {
            admin.force_purchase(&canonical_wallet(&wallet), daily_coins, total_days, start_date)?;
            println!("Purchase injected");
        }

        Commands::DeletePurchase { id } => {
            let deduction = admin.delete_purchase(id)?;
            println!("Deleted purchase {}, clawed back {} coin(s)", id, deduction);
        }
    }

    Ok(())
}
