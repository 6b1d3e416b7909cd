// Copyright (c) 2025 The Lode Foundation

//! Core types for the Lode loyalty program backend.
//!
//! This crate holds the domain model shared by the service and its tools:
//! the ledger entities, the accrual policy knobs, the service configuration,
//! and the error taxonomy.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AccrualPolicy, ServiceConfig};
pub use error::{Error, Result};
pub use types::{
    CreditState, LoginRecord, MiningPurchase, PurchaseEvent, ReferralReward, Registration, User,
    LOGIN_REWARD_COINS, REFERRAL_REWARD_COINS, ZERO_ADDRESS,
};
