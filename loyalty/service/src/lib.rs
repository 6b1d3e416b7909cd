// Copyright (c) 2025 The Lode Foundation

//! Lode loyalty service library.
//!
//! The service mirrors selected on-chain facts into a SQLite ledger and runs
//! day-based accrual arithmetic for logins, referrals, and miner-purchase
//! reward streams. Modules:
//!
//! - [`db`] - the relational ledger store
//! - [`chain`] - JSON-RPC reads against the platform contract
//! - [`accrual`] - daily-rate derivation, pending-day crediting, self-heal
//! - [`admin`] - import, normalization, and reconciliation tools
//! - [`auth`] - wallet-signed request verification
//! - [`ops`] - the inbound actions (sync, login, record-purchase, stats)

pub mod abi;
pub mod accrual;
pub mod admin;
pub mod auth;
pub mod chain;
pub mod db;
pub mod ops;
pub mod ratelimit;

#[cfg(test)]
pub(crate) mod testutil;
