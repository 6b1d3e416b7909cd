// Copyright (c) 2025 The Lode Foundation

//! SQLite ledger store for the loyalty program.
//!
//! Every multi-statement mutation (login + balance bump, credits + balance
//! bump, audit row + balance bump) runs inside one transaction so a partial
//! failure can never credit a balance without its underlying ledger row.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use lode_loyalty_core::{Error, MiningPurchase, Result, User};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

/// One guarded `credited_days` increment, prepared by the accrual engine.
#[derive(Debug, Clone)]
pub struct CreditUpdate {
    /// Purchase row to update.
    pub purchase_id: i64,
    /// The `credited_days` value observed when pending days were computed.
    /// The update only applies if the row still holds this value.
    pub observed_credited_days: i64,
    /// Days to credit now.
    pub pending_days: i64,
    /// Effective daily rate for the coin delta.
    pub daily_coins: i64,
    /// Date stamped into `last_credit_date`.
    pub credit_date: NaiveDate,
}

/// Ledger database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

fn lock_err<T>(_: T) -> Error {
    Error::Store("ledger lock poisoned".to_string())
}

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

impl Ledger {
    /// Open or create the database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Ensure the schema exists. Idempotent and cheap enough to run on every
    /// startup; "already exists" is success, not error.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                wallet TEXT PRIMARY KEY,
                user_id TEXT UNIQUE,
                referrer_id TEXT,
                coin_balance INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS logins (
                wallet TEXT NOT NULL,
                login_date TEXT NOT NULL,
                PRIMARY KEY (wallet, login_date)
            );

            CREATE TABLE IF NOT EXISTS referral_rewards (
                referred_wallet TEXT PRIMARY KEY,
                referrer_id TEXT NOT NULL,
                amount INTEGER NOT NULL DEFAULT 5,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_referral_referrer ON referral_rewards(referrer_id);

            CREATE TABLE IF NOT EXISTS mining_purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_hash TEXT UNIQUE,
                wallet TEXT NOT NULL,
                daily_coins INTEGER NOT NULL,
                total_days INTEGER NOT NULL DEFAULT 30,
                credited_days INTEGER NOT NULL DEFAULT 0,
                start_date TEXT NOT NULL,
                last_credit_date TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_purchases_wallet ON mining_purchases(wallet);

            CREATE TABLE IF NOT EXISTS admin_coin_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet TEXT NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                admin_address TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_wallet ON admin_coin_audit(wallet);

            CREATE TABLE IF NOT EXISTS mining_adjustments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet TEXT NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                admin_address TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_adjustments_wallet ON mining_adjustments(wallet);
            "#,
        )
        .map_err(store_err)?;

        // Columns added after initial deployment. Failure means the column
        // already exists, which is fine.
        let _ = conn.execute(
            "ALTER TABLE users ADD COLUMN is_active INTEGER NOT NULL DEFAULT 1",
            [],
        );
        let _ = conn.execute("ALTER TABLE mining_purchases ADD COLUMN last_credit_date TEXT", []);

        Ok(())
    }

    /// Insert or refresh a user from on-chain facts, keyed on wallet.
    ///
    /// An existing referrer id is never cleared by a sync that could not
    /// resolve one.
    pub fn upsert_user(
        &self,
        wallet: &str,
        user_id: &str,
        referrer_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_err)?;

        conn.execute(
            r#"
            INSERT INTO users (wallet, user_id, referrer_id, coin_balance, is_active, created_at)
            VALUES (?1, ?2, ?3, 0, 1, ?4)
            ON CONFLICT(wallet) DO UPDATE SET
                user_id = excluded.user_id,
                referrer_id = COALESCE(excluded.referrer_id, users.referrer_id),
                is_active = 1
            "#,
            params![wallet, user_id, referrer_id, Utc::now().timestamp()],
        )
        .map_err(store_err)?;

        Ok(())
    }

    /// Get a user by wallet address.
    pub fn get_user(&self, wallet: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(
            "SELECT wallet, user_id, referrer_id, coin_balance, is_active, created_at
             FROM users WHERE wallet = ?1",
            params![wallet],
            Self::row_to_user,
        )
        .optional()
        .map_err(store_err)
    }

    /// Get a user by assigned user identifier.
    pub fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(
            "SELECT wallet, user_id, referrer_id, coin_balance, is_active, created_at
             FROM users WHERE user_id = ?1",
            params![user_id],
            Self::row_to_user,
        )
        .optional()
        .map_err(store_err)
    }

    /// Record a login for a UTC calendar day and credit the daily coin.
    ///
    /// Returns true if this was the first login of the day; a repeat call
    /// inserts nothing and credits nothing.
    pub fn record_login(&self, wallet: &str, date: NaiveDate, reward: i64) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(store_err)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO logins (wallet, login_date) VALUES (?1, ?2)",
                params![wallet, date.to_string()],
            )
            .map_err(store_err)?;

        if inserted > 0 {
            tx.execute(
                "UPDATE users SET coin_balance = coin_balance + ?1, is_active = 1 WHERE wallet = ?2",
                params![reward, wallet],
            )
            .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)?;
        Ok(inserted > 0)
    }

    /// Whether a referral reward row already exists for a referred wallet.
    pub fn has_referral_reward(&self, referred_wallet: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM referral_rewards WHERE referred_wallet = ?1",
                params![referred_wallet],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count > 0)
    }

    /// Create the one-time referral reward for a referred wallet and credit
    /// the referrer's balance, as one unit.
    ///
    /// Returns false (and credits nothing) if a reward row already exists.
    pub fn insert_referral_reward(
        &self,
        referred_wallet: &str,
        referrer_id: &str,
        amount: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(store_err)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO referral_rewards
                     (referred_wallet, referrer_id, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![referred_wallet, referrer_id, amount, Utc::now().timestamp()],
            )
            .map_err(store_err)?;

        if inserted > 0 {
            tx.execute(
                "UPDATE users SET coin_balance = coin_balance + ?1 WHERE user_id = ?2",
                params![amount, referrer_id],
            )
            .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)?;
        Ok(inserted > 0)
    }

    /// Insert a mining purchase. Returns false if the transaction hash is
    /// already recorded (idempotent duplicate guard).
    pub fn insert_purchase(
        &self,
        tx_hash: Option<&str>,
        wallet: &str,
        daily_coins: i64,
        total_days: i64,
        start_date: NaiveDate,
    ) -> Result<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO mining_purchases
                     (tx_hash, wallet, daily_coins, total_days, credited_days,
                      start_date, last_credit_date, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?6)",
                params![
                    tx_hash,
                    wallet,
                    daily_coins,
                    total_days,
                    start_date.to_string(),
                    Utc::now().timestamp(),
                ],
            )
            .map_err(store_err)?;

        Ok(inserted > 0)
    }

    /// Get a purchase row by transaction hash.
    pub fn get_purchase_by_tx(&self, tx_hash: &str) -> Result<Option<MiningPurchase>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(
            &format!("{} WHERE tx_hash = ?1", Self::SELECT_PURCHASE),
            params![tx_hash],
            Self::row_to_purchase,
        )
        .optional()
        .map_err(store_err)
    }

    /// Get a purchase row by id.
    pub fn get_purchase(&self, id: i64) -> Result<Option<MiningPurchase>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(
            &format!("{} WHERE id = ?1", Self::SELECT_PURCHASE),
            params![id],
            Self::row_to_purchase,
        )
        .optional()
        .map_err(store_err)
    }

    /// All purchase rows for a wallet, oldest first.
    pub fn purchases_for_wallet(&self, wallet: &str) -> Result<Vec<MiningPurchase>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE wallet = ?1 ORDER BY created_at ASC, id ASC",
                Self::SELECT_PURCHASE
            ))
            .map_err(store_err)?;

        let purchases = stmt
            .query_map(params![wallet], Self::row_to_purchase)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        Ok(purchases)
    }

    /// Correct a purchase row's daily rate in place (rate self-heal).
    pub fn set_purchase_rate(&self, id: i64, daily_coins: i64) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "UPDATE mining_purchases SET daily_coins = ?1 WHERE id = ?2",
            params![daily_coins, id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Apply a batch of credit updates and the aggregate balance bump as one
    /// transaction.
    ///
    /// Each row update is guarded on the observed `credited_days` and on the
    /// `total_days` cap; a row that lost a concurrent race applies nothing
    /// and contributes nothing to the balance write. Returns the coin delta
    /// actually applied.
    pub fn apply_credits(&self, wallet: &str, updates: &[CreditUpdate]) -> Result<i64> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(store_err)?;

        let mut delta: i64 = 0;
        for update in updates {
            let applied = tx
                .execute(
                    "UPDATE mining_purchases
                     SET credited_days = credited_days + ?1, last_credit_date = ?2
                     WHERE id = ?3
                       AND credited_days = ?4
                       AND credited_days + ?1 <= total_days",
                    params![
                        update.pending_days,
                        update.credit_date.to_string(),
                        update.purchase_id,
                        update.observed_credited_days,
                    ],
                )
                .map_err(store_err)?;

            if applied > 0 {
                delta += update.pending_days.saturating_mul(update.daily_coins);
            }
        }

        if delta != 0 {
            tx.execute(
                "UPDATE users SET coin_balance = coin_balance + ?1 WHERE wallet = ?2",
                params![delta, wallet],
            )
            .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)?;
        Ok(delta)
    }

    /// Number of login-day rows for a wallet.
    pub fn login_count(&self, wallet: &str) -> Result<i64> {
        self.scalar(
            "SELECT COUNT(*) FROM logins WHERE wallet = ?1",
            wallet,
        )
    }

    /// Total referral coins earned by a user id as a referrer.
    pub fn referral_sum(&self, referrer_id: &str) -> Result<i64> {
        self.scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM referral_rewards WHERE referrer_id = ?1",
            referrer_id,
        )
    }

    /// Total coins mined so far across all purchase rows of a wallet.
    pub fn mined_sum(&self, wallet: &str) -> Result<i64> {
        self.scalar(
            "SELECT COALESCE(SUM(daily_coins * credited_days), 0)
             FROM mining_purchases WHERE wallet = ?1",
            wallet,
        )
    }

    /// Total manual admin coin deltas for a wallet.
    pub fn audit_sum(&self, wallet: &str) -> Result<i64> {
        self.scalar(
            "SELECT COALESCE(SUM(delta), 0) FROM admin_coin_audit WHERE wallet = ?1",
            wallet,
        )
    }

    /// Total manual mining adjustments for a wallet.
    pub fn adjustment_sum(&self, wallet: &str) -> Result<i64> {
        self.scalar(
            "SELECT COALESCE(SUM(delta), 0) FROM mining_adjustments WHERE wallet = ?1",
            wallet,
        )
    }

    /// Overwrite a user's stored balance (reconciliation only).
    pub fn set_balance(&self, wallet: &str, balance: i64) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "UPDATE users SET coin_balance = ?1 WHERE wallet = ?2",
            params![balance, wallet],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Append an admin coin audit row and apply its delta, as one unit.
    /// Returns the new balance.
    pub fn add_coin_audit(
        &self,
        wallet: &str,
        delta: i64,
        reason: &str,
        admin_address: &str,
    ) -> Result<i64> {
        self.add_manual_delta("admin_coin_audit", wallet, delta, reason, admin_address)
    }

    /// Append a mining adjustment row and apply its delta, as one unit.
    /// Returns the new balance.
    pub fn add_mining_adjustment(
        &self,
        wallet: &str,
        delta: i64,
        reason: &str,
        admin_address: &str,
    ) -> Result<i64> {
        self.add_manual_delta("mining_adjustments", wallet, delta, reason, admin_address)
    }

    /// Delete a purchase row and deduct its already-credited coins, as one
    /// unit. Returns the deduction, or None if the row does not exist.
    pub fn delete_purchase(&self, id: i64) -> Result<Option<i64>> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(store_err)?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT wallet, daily_coins * credited_days FROM mining_purchases WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        let Some((wallet, deduction)) = row else {
            return Ok(None);
        };

        tx.execute("DELETE FROM mining_purchases WHERE id = ?1", params![id])
            .map_err(store_err)?;

        if deduction != 0 {
            tx.execute(
                "UPDATE users SET coin_balance = coin_balance - ?1 WHERE wallet = ?2",
                params![deduction, wallet],
            )
            .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)?;
        Ok(Some(deduction))
    }

    const SELECT_PURCHASE: &'static str =
        "SELECT id, tx_hash, wallet, daily_coins, total_days, credited_days,
                start_date, last_credit_date, created_at
         FROM mining_purchases";

    fn add_manual_delta(
        &self,
        table: &str,
        wallet: &str,
        delta: i64,
        reason: &str,
        admin_address: &str,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(store_err)?;

        tx.execute(
            &format!(
                "INSERT INTO {} (wallet, delta, reason, admin_address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            ),
            params![wallet, delta, reason, admin_address, Utc::now().timestamp()],
        )
        .map_err(store_err)?;

        tx.execute(
            "UPDATE users SET coin_balance = coin_balance + ?1 WHERE wallet = ?2",
            params![delta, wallet],
        )
        .map_err(store_err)?;

        let balance: i64 = tx
            .query_row(
                "SELECT coin_balance FROM users WHERE wallet = ?1",
                params![wallet],
                |row| row.get(0),
            )
            .map_err(store_err)?;

        tx.commit().map_err(store_err)?;
        Ok(balance)
    }

    fn scalar(&self, sql: &str, arg: &str) -> Result<i64> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(sql, params![arg], |row| row.get(0))
            .map_err(store_err)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            wallet: row.get(0)?,
            user_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            referrer_id: row.get(2)?,
            coin_balance: row.get(3)?,
            is_active: row.get::<_, i64>(4)? != 0,
            created_at: timestamp_to_datetime(row.get(5)?),
        })
    }

    fn row_to_purchase(row: &rusqlite::Row<'_>) -> rusqlite::Result<MiningPurchase> {
        let start_date: String = row.get(6)?;
        let last_credit_date: Option<String> = row.get(7)?;

        Ok(MiningPurchase {
            id: row.get(0)?,
            tx_hash: row.get(1)?,
            wallet: row.get(2)?,
            daily_coins: row.get(3)?,
            total_days: row.get(4)?,
            credited_days: row.get(5)?,
            start_date: parse_date(&start_date)?,
            last_credit_date: last_credit_date.as_deref().map(parse_date).transpose()?,
            created_at: timestamp_to_datetime(row.get(8)?),
        })
    }
}
