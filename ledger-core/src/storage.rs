//! PostgreSQL-backed ledger store
//!
//! Holds the `username -> balance` mapping and the append-only entry log.
//! The store keeps no in-process locks or caches: every cross-request
//! serialization goes through row locks taken inside a store transaction.
//!
//! Two kinds of API live here:
//!
//! - Pool-level reads and single-statement writes (`get_or_create`,
//!   `history`, `total_supply`, ...). Reads outside a transaction are
//!   snapshots and may be stale by the time the caller looks at them.
//! - Connection-level primitives (`lock_accounts`, `adjust_balance`,
//!   `append_entry`, ...) that take `&mut PgConnection` so the engines can
//!   compose several of them inside one `Transaction`. Dropping that
//!   transaction without committing rolls every step back.

use crate::config::DatabaseConfig;
use crate::types::{validate_user_facing, Account, LedgerEntry, SIGNUP_BONUS};
use crate::{LedgerError, Result};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) const ACCOUNT_COLUMNS: &str =
    "id, username, email, balance, created_at, updated_at";

pub(crate) const ENTRY_SELECT: &str = r#"
    SELECT e.id, f.username AS from_user, t.username AS to_user, e.amount, e.note, e.created_at
    FROM ledger_entries e
    JOIN accounts f ON f.id = e.from_account_id
    JOIN accounts t ON t.id = e.to_account_id
"#;

/// Global lock order for account rows: ascending by username, duplicates removed.
///
/// Every operation that touches more than one account locks in this order,
/// whatever the argument order, so two opposite-direction transfers can never
/// wait on each other in a cycle.
pub fn lock_order<'a>(usernames: &[&'a str]) -> Vec<&'a str> {
    let mut ordered = usernames.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}

/// Account rows held under an exclusive lock for the life of a transaction
#[derive(Debug, Default)]
pub struct LockedAccounts {
    rows: BTreeMap<String, Account>,
}

impl LockedAccounts {
    pub fn get(&self, username: &str) -> Option<&Account> {
        self.rows.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.rows.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn insert(&mut self, account: Account) {
        self.rows.insert(account.username.clone(), account);
    }
}

/// Durable ledger store
#[derive(Debug, Clone)]
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    /// Connect a pool using the database section of the configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            "Connected ledger store (max_connections={})",
            config.max_connections
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running ledger migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Open a store transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ------------------------------------------------------------------
    // Pool-level operations
    // ------------------------------------------------------------------

    pub async fn find_account(&self, username: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE username = $1", ACCOUNT_COLUMNS);
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    pub async fn find_account_by_id(&self, id: i64) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    /// Return the wallet, materializing it with the signup bonus if absent.
    ///
    /// Concurrent first references race on the unique username index; only
    /// the insert that wins mints the bonus, the others read the winner's row.
    pub async fn get_or_create(&self, username: &str) -> Result<Account> {
        Ok(self.open_account(username).await?.0)
    }

    /// Like `get_or_create`; the flag is true when this call minted the signup bonus
    pub async fn open_account(&self, username: &str) -> Result<(Account, bool)> {
        validate_user_facing(username)?;

        let mut conn = self.pool.acquire().await?;
        let (account, created) = Self::insert_if_absent(&mut conn, username, SIGNUP_BONUS).await?;
        if created {
            info!(
                "Created wallet {} with signup bonus of {} bean(s)",
                username, SIGNUP_BONUS
            );
        }
        Ok((account, created))
    }

    pub async fn balance(&self, username: &str) -> Result<i64> {
        self.find_account(username)
            .await?
            .map(|account| account.balance)
            .ok_or_else(|| LedgerError::UserNotFound(username.to_string()))
    }

    /// Administrative override. Writes no ledger entry.
    pub async fn set_balance(&self, username: &str, amount: i64) -> Result<Account> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let sql = format!(
            "UPDATE accounts SET balance = $2, updated_at = NOW() WHERE username = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(username)
            .bind(amount)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(username.to_string()))?;

        info!("Balance of {} set to {} by administrator", username, amount);
        Ok(account)
    }

    /// Sum of every balance, escrow included
    pub async fn total_supply(&self) -> Result<i64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(balance), 0)::BIGINT FROM accounts")
                .fetch_one(&self.pool)
                .await?;
        Ok(total)
    }

    pub async fn top_accounts(&self, limit: i64) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts ORDER BY balance DESC, username ASC LIMIT $1",
            ACCOUNT_COLUMNS
        );
        let accounts = sqlx::query_as::<_, Account>(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    /// Case-insensitive username prefix lookup
    pub async fn search_accounts(&self, prefix: &str, limit: i64) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE username ILIKE $1 ORDER BY username ASC LIMIT $2",
            ACCOUNT_COLUMNS
        );
        let accounts = sqlx::query_as::<_, Account>(&sql)
            .bind(format!("{}%", escape_like(prefix)))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(accounts)
    }

    /// Every entry the user sent or received, newest first
    pub async fn history(&self, username: &str) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "{} WHERE f.username = $1 OR t.username = $1 ORDER BY e.created_at DESC, e.id DESC",
            ENTRY_SELECT
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(username)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    /// Latest entries across all accounts
    pub async fn recent_entries(&self, limit: i64) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "{} ORDER BY e.created_at DESC, e.id DESC LIMIT $1",
            ENTRY_SELECT
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Transaction primitives
    // ------------------------------------------------------------------

    /// Take exclusive row locks on the named accounts in [`lock_order`].
    ///
    /// Names that do not exist are simply absent from the result; the caller
    /// decides whether that is an error.
    pub async fn lock_accounts(
        conn: &mut PgConnection,
        usernames: &[&str],
    ) -> Result<LockedAccounts> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE username = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        );

        let mut locked = LockedAccounts::default();
        for username in lock_order(usernames) {
            let row = sqlx::query_as::<_, Account>(&sql)
                .bind(username)
                .fetch_optional(&mut *conn)
                .await?;
            if let Some(account) = row {
                locked.insert(account);
            }
        }

        debug!("Locked {} account row(s)", locked.len());
        Ok(locked)
    }

    pub async fn lock_account_by_id(conn: &mut PgConnection, id: i64) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(account)
    }

    /// Insert the account with `opening_balance` unless it already exists.
    ///
    /// Returns the row and whether this call created it. A conflicting
    /// in-flight insert makes this wait for the other transaction to finish.
    pub async fn insert_if_absent(
        conn: &mut PgConnection,
        username: &str,
        opening_balance: i64,
    ) -> Result<(Account, bool)> {
        let insert = format!(
            "INSERT INTO accounts (username, balance) VALUES ($1, $2) \
             ON CONFLICT (username) DO NOTHING RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let created = sqlx::query_as::<_, Account>(&insert)
            .bind(username)
            .bind(opening_balance)
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(account) = created {
            return Ok((account, true));
        }

        let select = format!("SELECT {} FROM accounts WHERE username = $1", ACCOUNT_COLUMNS);
        let existing = sqlx::query_as::<_, Account>(&select)
            .bind(username)
            .fetch_one(&mut *conn)
            .await?;
        Ok((existing, false))
    }

    /// Add `delta` (possibly negative) to a balance the caller has locked
    pub async fn adjust_balance(conn: &mut PgConnection, account_id: i64, delta: i64) -> Result<i64> {
        let balance: i64 = sqlx::query_scalar(
            "UPDATE accounts SET balance = balance + $2, updated_at = NOW() WHERE id = $1 RETURNING balance",
        )
        .bind(account_id)
        .bind(delta)
        .fetch_one(&mut *conn)
        .await?;
        Ok(balance)
    }

    /// Append one immutable entry to the log
    pub async fn append_entry(
        conn: &mut PgConnection,
        from: &Account,
        to: &Account,
        amount: i64,
        note: Option<&str>,
    ) -> Result<LedgerEntry> {
        let (id, created_at): (i64, chrono::DateTime<chrono::Utc>) = sqlx::query_as(
            r#"
            INSERT INTO ledger_entries (from_account_id, to_account_id, amount, note)
            VALUES ($1, $2, $3, $4)
            RETURNING id, created_at
            "#,
        )
        .bind(from.id)
        .bind(to.id)
        .bind(amount)
        .bind(note)
        .fetch_one(&mut *conn)
        .await?;

        Ok(LedgerEntry {
            id,
            from_user: from.username.clone(),
            to_user: to.username.clone(),
            amount,
            note: note.map(str::to_string),
            created_at,
        })
    }
}

/// Escape LIKE/ILIKE wildcards so user input matches literally
pub(crate) fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order_is_argument_independent() {
        assert_eq!(lock_order(&["bob", "alice"]), vec!["alice", "bob"]);
        assert_eq!(lock_order(&["alice", "bob"]), vec!["alice", "bob"]);
    }

    #[test]
    fn test_lock_order_dedups() {
        assert_eq!(lock_order(&["carol", "carol"]), vec!["carol"]);
        assert_eq!(
            lock_order(&["system", "alice", "system", "zoe"]),
            vec!["alice", "system", "zoe"]
        );
    }

    #[test]
    fn test_lock_order_is_bytewise() {
        // Uppercase sorts before lowercase; the order only has to be total.
        assert_eq!(lock_order(&["alice", "Zed"]), vec!["Zed", "alice"]);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
    }
}
