//! Harvest payouts
//!
//! A harvest is a task with a fixed bean reward. Completing it credits the
//! assignee directly and records an entry from [`SYSTEM_ACCOUNT`]; nothing is
//! debited, so completion is one of the two ways new beans enter circulation.

use crate::storage::{escape_like, LedgerStore};
use crate::types::{validate_user_facing, Account, Harvest, HarvestPage, UserRef, SYSTEM_ACCOUNT};
use crate::{LedgerError, Result};
use sqlx::postgres::PgConnection;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

const HARVEST_SELECT: &str = r#"
    SELECT h.id, h.title, h.description, h.reward, h.assigned_account_id,
           a.username AS assigned_user, h.completed, h.created_at, h.updated_at
    FROM harvests h
    LEFT JOIN accounts a ON a.id = h.assigned_account_id
"#;

/// Clamp a requested page: `page < 1` becomes 1, `limit` is held to `1..=100`
/// and a non-positive limit falls back to the default page size.
pub fn normalize_page(page: i64, limit: i64) -> (i64, i64) {
    let page = page.max(1);
    let limit = if limit <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    };
    (page, limit)
}

/// Row offset of `page`; pages too far out to address are a validation error
pub fn page_offset(page: i64, limit: i64) -> Result<i64> {
    page.checked_sub(1)
        .and_then(|skipped| skipped.checked_mul(limit))
        .ok_or_else(|| LedgerError::Validation(format!("page {} is out of range", page)))
}

/// Ledger note written for a completed harvest
pub fn completion_note(title: &str) -> String {
    format!("Harvest completed: {}", title)
}

fn check_fields(title: &str, reward: i64) -> Result<()> {
    if title.trim().is_empty() {
        return Err(LedgerError::Validation("harvest title is required".into()));
    }
    if reward < 1 {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(())
}

/// Harvest payout workflow
#[derive(Debug, Clone)]
pub struct HarvestPayout {
    store: LedgerStore,
}

impl HarvestPayout {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    pub async fn create(&self, title: &str, description: &str, reward: i64) -> Result<Harvest> {
        check_fields(title, reward)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO harvests (title, description, reward) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(title)
        .bind(description)
        .bind(reward)
        .fetch_one(self.store.pool())
        .await?;

        info!("Harvest {} created: {:?} paying {} bean(s)", id, title, reward);
        self.get(id).await
    }

    /// Replace title, description and reward of an open harvest
    pub async fn update(
        &self,
        id: i64,
        title: &str,
        description: &str,
        reward: i64,
    ) -> Result<Harvest> {
        check_fields(title, reward)?;

        let mut tx = self.store.begin().await?;
        let harvest = Self::lock(&mut tx, id).await?;
        if harvest.completed {
            return Err(LedgerError::HarvestAlreadyCompleted(id));
        }

        sqlx::query(
            r#"
            UPDATE harvests
            SET title = $2, description = $3, reward = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(description)
        .bind(reward)
        .execute(&mut *tx)
        .await?;

        let updated = Self::fetch(&mut tx, id, false)
            .await?
            .ok_or(LedgerError::HarvestNotFound(id))?;
        tx.commit().await?;

        info!("Harvest {} updated", id);
        Ok(updated)
    }

    /// Bind an account to the harvest. The last assignment before completion wins.
    pub async fn assign(&self, id: i64, user: &UserRef) -> Result<Harvest> {
        let account = self.resolve(user).await?;
        validate_user_facing(&account.username)?;

        let mut tx = self.store.begin().await?;
        let harvest = Self::lock(&mut tx, id).await?;
        if harvest.completed {
            return Err(LedgerError::HarvestAlreadyCompleted(id));
        }

        sqlx::query(
            "UPDATE harvests SET assigned_account_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(account.id)
        .execute(&mut *tx)
        .await?;

        let assigned = Self::fetch(&mut tx, id, false)
            .await?
            .ok_or(LedgerError::HarvestNotFound(id))?;
        tx.commit().await?;

        info!("Harvest {} assigned to {}", id, account.username);
        Ok(assigned)
    }

    /// Pay the reward to the assignee. One-way: a second call never re-mints.
    pub async fn complete(&self, id: i64) -> Result<Harvest> {
        let mut tx = self.store.begin().await?;

        let harvest = Self::lock(&mut tx, id).await?;
        if harvest.completed {
            debug!("Harvest {} already completed", id);
            return Err(LedgerError::HarvestAlreadyCompleted(id));
        }
        let assignee_id = harvest
            .assigned_account_id
            .ok_or(LedgerError::NoAssignedUser(id))?;

        let assignee_name = harvest
            .assigned_user
            .clone()
            .ok_or_else(|| LedgerError::UserNotFound(format!("#{}", assignee_id)))?;

        // system and assignee rows, in global lock order
        let locked =
            LedgerStore::lock_accounts(&mut tx, &[SYSTEM_ACCOUNT, &assignee_name]).await?;
        let assignee = locked
            .get(&assignee_name)
            .cloned()
            .ok_or_else(|| LedgerError::UserNotFound(assignee_name.clone()))?;
        let system = match locked.get(SYSTEM_ACCOUNT) {
            Some(system) => system.clone(),
            None => LedgerStore::insert_if_absent(&mut tx, SYSTEM_ACCOUNT, 0).await?.0,
        };

        Self::mint(&mut tx, &system, &assignee, &harvest).await?;

        sqlx::query("UPDATE harvests SET completed = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let completed = Self::fetch(&mut tx, id, false)
            .await?
            .ok_or(LedgerError::HarvestNotFound(id))?;
        tx.commit().await?;

        info!(
            "Harvest {} completed, minted {} bean(s) to {}",
            id, completed.reward, assignee.username
        );
        Ok(completed)
    }

    /// Case-insensitive substring search over title and description,
    /// most recently updated first
    pub async fn search(&self, query: &str, page: i64, limit: i64) -> Result<HarvestPage> {
        let (page, limit) = normalize_page(page, limit);
        let offset = page_offset(page, limit)?;
        let pattern = format!("%{}%", escape_like(query.trim()));
        let filter = "WHERE h.title ILIKE $1 OR h.description ILIKE $1";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM harvests h {}", filter))
            .bind(&pattern)
            .fetch_one(self.store.pool())
            .await?;

        let sql = format!(
            "{} {} ORDER BY h.updated_at DESC, h.id DESC LIMIT $2 OFFSET $3",
            HARVEST_SELECT, filter
        );
        let harvests = sqlx::query_as::<_, Harvest>(&sql)
            .bind(&pattern)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.store.pool())
            .await?;

        Ok(HarvestPage::new(harvests, total, page, limit))
    }

    pub async fn get(&self, id: i64) -> Result<Harvest> {
        let mut conn = self.store.pool().acquire().await?;
        Self::fetch(&mut conn, id, false)
            .await?
            .ok_or(LedgerError::HarvestNotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Harvest>> {
        let sql = format!("{} ORDER BY h.created_at DESC, h.id DESC", HARVEST_SELECT);
        let harvests = sqlx::query_as::<_, Harvest>(&sql)
            .fetch_all(self.store.pool())
            .await?;
        Ok(harvests)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM harvests WHERE id = $1")
            .bind(id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::HarvestNotFound(id));
        }
        info!("Harvest {} deleted", id);
        Ok(())
    }

    async fn resolve(&self, user: &UserRef) -> Result<Account> {
        let account = match user {
            UserRef::Id(id) => self.store.find_account_by_id(*id).await?,
            UserRef::Username(name) => self.store.find_account(name).await?,
        };
        account.ok_or_else(|| LedgerError::UserNotFound(user.to_string()))
    }

    async fn mint(
        conn: &mut PgConnection,
        system: &Account,
        assignee: &Account,
        harvest: &Harvest,
    ) -> Result<()> {
        LedgerStore::adjust_balance(&mut *conn, assignee.id, harvest.reward).await?;
        let note = completion_note(&harvest.title);
        LedgerStore::append_entry(&mut *conn, system, assignee, harvest.reward, Some(&note)).await?;
        Ok(())
    }

    async fn lock(conn: &mut PgConnection, id: i64) -> Result<Harvest> {
        Self::fetch(conn, id, true)
            .await?
            .ok_or(LedgerError::HarvestNotFound(id))
    }

    async fn fetch(conn: &mut PgConnection, id: i64, for_update: bool) -> Result<Option<Harvest>> {
        let sql = format!(
            "{} WHERE h.id = $1{}",
            HARVEST_SELECT,
            if for_update { " FOR UPDATE OF h" } else { "" }
        );
        let harvest = sqlx::query_as::<_, Harvest>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(harvest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_page() {
        assert_eq!(normalize_page(0, 0), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(normalize_page(-3, 10), (1, 10));
        assert_eq!(normalize_page(4, 500), (4, MAX_PAGE_SIZE));
        assert_eq!(normalize_page(2, 1), (2, 1));
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(page_offset(1, 20).unwrap(), 0);
        assert_eq!(page_offset(3, 20).unwrap(), 40);

        let (page, limit) = normalize_page(i64::MAX, 20);
        assert!(matches!(
            page_offset(page, limit),
            Err(LedgerError::Validation(_))
        ));
        assert!(page_offset(i64::MAX / 10, 20).is_err());
    }

    #[test]
    fn test_completion_note() {
        assert_eq!(completion_note("Fix the roof"), "Harvest completed: Fix the roof");
    }

    #[test]
    fn test_field_checks() {
        assert!(check_fields("Plant beans", 1).is_ok());
        assert!(matches!(
            check_fields("Plant beans", 0),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(check_fields("  ", 5), Err(LedgerError::Validation(_))));
    }
}
